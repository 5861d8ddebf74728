//! Foundation types shared by every layer of the server core.

pub mod codecs;
pub mod error;
pub mod timer;
pub mod types;

pub use error::{Result, ScrutinyError};
pub use timer::Timer;
pub use types::{EmbeddedDataType, Endianness, RuntimePublishedValue, Value};
