//! Framed request/response exchange over a [`Link`].
//!
//! One request at a time: the device is a single-threaded embedded agent, so
//! a response is always unambiguously matched to the active request. Reception
//! runs a tiny incremental parser over the link's byte stream; anything that
//! fails CRC or does not answer the active request discards the whole buffer.

use std::time::Duration;

use bytes::BytesMut;
use tracing::{debug, error, warn};

use crate::core::error::{Result, ScrutinyError};
use crate::core::timer::Timer;
use crate::link::Link;
use crate::protocol::request::Request;
use crate::protocol::response::Response;

/// Cumulative traffic counters, for the bitrate monitor.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LinkStats {
    /// Bytes handed to the link for transmission.
    pub sent_bytes: u64,
    /// Bytes drained from the link.
    pub received_bytes: u64,
}

/// Single active-request frame exchanger.
pub struct FrameExchanger {
    link: Option<Box<dyn Link>>,
    active_request: Option<Request>,
    received_response: Option<Response>,
    rx_buffer: BytesMut,
    rx_declared_len: Option<usize>,
    response_timer: Timer,
    timed_out: bool,
    stats: LinkStats,
}

impl FrameExchanger {
    /// Create an exchanger with the given response timeout. No link attached.
    pub fn new(response_timeout: Duration) -> Self {
        Self {
            link: None,
            active_request: None,
            received_response: None,
            rx_buffer: BytesMut::new(),
            rx_declared_len: None,
            response_timer: Timer::new(response_timeout),
            timed_out: false,
            stats: LinkStats::default(),
        }
    }

    /// Change the response timeout. Takes effect on the next request.
    pub fn set_response_timeout(&mut self, timeout: Duration) {
        self.response_timer.set_timeout(timeout);
    }

    /// Attach and open a link. A previously attached link is closed first.
    pub fn open(&mut self, mut link: Box<dyn Link>) {
        self.close();
        match link.open() {
            Ok(()) => {
                self.link = Some(link);
            }
            Err(e) => {
                error!(error = %e, "cannot open link to device");
            }
        }
        self.reset();
    }

    /// Close and detach the link.
    pub fn close(&mut self) {
        if let Some(link) = &mut self.link {
            link.close();
        }
        self.link = None;
        self.reset();
    }

    /// Check if a link is attached and open.
    pub fn is_open(&self) -> bool {
        self.link.is_some()
    }

    /// Check if the attached link can still move bytes.
    pub fn link_operational(&self) -> bool {
        self.link.as_ref().is_some_and(|link| link.operational())
    }

    /// Traffic counters since construction.
    pub fn stats(&self) -> LinkStats {
        self.stats
    }

    /// Bitrate ceiling advertised by the attached link, if any.
    pub fn link_max_bitrate_bps(&self) -> Option<u32> {
        self.link.as_ref().and_then(|link| link.max_bitrate_bps())
    }

    /// Pump the link and advance response reception. Call once per tick.
    pub fn process(&mut self) {
        if self.link.is_none() {
            self.reset();
            return;
        }
        if let Some(link) = &mut self.link {
            link.process();
        }
        self.process_rx();
    }

    fn process_rx(&mut self) {
        // No response will come on a dead or expired exchange.
        if self.waiting_response() {
            let link_lost = !self.link_operational();
            if self.response_timer.is_timed_out() || link_lost {
                if link_lost {
                    warn!("link became non-operational while waiting for a response");
                }
                self.reset_rx();
                self.timed_out = true;
                return;
            }
        }

        let data = match &mut self.link {
            Some(link) => link.read(),
            None => return,
        };
        if data.is_empty() {
            return;
        }
        self.stats.received_bytes += data.len() as u64;

        if self.response_available() || !self.waiting_response() {
            debug!(bytes = data.len(), "discarding unsolicited data");
            return;
        }

        self.rx_buffer.extend_from_slice(&data);

        // Header is 5 bytes; the length field completes it.
        if self.rx_declared_len.is_none() && self.rx_buffer.len() >= 5 {
            let length = u16::from_be_bytes([self.rx_buffer[3], self.rx_buffer[4]]) as usize;
            self.rx_declared_len = Some(length);
        }

        if let Some(length) = self.rx_declared_len {
            let frame_size = Response::OVERHEAD + length;
            if self.rx_buffer.len() >= frame_size {
                self.rx_buffer.truncate(frame_size);
                match self.try_decode_response() {
                    Ok(response) => {
                        debug!(%response, "received response");
                        self.rx_buffer.clear();
                        self.rx_declared_len = None;
                        self.response_timer.stop();
                        self.received_response = Some(response);
                    }
                    Err(e) => {
                        error!(error = %e, "received malformed frame");
                        self.reset_rx();
                    }
                }
            }
        }
    }

    fn try_decode_response(&self) -> Result<Response> {
        let response = Response::from_bytes(&self.rx_buffer)?;
        let active = self
            .active_request
            .as_ref()
            .ok_or_else(|| ScrutinyError::internal("decoding a response with no active request"))?;
        if response.command != active.command {
            return Err(ScrutinyError::protocol(format!(
                "unexpected response command: {}",
                response.command
            )));
        }
        if response.subfn != active.subfn {
            return Err(ScrutinyError::protocol(format!(
                "unexpected response subfunction: {}",
                response.subfn
            )));
        }
        Ok(response)
    }

    /// Send a request. Hard error while another request is active.
    pub fn send_request(&mut self, request: Request) -> Result<()> {
        if self.active_request.is_some() {
            return Err(ScrutinyError::ExchangeBusy);
        }
        let link = self
            .link
            .as_mut()
            .ok_or_else(|| ScrutinyError::link_down("no link attached"))?;

        let data = request.to_bytes();
        debug!(%request, "sending request");
        link.write(&data);
        self.stats.sent_bytes += data.len() as u64;
        self.active_request = Some(request);
        self.received_response = None;
        self.response_timer.start();
        self.timed_out = false;
        Ok(())
    }

    /// Check if a response is ready for pickup.
    pub fn response_available(&self) -> bool {
        self.received_response.is_some()
    }

    /// Consume the received response, ending the exchange.
    pub fn get_response(&mut self) -> Option<Response> {
        let response = self.received_response.take();
        if response.is_some() {
            self.reset_rx();
        }
        response
    }

    /// Check if a request is active and unanswered.
    pub fn waiting_response(&self) -> bool {
        self.active_request.is_some()
    }

    /// Check if the active exchange expired. Latches until cleared.
    pub fn has_timed_out(&self) -> bool {
        self.timed_out
    }

    /// Acknowledge a noticed timeout.
    pub fn clear_timeout(&mut self) {
        self.timed_out = false;
    }

    fn reset_rx(&mut self) {
        self.active_request = None;
        self.received_response = None;
        self.response_timer.stop();
        self.rx_buffer.clear();
        self.rx_declared_len = None;
    }

    /// Abort any active exchange and clear the timeout flag.
    pub fn reset(&mut self) {
        self.reset_rx();
        self.clear_timeout();
    }
}
