//! Request dispatching: priority queue, bandwidth throttle, size policing.
//!
//! Submitters register requests with completion callbacks; the device handler
//! pops them one at a time and completes them when the exchange ends. Each
//! record fires exactly one of its two callbacks, exactly once.

use std::collections::{BTreeMap, VecDeque};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::time::Instant;

use tracing::{error, warn};

use crate::protocol::messages::ResponseData;
use crate::protocol::request::Request;
use crate::protocol::response::Response;

/// Fired when the exchange succeeds and the response parses.
pub type SuccessCallback = Box<dyn FnOnce(&Request, &Response, ResponseData)>;

/// Fired when the exchange fails (timeout, link loss, decode error).
pub type FailureCallback = Box<dyn FnOnce(&Request)>;

/// A registered request waiting for, or undergoing, its exchange.
///
/// Owned by the dispatcher until popped, then by the device handler until
/// completion. Completion is idempotent.
pub struct RequestRecord {
    /// The request to send.
    pub request: Request,
    priority: u8,
    success: Option<SuccessCallback>,
    failure: Option<FailureCallback>,
    completed: bool,
}

impl RequestRecord {
    fn new(request: Request, success: SuccessCallback, failure: FailureCallback, priority: u8) -> Self {
        Self {
            request,
            priority,
            success: Some(success),
            failure: Some(failure),
            completed: false,
        }
    }

    /// Priority class this record was registered with.
    pub fn priority(&self) -> u8 {
        self.priority
    }

    /// Check if a callback already fired.
    pub fn is_completed(&self) -> bool {
        self.completed
    }

    /// Complete with success, firing the success callback.
    pub fn complete_success(&mut self, response: &Response, data: ResponseData) {
        if self.completed {
            return;
        }
        self.completed = true;
        self.failure = None;
        if let Some(callback) = self.success.take() {
            let request = &self.request;
            if catch_unwind(AssertUnwindSafe(|| callback(request, response, data))).is_err() {
                error!(%request, "success callback panicked");
            }
        }
    }

    /// Complete with failure, firing the failure callback.
    pub fn complete_failure(&mut self) {
        if self.completed {
            return;
        }
        self.completed = true;
        self.success = None;
        if let Some(callback) = self.failure.take() {
            let request = &self.request;
            if catch_unwind(AssertUnwindSafe(|| callback(request))).is_err() {
                error!(%request, "failure callback panicked");
            }
        }
    }
}

impl std::fmt::Debug for RequestRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestRecord")
            .field("request", &self.request)
            .field("priority", &self.priority)
            .field("completed", &self.completed)
            .finish()
    }
}

/// FIFO-within-priority queue. Higher integer pops first.
#[derive(Default)]
pub struct RequestQueue {
    queues: BTreeMap<u8, VecDeque<RequestRecord>>,
}

impl RequestQueue {
    /// Create an empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueue behind records of the same priority.
    pub fn push(&mut self, record: RequestRecord) {
        self.queues.entry(record.priority).or_default().push_back(record);
    }

    /// Look at the next record without removing it.
    pub fn peek(&self) -> Option<&RequestRecord> {
        self.queues.values().next_back().and_then(|queue| queue.front())
    }

    /// Remove and return the next record.
    pub fn pop(&mut self) -> Option<RequestRecord> {
        let priority = *self.queues.keys().next_back()?;
        let queue = self.queues.get_mut(&priority)?;
        let record = queue.pop_front();
        if queue.is_empty() {
            self.queues.remove(&priority);
        }
        record
    }

    /// Number of queued records.
    pub fn len(&self) -> usize {
        self.queues.values().map(VecDeque::len).sum()
    }

    /// Check if no record is queued.
    pub fn is_empty(&self) -> bool {
        self.queues.is_empty()
    }

    /// Remove every record, unfired.
    fn drain_all(&mut self) -> Vec<RequestRecord> {
        let mut out = Vec::with_capacity(self.len());
        while let Some(record) = self.pop() {
            out.push(record);
        }
        out
    }
}

/// Token-bucket bandwidth accountant.
///
/// Capacity equals the device-declared bitrate: at most one second worth of
/// traffic can be pre-approved. Popping a record debits its payload bits plus
/// the declared response payload bits; `process()` credits elapsed time back.
#[derive(Debug)]
pub struct Throttler {
    enabled: bool,
    max_bitrate_bps: u32,
    allowed_bits: f64,
    last_credit: Option<Instant>,
}

impl Default for Throttler {
    fn default() -> Self {
        Self {
            enabled: false,
            max_bitrate_bps: 0,
            allowed_bits: 0.0,
            last_credit: None,
        }
    }
}

impl Throttler {
    /// Create a disabled throttler.
    pub fn new() -> Self {
        Self::default()
    }

    /// Enable with the given bitrate. The bucket starts full.
    pub fn enable(&mut self, max_bitrate_bps: u32) {
        self.enabled = max_bitrate_bps > 0;
        self.max_bitrate_bps = max_bitrate_bps;
        self.allowed_bits = max_bitrate_bps as f64;
        self.last_credit = None;
    }

    /// Disable bandwidth accounting.
    pub fn disable(&mut self) {
        self.enabled = false;
        self.max_bitrate_bps = 0;
        self.allowed_bits = 0.0;
        self.last_credit = None;
    }

    /// Check if accounting is active.
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Configured bitrate, 0 when disabled.
    pub fn bitrate_bps(&self) -> u32 {
        self.max_bitrate_bps
    }

    /// Bits currently approved for emission.
    pub fn allowed_bits(&self) -> f64 {
        self.allowed_bits
    }

    /// Credit elapsed wall time, up to the bucket capacity.
    pub fn process(&mut self) {
        if !self.enabled {
            return;
        }
        let now = Instant::now();
        if let Some(last) = self.last_credit {
            let credit = now.duration_since(last).as_secs_f64() * self.max_bitrate_bps as f64;
            self.allowed_bits = (self.allowed_bits + credit).min(self.max_bitrate_bps as f64);
        }
        self.last_credit = Some(now);
    }

    fn bits_for(request: &Request) -> u64 {
        request.data_bits() + request.expected_response_bits()
    }

    /// Check if the bucket covers the whole exchange.
    pub fn allows(&self, request: &Request) -> bool {
        !self.enabled || Self::bits_for(request) as f64 <= self.allowed_bits
    }

    /// Debit the exchange from the bucket.
    pub fn consume(&mut self, request: &Request) {
        if self.enabled {
            self.allowed_bits -= Self::bits_for(request) as f64;
        }
    }
}

/// Priority-and-throttle request dispatcher.
#[derive(Default)]
pub struct RequestDispatcher {
    queue: RequestQueue,
    throttler: Throttler,
    tx_size_limit: Option<usize>,
    rx_size_limit: Option<usize>,
}

impl RequestDispatcher {
    /// Create a dispatcher with no size limits and throttling disabled.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a request. Silently dropped (with a diagnostic, no callback)
    /// when the request frame exceeds the tx limit or the declared response
    /// frame exceeds the rx limit.
    pub fn register_request(
        &mut self,
        request: Request,
        success: SuccessCallback,
        failure: FailureCallback,
        priority: u8,
    ) {
        if let Some(limit) = self.tx_size_limit {
            if request.size_on_wire() > limit {
                error!(
                    %request,
                    size = request.size_on_wire(),
                    limit,
                    "dropping request: frame exceeds device rx buffer"
                );
                return;
            }
        }
        if let Some(limit) = self.rx_size_limit {
            let response_size = request.response_payload_size + Response::OVERHEAD;
            if response_size > limit {
                error!(
                    %request,
                    response_size,
                    limit,
                    "dropping request: declared response exceeds device tx buffer"
                );
                return;
            }
        }
        self.queue.push(RequestRecord::new(request, success, failure, priority));
    }

    /// Set frame size limits (request side, response side).
    pub fn set_size_limits(&mut self, tx_size_limit: Option<usize>, rx_size_limit: Option<usize>) {
        self.tx_size_limit = tx_size_limit;
        self.rx_size_limit = rx_size_limit;
    }

    /// Enable the bandwidth throttle.
    pub fn enable_throttling(&mut self, max_bitrate_bps: u32) {
        self.throttler.enable(max_bitrate_bps);
    }

    /// Disable the bandwidth throttle.
    pub fn disable_throttling(&mut self) {
        self.throttler.disable();
    }

    /// Check if the throttle is active.
    pub fn is_throttling_enabled(&self) -> bool {
        self.throttler.is_enabled()
    }

    /// Throttle bitrate, 0 when disabled.
    pub fn throttling_bitrate_bps(&self) -> u32 {
        self.throttler.bitrate_bps()
    }

    /// Access the throttle accountant.
    pub fn throttler(&self) -> &Throttler {
        &self.throttler
    }

    /// Credit the throttle. Call once per tick.
    pub fn process(&mut self) {
        self.throttler.process();
    }

    /// Pop the next record the throttle allows, debiting its bandwidth.
    pub fn next(&mut self) -> Option<RequestRecord> {
        let candidate = self.queue.peek()?;
        if !self.throttler.allows(&candidate.request) {
            return None;
        }
        let record = self.queue.pop()?;
        self.throttler.consume(&record.request);
        Some(record)
    }

    /// Number of records waiting.
    pub fn pending_count(&self) -> usize {
        self.queue.len()
    }

    /// Fail every queued record. Used on session teardown.
    pub fn clear(&mut self) {
        let records = self.queue.drain_all();
        if !records.is_empty() {
            warn!(count = records.len(), "failing all queued requests");
        }
        for mut record in records {
            record.complete_failure();
        }
    }
}
