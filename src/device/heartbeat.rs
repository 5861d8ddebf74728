//! Session liveness through challenged heartbeats.
//!
//! Each emission carries a fresh 16-bit challenge; the device must echo the
//! session id and answer with the bitwise NOT of the challenge. The device
//! handler compares `now - last_valid_heartbeat()` to the heartbeat timeout
//! and tears the session down itself; failures here never disconnect.

use std::cell::RefCell;
use std::rc::Rc;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::core::timer::Timer;
use crate::device::priorities;
use crate::dispatcher::RequestDispatcher;
use crate::protocol::heartbeat_challenge_response;
use crate::protocol::messages::{Protocol, ResponseData};
use crate::protocol::response::ResponseCode;

struct HeartbeatState {
    session_id: u32,
    expected_challenge: Option<u16>,
    last_valid: Option<Instant>,
    pending: bool,
}

/// Emits heartbeats and tracks the last time the device answered correctly.
pub struct HeartbeatGenerator {
    state: Rc<RefCell<HeartbeatState>>,
    started: bool,
    interval_timer: Timer,
    next_challenge: u16,
}

impl HeartbeatGenerator {
    /// Create a stopped generator with the given emission interval.
    pub fn new(interval: Duration) -> Self {
        Self {
            state: Rc::new(RefCell::new(HeartbeatState {
                session_id: 0,
                expected_challenge: None,
                last_valid: None,
                pending: false,
            })),
            started: false,
            interval_timer: Timer::new(interval),
            next_challenge: 0,
        }
    }

    /// Change the emission interval. Takes effect on the next emission.
    pub fn set_interval(&mut self, interval: Duration) {
        self.interval_timer.set_timeout(interval);
    }

    /// Session to keep alive. Must be set before starting.
    pub fn set_session_id(&mut self, session_id: u32) {
        self.state.borrow_mut().session_id = session_id;
    }

    /// Begin emitting. The liveness clock starts now.
    pub fn start(&mut self) {
        self.started = true;
        self.interval_timer.start();
        let mut state = self.state.borrow_mut();
        state.last_valid = Some(Instant::now());
        state.expected_challenge = None;
        state.pending = false;
    }

    /// Stop emitting.
    pub fn stop(&mut self) {
        self.started = false;
        self.interval_timer.stop();
        let mut state = self.state.borrow_mut();
        state.expected_challenge = None;
        state.pending = false;
        state.last_valid = None;
    }

    /// Check if emitting.
    pub fn is_started(&self) -> bool {
        self.started
    }

    /// Instant of the last correctly answered heartbeat. Monotonically
    /// non-decreasing within a session.
    pub fn last_valid_heartbeat(&self) -> Option<Instant> {
        self.state.borrow().last_valid
    }

    /// Submit the next heartbeat when due. Call once per tick.
    pub fn process(&mut self, dispatcher: &mut RequestDispatcher, protocol: &Protocol) {
        if !self.started {
            return;
        }
        if self.state.borrow().pending || !self.interval_timer.is_timed_out() {
            return;
        }

        let challenge = self.next_challenge;
        self.next_challenge = self.next_challenge.wrapping_add(1);
        self.interval_timer.start();

        let session_id = {
            let mut state = self.state.borrow_mut();
            state.expected_challenge = Some(challenge);
            state.pending = true;
            state.session_id
        };

        debug!(session_id = %format_args!("0x{:08X}", session_id), challenge, "emitting heartbeat");

        let success_state = Rc::clone(&self.state);
        let failure_state = Rc::clone(&self.state);
        dispatcher.register_request(
            protocol.comm_heartbeat(session_id, challenge),
            Box::new(move |_request, response, data| {
                let mut state = success_state.borrow_mut();
                state.pending = false;
                if response.code != ResponseCode::Ok {
                    warn!(code = %response.code, "heartbeat refused");
                    return;
                }
                let expected = state.expected_challenge.take().map(heartbeat_challenge_response);
                if let ResponseData::Heartbeat {
                    session_id,
                    challenge_response,
                } = data
                {
                    if session_id == state.session_id && Some(challenge_response) == expected {
                        state.last_valid = Some(Instant::now());
                    } else {
                        warn!(
                            session_id = %format_args!("0x{:08X}", session_id),
                            "heartbeat response failed validation"
                        );
                    }
                }
            }),
            Box::new(move |_request| {
                let mut state = failure_state.borrow_mut();
                state.pending = false;
                state.expected_challenge = None;
            }),
            priorities::HEARTBEAT,
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_started(interval: Duration) -> (HeartbeatGenerator, RequestDispatcher, Protocol) {
        let mut heartbeat = HeartbeatGenerator::new(interval);
        heartbeat.set_session_id(0x11223344);
        heartbeat.start();
        (heartbeat, RequestDispatcher::new(), Protocol::new(1, 0))
    }

    #[test]
    fn test_no_emission_before_interval() {
        let (mut heartbeat, mut dispatcher, protocol) = make_started(Duration::from_secs(60));
        heartbeat.process(&mut dispatcher, &protocol);
        assert!(dispatcher.next().is_none());
    }

    #[test]
    fn test_valid_answer_advances_liveness() {
        let (mut heartbeat, mut dispatcher, protocol) = make_started(Duration::from_millis(0));
        let started_at = heartbeat.last_valid_heartbeat().unwrap();

        heartbeat.process(&mut dispatcher, &protocol);
        let mut record = dispatcher.next().expect("heartbeat due");

        // The device answers correctly: session echoed, challenge inverted.
        let response = protocol.respond_comm_heartbeat(0x11223344, heartbeat_challenge_response(0));
        let data = protocol.parse_response(&record.request, &response).unwrap();
        record.complete_success(&response, data);

        assert!(heartbeat.last_valid_heartbeat().unwrap() >= started_at);
    }

    #[test]
    fn test_wrong_challenge_does_not_advance_liveness() {
        let (mut heartbeat, mut dispatcher, protocol) = make_started(Duration::from_millis(0));
        let started_at = heartbeat.last_valid_heartbeat().unwrap();

        heartbeat.process(&mut dispatcher, &protocol);
        let mut record = dispatcher.next().unwrap();
        let response = protocol.respond_comm_heartbeat(0x11223344, 0xBEEF);
        let data = protocol.parse_response(&record.request, &response).unwrap();
        record.complete_success(&response, data);

        assert_eq!(heartbeat.last_valid_heartbeat().unwrap(), started_at);
    }

    #[test]
    fn test_wrong_session_does_not_advance_liveness() {
        let (mut heartbeat, mut dispatcher, protocol) = make_started(Duration::from_millis(0));
        let started_at = heartbeat.last_valid_heartbeat().unwrap();

        heartbeat.process(&mut dispatcher, &protocol);
        let mut record = dispatcher.next().unwrap();
        let response = protocol.respond_comm_heartbeat(0xDEAD0000, heartbeat_challenge_response(0));
        let data = protocol.parse_response(&record.request, &response).unwrap();
        record.complete_success(&response, data);

        assert_eq!(heartbeat.last_valid_heartbeat().unwrap(), started_at);
    }

    #[test]
    fn test_failure_allows_next_emission() {
        let (mut heartbeat, mut dispatcher, protocol) = make_started(Duration::from_millis(0));
        heartbeat.process(&mut dispatcher, &protocol);
        let mut record = dispatcher.next().unwrap();
        record.complete_failure();

        heartbeat.process(&mut dispatcher, &protocol);
        assert!(dispatcher.next().is_some());
    }
}
