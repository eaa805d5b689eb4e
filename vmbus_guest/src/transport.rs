// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Message transport: posting fixed-size control frames to the host and
//! blocking for the matching response.
//!
//! Responses are correlated to requests by construction. The requester arms
//! a slot that the dispatch path will fill, so there is no in-band
//! transaction ID and only one outstanding request per slot. The
//! [`PendingResponse`] guard enforces the single-wait invariant by type.

use parking_lot::Condvar;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use std::time::Instant;
use thiserror::Error;
use vmbus_proto::protocol;

/// Posts control messages to the host.
///
/// Implemented by the platform's synic access layer. A failure is surfaced
/// to the caller of the engine operation that attempted the send; the
/// engine does not retry.
pub trait MessagePoster: Send + Sync {
    /// Transmits a fixed-size control frame on the given connection.
    fn post_message(
        &self,
        connection_id: u32,
        message_type: u32,
        msg: &[u8],
    ) -> std::io::Result<()>;
}

/// A response delivered into a waitable slot by the dispatch path.
#[derive(Debug)]
pub(crate) enum Response {
    VersionResponse(protocol::VersionResponse2),
    OpenResult(protocol::OpenResult),
    GpadlCreated(protocol::GpadlCreated),
    GpadlTorndown(protocol::GpadlTorndown),
}

#[derive(Debug)]
enum SlotState {
    Idle,
    Waiting,
    Complete(Response),
    /// The request can never complete; the channel it targeted was revoked.
    Revoked,
}

/// A waitable slot for a single outstanding request.
#[derive(Debug)]
pub(crate) struct ResponseSlot {
    state: Mutex<SlotState>,
    ready: Condvar,
}

/// A second wait was attempted while a request was already outstanding on
/// the slot.
#[derive(Debug, Error)]
#[error("a response wait is already outstanding")]
pub(crate) struct WaitInProgress;

#[derive(Debug, PartialEq, Eq)]
pub(crate) enum WaitError {
    /// No response arrived before the deadline. The request's target is
    /// indeterminate and must be reconciled before reuse.
    Timeout,
    /// The channel was revoked while the request was outstanding.
    Revoked,
}

impl ResponseSlot {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(SlotState::Idle),
            ready: Condvar::new(),
        })
    }

    /// Arms the slot for one request, returning the guard the requester
    /// waits on. Fails if a request is already outstanding.
    pub fn begin_wait(self: Arc<Self>) -> Result<PendingResponse, WaitInProgress> {
        let mut state = self.state.lock();
        match *state {
            SlotState::Idle => {
                *state = SlotState::Waiting;
                drop(state);
                Ok(PendingResponse { slot: Some(self) })
            }
            _ => Err(WaitInProgress),
        }
    }

    /// Delivers a response to the armed waiter. Returns false, dropping the
    /// response, if no request is outstanding (the waiter gave up or never
    /// existed).
    pub fn complete(&self, response: Response) -> bool {
        let mut state = self.state.lock();
        if matches!(*state, SlotState::Waiting) {
            *state = SlotState::Complete(response);
            self.ready.notify_all();
            true
        } else {
            false
        }
    }

    /// Fails the outstanding request, if any, because its target was
    /// revoked.
    pub fn revoke(&self) {
        let mut state = self.state.lock();
        if matches!(*state, SlotState::Waiting) {
            *state = SlotState::Revoked;
            self.ready.notify_all();
        }
    }
}

/// Exclusive permission to wait for the next response on a slot.
#[derive(Debug)]
pub(crate) struct PendingResponse {
    slot: Option<Arc<ResponseSlot>>,
}

impl PendingResponse {
    /// Blocks until the dispatch path fills the slot, the request is
    /// revoked, or the timeout elapses. The slot is idle again on return.
    pub fn wait(mut self, timeout: Duration) -> Result<Response, WaitError> {
        let slot = self.slot.take().expect("slot present until consumed");
        let deadline = Instant::now() + timeout;
        let mut state = slot.state.lock();
        loop {
            match std::mem::replace(&mut *state, SlotState::Idle) {
                SlotState::Complete(response) => return Ok(response),
                SlotState::Revoked => return Err(WaitError::Revoked),
                SlotState::Waiting => {
                    *state = SlotState::Waiting;
                    if slot.ready.wait_until(&mut state, deadline).timed_out() {
                        // The response may have raced the deadline.
                        return match std::mem::replace(&mut *state, SlotState::Idle) {
                            SlotState::Complete(response) => Ok(response),
                            SlotState::Revoked => Err(WaitError::Revoked),
                            _ => Err(WaitError::Timeout),
                        };
                    }
                }
                SlotState::Idle => unreachable!("slot disarmed while waiting"),
            }
        }
    }
}

impl Drop for PendingResponse {
    fn drop(&mut self) {
        // Disarm an abandoned wait so the slot does not stay stuck; a late
        // response is then dropped rather than delivered.
        if let Some(slot) = self.slot.take() {
            let mut state = slot.state.lock();
            *state = SlotState::Idle;
        }
    }
}
