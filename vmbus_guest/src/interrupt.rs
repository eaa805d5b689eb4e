// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Interrupt routing from the host to per-channel events.
//!
//! Interrupt delivery runs at a higher priority than the engine and may run
//! concurrently with channel table and registry mutation. The table
//! therefore uses its own per-slot locks; the delivery path never takes the
//! engine lock and does nothing but locate the entry and signal it.

use parking_lot::Condvar;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use std::time::Instant;

/// An auto-reset event signaled when the host interrupts a channel.
#[derive(Debug, Default)]
pub struct ChannelEvent {
    signaled: Mutex<bool>,
    ready: Condvar,
}

impl ChannelEvent {
    pub fn new() -> Self {
        Self::default()
    }

    /// Signals the event, waking one waiter.
    pub fn signal(&self) {
        let mut signaled = self.signaled.lock();
        *signaled = true;
        self.ready.notify_all();
    }

    /// Consumes a pending signal without blocking.
    pub fn poll(&self) -> bool {
        std::mem::take(&mut *self.signaled.lock())
    }

    /// Blocks until the event is signaled or the timeout elapses, consuming
    /// the signal. Returns false on timeout.
    pub fn wait(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut signaled = self.signaled.lock();
        while !*signaled {
            if self.ready.wait_until(&mut signaled, deadline).timed_out() {
                return std::mem::take(&mut *signaled);
            }
        }
        *signaled = false;
        true
    }
}

/// Maps channel IDs to the event signaled on host interrupts.
///
/// `set` and `clear` are the only writers; `signal` is the interrupt-path
/// lookup and must stay O(1).
pub(crate) struct InterruptTable {
    slots: Box<[Mutex<Option<Arc<ChannelEvent>>>]>,
}

impl InterruptTable {
    pub fn new(max_channels: usize) -> Self {
        Self {
            slots: (0..max_channels).map(|_| Mutex::new(None)).collect(),
        }
    }

    /// Installs the interrupt entry for a channel.
    ///
    /// Panics if the entry is already in use: an entry must be cleared
    /// exactly once before its slot is reused.
    pub fn set(&self, channel_id: u32, event: Arc<ChannelEvent>) {
        let mut slot = self.slots[channel_id as usize].lock();
        assert!(
            slot.is_none(),
            "interrupt entry for channel {channel_id} already in use"
        );
        *slot = Some(event);
    }

    /// Removes the interrupt entry for a channel, if present.
    ///
    /// Taking the slot lock drains any in-flight delivery on this entry
    /// before the entry is released.
    pub fn clear(&self, channel_id: u32) -> Option<Arc<ChannelEvent>> {
        self.slots.get(channel_id as usize)?.lock().take()
    }

    /// Returns the event for a channel, if one is installed.
    pub fn get(&self, channel_id: u32) -> Option<Arc<ChannelEvent>> {
        self.slots.get(channel_id as usize)?.lock().clone()
    }

    /// Signals the channel's event from the interrupt context. Returns
    /// false if the channel has no entry (out of range or not open).
    pub fn signal(&self, channel_id: u32) -> bool {
        let Some(slot) = self.slots.get(channel_id as usize) else {
            return false;
        };
        let slot = slot.lock();
        if let Some(event) = &*slot {
            event.signal();
            true
        } else {
            false
        }
    }
}
