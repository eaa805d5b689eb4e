// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! GPADL handle registry.
//!
//! Handles are guest-chosen small integers drawn from a bounded pool that
//! mirrors the host's own table size. Allocation failure is a recoverable
//! error surfaced to the caller; a resource-starved host is an expected
//! condition, not a programming error.

use crate::isolation::ProtectionHandle;
use crate::transport::ResponseSlot;
use std::sync::Arc;
use vmbus_proto::OutgoingMessage;
use vmbus_proto::protocol;
use vmbus_proto::protocol::ChannelId;
use vmbus_proto::protocol::GpadlId;
use vmbus_proto::protocol::PAGE_SIZE;
use zerocopy::IntoBytes;

/// The maximum number of simultaneously allocated GPADL handles. Fixed by
/// the host contract, not configurable.
pub const MAX_GPADLS: usize = 256;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum GpadlState {
    Free,
    /// Handle drawn from the pool; no page range attached yet.
    Allocated,
    /// Header/body messages sent; GpadlCreated not yet received. A handle
    /// stuck here (response timeout) stays unavailable until reclaimed.
    Creating,
    Created,
    /// GpadlTeardown sent; GpadlTorndown not yet received.
    TearingDown,
}

#[derive(Debug)]
pub(crate) struct GpadlEntry {
    pub state: GpadlState,
    pub channel_id: Option<ChannelId>,
    pub base_pfn: u64,
    pub page_count: u32,
    pub byte_offset: u32,
    pub legacy: bool,
    /// Present only while the pages are visible across an isolation
    /// boundary.
    pub protection: Option<ProtectionHandle>,
}

impl GpadlEntry {
    fn free() -> Self {
        Self {
            state: GpadlState::Free,
            channel_id: None,
            base_pfn: 0,
            page_count: 0,
            byte_offset: 0,
            legacy: false,
            protection: None,
        }
    }
}

pub(crate) struct GpadlRegistry {
    entries: Vec<GpadlEntry>,
    /// The root-level response slot for GPADL create/teardown waits, and
    /// the handle the armed wait correlates with. Only one GPADL exchange
    /// is in flight at a time.
    pub response: Arc<ResponseSlot>,
    pub pending: Option<GpadlId>,
}

impl GpadlRegistry {
    pub fn new() -> Self {
        Self {
            entries: (0..MAX_GPADLS).map(|_| GpadlEntry::free()).collect(),
            response: ResponseSlot::new(),
            pending: None,
        }
    }

    /// Handle 0 is reserved; valid handles are 1..=MAX_GPADLS.
    fn index(id: GpadlId) -> Option<usize> {
        (id.0 >= 1 && id.0 <= MAX_GPADLS as u32).then(|| id.0 as usize - 1)
    }

    pub fn get(&self, id: GpadlId) -> Option<&GpadlEntry> {
        self.entries.get(Self::index(id)?)
    }

    pub fn get_mut(&mut self, id: GpadlId) -> Option<&mut GpadlEntry> {
        let index = Self::index(id)?;
        self.entries.get_mut(index)
    }

    /// Draws a free handle from the pool.
    pub fn allocate(&mut self) -> Option<GpadlId> {
        let index = self
            .entries
            .iter()
            .position(|entry| entry.state == GpadlState::Free)?;
        self.entries[index].state = GpadlState::Allocated;
        Some(GpadlId(index as u32 + 1))
    }

    /// True only for handles that are fully created and safe to hand to the
    /// host in an open request or a teardown.
    pub fn validate(&self, id: GpadlId) -> bool {
        self.get(id)
            .is_some_and(|entry| entry.state == GpadlState::Created)
    }

    /// Returns a handle to the pool, yielding any protection grant that
    /// still needs to be revoked.
    pub fn free(&mut self, id: GpadlId) -> Option<ProtectionHandle> {
        let entry = self.get_mut(id)?;
        std::mem::replace(entry, GpadlEntry::free()).protection
    }

    /// Frees every handle bound to a channel without a teardown exchange.
    /// Used when the host rescinds the channel and will no longer
    /// acknowledge teardowns for it. Returns the protection grants to
    /// revoke.
    pub fn release_channel(&mut self, channel_id: ChannelId) -> Vec<ProtectionHandle> {
        let mut protections = Vec::new();
        for entry in &mut self.entries {
            if entry.channel_id == Some(channel_id) && entry.state != GpadlState::Free {
                if let Some(protection) = std::mem::replace(entry, GpadlEntry::free()).protection {
                    protections.push(protection);
                }
            }
        }
        protections
    }

    /// True if the armed GPADL wait correlates with this handle.
    pub fn is_pending(&self, id: GpadlId) -> bool {
        self.pending == Some(id)
    }

    /// Every handle not currently in the free pool.
    pub fn live_handles(&self) -> Vec<GpadlId> {
        self.entries
            .iter()
            .enumerate()
            .filter(|(_, entry)| entry.state != GpadlState::Free)
            .map(|(index, _)| GpadlId(index as u32 + 1))
            .collect()
    }
}

/// Builds the GpadlHeader message and any GpadlBody continuations needed to
/// carry a page list to the host. The first frame carries the packed
/// byte-count/byte-offset range word and as many page numbers as fit;
/// continuation frames carry the rest.
pub(crate) fn create_messages(
    channel_id: ChannelId,
    gpadl_id: GpadlId,
    byte_offset: u32,
    legacy: bool,
    pages: &[u64],
) -> Vec<OutgoingMessage> {
    let total = pages.len() * PAGE_SIZE;
    // The legacy layout reports the span of the whole mapped region; the
    // current layout reports the usable length past the offset.
    let byte_count = if legacy {
        total as u32
    } else {
        total as u32 - byte_offset
    };

    let mut buf = Vec::with_capacity(pages.len() + 1);
    buf.push(byte_count as u64 | (byte_offset as u64) << 32);
    buf.extend_from_slice(pages);

    let (first, remaining) = if buf.len() > protocol::GpadlHeader::MAX_DATA_VALUES {
        buf.split_at(protocol::GpadlHeader::MAX_DATA_VALUES)
    } else {
        (buf.as_slice(), [].as_slice())
    };

    let header = protocol::GpadlHeader {
        channel_id,
        gpadl_id,
        len: (buf.len() * size_of::<u64>()) as u16,
        count: 1,
    };

    let mut messages = vec![OutgoingMessage::with_data(&header, first.as_bytes())];

    let body = protocol::GpadlBody {
        rsvd: 0,
        gpadl_id,
    };
    for chunk in remaining.chunks(protocol::GpadlBody::MAX_DATA_VALUES) {
        messages.push(OutgoingMessage::with_data(&body, chunk.as_bytes()));
    }

    messages
}

/// The largest page count expressible in one GPADL: the header's length
/// field counts the range word plus one u64 per page, in bytes.
pub(crate) fn max_page_count() -> u32 {
    (u16::MAX as usize / size_of::<u64>() - 1) as u32
}
