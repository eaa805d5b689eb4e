// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Wire protocol definitions for the control message channel between the
//! guest and the host. Message sizes and field layouts are a bit-exact
//! contract with the host and must not be altered.

use crate::Guid;
use crate::VersionInfo;
use bitfield_struct::bitfield;
use std::mem::size_of;
use std::ops::BitAnd;
use std::ops::BitAndAssign;
use std::ops::BitOr;
use std::ops::Deref;
use std::ops::DerefMut;
use thiserror::Error;
use zerocopy::FromBytes;
use zerocopy::FromZeros;
use zerocopy::Immutable;
use zerocopy::IntoBytes;
use zerocopy::KnownLayout;

#[macro_use]
mod macros;

/// The fixed connection ID used to post control messages to the host.
pub const VMBUS_MESSAGE_CONNECTION_ID: u32 = 1;

/// The synic message type used for all control messages.
pub const VMBUS_MESSAGE_TYPE: u32 = 1;

pub const STATUS_SUCCESS: i32 = 0;
pub const STATUS_UNSUCCESSFUL: i32 = 0x8000ffff_u32 as i32;

/// The size of a guest page covered by one GPADL page frame number.
pub const PAGE_SIZE: usize = 4096;

pub const HEADER_SIZE: usize = size_of::<MessageHeader>();

/// The maximum size of a control message frame, including the message
/// header.
pub const MAX_MESSAGE_SIZE: usize = 240;

// Generates the MessageType constants, the parsed Message enum, and the
// BusMessage impl for every protocol message struct.
//
// Each entry reads: discriminant NAME { Struct min_version [options] }. A
// min_version of 0 means the message is accepted while disconnected. When a
// discriminant has more than one layout, list them newest first; the
// check_size option lets a variant match only when the frame is large enough
// for it, so a smaller layout of the same discriminant can match otherwise.
bus_messages! {
    pub enum Message, MessageType {
        1 OFFER_CHANNEL { OfferChannel V1 },
        2 RESCIND_CHANNEL_OFFER { RescindChannelOffer V1 },
        5 OPEN_CHANNEL { OpenChannel V1 },
        6 OPEN_CHANNEL_RESULT { OpenResult V1 },
        7 CLOSE_CHANNEL { CloseChannel V1 },
        8 GPADL_HEADER { GpadlHeader V1 },
        9 GPADL_BODY { GpadlBody V1 },
        10 GPADL_CREATED { GpadlCreated V1 },
        11 GPADL_TEARDOWN { GpadlTeardown V1 },
        12 GPADL_TORNDOWN { GpadlTorndown V1 },
        13 REL_ID_RELEASED { RelIdReleased V1 },
        14 INITIATE_CONTACT { InitiateContact 0 },
        15 VERSION_RESPONSE {
            // The host only sends the larger layout when the requested
            // version is Copper or above and the version is supported, so
            // the two can only be told apart by size.
            VersionResponse2 0 check_size:true,
            VersionResponse 0
        },
    }
}

/// An error that occurred while parsing a bus protocol message.
#[derive(Debug, Error)]
pub enum ParseError {
    /// The frame was shorter than the layout its discriminant requires.
    #[error("message too small: {0:?}")]
    MessageTooSmall(Option<MessageType>),
    /// The message type is not a valid bus protocol message, or a message
    /// that is not supported with the current protocol version.
    #[error("unexpected or unsupported message type: {0:?}")]
    InvalidMessageType(MessageType),
}

/// Trait implemented on all protocol message structs by the bus_messages!
/// macro.
pub trait BusMessage: Sized {
    /// The wire discriminant for this message struct.
    const MESSAGE_TYPE: MessageType;

    /// The size of the message, including the message header.
    const MESSAGE_SIZE: usize = HEADER_SIZE + size_of::<Self>();
}

/// The header of a bus control message.
#[repr(C)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, IntoBytes, FromBytes, Immutable, KnownLayout)]
pub struct MessageHeader {
    message_type: MessageType,
    padding: u32,
}

impl MessageHeader {
    /// A header carrying the given message type.
    pub fn new(message_type: MessageType) -> Self {
        Self {
            message_type,
            padding: 0,
        }
    }

    pub fn message_type(&self) -> MessageType {
        self.message_type
    }
}

#[bitfield(u32)]
#[derive(IntoBytes, FromBytes, Immutable, KnownLayout, PartialEq, Eq)]
pub struct FeatureFlags {
    /// The guest may choose the event flag and connection ID when opening a
    /// channel, instead of taking the channel ID and the values the host
    /// placed in the offer.
    pub guest_specified_signal_parameters: bool,

    /// The `REDIRECT_INTERRUPT` open flag is understood.
    pub channel_interrupt_redirection: bool,

    /// The `MODIFY_CONNECTION` message set is understood.
    pub modify_connection: bool,

    /// The guest may identify itself with a well-known GUID when initiating
    /// contact.
    pub client_id: bool,

    /// The `confidential_ring_buffer` and `confidential_external_memory`
    /// offer flags are understood.
    pub confidential_channels: bool,

    #[bits(27)]
    _reserved: u32,
}

impl FeatureFlags {
    pub const fn all() -> Self {
        Self::new()
            .with_guest_specified_signal_parameters(true)
            .with_channel_interrupt_redirection(true)
            .with_modify_connection(true)
            .with_client_id(true)
            .with_confidential_channels(true)
    }

    pub fn contains(&self, other: Self) -> bool {
        self.into_bits() & other.into_bits() == other.into_bits()
    }
}

impl BitAnd for FeatureFlags {
    type Output = Self;

    fn bitand(self, rhs: Self) -> Self::Output {
        Self::from_bits(self.into_bits() & rhs.into_bits())
    }
}

impl BitAndAssign for FeatureFlags {
    fn bitand_assign(&mut self, rhs: Self) {
        *self = *self & rhs;
    }
}

impl BitOr for FeatureFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self::Output {
        Self::from_bits(self.into_bits() | rhs.into_bits())
    }
}

/// A guest-chosen handle identifying a GPADL.
#[repr(transparent)]
#[derive(
    Copy,
    Clone,
    Debug,
    Eq,
    PartialEq,
    Ord,
    PartialOrd,
    Hash,
    IntoBytes,
    FromBytes,
    Immutable,
    KnownLayout,
)]
pub struct GpadlId(pub u32);

/// A host-assigned channel ID.
#[repr(transparent)]
#[derive(
    Copy,
    Clone,
    Debug,
    Eq,
    PartialEq,
    Ord,
    PartialOrd,
    Hash,
    IntoBytes,
    FromBytes,
    Immutable,
    KnownLayout,
)]
pub struct ChannelId(pub u32);

pub struct ConnectionId(pub u32);

impl ConnectionId {
    /// Packs a channel's signaling connection ID.
    pub fn new(channel_id: u32, vtl: u8, sint: u8) -> Self {
        Self(channel_id | (sint as u32) << 12 | (vtl as u32) << 16)
    }
}

#[repr(C)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, IntoBytes, FromBytes, Immutable, KnownLayout)]
pub struct InitiateContact {
    pub version_requested: u32,
    pub target_message_vp: u32,
    pub interrupt_page_or_target_info: u64, // sint, vtl, feature flags
    pub parent_to_child_monitor_page_gpa: u64,
    pub child_to_parent_monitor_page_gpa: u64,
}

/// View of the packed `InitiateContact::interrupt_page_or_target_info` word.
#[bitfield(u64)]
pub struct TargetInfo {
    pub sint: u8,
    pub vtl: u8,
    pub _padding: u16,
    pub feature_flags: u32,
}

pub const fn make_version(major: u16, minor: u16) -> u32 {
    ((major as u32) << 16) | (minor as u32)
}

#[repr(u32)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum Version {
    V1 = make_version(0, 13),
    Win7 = make_version(1, 1),
    Win8 = make_version(2, 4),
    Win8_1 = make_version(3, 0),
    Win10 = make_version(4, 0),
    Win10Rs3_0 = make_version(4, 1),
    Win10Rs3_1 = make_version(5, 0),
    Win10Rs4 = make_version(5, 1),
    Win10Rs5 = make_version(5, 2),
    Iron = make_version(5, 3),
    Copper = make_version(6, 0),
}

/// Possible values for the `VersionResponse::connection_state` field.
#[repr(transparent)]
#[derive(Copy, Clone, Eq, PartialEq, Hash, IntoBytes, FromBytes, Immutable, KnownLayout)]
pub struct ConnectionState(pub u8);

impl ConnectionState {
    pub const SUCCESSFUL: Self = Self(0);
    pub const FAILED_LOW_RESOURCES: Self = Self(1);
    pub const FAILED_UNKNOWN_FAILURE: Self = Self(2);
}

impl std::fmt::Debug for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match *self {
            Self::SUCCESSFUL => f.pad("SUCCESSFUL"),
            Self::FAILED_LOW_RESOURCES => f.pad("FAILED_LOW_RESOURCES"),
            Self::FAILED_UNKNOWN_FAILURE => f.pad("FAILED_UNKNOWN_FAILURE"),
            Self(other) => f.debug_tuple("ConnectionState").field(&other).finish(),
        }
    }
}

#[repr(C)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, IntoBytes, FromBytes, Immutable, KnownLayout)]
pub struct VersionResponse {
    pub version_supported: u8,
    pub connection_state: ConnectionState,
    pub padding: u16,
    pub selected_version_or_connection_id: u32,
}

/// The version response layout for `Version::Copper` and above.
///
/// N.B. Only sent when the requested version is `Version::Copper` or above
///      and that version is supported; a rejection always comes as the
///      shorter `VersionResponse`.
#[repr(C)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, IntoBytes, FromBytes, Immutable, KnownLayout)]
pub struct VersionResponse2 {
    pub version_response: VersionResponse,
    pub supported_features: u32,
}

impl From<VersionResponse> for VersionResponse2 {
    fn from(value: VersionResponse) -> Self {
        Self {
            version_response: value,
            ..FromZeros::new_zeroed()
        }
    }
}

/// User-defined data provided by a device as part of an offer or open
/// request.
#[derive(Copy, Clone, Debug, PartialEq, Eq, IntoBytes, FromBytes, Immutable, KnownLayout)]
#[repr(C, align(4))]
pub struct UserDefinedData([u8; 120]);

impl Deref for UserDefinedData {
    type Target = [u8; 120];

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl DerefMut for UserDefinedData {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

impl From<[u8; 120]> for UserDefinedData {
    fn from(value: [u8; 120]) -> Self {
        Self(value)
    }
}

impl From<UserDefinedData> for [u8; 120] {
    fn from(value: UserDefinedData) -> Self {
        value.0
    }
}

impl Default for UserDefinedData {
    fn default() -> Self {
        Self::new_zeroed()
    }
}

#[repr(C)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, IntoBytes, FromBytes, Immutable, KnownLayout)]
pub struct OfferChannel {
    pub interface_id: Guid,
    pub instance_id: Guid,
    pub rsvd: [u32; 4],
    pub flags: OfferFlags,
    pub mmio_megabytes: u16,
    pub user_defined: UserDefinedData,
    pub subchannel_index: u16,
    pub mmio_megabytes_optional: u16,
    pub channel_id: ChannelId,
    pub monitor_id: u8,
    pub monitor_allocated: u8,
    pub is_dedicated: u16,
    pub connection_id: u32,
}

#[bitfield(u16)]
#[derive(IntoBytes, FromBytes, Immutable, KnownLayout, PartialEq, Eq)]
pub struct OfferFlags {
    pub enumerate_device_interface: bool, // 0x1
    /// On a hardware-isolated VM, the channel's ring buffer stays in
    /// encrypted memory.
    pub confidential_ring_buffer: bool, // 0x2
    /// On a hardware-isolated VM, the channel's additional GPADLs and GPA
    /// direct ranges stay in encrypted memory.
    pub confidential_external_memory: bool, // 0x4
    #[bits(1)]
    _reserved1: u16,
    pub named_pipe_mode: bool, // 0x10
    #[bits(8)]
    _reserved2: u16,
    pub tlnpi_provider: bool, // 0x2000
    #[bits(2)]
    _reserved3: u16,
}

#[repr(C)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, IntoBytes, FromBytes, Immutable, KnownLayout)]
pub struct RescindChannelOffer {
    pub channel_id: ChannelId,
}

#[repr(C)]
#[derive(Copy, Clone, Debug, IntoBytes, FromBytes, Immutable, KnownLayout)]
pub struct GpadlHeader {
    pub channel_id: ChannelId,
    pub gpadl_id: GpadlId,
    pub len: u16,
    pub count: u16,
}

impl GpadlHeader {
    /// How many u64 values fit in the frame after this message's fields.
    pub const MAX_DATA_VALUES: usize = (MAX_MESSAGE_SIZE - Self::MESSAGE_SIZE) / size_of::<u64>();
}

#[repr(C)]
#[derive(Copy, Clone, Debug, IntoBytes, FromBytes, Immutable, KnownLayout)]
pub struct GpadlBody {
    pub rsvd: u32,
    pub gpadl_id: GpadlId,
}

impl GpadlBody {
    /// How many u64 values fit in the frame after this message's fields.
    pub const MAX_DATA_VALUES: usize = (MAX_MESSAGE_SIZE - Self::MESSAGE_SIZE) / size_of::<u64>();
}

#[repr(C)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, IntoBytes, FromBytes, Immutable, KnownLayout)]
pub struct GpadlCreated {
    pub channel_id: ChannelId,
    pub gpadl_id: GpadlId,
    pub status: i32,
}

#[repr(C)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, IntoBytes, FromBytes, Immutable, KnownLayout)]
pub struct OpenChannel {
    pub channel_id: ChannelId,
    pub open_id: u32,
    pub ring_buffer_gpadl_id: GpadlId,
    pub target_vp: u32,
    pub downstream_ring_buffer_page_offset: u32,
    pub user_data: UserDefinedData,
}

#[repr(C)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, IntoBytes, FromBytes, Immutable, KnownLayout)]
pub struct OpenResult {
    pub channel_id: ChannelId,
    pub open_id: u32,
    pub status: u32,
}

#[repr(C)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, IntoBytes, FromBytes, Immutable, KnownLayout)]
pub struct CloseChannel {
    pub channel_id: ChannelId,
}

#[repr(C)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, IntoBytes, FromBytes, Immutable, KnownLayout)]
pub struct RelIdReleased {
    pub channel_id: ChannelId,
}

#[repr(C)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, IntoBytes, FromBytes, Immutable, KnownLayout)]
pub struct GpadlTeardown {
    pub channel_id: ChannelId,
    pub gpadl_id: GpadlId,
}

#[repr(C)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, IntoBytes, FromBytes, Immutable, KnownLayout)]
pub struct GpadlTorndown {
    pub gpadl_id: GpadlId,
}
