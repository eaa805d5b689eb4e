// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Guest-side connection and channel management engine for the
//! paravirtualized inter-partition bus.
//!
//! The engine owns the root message channel to the host: it negotiates the
//! protocol version, accepts channel offers, opens and closes channels,
//! manages the shared-memory GPADLs used for ring buffers, and routes host
//! interrupts to the right channel. The host is an untrusted peer; every
//! inbound field is bounds-checked before it is used as an index or a
//! length, and a malformed or out-of-sequence message fails only the
//! request it correlates with, never the connection.
//!
//! Execution model: callers of the engine serialize on an internal lock,
//! while blocking response waits happen outside it so dispatch can run.
//! Interrupt delivery takes only a per-channel slot lock and may run
//! concurrently with everything else.

#![forbid(unsafe_code)]

pub mod gpadl;
pub mod interrupt;
pub mod isolation;
pub mod transport;

use crate::gpadl::GpadlRegistry;
use crate::gpadl::GpadlState;
use crate::interrupt::ChannelEvent;
use crate::interrupt::InterruptTable;
use crate::isolation::IsolationConfig;
use crate::isolation::MemoryProtection;
use crate::isolation::ProtectionError;
use crate::transport::MessagePoster;
use crate::transport::Response;
use crate::transport::ResponseSlot;
use crate::transport::WaitError;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use vmbus_proto::OutgoingMessage;
use vmbus_proto::VersionInfo;
use vmbus_proto::protocol;
use vmbus_proto::protocol::BusMessage;
use vmbus_proto::protocol::ChannelId;
use vmbus_proto::protocol::ConnectionState;
use vmbus_proto::protocol::FeatureFlags;
use vmbus_proto::protocol::GpadlId;
use vmbus_proto::protocol::Message;
use vmbus_proto::protocol::MessageType;
use vmbus_proto::protocol::Version;
use zerocopy::Immutable;
use zerocopy::IntoBytes;
use zerocopy::KnownLayout;

pub use crate::gpadl::MAX_GPADLS;

/// The maximum number of simultaneous channels, which also bounds the
/// channel ID range usable in the interrupt routing table. Fixed by the
/// host contract.
pub const MAX_CHANNELS: usize = 256;

const SINT: u8 = 2;
const VTL: u8 = 0;

/// Protocol versions this guest can speak, in ascending order. Negotiation
/// walks the list from the end.
const SUPPORTED_VERSIONS: &[Version] = &[Version::Iron, Version::Copper];

const SUPPORTED_FEATURE_FLAGS: FeatureFlags =
    FeatureFlags::new().with_confidential_channels(true);

#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("invalid state to connect to the host")]
    InvalidState,
    #[error("no supported protocol versions")]
    NoSupportedVersions,
    #[error("failed to connect to the host: {0:?}")]
    FailedToConnect(ConnectionState),
    #[error("timed out waiting for a version response")]
    HostUnresponsive,
    #[error("failed to post message to the host")]
    Post(#[source] std::io::Error),
}

#[derive(Debug, Error)]
pub enum OpenError {
    #[error("unknown channel {0}")]
    UnknownChannel(u32),
    #[error("invalid channel state for open")]
    InvalidChannelState,
    #[error("ring buffer gpadl is not created or not bound to the channel")]
    InvalidRingGpadl,
    #[error("the host rejected the open request: {0:#x}")]
    OpenRejected(u32),
    #[error("channel was revoked by the host")]
    Revoked,
    #[error("timed out waiting for the open result")]
    HostUnresponsive,
    #[error("failed to make ring buffer pages visible to the host")]
    IsolationBoundary(#[source] ProtectionError),
    #[error("failed to post message to the host")]
    Post(#[source] std::io::Error),
}

#[derive(Debug, Error)]
pub enum CloseError {
    #[error("unknown channel {0}")]
    UnknownChannel(u32),
    #[error("invalid channel state for close")]
    InvalidChannelState,
    #[error("failed to post message to the host")]
    Post(#[source] std::io::Error),
}

#[derive(Debug, Error)]
pub enum GpadlError {
    #[error("all gpadl handles are in use")]
    ResourceExhausted,
    #[error("gpadl handle is not valid for this operation")]
    InvalidHandle,
    #[error("unknown channel {0}")]
    UnknownChannel(u32),
    #[error("page range is empty or too large for one gpadl")]
    InvalidPageRange,
    #[error("another gpadl request is outstanding")]
    RequestOutstanding,
    #[error("the host rejected gpadl creation: {0:#x}")]
    CreateRejected(i32),
    #[error("channel was revoked by the host")]
    Revoked,
    #[error("timed out waiting for the gpadl response")]
    HostUnresponsive,
    #[error("failed to post message to the host")]
    Post(#[source] std::io::Error),
}

/// A malformed or out-of-sequence message from the host. The offending
/// message is dropped; the connection stays up.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("failed to parse host message")]
    Parse(#[source] protocol::ParseError),
    #[error("unexpected message type {0:?} from the host")]
    UnexpectedMessage(MessageType),
    #[error("message references out-of-range channel id {0}")]
    ChannelIdOutOfRange(u32),
    #[error("offer for duplicate channel id {0}")]
    DuplicateChannelId(u32),
}

/// The overall connection state machine. It gates which messages are
/// acceptable from the host and which operations callers may start.
enum BusState {
    Disconnected,
    /// InitiateContact sent, waiting for the version response.
    Connecting { version: Version },
    Connected { version: VersionInfo },
}

impl BusState {
    fn version(&self) -> Option<VersionInfo> {
        match self {
            BusState::Connected { version } => Some(*version),
            BusState::Disconnected | BusState::Connecting { .. } => None,
        }
    }
}

impl std::fmt::Display for BusState {
    fn fmt(&self, fmt: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            BusState::Disconnected => "Disconnected",
            BusState::Connecting { .. } => "Connecting",
            BusState::Connected { .. } => "Connected",
        };
        fmt.pad(s)
    }
}

/// The per-channel lifecycle state.
#[derive(Debug)]
enum ChannelState {
    /// The channel has been offered by the host; not yet usable by upper
    /// layers.
    Offered,
    /// An open request has been sent to the host.
    Opening,
    Open,
    /// A close request is being sent. Transient within a close call.
    Closing,
    Closed,
}

impl std::fmt::Display for ChannelState {
    fn fmt(&self, fmt: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ChannelState::Offered => "Offered",
            ChannelState::Opening => "Opening",
            ChannelState::Open => "Open",
            ChannelState::Closing => "Closing",
            ChannelState::Closed => "Closed",
        };
        fmt.pad(s)
    }
}

struct Channel {
    offer: protocol::OfferChannel,
    state: ChannelState,
    /// Trusted only when the isolation context and the negotiated feature
    /// flags both allow confidential channels.
    confidential: bool,
    response: Arc<ResponseSlot>,
    ring_gpadl: Option<GpadlId>,
}

struct RootInner {
    state: BusState,
    channels: HashMap<ChannelId, Channel>,
    gpadls: GpadlRegistry,
    connect_slot: Arc<ResponseSlot>,
}

/// Parameters for a bus connection, fixed at construction.
#[derive(Copy, Clone, Debug)]
pub struct ConnectionParams {
    /// The virtual processor the host should target with control messages.
    pub target_message_vp: u32,
    /// How long to wait for any single host response.
    pub response_timeout: Duration,
}

impl Default for ConnectionParams {
    fn default() -> Self {
        Self {
            target_message_vp: 0,
            response_timeout: Duration::from_secs(5),
        }
    }
}

/// Describes an open request for a channel whose ring buffer gpadl has
/// already been created.
#[derive(Debug)]
pub struct OpenRequest {
    pub ring_gpadl: GpadlId,
    pub target_vp: u32,
    pub downstream_ring_buffer_page_offset: u32,
    pub user_data: protocol::UserDefinedData,
}

/// A request to attach a page range to an allocated gpadl handle and
/// publish it to the host.
#[derive(Copy, Clone, Debug)]
pub struct GpadlRequest {
    pub gpadl_id: GpadlId,
    pub base_pfn: u64,
    pub page_count: u32,
    pub byte_offset: u32,
    pub legacy: bool,
}

/// The root connection between the guest and the host.
///
/// At most one exists per guest. The connection ID it posts on is fixed by
/// the protocol, not negotiated.
pub struct RootConnection {
    inner: Mutex<RootInner>,
    interrupts: InterruptTable,
    poster: Arc<dyn MessagePoster>,
    protection: Arc<dyn MemoryProtection>,
    isolation: IsolationConfig,
    response_timeout: Duration,
    target_message_vp: u32,
}

impl RootConnection {
    pub fn new(
        poster: Arc<dyn MessagePoster>,
        protection: Arc<dyn MemoryProtection>,
        isolation: IsolationConfig,
        params: ConnectionParams,
    ) -> Self {
        Self {
            inner: Mutex::new(RootInner {
                state: BusState::Disconnected,
                channels: HashMap::new(),
                gpadls: GpadlRegistry::new(),
                connect_slot: ResponseSlot::new(),
            }),
            interrupts: InterruptTable::new(MAX_CHANNELS),
            poster,
            protection,
            isolation,
            response_timeout: params.response_timeout,
            target_message_vp: params.target_message_vp,
        }
    }

    fn post(&self, message: &OutgoingMessage) -> std::io::Result<()> {
        self.poster.post_message(
            protocol::VMBUS_MESSAGE_CONNECTION_ID,
            protocol::VMBUS_MESSAGE_TYPE,
            message.data(),
        )
    }

    fn send_message<T>(&self, msg: &T) -> std::io::Result<()>
    where
        T: IntoBytes + BusMessage + std::fmt::Debug + Immutable + KnownLayout,
    {
        tracing::trace!(typ = ?T::MESSAGE_TYPE, "sending message to host");
        self.post(&OutgoingMessage::new(msg))
    }

    /// Negotiates the protocol version with the host, walking the supported
    /// version list from highest to lowest until the host accepts one.
    pub fn connect(&self) -> Result<VersionInfo, ConnectError> {
        for &version in SUPPORTED_VERSIONS.iter().rev() {
            let pending = {
                let mut inner = self.inner.lock();
                if !matches!(inner.state, BusState::Disconnected) {
                    return Err(ConnectError::InvalidState);
                }
                let pending = inner
                    .connect_slot
                    .clone()
                    .begin_wait()
                    .map_err(|_| ConnectError::InvalidState)?;
                inner.state = BusState::Connecting { version };
                pending
            };

            // Feature flags only ride on Copper and above.
            let feature_flags = if version >= Version::Copper {
                SUPPORTED_FEATURE_FLAGS
            } else {
                FeatureFlags::new()
            };

            tracing::debug!(version = ?version, ?feature_flags, "connecting to host");
            let target_info = protocol::TargetInfo::new()
                .with_sint(SINT)
                .with_vtl(VTL)
                .with_feature_flags(feature_flags.into_bits());
            let msg = protocol::InitiateContact {
                version_requested: version as u32,
                target_message_vp: self.target_message_vp,
                interrupt_page_or_target_info: target_info.into_bits(),
                parent_to_child_monitor_page_gpa: 0,
                child_to_parent_monitor_page_gpa: 0,
            };

            if let Err(err) = self.send_message(&msg) {
                drop(pending);
                self.inner.lock().state = BusState::Disconnected;
                return Err(ConnectError::Post(err));
            }

            let response = match pending.wait(self.response_timeout) {
                Ok(Response::VersionResponse(response)) => response,
                Ok(_) => unreachable!("connect slot only receives version responses"),
                Err(WaitError::Revoked) => unreachable!("connect slot is never revoked"),
                Err(WaitError::Timeout) => {
                    self.inner.lock().state = BusState::Disconnected;
                    return Err(ConnectError::HostUnresponsive);
                }
            };

            if response.version_response.version_supported == 0 {
                tracing::debug!(version = version as u32, "version not supported, retrying");
                self.inner.lock().state = BusState::Disconnected;
                continue;
            }

            if response.version_response.connection_state != ConnectionState::SUCCESSFUL {
                self.inner.lock().state = BusState::Disconnected;
                return Err(ConnectError::FailedToConnect(
                    response.version_response.connection_state,
                ));
            }

            // Only honor the flags this guest asked for; the host's word is
            // not trusted beyond that.
            let feature_flags =
                FeatureFlags::from_bits(response.supported_features) & feature_flags;
            let version = VersionInfo {
                version,
                feature_flags,
            };
            self.inner.lock().state = BusState::Connected { version };
            tracing::info!(?version, "connected to host");
            return Ok(version);
        }

        Err(ConnectError::NoSupportedVersions)
    }

    /// The negotiated version, if connected.
    pub fn version(&self) -> Option<VersionInfo> {
        self.inner.lock().state.version()
    }

    /// Whether every flag in `flags` was negotiated with the host.
    pub fn supports_feature_flag(&self, flags: FeatureFlags) -> bool {
        self.version()
            .is_some_and(|version| version.feature_flags.contains(flags))
    }

    /// Dispatches one inbound control message from the host.
    ///
    /// Unsolicited messages mutate the channel table; responses are routed
    /// to the slot armed for them. Anything malformed, out of sequence, or
    /// referencing an unknown correlation is logged and dropped without
    /// affecting the connection.
    pub fn handle_message(&self, data: &[u8]) -> Result<(), ProtocolError> {
        let version = self.inner.lock().state.version();
        let msg = Message::parse(data, version).map_err(ProtocolError::Parse)?;
        tracing::trace!(?msg, "received message from host");

        let mut inner = self.inner.lock();
        match msg {
            Message::VersionResponse2(response, ..) => {
                self.handle_version_response(&mut inner, response)
            }
            Message::VersionResponse(response, ..) => {
                self.handle_version_response(&mut inner, response.into())
            }
            Message::OfferChannel(offer, ..) => self.handle_offer(&mut inner, offer),
            Message::RescindChannelOffer(rescind, ..) => self.handle_rescind(&mut inner, rescind),
            Message::OpenResult(result, ..) => self.handle_open_result(&mut inner, result),
            Message::GpadlCreated(created, ..) => self.handle_gpadl_created(&mut inner, created),
            Message::GpadlTorndown(torndown, ..) => {
                self.handle_gpadl_torndown(&mut inner, torndown)
            }
            Message::RelIdReleased(released, ..) => {
                self.handle_relid_released(&mut inner, released)
            }
            // Messages only ever sent by the guest.
            Message::OpenChannel(..) => {
                Err(ProtocolError::UnexpectedMessage(MessageType::OPEN_CHANNEL))
            }
            Message::CloseChannel(..) => {
                Err(ProtocolError::UnexpectedMessage(MessageType::CLOSE_CHANNEL))
            }
            Message::GpadlHeader(..) => {
                Err(ProtocolError::UnexpectedMessage(MessageType::GPADL_HEADER))
            }
            Message::GpadlBody(..) => {
                Err(ProtocolError::UnexpectedMessage(MessageType::GPADL_BODY))
            }
            Message::GpadlTeardown(..) => Err(ProtocolError::UnexpectedMessage(
                MessageType::GPADL_TEARDOWN,
            )),
            Message::InitiateContact(..) => Err(ProtocolError::UnexpectedMessage(
                MessageType::INITIATE_CONTACT,
            )),
        }
    }

    fn handle_version_response(
        &self,
        inner: &mut RootInner,
        response: protocol::VersionResponse2,
    ) -> Result<(), ProtocolError> {
        if let BusState::Connecting { version } = inner.state {
            tracing::debug!(
                version = version as u32,
                supported = response.version_response.version_supported,
                "received version response"
            );
            if !inner
                .connect_slot
                .complete(Response::VersionResponse(response))
            {
                tracing::warn!("version response with no waiter");
            }
        } else {
            tracing::warn!(state = %inner.state, "unexpected version response");
        }
        Ok(())
    }

    fn handle_offer(
        &self,
        inner: &mut RootInner,
        offer: protocol::OfferChannel,
    ) -> Result<(), ProtocolError> {
        let channel_id = offer.channel_id;
        if channel_id.0 >= MAX_CHANNELS as u32 {
            return Err(ProtocolError::ChannelIdOutOfRange(channel_id.0));
        }
        if inner.channels.contains_key(&channel_id) {
            return Err(ProtocolError::DuplicateChannelId(channel_id.0));
        }

        let confidential = offer.flags.confidential_ring_buffer()
            && self.isolation.can_use_confidential_channels()
            && inner
                .state
                .version()
                .is_some_and(|version| version.feature_flags.confidential_channels());

        inner.channels.insert(
            channel_id,
            Channel {
                offer,
                state: ChannelState::Offered,
                confidential,
                response: ResponseSlot::new(),
                ring_gpadl: None,
            },
        );

        tracing::info!(
            channel_id = channel_id.0,
            interface_id = %offer.interface_id,
            instance_id = %offer.instance_id,
            confidential,
            "received offer"
        );
        Ok(())
    }

    fn handle_rescind(
        &self,
        inner: &mut RootInner,
        rescind: protocol::RescindChannelOffer,
    ) -> Result<(), ProtocolError> {
        let channel_id = rescind.channel_id;
        let Some(channel) = inner.channels.remove(&channel_id) else {
            // Benign race with a concurrently removed channel.
            tracing::debug!(channel_id = channel_id.0, "rescind for unknown channel");
            return Ok(());
        };
        tracing::info!(channel_id = channel_id.0, state = %channel.state, "channel rescinded");

        // Wake a waiter blocked on an open for this channel.
        channel.response.revoke();

        // And one blocked on a gpadl exchange for it.
        if let Some(pending) = inner.gpadls.pending {
            if inner
                .gpadls
                .get(pending)
                .is_some_and(|entry| entry.channel_id == Some(channel_id))
            {
                inner.gpadls.pending = None;
                inner.gpadls.response.revoke();
            }
        }

        self.interrupts.clear(channel_id.0);
        for protection in inner.gpadls.release_channel(channel_id) {
            self.protection.revoke(protection);
        }

        if let Err(err) = self.send_message(&protocol::RelIdReleased { channel_id }) {
            tracing::warn!(
                error = &err as &dyn std::error::Error,
                channel_id = channel_id.0,
                "failed to release channel id"
            );
        }
        Ok(())
    }

    fn handle_relid_released(
        &self,
        inner: &mut RootInner,
        released: protocol::RelIdReleased,
    ) -> Result<(), ProtocolError> {
        let channel_id = released.channel_id;
        let Some(channel) = inner.channels.remove(&channel_id) else {
            tracing::debug!(channel_id = channel_id.0, "release for unknown channel");
            return Ok(());
        };
        tracing::info!(channel_id = channel_id.0, state = %channel.state, "channel id released");

        channel.response.revoke();
        self.interrupts.clear(channel_id.0);
        for protection in inner.gpadls.release_channel(channel_id) {
            self.protection.revoke(protection);
        }
        Ok(())
    }

    fn handle_open_result(
        &self,
        inner: &mut RootInner,
        result: protocol::OpenResult,
    ) -> Result<(), ProtocolError> {
        let Some(channel) = inner.channels.get(&result.channel_id) else {
            // A late result for a channel that was rescinded while the open
            // was outstanding.
            tracing::debug!(
                channel_id = result.channel_id.0,
                "open result for unknown channel"
            );
            return Ok(());
        };

        tracing::debug!(
            channel_id = result.channel_id.0,
            status = result.status,
            "received open result"
        );
        if !channel.response.complete(Response::OpenResult(result)) {
            tracing::warn!(channel_id = result.channel_id.0, "open result with no waiter");
        }
        Ok(())
    }

    fn handle_gpadl_created(
        &self,
        inner: &mut RootInner,
        created: protocol::GpadlCreated,
    ) -> Result<(), ProtocolError> {
        if !inner.gpadls.is_pending(created.gpadl_id) {
            tracing::warn!(
                gpadl_id = created.gpadl_id.0,
                "gpadl created response for unknown request"
            );
            return Ok(());
        }
        if !inner
            .gpadls
            .response
            .complete(Response::GpadlCreated(created))
        {
            tracing::warn!(gpadl_id = created.gpadl_id.0, "gpadl created with no waiter");
        }
        Ok(())
    }

    fn handle_gpadl_torndown(
        &self,
        inner: &mut RootInner,
        torndown: protocol::GpadlTorndown,
    ) -> Result<(), ProtocolError> {
        if !inner.gpadls.is_pending(torndown.gpadl_id) {
            tracing::warn!(
                gpadl_id = torndown.gpadl_id.0,
                "gpadl torndown response for unknown request"
            );
            return Ok(());
        }
        if !inner
            .gpadls
            .response
            .complete(Response::GpadlTorndown(torndown))
        {
            tracing::warn!(gpadl_id = torndown.gpadl_id.0, "gpadl torndown with no waiter");
        }
        Ok(())
    }

    /// Signals the interrupt event bound to a channel. Called from the
    /// platform's interrupt context; takes only the routing table's slot
    /// lock.
    pub fn deliver_interrupt(&self, channel_id: u32) {
        if !self.interrupts.signal(channel_id) {
            tracing::trace!(channel_id, "interrupt for channel without an entry");
        }
    }

    /// The interrupt event for a channel, present while the channel is
    /// opening or open.
    pub fn get_interrupt_event(&self, channel_id: ChannelId) -> Option<Arc<ChannelEvent>> {
        self.interrupts.get(channel_id.0)
    }

    /// The currently offered channels.
    pub fn offers(&self) -> Vec<protocol::OfferChannel> {
        self.inner.lock().channels.values().map(|c| c.offer).collect()
    }

    /// Whether the channel may use encrypted memory for its ring buffer.
    pub fn is_confidential(&self, channel_id: ChannelId) -> bool {
        self.inner
            .lock()
            .channels
            .get(&channel_id)
            .is_some_and(|channel| channel.confidential)
    }

    /// The connection ID used to signal the host for this channel.
    pub fn connection_id(&self, channel_id: ChannelId) -> Option<u32> {
        self.inner
            .lock()
            .channels
            .get(&channel_id)
            .map(|channel| channel.offer.connection_id)
    }

    /// Opens a channel using a previously created ring buffer gpadl.
    ///
    /// The interrupt routing entry is installed before the open message is
    /// sent so an immediate interrupt from the host is not lost. For
    /// confidential channels the ring buffer pages are made host-visible
    /// first; if that fails, no message is sent and the channel stays
    /// closed.
    pub fn open_channel(
        &self,
        channel_id: ChannelId,
        request: &OpenRequest,
    ) -> Result<(), OpenError> {
        let (pending, msg) = {
            let mut inner = self.inner.lock();
            let inner = &mut *inner;
            let channel = inner
                .channels
                .get_mut(&channel_id)
                .ok_or(OpenError::UnknownChannel(channel_id.0))?;
            match channel.state {
                ChannelState::Offered | ChannelState::Closed => {}
                _ => return Err(OpenError::InvalidChannelState),
            }

            let (ring_base, ring_pages) = inner
                .gpadls
                .get(request.ring_gpadl)
                .filter(|entry| {
                    entry.state == GpadlState::Created && entry.channel_id == Some(channel_id)
                })
                .map(|entry| (entry.base_pfn, entry.page_count))
                .ok_or(OpenError::InvalidRingGpadl)?;

            let pending = channel
                .response
                .clone()
                .begin_wait()
                .map_err(|_| OpenError::InvalidChannelState)?;

            self.interrupts
                .set(channel_id.0, Arc::new(ChannelEvent::new()));

            if channel.confidential {
                match self.protection.make_visible(ring_base, ring_pages) {
                    Ok(handle) => {
                        inner
                            .gpadls
                            .get_mut(request.ring_gpadl)
                            .expect("validated above")
                            .protection = Some(handle);
                    }
                    Err(err) => {
                        drop(pending);
                        self.interrupts.clear(channel_id.0);
                        channel.state = ChannelState::Closed;
                        return Err(OpenError::IsolationBoundary(err));
                    }
                }
            }

            channel.state = ChannelState::Opening;
            channel.ring_gpadl = Some(request.ring_gpadl);

            tracing::info!(channel_id = channel_id.0, "opening channel on host");
            let msg = protocol::OpenChannel {
                channel_id,
                open_id: 0,
                ring_buffer_gpadl_id: request.ring_gpadl,
                target_vp: request.target_vp,
                downstream_ring_buffer_page_offset: request.downstream_ring_buffer_page_offset,
                user_data: request.user_data,
            };
            (pending, msg)
        };

        if let Err(err) = self.send_message(&msg) {
            drop(pending);
            self.unwind_open(channel_id);
            return Err(OpenError::Post(err));
        }

        match pending.wait(self.response_timeout) {
            Ok(Response::OpenResult(result)) => {
                if result.status == protocol::STATUS_SUCCESS as u32 {
                    let mut inner = self.inner.lock();
                    let Some(channel) = inner.channels.get_mut(&channel_id) else {
                        // Rescinded between the result and here.
                        return Err(OpenError::Revoked);
                    };
                    channel.state = ChannelState::Open;
                    tracing::info!(channel_id = channel_id.0, "channel opened");
                    Ok(())
                } else {
                    tracing::warn!(
                        channel_id = channel_id.0,
                        status = result.status,
                        "host rejected open"
                    );
                    self.unwind_open(channel_id);
                    self.release_ring_gpadl(channel_id, request.ring_gpadl);
                    Err(OpenError::OpenRejected(result.status))
                }
            }
            Ok(_) => unreachable!("channel slot only receives open results"),
            Err(WaitError::Revoked) => Err(OpenError::Revoked),
            Err(WaitError::Timeout) => {
                // The host may still act on the request; the channel is
                // indeterminate until the caller reconciles it.
                self.unwind_open(channel_id);
                Err(OpenError::HostUnresponsive)
            }
        }
    }

    /// Rolls a failed open attempt back to Closed, removing the interrupt
    /// entry and revoking any visibility grant made for the attempt.
    fn unwind_open(&self, channel_id: ChannelId) {
        let mut inner = self.inner.lock();
        let inner = &mut *inner;
        if let Some(channel) = inner.channels.get_mut(&channel_id) {
            self.interrupts.clear(channel_id.0);
            if let Some(gpadl_id) = channel.ring_gpadl {
                if let Some(entry) = inner.gpadls.get_mut(gpadl_id) {
                    if let Some(protection) = entry.protection.take() {
                        self.protection.revoke(protection);
                    }
                }
            }
            channel.state = ChannelState::Closed;
        }
    }

    fn release_ring_gpadl(&self, channel_id: ChannelId, gpadl_id: GpadlId) {
        if let Err(err) = self.reclaim_gpadl(gpadl_id) {
            tracing::warn!(
                channel_id = channel_id.0,
                gpadl_id = gpadl_id.0,
                error = &err as &dyn std::error::Error,
                "failed to reclaim ring gpadl"
            );
        }
    }

    /// Closes an open channel.
    ///
    /// The protocol defines no response to the close message, so the
    /// channel is Closed as soon as the message is sent. Close on an
    /// already closed channel is a no-op and does not emit a second
    /// message.
    pub fn close_channel(&self, channel_id: ChannelId) -> Result<(), CloseError> {
        let mut inner = self.inner.lock();
        let inner = &mut *inner;
        let channel = inner
            .channels
            .get_mut(&channel_id)
            .ok_or(CloseError::UnknownChannel(channel_id.0))?;
        match channel.state {
            ChannelState::Open => {}
            ChannelState::Closed => {
                tracing::debug!(channel_id = channel_id.0, "channel already closed");
                return Ok(());
            }
            _ => return Err(CloseError::InvalidChannelState),
        }

        channel.state = ChannelState::Closing;
        tracing::info!(channel_id = channel_id.0, "closing channel on host");
        if let Err(err) = self.send_message(&protocol::CloseChannel { channel_id }) {
            channel.state = ChannelState::Open;
            return Err(CloseError::Post(err));
        }

        // Clearing the entry takes the slot lock, which drains any
        // in-flight interrupt delivery for this channel first.
        self.interrupts.clear(channel_id.0);

        // Visibility is revoked only once the channel is down.
        if let Some(gpadl_id) = channel.ring_gpadl.take() {
            if let Some(entry) = inner.gpadls.get_mut(gpadl_id) {
                if let Some(protection) = entry.protection.take() {
                    self.protection.revoke(protection);
                }
            }
        }
        channel.state = ChannelState::Closed;
        Ok(())
    }

    /// Draws a free gpadl handle from the pool.
    pub fn get_free_gpadl(&self) -> Result<GpadlId, GpadlError> {
        let mut inner = self.inner.lock();
        let id = inner
            .gpadls
            .allocate()
            .ok_or(GpadlError::ResourceExhausted)?;
        tracing::debug!(gpadl_id = id.0, "allocated gpadl handle");
        Ok(id)
    }

    /// Attaches a contiguous page range to an allocated handle and
    /// publishes it to the host, blocking until the host acknowledges
    /// creation.
    pub fn set_gpadl_page_range(
        &self,
        channel_id: ChannelId,
        gpadl_id: GpadlId,
        base_pfn: u64,
        page_count: u32,
    ) -> Result<(), GpadlError> {
        self.create_gpadl(
            channel_id,
            GpadlRequest {
                gpadl_id,
                base_pfn,
                page_count,
                byte_offset: 0,
                legacy: false,
            },
        )
    }

    /// Full-control variant of [`Self::set_gpadl_page_range`].
    pub fn create_gpadl(
        &self,
        channel_id: ChannelId,
        request: GpadlRequest,
    ) -> Result<(), GpadlError> {
        let (pending, messages) = {
            let mut inner = self.inner.lock();
            let inner = &mut *inner;
            let channel = inner
                .channels
                .get(&channel_id)
                .ok_or(GpadlError::UnknownChannel(channel_id.0))?;
            let confidential = channel.confidential;

            if request.page_count == 0
                || request.page_count > gpadl::max_page_count()
                || request.byte_offset as usize
                    >= request.page_count as usize * protocol::PAGE_SIZE
            {
                return Err(GpadlError::InvalidPageRange);
            }

            if inner
                .gpadls
                .get(request.gpadl_id)
                .ok_or(GpadlError::InvalidHandle)?
                .state
                != GpadlState::Allocated
            {
                return Err(GpadlError::InvalidHandle);
            }

            let pending = inner
                .gpadls
                .response
                .clone()
                .begin_wait()
                .map_err(|_| GpadlError::RequestOutstanding)?;
            let entry = inner
                .gpadls
                .get_mut(request.gpadl_id)
                .expect("handle validated above");
            entry.state = GpadlState::Creating;
            entry.channel_id = Some(channel_id);
            entry.base_pfn = request.base_pfn;
            entry.page_count = request.page_count;
            entry.byte_offset = request.byte_offset;
            entry.legacy = request.legacy;

            // Confidential channel memory stays private; anything else is
            // published through the host-visible alias.
            let pages: Vec<u64> = (0..entry.page_count as u64)
                .map(|i| {
                    let pfn = entry.base_pfn + i;
                    if confidential {
                        pfn
                    } else {
                        self.isolation.host_visible_gpn(pfn)
                    }
                })
                .collect();

            tracing::debug!(
                channel_id = channel_id.0,
                gpadl_id = request.gpadl_id.0,
                count = entry.page_count,
                "creating gpadl"
            );
            let messages = gpadl::create_messages(
                channel_id,
                request.gpadl_id,
                entry.byte_offset,
                entry.legacy,
                &pages,
            );
            inner.gpadls.pending = Some(request.gpadl_id);
            (pending, messages)
        };

        for message in &messages {
            if let Err(err) = self.post(message) {
                drop(pending);
                let mut inner = self.inner.lock();
                inner.gpadls.pending = None;
                if let Some(entry) = inner.gpadls.get_mut(request.gpadl_id) {
                    entry.state = GpadlState::Allocated;
                }
                return Err(GpadlError::Post(err));
            }
        }

        match pending.wait(self.response_timeout) {
            Ok(Response::GpadlCreated(created)) => {
                let mut inner = self.inner.lock();
                inner.gpadls.pending = None;
                let entry = inner
                    .gpadls
                    .get_mut(request.gpadl_id)
                    .expect("handle validated above");
                if entry.state != GpadlState::Creating {
                    // Freed by a rescind while the response was in flight.
                    return Err(GpadlError::Revoked);
                }
                if created.status == protocol::STATUS_SUCCESS {
                    entry.state = GpadlState::Created;
                    Ok(())
                } else {
                    entry.state = GpadlState::Allocated;
                    Err(GpadlError::CreateRejected(created.status))
                }
            }
            Ok(_) => unreachable!("gpadl slot only receives gpadl responses"),
            Err(WaitError::Revoked) => Err(GpadlError::Revoked),
            Err(WaitError::Timeout) => {
                // Leave the handle in Creating: it must not be reused while
                // the created response may still arrive. Reclaim reconciles
                // it.
                self.inner.lock().gpadls.pending = None;
                Err(GpadlError::HostUnresponsive)
            }
        }
    }

    /// Confirms a handle is fully created and usable for a ring buffer or a
    /// teardown.
    pub fn validate_gpadl(&self, gpadl_id: GpadlId) -> bool {
        self.inner.lock().gpadls.validate(gpadl_id)
    }

    /// Returns a handle to the free pool, tearing the mapping down with the
    /// host if it was ever published. Idempotent against a handle that is
    /// already free.
    pub fn reclaim_gpadl(&self, gpadl_id: GpadlId) -> Result<(), GpadlError> {
        let pending = {
            let mut inner = self.inner.lock();
            let inner = &mut *inner;
            let (previous, bound_channel) = {
                let entry = inner
                    .gpadls
                    .get(gpadl_id)
                    .ok_or(GpadlError::InvalidHandle)?;
                (entry.state, entry.channel_id)
            };
            match previous {
                GpadlState::Free => return Ok(()),
                GpadlState::Allocated => {
                    if let Some(protection) = inner.gpadls.free(gpadl_id) {
                        self.protection.revoke(protection);
                    }
                    tracing::debug!(gpadl_id = gpadl_id.0, "reclaimed unused gpadl handle");
                    return Ok(());
                }
                GpadlState::TearingDown => {
                    // A teardown is already in flight; duplicate reclaims
                    // during error unwinding are tolerated.
                    return Ok(());
                }
                GpadlState::Creating | GpadlState::Created => {}
            }

            let channel_id = bound_channel.expect("bound when the page range was set");
            let pending = inner
                .gpadls
                .response
                .clone()
                .begin_wait()
                .map_err(|_| GpadlError::RequestOutstanding)?;
            inner
                .gpadls
                .get_mut(gpadl_id)
                .expect("handle validated above")
                .state = GpadlState::TearingDown;
            inner.gpadls.pending = Some(gpadl_id);

            tracing::debug!(
                channel_id = channel_id.0,
                gpadl_id = gpadl_id.0,
                "tearing down gpadl"
            );
            if let Err(err) = self.send_message(&protocol::GpadlTeardown {
                channel_id,
                gpadl_id,
            }) {
                drop(pending);
                inner.gpadls.pending = None;
                if let Some(entry) = inner.gpadls.get_mut(gpadl_id) {
                    entry.state = previous;
                }
                return Err(GpadlError::Post(err));
            }
            pending
        };

        match pending.wait(self.response_timeout) {
            Ok(Response::GpadlTorndown(_)) => {
                let mut inner = self.inner.lock();
                inner.gpadls.pending = None;
                if let Some(protection) = inner.gpadls.free(gpadl_id) {
                    self.protection.revoke(protection);
                }
                tracing::debug!(gpadl_id = gpadl_id.0, "gpadl torn down");
                Ok(())
            }
            Ok(_) => unreachable!("gpadl slot only receives gpadl responses"),
            Err(WaitError::Revoked) => {
                // The owning channel was rescinded; the handle has already
                // been returned to the pool.
                Ok(())
            }
            Err(WaitError::Timeout) => {
                self.inner.lock().gpadls.pending = None;
                Err(GpadlError::HostUnresponsive)
            }
        }
    }

    /// Tears the bus connection down: closes every open channel and
    /// reclaims every live gpadl, then returns to the disconnected state.
    pub fn shutdown(&self) {
        let open: Vec<ChannelId> = {
            let inner = self.inner.lock();
            inner
                .channels
                .iter()
                .filter(|(_, channel)| matches!(channel.state, ChannelState::Open))
                .map(|(&id, _)| id)
                .collect()
        };
        for channel_id in open {
            if let Err(err) = self.close_channel(channel_id) {
                tracing::warn!(
                    channel_id = channel_id.0,
                    error = &err as &dyn std::error::Error,
                    "failed to close channel during shutdown"
                );
            }
        }

        for gpadl_id in {
            let inner = self.inner.lock();
            inner.gpadls.live_handles()
        } {
            if let Err(err) = self.reclaim_gpadl(gpadl_id) {
                tracing::warn!(
                    gpadl_id = gpadl_id.0,
                    error = &err as &dyn std::error::Error,
                    "failed to reclaim gpadl during shutdown"
                );
            }
        }

        self.inner.lock().state = BusState::Disconnected;
        tracing::info!("bus connection shut down");
    }
}
