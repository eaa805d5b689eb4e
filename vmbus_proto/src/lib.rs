// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Wire protocol for the paravirtualized inter-partition bus: control
//! message definitions, version negotiation types, and outgoing message
//! serialization. The engine that speaks this protocol lives in
//! `vmbus_guest`.

#![forbid(unsafe_code)]

mod guid;
pub mod protocol;

pub use guid::Guid;

use protocol::BusMessage;
use protocol::HEADER_SIZE;
use protocol::MAX_MESSAGE_SIZE;
use protocol::MessageHeader;
use zerocopy::Immutable;
use zerocopy::IntoBytes;
use zerocopy::KnownLayout;

/// The version and feature flags agreed with the host.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct VersionInfo {
    pub version: protocol::Version,
    pub feature_flags: protocol::FeatureFlags,
}

/// A control message frame ready to post to the host.
#[derive(Clone, Debug)]
pub struct OutgoingMessage {
    data: [u8; MAX_MESSAGE_SIZE],
    len: u8,
}

impl OutgoingMessage {
    /// Frames the given protocol message.
    pub fn new<T: IntoBytes + Immutable + KnownLayout + BusMessage>(message: &T) -> Self {
        let mut data = [0; MAX_MESSAGE_SIZE];
        let header = MessageHeader::new(T::MESSAGE_TYPE);
        let message_bytes = message.as_bytes();
        let len = HEADER_SIZE + message_bytes.len();
        data[..HEADER_SIZE].copy_from_slice(header.as_bytes());
        data[HEADER_SIZE..len].copy_from_slice(message_bytes);
        Self {
            data,
            len: len as u8,
        }
    }

    /// Frames the given protocol message with trailing data appended, as
    /// used for GPADL page lists.
    ///
    /// Panics if the message and data together exceed the maximum frame
    /// size.
    pub fn with_data<T: IntoBytes + Immutable + KnownLayout + BusMessage>(
        message: &T,
        data: &[u8],
    ) -> Self {
        let mut message = OutgoingMessage::new(message);
        let old_len = message.len as usize;
        let len = old_len + data.len();
        message.data[old_len..len].copy_from_slice(data);
        message.len = len as u8;
        message
    }

    /// The bytes to place in the frame, header included.
    pub fn data(&self) -> &[u8] {
        &self.data[..self.len as usize]
    }
}

impl PartialEq for OutgoingMessage {
    fn eq(&self, other: &Self) -> bool {
        self.data() == other.data()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::ChannelId;
    use crate::protocol::GpadlId;
    use crate::protocol::Message;
    use crate::protocol::MessageType;
    use crate::protocol::Version;
    use zerocopy::FromZeros;

    fn version(version: Version) -> Option<VersionInfo> {
        Some(VersionInfo {
            version,
            feature_flags: protocol::FeatureFlags::new(),
        })
    }

    #[test]
    fn test_outgoing_message() {
        let message = OutgoingMessage::new(&protocol::CloseChannel {
            channel_id: ChannelId(5),
        });

        assert_eq!(&[0x7, 0, 0, 0, 0, 0, 0, 0, 0x5, 0, 0, 0], message.data())
    }

    #[test]
    fn test_outgoing_message_with_data() {
        let message = OutgoingMessage::with_data(
            &protocol::GpadlHeader {
                channel_id: ChannelId(5),
                gpadl_id: GpadlId(1),
                len: 7,
                count: 6,
            },
            &[0xa, 0xb, 0xc, 0xd],
        );

        assert_eq!(
            &[
                0x8, 0, 0, 0, 0, 0, 0, 0, 0x5, 0, 0, 0, 0x1, 0, 0, 0, 0x7, 0, 0x6, 0, 0xa, 0xb,
                0xc, 0xd
            ],
            message.data()
        )
    }

    #[test]
    fn test_parse_round_trip() {
        let message = OutgoingMessage::new(&protocol::GpadlCreated {
            channel_id: ChannelId(3),
            gpadl_id: GpadlId(8),
            status: protocol::STATUS_SUCCESS,
        });

        let Message::GpadlCreated(parsed, rest) =
            Message::parse(message.data(), version(Version::Copper)).unwrap()
        else {
            panic!("wrong message variant");
        };
        assert_eq!(parsed.channel_id, ChannelId(3));
        assert_eq!(parsed.gpadl_id, GpadlId(8));
        assert_eq!(parsed.status, protocol::STATUS_SUCCESS);
        assert!(rest.is_empty());
    }

    #[test]
    fn test_parse_requires_connection() {
        // Channel messages are not valid before a version is negotiated.
        let message = OutgoingMessage::new(&protocol::CloseChannel {
            channel_id: ChannelId(5),
        });

        assert!(matches!(
            Message::parse(message.data(), None),
            Err(protocol::ParseError::InvalidMessageType(
                MessageType::CLOSE_CHANNEL
            ))
        ));
    }

    #[test]
    fn test_parse_version_response_by_size() {
        let response = protocol::VersionResponse {
            version_supported: 1,
            connection_state: protocol::ConnectionState::SUCCESSFUL,
            padding: 0,
            selected_version_or_connection_id: 0,
        };

        let message = OutgoingMessage::new(&response);
        assert!(matches!(
            Message::parse(message.data(), None).unwrap(),
            Message::VersionResponse(..)
        ));

        let message = OutgoingMessage::new(&protocol::VersionResponse2 {
            version_response: response,
            supported_features: 0x10,
        });
        assert!(matches!(
            Message::parse(message.data(), None).unwrap(),
            Message::VersionResponse2(..)
        ));
    }

    #[test]
    fn test_parse_too_small() {
        let mut data = OutgoingMessage::new(&protocol::OpenResult::new_zeroed())
            .data()
            .to_vec();
        data.truncate(HEADER_SIZE + 2);

        assert!(matches!(
            Message::parse(&data, version(Version::Iron)).unwrap_err(),
            protocol::ParseError::MessageTooSmall(Some(MessageType::OPEN_CHANNEL_RESULT))
        ));
    }
}
