// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

/// Defines the `MessageType` wire discriminant as an open enum: the host may
/// send values outside the known set, so the type is a transparent `u32`
/// newtype with named constants rather than a closed Rust enum.
macro_rules! bus_message_type {
    (pub enum $enum_name:ident, $type_name:ident { $( $num:literal $name:ident $rest:tt, )* }) => {
        /// Represents the message type value that identifies a bus protocol
        /// message.
        #[repr(transparent)]
        #[derive(
            Copy, Clone, Eq, PartialEq, Hash, IntoBytes, FromBytes, Immutable, KnownLayout,
        )]
        pub struct $type_name(pub u32);

        impl $type_name {
            $( pub const $name: Self = Self($num); )*
        }

        impl core::fmt::Debug for $type_name {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                match *self {
                    $( Self::$name => f.pad(stringify!($name)), )*
                    Self(other) => f.debug_tuple(stringify!($type_name)).field(&other).finish(),
                }
            }
        }
    }
}

/// Defines an enum which contains a variant for each message type, and a
/// parse method that converts a received message into one of those variants.
///
/// Messages carrying a minimum version are only parsed when the negotiated
/// version is at least that version; a minimum of 0 means the message is
/// accepted while disconnected. `check_size:true` makes a variant match only
/// when the frame is large enough for it, letting a smaller variant of the
/// same discriminant match instead.
macro_rules! bus_message_enum {
    (pub enum $enum_name:ident, $type_name:ident { $( $num:literal $name:ident { $($type:ident $min_version:tt $($condition_name:ident:$condition_value:tt)*),* } ,)* }) => {
        /// Represents a parsed bus protocol message.
        #[derive(Debug)]
        pub enum $enum_name<'a> {
            $( $($type($type, &'a [u8]),)* )*
        }

        impl<'a> $enum_name<'a> {
            /// Parses a message received from the host into an enum variant,
            /// only accepting messages that are valid for the specified
            /// protocol version.
            ///
            /// Use `None` for the version to only parse messages that are
            /// accepted in a disconnected state.
            pub fn parse(data: &'a [u8], version: Option<VersionInfo>) -> Result<Self, ParseError> {
                let version = version.map(|v| v.version);

                let (header, data) = MessageHeader::read_from_prefix(data)
                    .map_err(|_| ParseError::MessageTooSmall(None))?;

                let message = match header.message_type {
                    $(
                        $($type_name::$name
                            if bus_message_enum!(@create_conditions $type version data $min_version $($condition_name:$condition_value)*) =>
                        {
                            let (message, remaining) = $type::read_from_prefix(data)
                                .map_err(|_| ParseError::MessageTooSmall(Some(header.message_type)))?;

                            Self::$type(message, remaining)
                        })*
                    )*
                    _ => return Err(ParseError::InvalidMessageType(header.message_type)),
                };

                Ok(message)
            }
        }
    };

    (@create_conditions $type:ident $version_ident:ident $data_ident:ident $min_version:tt $($name:ident:$value:tt)*) => {
        $version_ident >= bus_message_enum!(@to_version $min_version)
        $(&& bus_message_enum!(@create_condition $type $data_ident $name $value))*
    };

    (@create_condition $type:ident $data_ident:ident check_size true) => {
        $data_ident.len() >= size_of::<$type>()
    };

    (@to_version 0) => { None };
    (@to_version $version:ident) => { Some(Version::$version) };
}

/// Implements the `BusMessage` trait for each protocol message struct, which
/// provides a constant with the message type for that struct. It also
/// generates a compile-time assert that the message fits in the synic
/// message payload.
macro_rules! bus_message_trait_impl {
    (pub enum $enum_name:ident, $type_name:ident { $( $num:literal $name:ident { $($type:ident $min_version:tt $($condition_name:ident:$condition_value:tt)*),* } ,)* }) => {
        $($(
            impl BusMessage for $type {
                const MESSAGE_TYPE: $type_name = $type_name::$name;
            }

            static_assertions::const_assert!($type::MESSAGE_SIZE <= MAX_MESSAGE_SIZE);
        )*)*
    }
}

/// Defines the message type constants, the parsed message enum, and the
/// `BusMessage` trait implementations for the bus protocol messages. See the
/// macro's usage in protocol.rs for the syntax.
macro_rules! bus_messages {
    ($($contents:tt)*) => {
        bus_message_type!($($contents)*);
        bus_message_enum!($($contents)*);
        bus_message_trait_impl!($($contents)*);
    }
}
