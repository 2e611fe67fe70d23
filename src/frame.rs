//! Frame envelope: `<version>,<type-tag>,<payload fields...>`.
//!
//! The version is checked before the tag, and the tag before any payload
//! field, so a frame from an incompatible peer never reaches variant-specific
//! decoding. Decoding is all-or-nothing: a [`Message`] is only produced once
//! every field of its payload has been read.

use std::fmt;
use std::str::FromStr;

use crate::codec::{FieldReader, FieldWriter};
use crate::error::DecodeError;
use crate::protocol::{Message, MessageType};

/// The only protocol version this client speaks.
pub const PROTOCOL_VERSION: u64 = 1;

/// Encode a message into a complete frame.
pub fn encode(message: &Message) -> String {
    let mut writer = FieldWriter::new();
    writer
        .write_number(PROTOCOL_VERSION)
        .write_number(message.message_type().tag());
    message.write_payload(&mut writer);
    writer.finish()
}

/// Decode one complete frame.
///
/// Characters left over after the payload are ignored, which lets newer
/// peers append fields without breaking this client.
///
/// # Errors
///
/// - [`DecodeError::UnsupportedVersion`] if the version is not
///   [`PROTOCOL_VERSION`]
/// - [`DecodeError::UnknownMessageType`] if the tag is not defined
/// - [`DecodeError::MalformedNumber`] / [`DecodeError::TruncatedString`] for
///   damaged header or payload fields
pub fn decode(frame: &str) -> Result<Message, DecodeError> {
    let mut reader = FieldReader::new(frame);
    let kind = read_header(&mut reader)?;
    let message = Message::read_payload(kind, &mut reader)?;
    if !reader.is_empty() {
        tracing::trace!(
            message_type = %kind,
            trailing = reader.remaining(),
            "ignoring trailing characters after payload"
        );
    }
    Ok(message)
}

/// Read and validate the version and tag.
fn read_header(reader: &mut FieldReader<'_>) -> Result<MessageType, DecodeError> {
    let version = reader.read_number()?;
    if version != PROTOCOL_VERSION {
        return Err(DecodeError::UnsupportedVersion(version));
    }
    let tag = reader.read_number()?;
    MessageType::from_tag(tag).ok_or(DecodeError::UnknownMessageType(tag))
}

impl Message {
    /// Encode this message into a complete frame.
    pub fn encode(&self) -> String {
        encode(self)
    }

    /// Decode one complete frame.
    ///
    /// # Errors
    ///
    /// See [`decode`].
    pub fn decode(frame: &str) -> Result<Message, DecodeError> {
        decode(frame)
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&encode(self))
    }
}

impl FromStr for Message {
    type Err = DecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        decode(s)
    }
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::todo,
    clippy::unimplemented,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;
    use crate::protocol::{AddArena, GetOrSubscribeState, RemovePlayer};

    #[test]
    fn encodes_add_arena() {
        let msg = Message::from(AddArena {
            arena: "lobby1".into(),
            num_players: 20,
        });
        assert_eq!(encode(&msg), "1,1,6,lobby1,20");
        assert_eq!(msg.to_string(), "1,1,6,lobby1,20");
    }

    #[test]
    fn decodes_remove_player() {
        let msg: Message = "1,4,6,lobby1,5,bob".parse().unwrap();
        assert_eq!(
            msg,
            Message::RemovePlayer(RemovePlayer {
                arena: "lobby1".into(),
                player: "bob".into(),
            })
        );
    }

    #[test]
    fn version_is_checked_before_tag() {
        // Tag 99 is unknown too, but the version must win.
        assert_eq!(decode("2,99"), Err(DecodeError::UnsupportedVersion(2)));
        assert_eq!(decode("0,1,1,a,1"), Err(DecodeError::UnsupportedVersion(0)));
    }

    #[test]
    fn unknown_tag_is_rejected() {
        assert_eq!(decode("1,42,3,abc"), Err(DecodeError::UnknownMessageType(42)));
        assert_eq!(decode("1,0"), Err(DecodeError::UnknownMessageType(0)));
    }

    #[test]
    fn missing_header_fields() {
        assert!(matches!(decode(""), Err(DecodeError::MalformedNumber { position: 0 })));
        assert!(matches!(decode("1,"), Err(DecodeError::MalformedNumber { position: 2 })));
        assert!(matches!(decode("v1,1"), Err(DecodeError::MalformedNumber { position: 0 })));
    }

    #[test]
    fn trailing_characters_are_ignored() {
        let msg = decode("1,5,10,extra").unwrap();
        assert_eq!(
            msg,
            Message::GetOrSubscribeState(GetOrSubscribeState { period: 10 })
        );
    }

    #[test]
    fn truncated_payload_produces_no_message() {
        let result = decode("1,2,9,lobby");
        assert_eq!(
            result,
            Err(DecodeError::TruncatedString {
                declared: 9,
                remaining: 5
            })
        );
    }
}
