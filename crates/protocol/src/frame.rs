//! Single-channel multiplex framing.
//!
//! Used only when a deployment cannot keep two data channels alive. Every
//! message on the shared channel carries a one-byte type tag:
//! ```text
//! [0]    tag: 0x00 control JSON, 0x01 media-control JSON, 0x02 media binary
//! [1..]  payload, unmodified
//! ```

use crate::messages::Channel;

pub const TAG_CONTROL: u8 = 0x00;
pub const TAG_MEDIA_CONTROL: u8 = 0x01;
pub const TAG_MEDIA_BINARY: u8 = 0x02;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MuxTag {
    Control,
    MediaControl,
    MediaBinary,
}

impl MuxTag {
    pub fn byte(self) -> u8 {
        match self {
            MuxTag::Control => TAG_CONTROL,
            MuxTag::MediaControl => TAG_MEDIA_CONTROL,
            MuxTag::MediaBinary => TAG_MEDIA_BINARY,
        }
    }

    pub fn from_byte(byte: u8) -> Result<Self, FrameError> {
        match byte {
            TAG_CONTROL => Ok(MuxTag::Control),
            TAG_MEDIA_CONTROL => Ok(MuxTag::MediaControl),
            TAG_MEDIA_BINARY => Ok(MuxTag::MediaBinary),
            other => Err(FrameError::UnknownTag(other)),
        }
    }

    /// Tag for a message on a logical channel. `binary` selects the binary
    /// media stream; the control channel only carries JSON.
    pub fn for_message(channel: Channel, binary: bool) -> Result<Self, FrameError> {
        match (channel, binary) {
            (Channel::Control, false) => Ok(MuxTag::Control),
            (Channel::Control, true) => Err(FrameError::BinaryOnControl),
            (Channel::Media, false) => Ok(MuxTag::MediaControl),
            (Channel::Media, true) => Ok(MuxTag::MediaBinary),
        }
    }

    /// Logical channel this tag belongs to.
    pub fn channel(self) -> Channel {
        match self {
            MuxTag::Control => Channel::Control,
            MuxTag::MediaControl | MuxTag::MediaBinary => Channel::Media,
        }
    }

    pub fn is_binary(self) -> bool {
        self == MuxTag::MediaBinary
    }
}

/// Prefix `payload` with the tag byte.
pub fn encode_mux(tag: MuxTag, payload: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(payload.len() + 1);
    buf.push(tag.byte());
    buf.extend_from_slice(payload);
    buf
}

/// Split a multiplexed message into its tag and payload.
pub fn decode_mux(buf: &[u8]) -> Result<(MuxTag, &[u8]), FrameError> {
    let (&tag, payload) = buf.split_first().ok_or(FrameError::Empty)?;
    Ok((MuxTag::from_byte(tag)?, payload))
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FrameError {
    #[error("empty multiplexed message")]
    Empty,
    #[error("unknown multiplex tag: 0x{0:02x}")]
    UnknownTag(u8),
    #[error("binary payloads are not allowed on the control channel")]
    BinaryOnControl,
}
