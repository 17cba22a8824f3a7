//! Message framing for the multiplexed transport
//!
//! Record wire format:
//! - 4 bytes: length (big-endian) of the record body
//! - N bytes: the frame, sealed with the session keys when a session is set
//!
//! Frame layout inside a record:
//! - 1 byte: frame type
//! - 4 bytes: stream id (big-endian)
//! - remaining bytes: payload

use crate::crypto::{CryptoError, SessionKeys};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::codec::{Decoder, Encoder};

/// Maximum record size (16 MB)
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;
/// Largest payload carried by one data frame
pub const MAX_DATA_CHUNK: usize = 64 * 1024;
/// Largest length-prefixed control message exchanged on a stream
pub const MAX_MESSAGE_SIZE: usize = 64 * 1024;

const HEADER_LEN: usize = 5;

/// Framing errors
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("Frame too large: {0} bytes")]
    TooLarge(usize),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("Unknown frame type: {0}")]
    UnknownType(u8),
    #[error("Truncated frame")]
    Truncated,
    #[error("Invalid {0} payload")]
    InvalidPayload(&'static str),
    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),
}

/// Frame types
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameType {
    /// Open a stream; payload is the protocol id
    Open = 1,
    /// Stream accepted by a registered handler
    OpenAck = 2,
    /// Stream bytes
    Data = 3,
    /// Grant send credit; payload is a u32
    WindowUpdate = 4,
    /// Sender will write no more on this stream
    Close = 5,
    /// Abort the stream in both directions
    Reset = 6,
    /// Keepalive ping; payload is a u64 nonce
    Ping = 7,
    /// Keepalive answer echoing the nonce
    Pong = 8,
    /// Connection is shutting down
    GoAway = 9,
}

impl TryFrom<u8> for FrameType {
    type Error = FrameError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::Open),
            2 => Ok(Self::OpenAck),
            3 => Ok(Self::Data),
            4 => Ok(Self::WindowUpdate),
            5 => Ok(Self::Close),
            6 => Ok(Self::Reset),
            7 => Ok(Self::Ping),
            8 => Ok(Self::Pong),
            9 => Ok(Self::GoAway),
            _ => Err(FrameError::UnknownType(value)),
        }
    }
}

/// A multiplexer frame
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Frame {
    pub frame_type: FrameType,
    /// Stream the frame belongs to (0 for connection-level frames)
    pub stream_id: u32,
    pub payload: Bytes,
}

impl Frame {
    /// Create a new frame
    pub fn new(frame_type: FrameType, stream_id: u32, payload: impl Into<Bytes>) -> Self {
        Self {
            frame_type,
            stream_id,
            payload: payload.into(),
        }
    }

    pub fn open(stream_id: u32, protocol: &str) -> Self {
        Self::new(FrameType::Open, stream_id, protocol.as_bytes().to_vec())
    }

    pub fn open_ack(stream_id: u32) -> Self {
        Self::new(FrameType::OpenAck, stream_id, Bytes::new())
    }

    pub fn data(stream_id: u32, payload: Bytes) -> Self {
        Self::new(FrameType::Data, stream_id, payload)
    }

    pub fn window_update(stream_id: u32, credit: u32) -> Self {
        Self::new(FrameType::WindowUpdate, stream_id, credit.to_be_bytes().to_vec())
    }

    pub fn close(stream_id: u32) -> Self {
        Self::new(FrameType::Close, stream_id, Bytes::new())
    }

    pub fn reset(stream_id: u32) -> Self {
        Self::new(FrameType::Reset, stream_id, Bytes::new())
    }

    pub fn ping(nonce: u64) -> Self {
        Self::new(FrameType::Ping, 0, nonce.to_be_bytes().to_vec())
    }

    pub fn pong(nonce: u64) -> Self {
        Self::new(FrameType::Pong, 0, nonce.to_be_bytes().to_vec())
    }

    pub fn go_away() -> Self {
        Self::new(FrameType::GoAway, 0, Bytes::new())
    }

    /// Protocol id of an Open frame
    pub fn protocol(&self) -> Result<&str, FrameError> {
        std::str::from_utf8(&self.payload).map_err(|_| FrameError::InvalidPayload("open"))
    }

    /// Credit of a WindowUpdate frame
    pub fn credit(&self) -> Result<u32, FrameError> {
        let bytes: [u8; 4] = self
            .payload
            .as_ref()
            .try_into()
            .map_err(|_| FrameError::InvalidPayload("window update"))?;
        Ok(u32::from_be_bytes(bytes))
    }

    /// Nonce of a Ping or Pong frame
    pub fn nonce(&self) -> Result<u64, FrameError> {
        let bytes: [u8; 8] = self
            .payload
            .as_ref()
            .try_into()
            .map_err(|_| FrameError::InvalidPayload("ping"))?;
        Ok(u64::from_be_bytes(bytes))
    }

    fn encode_plain(&self, dst: &mut BytesMut) {
        dst.reserve(HEADER_LEN + self.payload.len());
        dst.put_u8(self.frame_type as u8);
        dst.put_u32(self.stream_id);
        dst.put_slice(&self.payload);
    }

    fn decode_plain(mut src: Bytes) -> Result<Self, FrameError> {
        if src.len() < HEADER_LEN {
            return Err(FrameError::Truncated);
        }
        let frame_type = FrameType::try_from(src.get_u8())?;
        let stream_id = src.get_u32();
        Ok(Self {
            frame_type,
            stream_id,
            payload: src,
        })
    }
}

/// Codec for length-prefixed, optionally sealed frames
///
/// A reader and a writer each own a codec built from the same session; the
/// reader only advances the receive counter and the writer the send counter.
pub struct FrameCodec {
    session: Option<SessionKeys>,
}

impl FrameCodec {
    /// Create a plaintext codec
    pub fn new() -> Self {
        Self { session: None }
    }

    /// Create a codec that seals and opens records with session keys
    pub fn with_session(session: SessionKeys) -> Self {
        Self {
            session: Some(session),
        }
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < 4 {
            return Ok(None);
        }

        // Peek at length
        let length = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;

        if length > MAX_FRAME_SIZE {
            return Err(FrameError::TooLarge(length));
        }

        if src.len() < 4 + length {
            src.reserve(4 + length - src.len());
            return Ok(None);
        }

        src.advance(4);
        let record = src.split_to(length).freeze();

        let plain = match &mut self.session {
            Some(session) => Bytes::from(session.decrypt(&record, &[])?),
            None => record,
        };

        Frame::decode_plain(plain).map(Some)
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = FrameError;

    fn encode(&mut self, item: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let mut plain = BytesMut::new();
        item.encode_plain(&mut plain);

        let record = match &mut self.session {
            Some(session) => Bytes::from(session.encrypt(&plain, &[])?),
            None => plain.freeze(),
        };

        if record.len() > MAX_FRAME_SIZE {
            return Err(FrameError::TooLarge(record.len()));
        }

        dst.reserve(4 + record.len());
        dst.put_u32(record.len() as u32);
        dst.put_slice(&record);

        Ok(())
    }
}

/// Write one length-prefixed postcard message
pub async fn write_message<W, T>(io: &mut W, message: &T) -> Result<(), FrameError>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let body = postcard::to_allocvec(message).map_err(|e| FrameError::Serialization(e.to_string()))?;
    if body.len() > MAX_MESSAGE_SIZE {
        return Err(FrameError::TooLarge(body.len()));
    }

    let mut buf = Vec::with_capacity(4 + body.len());
    buf.extend_from_slice(&(body.len() as u32).to_be_bytes());
    buf.extend_from_slice(&body);
    io.write_all(&buf).await?;
    io.flush().await?;
    Ok(())
}

/// Read one length-prefixed postcard message
///
/// Reads exactly the message bytes, never past them.
pub async fn read_message<R, T>(io: &mut R) -> Result<T, FrameError>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let length = io.read_u32().await? as usize;
    if length > MAX_MESSAGE_SIZE {
        return Err(FrameError::TooLarge(length));
    }

    let mut body = vec![0u8; length];
    io.read_exact(&mut body).await?;
    postcard::from_bytes(&body).map_err(|e| FrameError::Serialization(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::EphemeralKeyExchange;
    use serde::Deserialize;
    use x25519_dalek::PublicKey as X25519Public;

    fn sessions() -> (SessionKeys, SessionKeys) {
        let a = EphemeralKeyExchange::new();
        let b = EphemeralKeyExchange::new();
        let a_pub = X25519Public::from(a.public_key());
        let b_pub = X25519Public::from(b.public_key());
        let a_shared = a.exchange(b_pub.as_bytes());
        let b_shared = b.exchange(a_pub.as_bytes());
        (
            SessionKeys::derive(&a_shared, &a_pub, &b_pub, b"framing").unwrap(),
            SessionKeys::derive(&b_shared, &b_pub, &a_pub, b"framing").unwrap(),
        )
    }

    #[test]
    fn test_frame_roundtrip() {
        let mut codec = FrameCodec::new();
        let frame = Frame::data(7, Bytes::from_static(&[1, 2, 3, 4, 5]));

        let mut buf = BytesMut::new();
        codec.encode(frame.clone(), &mut buf).unwrap();

        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, frame);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_partial_record_waits_for_more() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::new();
        codec.encode(Frame::open(1, "/echo/1.0.0"), &mut buf).unwrap();

        let mut partial = buf.split_to(buf.len() - 2);
        assert!(codec.decode(&mut partial).unwrap().is_none());
        partial.unsplit(buf);
        let frame = codec.decode(&mut partial).unwrap().unwrap();
        assert_eq!(frame.protocol().unwrap(), "/echo/1.0.0");
    }

    #[test]
    fn test_sealed_records() {
        let (alice, bob) = sessions();
        let mut writer = FrameCodec::with_session(alice);
        let mut reader = FrameCodec::with_session(bob);

        let mut buf = BytesMut::new();
        writer.encode(Frame::window_update(3, 4096), &mut buf).unwrap();
        writer.encode(Frame::ping(99), &mut buf).unwrap();
        // payload must not appear in the clear
        assert!(!buf.windows(4).any(|w| w == 4096u32.to_be_bytes()));

        let first = reader.decode(&mut buf).unwrap().unwrap();
        assert_eq!(first.credit().unwrap(), 4096);
        let second = reader.decode(&mut buf).unwrap().unwrap();
        assert_eq!(second.nonce().unwrap(), 99);
    }

    #[test]
    fn test_tampered_record_fails() {
        let (alice, bob) = sessions();
        let mut writer = FrameCodec::with_session(alice);
        let mut reader = FrameCodec::with_session(bob);

        let mut buf = BytesMut::new();
        writer.encode(Frame::data(1, Bytes::from_static(b"payload")), &mut buf).unwrap();
        let last = buf.len() - 1;
        buf[last] ^= 0xff;

        assert!(matches!(reader.decode(&mut buf), Err(FrameError::Crypto(_))));
    }

    #[test]
    fn test_rejects_oversized_and_unknown() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::new();
        buf.put_u32((MAX_FRAME_SIZE + 1) as u32);
        assert!(matches!(codec.decode(&mut buf), Err(FrameError::TooLarge(_))));

        let mut buf = BytesMut::new();
        buf.put_u32(5);
        buf.put_u8(200);
        buf.put_u32(0);
        assert!(matches!(codec.decode(&mut buf), Err(FrameError::UnknownType(200))));
    }

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Greeting {
        name: String,
        port: u16,
    }

    #[tokio::test]
    async fn test_message_helpers() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        let sent = Greeting {
            name: "edge-1".into(),
            port: 10006,
        };
        write_message(&mut a, &sent).await.unwrap();
        write_message(&mut a, &sent).await.unwrap();

        let first: Greeting = read_message(&mut b).await.unwrap();
        let second: Greeting = read_message(&mut b).await.unwrap();
        assert_eq!(first, sent);
        assert_eq!(second, sent);
    }
}
