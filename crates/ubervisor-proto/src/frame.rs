use std::io;

use tokio::io::{AsyncRead, AsyncReadExt};

/// Maximum payload of a single chunk.
pub const CHUNKSIZ: usize = 16384;

/// Continuation flag in the 16-bit length field: when set, another chunk
/// with the same cid follows and the payload length is `len & !CHUNKEXT`.
pub const CHUNKEXT: u16 = 0x8000;

/// Cap on a reassembled multi-chunk message. A peer that keeps sending
/// continuation chunks past this is cut off.
pub const MSG_MAX: usize = 16 * CHUNKSIZ;

/// One complete logical message: the client-chosen correlation id and the
/// reassembled payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub cid: u16,
    pub payload: Vec<u8>,
}

#[derive(Debug)]
pub enum FrameError {
    /// Zero-length chunks are illegal.
    ZeroLength,
    /// Cid 0 is reserved and never valid on the wire.
    ZeroCid,
    /// Declared chunk payload exceeds CHUNKSIZ.
    Oversize(usize),
    /// A continuation chunk switched cids mid-message.
    CidMismatch { expected: u16, got: u16 },
    /// Reassembled message would exceed MSG_MAX.
    TooLarge(usize),
    /// Stream ended inside a chunk or between chunks of one message.
    Truncated,
    Io(io::Error),
}

impl std::fmt::Display for FrameError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FrameError::ZeroLength => write!(f, "zero-length chunk"),
            FrameError::ZeroCid => write!(f, "zero cid"),
            FrameError::Oversize(n) => {
                write!(f, "chunk payload too large: {} > {}", n, CHUNKSIZ)
            }
            FrameError::CidMismatch { expected, got } => {
                write!(f, "cid changed mid-message: {} -> {}", expected, got)
            }
            FrameError::TooLarge(n) => {
                write!(f, "message too large: {} > {}", n, MSG_MAX)
            }
            FrameError::Truncated => write!(f, "stream truncated mid-message"),
            FrameError::Io(e) => write!(f, "read failed: {}", e),
        }
    }
}

impl std::error::Error for FrameError {}

impl From<io::Error> for FrameError {
    fn from(e: io::Error) -> Self {
        FrameError::Io(e)
    }
}

/// Frame `payload` into one or more chunks carrying `cid`. Every chunk but
/// the last has CHUNKEXT set in its length field.
pub fn encode_message(cid: u16, payload: &[u8]) -> Vec<u8> {
    debug_assert!(!payload.is_empty());
    debug_assert!(cid != 0);
    let mut out = Vec::with_capacity(payload.len() + 8);
    let mut off = 0;
    loop {
        let remaining = payload.len() - off;
        let (len_field, take) = if remaining > CHUNKSIZ {
            (CHUNKEXT | CHUNKSIZ as u16, CHUNKSIZ)
        } else {
            (remaining as u16, remaining)
        };
        out.extend_from_slice(&len_field.to_be_bytes());
        out.extend_from_slice(&cid.to_be_bytes());
        out.extend_from_slice(&payload[off..off + take]);
        off += take;
        if off >= payload.len() {
            return out;
        }
    }
}

/// Read one complete message, reassembling continuation chunks.
///
/// Returns `Ok(None)` on a clean EOF at a message boundary; EOF anywhere
/// else is [`FrameError::Truncated`].
pub async fn read_message<R>(reader: &mut R) -> Result<Option<Message>, FrameError>
where
    R: AsyncRead + Unpin,
{
    let mut payload = Vec::new();
    let mut msg_cid: Option<u16> = None;

    loop {
        let len_field = match read_u16(reader).await {
            Ok(v) => v,
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                if msg_cid.is_none() && payload.is_empty() {
                    return Ok(None);
                }
                return Err(FrameError::Truncated);
            }
            Err(e) => return Err(e.into()),
        };

        let more = len_field & CHUNKEXT != 0;
        let len = (len_field & !CHUNKEXT) as usize;
        if len == 0 {
            return Err(FrameError::ZeroLength);
        }
        if len > CHUNKSIZ {
            return Err(FrameError::Oversize(len));
        }

        let cid = read_u16(reader)
            .await
            .map_err(|e| truncated_or_io(e))?;
        if cid == 0 {
            return Err(FrameError::ZeroCid);
        }
        match msg_cid {
            None => msg_cid = Some(cid),
            Some(expected) if expected != cid => {
                return Err(FrameError::CidMismatch { expected, got: cid });
            }
            Some(_) => {}
        }

        if payload.len() + len > MSG_MAX {
            return Err(FrameError::TooLarge(payload.len() + len));
        }

        let start = payload.len();
        payload.resize(start + len, 0);
        reader
            .read_exact(&mut payload[start..])
            .await
            .map_err(|e| truncated_or_io(e))?;

        if !more {
            // msg_cid is always set once the first chunk header was read
            let cid = msg_cid.unwrap_or_default();
            return Ok(Some(Message { cid, payload }));
        }
    }
}

fn truncated_or_io(e: io::Error) -> FrameError {
    if e.kind() == io::ErrorKind::UnexpectedEof {
        FrameError::Truncated
    } else {
        FrameError::Io(e)
    }
}

async fn read_u16<R>(reader: &mut R) -> io::Result<u16>
where
    R: AsyncRead + Unpin,
{
    let mut buf = [0u8; 2];
    reader.read_exact(&mut buf).await?;
    Ok(u16::from_be_bytes(buf))
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn decode(bytes: &[u8]) -> Result<Option<Message>, FrameError> {
        let mut slice = bytes;
        read_message(&mut slice).await
    }

    #[tokio::test]
    async fn single_chunk_round_trip() {
        let encoded = encode_message(7, b"LIST");
        assert_eq!(&encoded[..2], &4u16.to_be_bytes());
        assert_eq!(&encoded[2..4], &7u16.to_be_bytes());
        assert_eq!(&encoded[4..], b"LIST");

        let msg = decode(&encoded).await.unwrap().unwrap();
        assert_eq!(msg.cid, 7);
        assert_eq!(msg.payload, b"LIST");
    }

    #[tokio::test]
    async fn multi_chunk_round_trip() {
        let payload: Vec<u8> = (0..CHUNKSIZ * 2 + 100).map(|i| i as u8).collect();
        let encoded = encode_message(9, &payload);

        // Three chunks: two full with CHUNKEXT, one trailing without.
        let first_len = u16::from_be_bytes([encoded[0], encoded[1]]);
        assert_eq!(first_len, CHUNKEXT | CHUNKSIZ as u16);

        let msg = decode(&encoded).await.unwrap().unwrap();
        assert_eq!(msg.cid, 9);
        assert_eq!(msg.payload, payload);
    }

    #[tokio::test]
    async fn clean_eof_returns_none() {
        assert!(decode(b"").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn eof_between_chunks_is_truncated() {
        let payload: Vec<u8> = vec![1; CHUNKSIZ + 1];
        let encoded = encode_message(3, &payload);
        // Cut off after the first full chunk.
        let cut = &encoded[..4 + CHUNKSIZ];
        assert!(matches!(decode(cut).await, Err(FrameError::Truncated)));
    }

    #[tokio::test]
    async fn eof_inside_payload_is_truncated() {
        let encoded = encode_message(3, b"DUMP");
        assert!(matches!(
            decode(&encoded[..6]).await,
            Err(FrameError::Truncated)
        ));
    }

    #[tokio::test]
    async fn zero_length_chunk_rejected() {
        let bytes = [0, 0, 0, 1];
        assert!(matches!(decode(&bytes).await, Err(FrameError::ZeroLength)));
    }

    #[tokio::test]
    async fn zero_cid_rejected() {
        let bytes = [0, 4, 0, 0, b'L', b'I', b'S', b'T'];
        assert!(matches!(decode(&bytes).await, Err(FrameError::ZeroCid)));
    }

    #[tokio::test]
    async fn oversize_chunk_rejected() {
        // Length 0x7fff without the continuation bit: over CHUNKSIZ.
        let bytes = [0x7f, 0xff, 0, 1];
        assert!(matches!(
            decode(&bytes).await,
            Err(FrameError::Oversize(_))
        ));
    }

    #[tokio::test]
    async fn cid_switch_mid_message_rejected() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&(CHUNKEXT | 2).to_be_bytes());
        bytes.extend_from_slice(&5u16.to_be_bytes());
        bytes.extend_from_slice(b"ab");
        bytes.extend_from_slice(&2u16.to_be_bytes());
        bytes.extend_from_slice(&6u16.to_be_bytes());
        bytes.extend_from_slice(b"cd");
        assert!(matches!(
            decode(&bytes).await,
            Err(FrameError::CidMismatch { expected: 5, got: 6 })
        ));
    }

    #[tokio::test]
    async fn runaway_continuation_rejected() {
        let mut bytes = Vec::new();
        for _ in 0..(MSG_MAX / CHUNKSIZ) + 1 {
            bytes.extend_from_slice(&(CHUNKEXT | CHUNKSIZ as u16).to_be_bytes());
            bytes.extend_from_slice(&5u16.to_be_bytes());
            bytes.extend_from_slice(&vec![0u8; CHUNKSIZ]);
        }
        assert!(matches!(decode(&bytes).await, Err(FrameError::TooLarge(_))));
    }

    #[tokio::test]
    async fn two_messages_back_to_back() {
        let mut bytes = encode_message(1, b"HELO");
        bytes.extend_from_slice(&encode_message(2, b"LIST"));
        let mut slice = &bytes[..];
        let a = read_message(&mut slice).await.unwrap().unwrap();
        let b = read_message(&mut slice).await.unwrap().unwrap();
        assert_eq!((a.cid, a.payload.as_slice()), (1, &b"HELO"[..]));
        assert_eq!((b.cid, b.payload.as_slice()), (2, &b"LIST"[..]));
        assert!(read_message(&mut slice).await.unwrap().is_none());
    }

    #[test]
    fn exact_chunksiz_payload_is_single_chunk() {
        let payload = vec![7u8; CHUNKSIZ];
        let encoded = encode_message(4, &payload);
        assert_eq!(encoded.len(), 4 + CHUNKSIZ);
        let len = u16::from_be_bytes([encoded[0], encoded[1]]);
        assert_eq!(len & CHUNKEXT, 0);
        assert_eq!(len as usize, CHUNKSIZ);
    }
}
