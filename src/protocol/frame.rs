//! Module providing length-prefixed, checksummed framing for request/response payloads.
//!
//! Each frame is laid out as:
//! ```text
//! ┌──────────────┬────────────────┬──────────────────────┬───────────────┐
//! │ length: u32  │ checksum: u32  │ correlation_id: u64  │ payload bytes │
//! └──────────────┴────────────────┴──────────────────────┴───────────────┘
//! ```
//! All header fields are little endian. The checksum is the CRC32 of the payload.

use super::super::error::{Error, Result};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWrite};

pub const FRAME_HEADER_LENGTH: usize = 16;

/// Frames larger than this are rejected as corrupt.
pub const MAX_FRAME_LENGTH: u32 = 64 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub length: u32,
    pub checksum: u32,
    pub correlation_id: u64,
}

impl FrameHeader {
    pub fn from_payload(correlation_id: u64, payload: &[u8]) -> Self {
        Self {
            length: payload.len() as u32,
            checksum: crc32fast::hash(payload),
            correlation_id,
        }
    }

    pub fn from_bytes(header_bytes: &[u8]) -> std::io::Result<Self> {
        let mut cursor = std::io::Cursor::new(header_bytes);

        let length = ReadBytesExt::read_u32::<LittleEndian>(&mut cursor)?;
        let checksum = ReadBytesExt::read_u32::<LittleEndian>(&mut cursor)?;
        let correlation_id = ReadBytesExt::read_u64::<LittleEndian>(&mut cursor)?;

        Ok(Self {
            length,
            checksum,
            correlation_id,
        })
    }

    pub fn as_bytes(self) -> std::io::Result<[u8; FRAME_HEADER_LENGTH]> {
        let mut bytes = [0; FRAME_HEADER_LENGTH];

        let buffer: &mut [u8] = &mut bytes;
        let mut cursor = std::io::Cursor::new(buffer);

        WriteBytesExt::write_u32::<LittleEndian>(&mut cursor, self.length)?;
        WriteBytesExt::write_u32::<LittleEndian>(&mut cursor, self.checksum)?;
        WriteBytesExt::write_u64::<LittleEndian>(&mut cursor, self.correlation_id)?;

        Ok(bytes)
    }

    #[inline]
    pub fn valid_for_payload(&self, payload: &[u8]) -> bool {
        self.length as usize == payload.len() && self.checksum == crc32fast::hash(payload)
    }
}

/// A payload tagged with the correlation id of the request it belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub correlation_id: u64,
    pub payload: Bytes,
}

impl Frame {
    pub fn new(correlation_id: u64, payload: Bytes) -> Self {
        Self {
            correlation_id,
            payload,
        }
    }
}

/// Reads the next frame. Returns `Ok(None)` when the peer closed the stream between frames.
pub async fn read_frame<R>(reader: &mut R) -> Result<Option<Frame>>
where
    R: AsyncRead + Unpin,
{
    use tokio::io::AsyncReadExt;

    let mut header_bytes = [0; FRAME_HEADER_LENGTH];

    match reader.read_exact(&mut header_bytes).await {
        Ok(_) => {}
        Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(err) => return Err(err.into()),
    }

    let header = FrameHeader::from_bytes(&header_bytes)?;

    if header.length > MAX_FRAME_LENGTH {
        return Err(Error::protocol(format!(
            "frame length {} exceeds maximum {}",
            header.length, MAX_FRAME_LENGTH
        )));
    }

    let mut payload = vec![0; header.length as usize];
    reader.read_exact(&mut payload).await?;

    if !header.valid_for_payload(&payload) {
        return Err(Error::protocol(format!(
            "checksum mismatch for frame {}",
            header.correlation_id
        )));
    }

    Ok(Some(Frame::new(header.correlation_id, payload.into())))
}

pub async fn write_frame<W>(writer: &mut W, frame: &Frame) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    use tokio::io::AsyncWriteExt;

    let header = FrameHeader::from_payload(frame.correlation_id, &frame.payload).as_bytes()?;

    writer.write_all(&header).await?;
    writer.write_all(&frame.payload).await?;
    writer.flush().await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::{super::super::error::ErrorKind, *};
    use tokio::io::AsyncWriteExt;

    #[test]
    fn test_frame_header_layout() {
        let header = FrameHeader::from_payload(0x0102030405060708, b"laminar");
        let bytes = header.as_bytes().unwrap();

        assert_eq!(&bytes[0..4], &7u32.to_le_bytes());
        assert_eq!(&bytes[8..16], &0x0102030405060708u64.to_le_bytes());
        assert_eq!(FrameHeader::from_bytes(&bytes).unwrap(), header);

        assert!(header.valid_for_payload(b"laminar"));
        assert!(!header.valid_for_payload(b"laminaR"));
    }

    #[tokio::test]
    async fn test_frames_over_stream() {
        let (mut client, mut server) = tokio::io::duplex(64);

        let writer = tokio::spawn(async move {
            for (correlation_id, payload) in [(1u64, "Lorem"), (2, "ipsum"), (3, "")] {
                write_frame(&mut client, &Frame::new(correlation_id, payload.into()))
                    .await
                    .unwrap();
            }
        });

        for (correlation_id, payload) in [(1u64, "Lorem"), (2, "ipsum"), (3, "")] {
            let frame = read_frame(&mut server).await.unwrap().unwrap();
            assert_eq!(frame.correlation_id, correlation_id);
            assert_eq!(frame.payload, payload.as_bytes());
        }

        writer.await.unwrap();

        assert!(read_frame(&mut server).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_corrupt_frame_rejected() {
        let (mut client, mut server) = tokio::io::duplex(64);

        let mut header = FrameHeader::from_payload(9, b"dolor");
        header.checksum ^= 1;

        client.write_all(&header.as_bytes().unwrap()).await.unwrap();
        client.write_all(b"dolor").await.unwrap();

        assert_eq!(
            read_frame(&mut server).await.unwrap_err().kind(),
            ErrorKind::Protocol
        );
    }
}
