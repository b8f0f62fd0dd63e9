//! Length-prefixed framing shared by every transport.
//!
//! Wire format: `[4-byte big-endian length N][N bytes payload]`. Frames handed
//! to the rest of the bridge always include the 4-byte prefix.

use crate::error::{BridgeError, BridgeResult};
use tokio::io::{AsyncRead, AsyncReadExt};

/// Largest frame (prefix included) the bridge accepts.
pub const MAX_MESSAGE_SIZE: usize = 262144;

/// Size of the length prefix.
pub const HEADER_LEN: usize = 4;

/// Total frame length (prefix included) announced by a header.
pub fn frame_len(header: &[u8]) -> usize {
    let len = u32::from_be_bytes([header[0], header[1], header[2], header[3]]) as usize;
    len.saturating_add(HEADER_LEN)
}

/// Prefix `payload` with its big-endian length.
pub fn encode_frame(payload: &[u8]) -> Vec<u8> {
    let len = payload.len() as u32;
    let mut frame = Vec::with_capacity(HEADER_LEN + payload.len());
    frame.extend_from_slice(&len.to_be_bytes());
    frame.extend_from_slice(payload);
    frame
}

/// Check that `frame` is one complete frame no larger than `max`.
pub fn validate_frame(frame: &[u8], max: usize) -> BridgeResult<()> {
    if frame.len() > max {
        return Err(BridgeError::InvalidFrame(format!(
            "message too long: {} > {max}",
            frame.len()
        )));
    }
    if frame.len() < HEADER_LEN {
        return Err(BridgeError::InvalidFrame(format!(
            "truncated header: {} bytes",
            frame.len()
        )));
    }
    let declared = frame_len(frame);
    if declared != frame.len() {
        return Err(BridgeError::InvalidFrame(format!(
            "declared length {declared} does not match frame size {}",
            frame.len()
        )));
    }
    Ok(())
}

/// Read exactly one frame from `reader` into `buf`, returning its total length.
///
/// The length prefix is parsed once, as soon as four bytes are available, and
/// fixes how many more bytes are read; bytes belonging to a following frame
/// are never consumed.
///
/// # Errors
///
/// - [`BridgeError::Disconnected`] if the stream ends before any byte is read.
/// - [`BridgeError::BufferTooSmall`] if the announced frame does not fit in
///   `buf`. The caller must drop the connection.
/// - [`BridgeError::Io`] on read failure or end of stream mid-frame.
pub async fn read_message<R>(reader: &mut R, buf: &mut [u8]) -> BridgeResult<usize>
where
    R: AsyncRead + Unpin + ?Sized,
{
    if buf.len() < HEADER_LEN {
        return Err(BridgeError::BufferTooSmall {
            needed: HEADER_LEN,
            capacity: buf.len(),
        });
    }

    let mut bytes_read = 0;
    let mut target = HEADER_LEN;
    let mut size_parsed = false;

    while bytes_read < target {
        let n = reader.read(&mut buf[bytes_read..target]).await?;
        if n == 0 {
            if bytes_read == 0 {
                return Err(BridgeError::Disconnected);
            }
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                format!("stream ended after {bytes_read} of {target} bytes"),
            )
            .into());
        }
        bytes_read += n;

        if !size_parsed && bytes_read >= HEADER_LEN {
            let needed = frame_len(&buf[..HEADER_LEN]);
            if needed > buf.len() {
                return Err(BridgeError::BufferTooSmall {
                    needed,
                    capacity: buf.len(),
                });
            }
            target = needed;
            size_parsed = true;
        }
    }

    Ok(bytes_read)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    #[tokio::test]
    async fn read_single_frame() {
        let frame = encode_frame(&[0xAA, 0xBB, 0xCC, 0xDD, 0xEE]);
        assert_eq!(frame, [0, 0, 0, 5, 0xAA, 0xBB, 0xCC, 0xDD, 0xEE]);

        let mut reader = &frame[..];
        let mut buf = vec![0u8; MAX_MESSAGE_SIZE];
        let n = read_message(&mut reader, &mut buf).await.unwrap();
        assert_eq!(&buf[..n], &frame[..]);
    }

    #[tokio::test]
    async fn back_to_back_frames_are_not_merged() {
        let mut wire = encode_frame(b"first");
        wire.extend(encode_frame(b"second!"));

        let mut reader = &wire[..];
        let mut buf = vec![0u8; 64];

        let n = read_message(&mut reader, &mut buf).await.unwrap();
        assert_eq!(&buf[4..n], b"first");
        let n = read_message(&mut reader, &mut buf).await.unwrap();
        assert_eq!(&buf[4..n], b"second!");
        assert!(read_message(&mut reader, &mut buf)
            .await
            .unwrap_err()
            .is_disconnect());
    }

    #[tokio::test]
    async fn partial_reads_accumulate() {
        let frame = encode_frame(&[7u8; 300]);
        // A one-byte pipe forces one byte per read.
        let (mut tx, mut rx) = tokio::io::duplex(1);
        let writer = tokio::spawn({
            let frame = frame.clone();
            async move { tx.write_all(&frame).await.unwrap() }
        });

        let mut buf = vec![0u8; 1024];
        let n = read_message(&mut rx, &mut buf).await.unwrap();
        assert_eq!(n, 304);
        assert_eq!(&buf[..n], &frame[..]);
        writer.await.unwrap();
    }

    #[tokio::test]
    async fn empty_payload_frame() {
        let frame = encode_frame(&[]);
        let mut reader = &frame[..];
        let mut buf = [0u8; 8];
        assert_eq!(read_message(&mut reader, &mut buf).await.unwrap(), 4);
    }

    #[tokio::test]
    async fn oversized_frame_is_rejected() {
        let mut wire = (MAX_MESSAGE_SIZE as u32).to_be_bytes().to_vec();
        wire.extend_from_slice(&[0u8; 16]);

        let mut reader = &wire[..];
        let mut buf = vec![0u8; MAX_MESSAGE_SIZE];
        match read_message(&mut reader, &mut buf).await {
            Err(BridgeError::BufferTooSmall { needed, capacity }) => {
                assert_eq!(needed, MAX_MESSAGE_SIZE + 4);
                assert_eq!(capacity, MAX_MESSAGE_SIZE);
            }
            other => panic!("expected BufferTooSmall, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn largest_frame_fits() {
        let frame = encode_frame(&vec![1u8; MAX_MESSAGE_SIZE - HEADER_LEN]);
        let mut reader = &frame[..];
        let mut buf = vec![0u8; MAX_MESSAGE_SIZE];
        assert_eq!(
            read_message(&mut reader, &mut buf).await.unwrap(),
            MAX_MESSAGE_SIZE
        );
    }

    #[tokio::test]
    async fn eof_mid_frame_is_an_io_error() {
        let wire = [0u8, 0, 0, 10, 1, 2, 3];
        let mut reader = &wire[..];
        let mut buf = [0u8; 64];
        match read_message(&mut reader, &mut buf).await {
            Err(BridgeError::Io(e)) => assert_eq!(e.kind(), std::io::ErrorKind::UnexpectedEof),
            other => panic!("expected io error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn eof_inside_header_is_an_io_error() {
        let wire = [0u8, 0];
        let mut reader = &wire[..];
        let mut buf = [0u8; 64];
        assert!(matches!(
            read_message(&mut reader, &mut buf).await,
            Err(BridgeError::Io(_))
        ));
    }

    #[test]
    fn validate_frame_checks_length() {
        assert!(validate_frame(&encode_frame(b"ok"), MAX_MESSAGE_SIZE).is_ok());
        assert!(validate_frame(&[0, 0, 0, 9, 1], MAX_MESSAGE_SIZE).is_err());
        assert!(validate_frame(&[0, 0], MAX_MESSAGE_SIZE).is_err());
        assert!(validate_frame(&encode_frame(&[0u8; 32]), 16).is_err());
    }
}
