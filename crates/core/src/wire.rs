//! Bridge wire protocol.
//!
//! Every message is a 4-byte big-endian length prefix followed by a UTF-8
//! JSON payload. Both the synchronous client inside the sandbox and the
//! async listener on the host frame messages with these helpers.

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::io::{Read, Write};

use crate::error::{Error, Result};

/// Largest accepted payload. Guards the listener against garbage lengths.
pub const MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

/// Length of the frame header.
pub const HEADER_BYTES: usize = 4;

/// Serialize `message` into a complete frame (header + payload).
pub fn encode_frame<T: Serialize>(message: &T) -> Result<Vec<u8>> {
    let payload = serde_json::to_vec(message)?;
    check_len(payload.len())?;
    let mut frame = Vec::with_capacity(HEADER_BYTES + payload.len());
    frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    frame.extend_from_slice(&payload);
    Ok(frame)
}

/// Validate a declared payload length.
pub fn check_len(len: usize) -> Result<()> {
    if len > MAX_FRAME_BYTES {
        return Err(Error::wire(format!(
            "frame of {} bytes exceeds the {} byte limit",
            len, MAX_FRAME_BYTES
        )));
    }
    Ok(())
}

/// Parse a payload (without header).
pub fn decode_payload<T: DeserializeOwned>(payload: &[u8]) -> Result<T> {
    serde_json::from_slice(payload).map_err(|e| Error::wire(format!("malformed message: {}", e)))
}

/// Write one message to a blocking stream.
pub fn write_message<W: Write, T: Serialize>(writer: &mut W, message: &T) -> Result<()> {
    let frame = encode_frame(message)?;
    writer.write_all(&frame)?;
    writer.flush()?;
    Ok(())
}

/// Read one message from a blocking stream.
///
/// Returns `Ok(None)` when the peer closed the connection cleanly before a
/// new frame started.
pub fn read_message<R: Read, T: DeserializeOwned>(reader: &mut R) -> Result<Option<T>> {
    let mut header = [0u8; HEADER_BYTES];
    match reader.read_exact(&mut header) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let len = u32::from_be_bytes(header) as usize;
    check_len(len)?;
    let mut payload = vec![0u8; len];
    reader
        .read_exact(&mut payload)
        .map_err(|e| Error::wire(format!("connection closed mid-message: {}", e)))?;
    decode_payload(&payload).map(Some)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{QueryRequest, SessionId};
    use std::io::Cursor;

    #[test]
    fn test_frame_header_is_big_endian_length() {
        let req = QueryRequest::single(SessionId("s".into()), 1, "ping");
        let frame = encode_frame(&req).unwrap();
        let len = u32::from_be_bytes([frame[0], frame[1], frame[2], frame[3]]) as usize;
        assert_eq!(len, frame.len() - HEADER_BYTES);
    }

    #[test]
    fn test_read_back_sequence_then_eof() {
        let a = QueryRequest::single(SessionId("s".into()), 1, "a");
        let b = QueryRequest::single(SessionId("s".into()), 1, "b");
        let mut buf = Vec::new();
        write_message(&mut buf, &a).unwrap();
        write_message(&mut buf, &b).unwrap();

        let mut cursor = Cursor::new(buf);
        let first: Option<QueryRequest> = read_message(&mut cursor).unwrap();
        let second: Option<QueryRequest> = read_message(&mut cursor).unwrap();
        let end: Option<QueryRequest> = read_message(&mut cursor).unwrap();
        assert_eq!(first, Some(a));
        assert_eq!(second, Some(b));
        assert!(end.is_none());
    }

    #[test]
    fn test_oversize_frame_rejected() {
        let mut buf = ((MAX_FRAME_BYTES + 1) as u32).to_be_bytes().to_vec();
        buf.extend_from_slice(b"{}");
        let err = read_message::<_, QueryRequest>(&mut Cursor::new(buf)).unwrap_err();
        assert!(matches!(err, Error::Wire(_)));
    }

    #[test]
    fn test_truncated_payload_is_wire_error() {
        let mut buf = 10u32.to_be_bytes().to_vec();
        buf.extend_from_slice(b"{}");
        let err = read_message::<_, QueryRequest>(&mut Cursor::new(buf)).unwrap_err();
        assert!(matches!(err, Error::Wire(_)));
    }
}
