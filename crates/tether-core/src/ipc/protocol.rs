//! Control protocol between Tether and its workers.
//!
//! Uses length-prefixed rkyv messages, both over worker sockets and over the
//! stdin/stdout pipes of pooled workers.
//! Format: 4-byte length (u32 LE) + rkyv-encoded message.

use std::io::{Read, Write};

use rkyv::{Archive, Deserialize, Serialize};

use crate::error::{Error, Result};

/// Largest message accepted from a peer.
pub const MAX_MESSAGE_LEN: usize = 16 * 1024 * 1024;

/// Command sent to a worker.
#[derive(Debug, Clone, PartialEq, Eq, Archive, Serialize, Deserialize)]
pub enum WorkerCommand {
    /// Start a stdio worker from a compiled descriptor (JSON text).
    ///
    /// Only valid as the first message on a stdio pipe.
    Bootstrap {
        descriptor_json: String,
    },

    /// Ping to check if the worker is alive.
    Ping,

    /// Ask for the worker's status.
    Query,

    /// Authenticated stop request.
    Stop {
        /// Admin cookie of the worker's profile.
        cookie: String,
    },

    /// Unauthenticated shutdown, accepted on stdio pipes only.
    Shutdown,

    /// Payload for the worker implementation.
    Send {
        payload: Vec<u8>,
    },
}

/// Response sent back by a worker.
#[derive(Debug, Clone, PartialEq, Eq, Archive, Serialize, Deserialize)]
pub enum WorkerResponse {
    /// Response to Ping.
    Pong,

    /// Status payload.
    Status {
        /// Human-readable status line.
        text: String,
        /// Worker process ID.
        pid: u32,
    },

    /// The stop request was accepted; the worker is exiting.
    Stopping,

    /// Acknowledgement of Shutdown.
    ShuttingDown,

    /// Implementation reply to Send.
    Reply {
        payload: Vec<u8>,
    },

    /// The command failed.
    Error {
        message: String,
    },
}

/// Encode a message to its length-prefixed wire form.
pub fn encode_message(
    message: &impl for<'a> Serialize<
        rkyv::rancor::Strategy<
            rkyv::ser::Serializer<
                rkyv::util::AlignedVec,
                rkyv::ser::allocator::ArenaHandle<'a>,
                rkyv::ser::sharing::Share,
            >,
            rkyv::rancor::Error,
        >,
    >,
) -> Result<Vec<u8>> {
    let bytes = rkyv::to_bytes::<rkyv::rancor::Error>(message)
        .map_err(|e| Error::Serialization(format!("Failed to encode message: {}", e)))?;

    let mut framed = Vec::with_capacity(bytes.len() + 4);
    framed.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
    framed.extend_from_slice(&bytes);
    Ok(framed)
}

/// Decode the body of a message whose length prefix was already consumed.
pub fn decode_body<T>(bytes: &[u8]) -> Result<T>
where
    T: Archive,
    T::Archived: for<'a> rkyv::bytecheck::CheckBytes<
            rkyv::api::high::HighValidator<'a, rkyv::rancor::Error>,
        > + Deserialize<T, rkyv::api::high::HighDeserializer<rkyv::rancor::Error>>,
{
    // Bodies come from sockets that may be remote, so they are validated.
    let mut aligned = rkyv::util::AlignedVec::<16>::with_capacity(bytes.len());
    aligned.extend_from_slice(bytes);
    rkyv::from_bytes::<T, rkyv::rancor::Error>(&aligned)
        .map_err(|e| Error::Protocol(format!("Failed to decode message: {}", e)))
}

/// Parse a length prefix, rejecting oversized messages.
pub fn decode_len(prefix: [u8; 4]) -> Result<usize> {
    let len = u32::from_le_bytes(prefix) as usize;
    if len > MAX_MESSAGE_LEN {
        return Err(Error::Protocol(format!("Message too large: {} bytes", len)));
    }
    Ok(len)
}

/// Write a message to a writer using length-prefixed rkyv encoding.
pub fn write_message<W: Write>(
    writer: &mut W,
    message: &impl for<'a> Serialize<
        rkyv::rancor::Strategy<
            rkyv::ser::Serializer<
                rkyv::util::AlignedVec,
                rkyv::ser::allocator::ArenaHandle<'a>,
                rkyv::ser::sharing::Share,
            >,
            rkyv::rancor::Error,
        >,
    >,
) -> std::io::Result<()> {
    let framed = encode_message(message)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string()))?;
    writer.write_all(&framed)?;
    writer.flush()
}

/// Read a message from a reader using length-prefixed rkyv encoding.
///
/// I/O failures are returned as-is so callers can tell a closed or timed-out
/// peer apart from a malformed message.
pub fn read_message<R: Read, T>(reader: &mut R) -> std::io::Result<Result<T>>
where
    T: Archive,
    T::Archived: for<'a> rkyv::bytecheck::CheckBytes<
            rkyv::api::high::HighValidator<'a, rkyv::rancor::Error>,
        > + Deserialize<T, rkyv::api::high::HighDeserializer<rkyv::rancor::Error>>,
{
    let mut len_bytes = [0u8; 4];
    reader.read_exact(&mut len_bytes)?;
    let len = match decode_len(len_bytes) {
        Ok(len) => len,
        Err(e) => return Ok(Err(e)),
    };

    let mut bytes = vec![0u8; len];
    reader.read_exact(&mut bytes)?;

    Ok(decode_body(&bytes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_stop_command_roundtrip() {
        let cmd = WorkerCommand::Stop {
            cookie: "abc".to_string(),
        };

        let mut buf = Vec::new();
        write_message(&mut buf, &cmd).unwrap();

        let mut cursor = Cursor::new(buf);
        let decoded: WorkerCommand = read_message(&mut cursor).unwrap().unwrap();
        assert_eq!(decoded, cmd);
    }

    #[test]
    fn test_status_response_roundtrip() {
        let resp = WorkerResponse::Status {
            text: "Echo: 3 messages".to_string(),
            pid: 4242,
        };

        let mut buf = Vec::new();
        write_message(&mut buf, &resp).unwrap();

        let mut cursor = Cursor::new(buf);
        let decoded: WorkerResponse = read_message(&mut cursor).unwrap().unwrap();
        assert_eq!(decoded, resp);
    }

    #[test]
    fn test_oversized_length_is_rejected() {
        let mut buf = ((MAX_MESSAGE_LEN + 1) as u32).to_le_bytes().to_vec();
        buf.extend_from_slice(&[0u8; 8]);

        let mut cursor = Cursor::new(buf);
        let decoded: Result<WorkerCommand> = read_message(&mut cursor).unwrap();
        assert!(matches!(decoded, Err(Error::Protocol(_))));
    }

    #[test]
    fn test_truncated_stream_is_io_error() {
        let mut buf = Vec::new();
        write_message(&mut buf, &WorkerCommand::Ping).unwrap();
        buf.truncate(buf.len() - 1);

        let mut cursor = Cursor::new(buf);
        let result: std::io::Result<Result<WorkerCommand>> = read_message(&mut cursor);
        assert!(result.is_err());
    }

    #[test]
    fn test_garbage_body_is_protocol_error() {
        let mut buf = 4u32.to_le_bytes().to_vec();
        buf.extend_from_slice(&[0xff, 0xff, 0xff, 0xff]);

        let mut cursor = Cursor::new(buf);
        let decoded: Result<WorkerResponse> = read_message(&mut cursor).unwrap();
        assert!(decoded.is_err());
    }
}
