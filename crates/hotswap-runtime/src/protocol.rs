//! Attach protocol
//!
//! One request, one response, each a single JSON document terminated by a
//! newline. The connection closes after the response.

use hotswap_artifact::ImageDigest;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::io::{self, BufRead, Read, Write};
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// Wire protocol version
pub const PROTOCOL_VERSION: u32 = 1;

/// File name prefix of attach sockets; the pid follows
pub const SOCKET_PREFIX: &str = ".hotswap_pid";

/// Largest message either side reads
pub const MAX_MESSAGE_BYTES: u64 = 64 * 1024;

/// Attach socket of process `pid` inside `dir`
#[must_use]
pub fn socket_path(dir: &Path, pid: u32) -> PathBuf {
    dir.join(format!("{SOCKET_PREFIX}{pid}"))
}

/// Controller to target
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Request {
    /// Load the artifact at `artifact` and run its entry point
    LoadAgent { protocol: u32, artifact: PathBuf },
}

/// Target to controller
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Response {
    /// Entry point ran to completion
    Loaded {
        agent_id: Option<String>,
        entry_point: String,
        capability_id: Uuid,
        digest: ImageDigest,
    },
    /// Artifact was not loaded
    Rejected { code: RejectCode, message: String },
}

/// Why the target refused an artifact
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectCode {
    /// Request was not understood or used another protocol version
    Protocol,
    /// Artifact could not be read
    Io,
    /// Artifact exceeds the configured size limit
    TooLarge,
    /// Artifact is not a valid sealed image
    Corrupt,
    /// Manifest lacks a capability flag the runtime requires
    MissingCapability,
    /// Manifest names an entry point the runtime does not know
    UnknownEntryPoint,
    /// Entry point panicked
    EntryFailed,
}

/// Message framing errors
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),

    #[error("malformed message: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("connection closed before a message arrived")]
    Closed,

    #[error("message exceeds the size limit")]
    TooLong,
}

/// Write one newline-terminated message
///
/// # Errors
/// Returns error if serialization or the write fails
pub fn write_message<W: Write, T: Serialize>(
    writer: &mut W,
    message: &T,
) -> Result<(), ProtocolError> {
    let mut line = serde_json::to_vec(message)?;
    line.push(b'\n');
    writer.write_all(&line)?;
    writer.flush()?;
    Ok(())
}

/// Read one newline-terminated message
///
/// # Errors
/// Returns error on I/O failure, EOF before any byte, an over-long line or
/// invalid JSON
pub fn read_message<R: BufRead, T: DeserializeOwned>(reader: &mut R) -> Result<T, ProtocolError> {
    let mut line = String::new();
    let read = reader.take(MAX_MESSAGE_BYTES + 1).read_line(&mut line)?;
    if read == 0 {
        return Err(ProtocolError::Closed);
    }
    if read as u64 > MAX_MESSAGE_BYTES {
        return Err(ProtocolError::TooLong);
    }
    Ok(serde_json::from_str(line.trim_end())?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::io::Cursor;

    #[test]
    fn request_wire_shape() {
        let request = Request::LoadAgent {
            protocol: PROTOCOL_VERSION,
            artifact: PathBuf::from("/tmp/a.hsa"),
        };
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"op": "load_agent", "protocol": 1, "artifact": "/tmp/a.hsa"})
        );
    }

    #[test]
    fn messages_survive_framing() {
        let response = Response::Rejected {
            code: RejectCode::MissingCapability,
            message: "needs Can-Redefine-Types".to_string(),
        };
        let mut buf = Vec::new();
        write_message(&mut buf, &response).unwrap();
        assert_eq!(buf.last(), Some(&b'\n'));

        let decoded: Response = read_message(&mut Cursor::new(buf)).unwrap();
        assert_eq!(decoded, response);
    }

    #[test]
    fn read_reports_closed_and_garbage() {
        let closed: Result<Request, _> = read_message(&mut Cursor::new(Vec::new()));
        assert!(matches!(closed, Err(ProtocolError::Closed)));

        let garbage: Result<Request, _> = read_message(&mut Cursor::new(b"{nope}\n".to_vec()));
        assert!(matches!(garbage, Err(ProtocolError::Malformed(_))));
    }

    #[test]
    fn read_caps_line_length() {
        let long = vec![b'a'; usize::try_from(MAX_MESSAGE_BYTES).unwrap() + 10];
        let result: Result<Request, _> = read_message(&mut Cursor::new(long));
        assert!(matches!(result, Err(ProtocolError::TooLong)));
    }

    #[test]
    fn socket_path_embeds_pid() {
        let path = socket_path(Path::new("/tmp"), 4242);
        assert_eq!(path, PathBuf::from("/tmp/.hotswap_pid4242"));
    }
}
