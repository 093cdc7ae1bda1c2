//! IPC protocol messages for the kernel process.
//!
//! Length-prefixed JSON messages over stdin/stdout.
//! Format: 4-byte length (u32 LE) + JSON-encoded message. JSON (rather than
//! a compact binary codec) because output payloads carry arbitrary
//! Python-plain values and must decode from a self-describing format.

use std::io::{Read, Write};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{Error, Result};
use crate::notebook::{CellId, CellKind, ExecStatus, Output};

/// Sanity cap on a single message (100MB).
const MAX_MESSAGE_SIZE: usize = 100 * 1024 * 1024;

/// Requests sent from the coordinator to the kernel process.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum KernelRequest {
    /// Associate a cell id with its source and kind. Does not execute.
    ///
    /// `position` is the cell's visible index, used for `Cell[<position>]`
    /// traceback filenames.
    RegisterCell {
        id: CellId,
        source: String,
        kind: CellKind,
        position: usize,
    },

    /// Forget a deleted cell and purge its uniquely-owned symbols.
    RemoveCell { id: CellId, purge: Vec<String> },

    /// Execute a registered cell.
    Execute { id: CellId },

    /// Set (and validate) the SQL connection string.
    SetDatabaseConfig { connection_string: String },

    /// Shut down the kernel process gracefully.
    Shutdown,
}

/// Messages streamed from the kernel back to the coordinator.
///
/// For each execution the kernel emits `Status{running}`, zero or more
/// `Stdout`/`Output` messages, and exactly one terminal `Result`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum KernelMessage {
    Status {
        id: CellId,
        running: bool,
    },

    Stdout {
        id: CellId,
        text: String,
    },

    Output {
        id: CellId,
        output: Output,
    },

    Result {
        id: CellId,
        status: ExecStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },

    /// Response to `SetDatabaseConfig`.
    ConfigResult {
        status: ExecStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
}

/// Write a message using length-prefixed JSON encoding.
pub fn write_message<W: Write, T: Serialize>(writer: &mut W, message: &T) -> Result<()> {
    let bytes = encode(message)?;
    writer
        .write_all(&(bytes.len() as u32).to_le_bytes())
        .and_then(|()| writer.write_all(&bytes))
        .and_then(|()| writer.flush())
        .map_err(|e| Error::Ipc(format!("failed to write IPC message: {e}")))
}

/// Read a message using length-prefixed JSON encoding.
pub fn read_message<R: Read, T: DeserializeOwned>(reader: &mut R) -> Result<T> {
    let mut len_bytes = [0u8; 4];
    reader
        .read_exact(&mut len_bytes)
        .map_err(|e| Error::Ipc(format!("failed to read IPC message length: {e}")))?;
    let len = check_len(u32::from_le_bytes(len_bytes))?;

    let mut bytes = vec![0u8; len];
    reader
        .read_exact(&mut bytes)
        .map_err(|e| Error::Ipc(format!("failed to read IPC message body: {e}")))?;
    decode(&bytes)
}

/// Async flavor of [`write_message`], used on the coordinator side.
pub async fn write_frame<W, T>(writer: &mut W, message: &T) -> Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let bytes = encode(message)?;
    let write = async {
        writer.write_all(&(bytes.len() as u32).to_le_bytes()).await?;
        writer.write_all(&bytes).await?;
        writer.flush().await
    };
    write
        .await
        .map_err(|e| Error::Ipc(format!("failed to write IPC message: {e}")))
}

/// Async flavor of [`read_message`].
pub async fn read_frame<R, T>(reader: &mut R) -> Result<T>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let mut len_bytes = [0u8; 4];
    reader
        .read_exact(&mut len_bytes)
        .await
        .map_err(|e| Error::Ipc(format!("failed to read IPC message length: {e}")))?;
    let len = check_len(u32::from_le_bytes(len_bytes))?;

    let mut bytes = vec![0u8; len];
    reader
        .read_exact(&mut bytes)
        .await
        .map_err(|e| Error::Ipc(format!("failed to read IPC message body: {e}")))?;
    decode(&bytes)
}

fn encode<T: Serialize>(message: &T) -> Result<Vec<u8>> {
    serde_json::to_vec(message)
        .map_err(|e| Error::Serialization(format!("failed to encode IPC message: {e}")))
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    serde_json::from_slice(bytes)
        .map_err(|e| Error::Serialization(format!("failed to decode IPC message: {e}")))
}

fn check_len(len: u32) -> Result<usize> {
    let len = len as usize;
    if len > MAX_MESSAGE_SIZE {
        return Err(Error::Ipc(format!("IPC message too large: {len} bytes")));
    }
    Ok(len)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notebook::MimeType;
    use std::io::Cursor;

    #[test]
    fn test_request_roundtrip() {
        let request = KernelRequest::RegisterCell {
            id: CellId::new("c1"),
            source: "x = 5".to_string(),
            kind: CellKind::Python,
            position: 3,
        };

        let mut buf = Vec::new();
        write_message(&mut buf, &request).unwrap();

        let mut cursor = Cursor::new(buf);
        let decoded: KernelRequest = read_message(&mut cursor).unwrap();
        match decoded {
            KernelRequest::RegisterCell { id, source, kind, position } => {
                assert_eq!(id, CellId::new("c1"));
                assert_eq!(source, "x = 5");
                assert_eq!(kind, CellKind::Python);
                assert_eq!(position, 3);
            }
            other => panic!("wrong request type: {other:?}"),
        }
    }

    #[test]
    fn test_table_output_roundtrip() {
        let message = KernelMessage::Output {
            id: CellId::new("c2"),
            output: Output::new(
                MimeType::Json,
                serde_json::json!({
                    "type": "table",
                    "columns": ["id", "name"],
                    "rows": [[42, "a"]],
                }),
            ),
        };

        let mut buf = Vec::new();
        write_message(&mut buf, &message).unwrap();

        let mut cursor = Cursor::new(buf);
        let decoded: KernelMessage = read_message(&mut cursor).unwrap();
        match decoded {
            KernelMessage::Output { output, .. } => {
                assert_eq!(output.mime, MimeType::Json);
                assert_eq!(output.data["columns"][1], "name");
                assert_eq!(output.data["rows"][0][0], 42);
            }
            other => panic!("wrong message type: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_async_frame_roundtrip() {
        let message = KernelMessage::Result {
            id: CellId::new("c3"),
            status: ExecStatus::Error,
            error: Some("ZeroDivisionError: division by zero".to_string()),
        };

        let mut buf = Vec::new();
        write_frame(&mut buf, &message).await.unwrap();

        let mut cursor = Cursor::new(buf);
        let decoded: KernelMessage = read_frame(&mut cursor).await.unwrap();
        match decoded {
            KernelMessage::Result { status, error, .. } => {
                assert_eq!(status, ExecStatus::Error);
                assert!(error.unwrap().contains("ZeroDivisionError"));
            }
            other => panic!("wrong message type: {other:?}"),
        }
    }

    #[test]
    fn test_oversized_message_rejected() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&(u32::MAX).to_le_bytes());
        buf.extend_from_slice(b"junk");

        let mut cursor = Cursor::new(buf);
        let result: Result<KernelMessage> = read_message(&mut cursor);
        assert!(matches!(result, Err(Error::Ipc(_))));
    }
}
