//! Wire framing and datetime rendering shared by every packed message.
//!
//! Every queue element is a single length-prefixed UTF-8 JSON frame: a
//! `u32` big-endian byte count followed by that many bytes of JSON. A
//! zero-length frame is the sentinel (`None`) used to signal a consumer
//! state machine to drain and halt.

use std::io;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

/// Maximum frame size accepted from a peer, guards against a malformed
/// length prefix pinning an unbounded allocation.
pub const MAX_FRAME_BYTES: u32 = 64 * 1024 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("frame exceeds maximum size ({0} > {MAX_FRAME_BYTES})")]
    TooLarge(u32),

    #[error("io error: {0}")]
    Io(#[from] io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Write a single frame. `None` encodes the sentinel (zero-length frame).
pub async fn write_frame<W, T>(writer: &mut W, value: Option<&T>) -> Result<(), FrameError>
where
    W: AsyncWriteExt + Unpin,
    T: Serialize,
{
    match value {
        None => {
            writer.write_all(&0u32.to_be_bytes()).await?;
        }
        Some(value) => {
            let bytes = serde_json::to_vec(value)?;
            let len = u32::try_from(bytes.len()).unwrap_or(u32::MAX);
            if len > MAX_FRAME_BYTES {
                return Err(FrameError::TooLarge(len));
            }
            writer.write_all(&len.to_be_bytes()).await?;
            writer.write_all(&bytes).await?;
        }
    }
    writer.flush().await?;
    Ok(())
}

/// Write a raw byte frame without JSON re-encoding (used when the payload
/// has already been packed by a `Task`/`Heartbeat`/`ClientInfo` caller).
pub async fn write_raw_frame<W>(writer: &mut W, bytes: Option<&[u8]>) -> Result<(), FrameError>
where
    W: AsyncWriteExt + Unpin,
{
    match bytes {
        None => {
            writer.write_all(&0u32.to_be_bytes()).await?;
        }
        Some(bytes) => {
            let len = u32::try_from(bytes.len()).unwrap_or(u32::MAX);
            if len > MAX_FRAME_BYTES {
                return Err(FrameError::TooLarge(len));
            }
            writer.write_all(&len.to_be_bytes()).await?;
            writer.write_all(bytes).await?;
        }
    }
    writer.flush().await?;
    Ok(())
}

/// Read a single frame as raw bytes. `Ok(None)` is the sentinel.
pub async fn read_raw_frame<R>(reader: &mut R) -> Result<Option<Vec<u8>>, FrameError>
where
    R: AsyncReadExt + Unpin,
{
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf).await?;
    let len = u32::from_be_bytes(len_buf);
    if len == 0 {
        return Ok(None);
    }
    if len > MAX_FRAME_BYTES {
        return Err(FrameError::TooLarge(len));
    }
    let mut buf = vec![0u8; len as usize];
    reader.read_exact(&mut buf).await?;
    Ok(Some(buf))
}

/// Read and JSON-decode a single frame. `Ok(None)` is the sentinel.
pub async fn read_frame<R, T>(reader: &mut R) -> Result<Option<T>, FrameError>
where
    R: AsyncReadExt + Unpin,
    T: DeserializeOwned,
{
    match read_raw_frame(reader).await? {
        None => Ok(None),
        Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
    }
}

/// ISO-8601 datetime rendering with a space separator, matching the
/// original engine's `value.isoformat(sep=' ')` wire format.
pub mod iso_space {
    use chrono::{DateTime, Local};
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    const FORMAT: &str = "%Y-%m-%d %H:%M:%S%.6f%:z";

    pub fn serialize<S>(value: &DateTime<Local>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        value.format(FORMAT).to_string().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<DateTime<Local>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        DateTime::parse_from_str(&raw, FORMAT)
            .map(|dt| dt.with_timezone(&Local))
            .map_err(serde::de::Error::custom)
    }

    pub mod option {
        use chrono::{DateTime, Local};
        use serde::{Deserialize, Deserializer, Serialize, Serializer};

        pub fn serialize<S>(
            value: &Option<DateTime<Local>>,
            serializer: S,
        ) -> Result<S::Ok, S::Error>
        where
            S: Serializer,
        {
            match value {
                Some(dt) => super::serialize(dt, serializer),
                None => Option::<String>::None.serialize(serializer),
            }
        }

        pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<DateTime<Local>>, D::Error>
        where
            D: Deserializer<'de>,
        {
            let raw = Option::<String>::deserialize(deserializer)?;
            match raw {
                None => Ok(None),
                Some(raw) => DateTime::parse_from_str(&raw, super::FORMAT)
                    .map(|dt| Some(dt.with_timezone(&Local)))
                    .map_err(serde::de::Error::custom),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[tokio::test]
    async fn sentinel_round_trips() {
        let (mut a, mut b) = duplex(64);
        write_raw_frame(&mut a, None).await.unwrap();
        let got = read_raw_frame(&mut b).await.unwrap();
        assert!(got.is_none());
    }

    #[tokio::test]
    async fn payload_round_trips() {
        let (mut a, mut b) = duplex(256);
        write_frame(&mut a, Some(&vec!["x".to_string(), "y".to_string()]))
            .await
            .unwrap();
        let got: Option<Vec<String>> = read_frame(&mut b).await.unwrap();
        assert_eq!(got, Some(vec!["x".to_string(), "y".to_string()]));
    }
}
