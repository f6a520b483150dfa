//! Length-prefixed JSON datagram codec (component E).
//!
//! Each message on the TCP control channel is exactly 4 ASCII decimal
//! digits giving the JSON body's length in bytes, followed by that many
//! bytes of UTF-8 JSON. Framing is identical in both directions. The
//! 4-digit prefix caps a body at 9999 bytes (see spec Open Question b).

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::error::DatagramError;

const PREFIX_LEN: usize = 4;
const MAX_BODY_LEN: usize = 9999;

/// Reads one length-prefixed JSON datagram from `stream` and decodes it as
/// `T`. Any failure along the way (short read, non-digit prefix, invalid
/// UTF-8, invalid JSON) is surfaced as a `DatagramError`; callers treat
/// every variant the same way per spec: drop the connection silently.
pub async fn read_datagram<R, T>(stream: &mut R) -> Result<T, DatagramError>
where
    R: tokio::io::AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let mut prefix = [0u8; PREFIX_LEN];
    stream
        .read_exact(&mut prefix)
        .await
        .map_err(|_| DatagramError::ShortPrefix)?;

    let prefix_str = std::str::from_utf8(&prefix).map_err(|_| DatagramError::BadPrefix(format!("{:?}", prefix)))?;
    if !prefix_str.bytes().all(|b| b.is_ascii_digit()) {
        return Err(DatagramError::BadPrefix(prefix_str.to_string()));
    }
    let length: usize = prefix_str
        .parse()
        .map_err(|_| DatagramError::BadPrefix(prefix_str.to_string()))?;

    let mut body = vec![0u8; length];
    stream
        .read_exact(&mut body)
        .await
        .map_err(|_| DatagramError::ShortBody { expected: length })?;

    let body_str = std::str::from_utf8(&body).map_err(|_| DatagramError::NotUtf8)?;
    let value = serde_json::from_str(body_str)?;
    Ok(value)
}

/// Encodes `value` as a length-prefixed JSON datagram and writes it to
/// `stream`.
pub async fn write_datagram<W, T>(stream: &mut W, value: &T) -> Result<(), DatagramError>
where
    W: tokio::io::AsyncWrite + Unpin,
    T: Serialize,
{
    let body = serde_json::to_string(value)?;
    if body.len() > MAX_BODY_LEN {
        return Err(DatagramError::TooLarge(body.len()));
    }
    let datagram = format!("{:04}{}", body.len(), body);
    stream.write_all(datagram.as_bytes()).await?;
    Ok(())
}
