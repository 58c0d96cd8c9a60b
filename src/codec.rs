//! Length-prefixed bincode framing over any async byte stream.
//!
//! Every frame is a 4-byte big-endian length followed by a bincode body.
//! A clean EOF at a frame boundary reads as `None`; bytes ending mid-frame
//! are a protocol violation, not an EOF.

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{ForemanError, Result};

/// Upper bound on a single frame body. Anything larger is treated as channel
/// corruption rather than a legitimate message.
pub const MAX_FRAME_LEN: u32 = 64 * 1024 * 1024;

/// Read one frame, decoding the body as `M`. Returns `Ok(None)` on clean EOF.
pub async fn read_frame<R, M>(reader: &mut R) -> Result<Option<M>>
where
    R: AsyncRead + Unpin,
    M: DeserializeOwned,
{
    let mut len_buf = [0u8; 4];
    let mut filled = 0;
    while filled < len_buf.len() {
        let n = reader.read(&mut len_buf[filled..]).await?;
        if n == 0 {
            if filled == 0 {
                return Ok(None);
            }
            return Err(ForemanError::Protocol(
                "channel closed mid-frame".to_string(),
            ));
        }
        filled += n;
    }

    let len = u32::from_be_bytes(len_buf);
    if len > MAX_FRAME_LEN {
        return Err(ForemanError::Protocol(format!(
            "frame of {len} bytes exceeds the {MAX_FRAME_LEN} byte limit"
        )));
    }

    let mut body = vec![0u8; len as usize];
    reader.read_exact(&mut body).await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            ForemanError::Protocol("channel closed mid-frame".to_string())
        } else {
            ForemanError::Io(e)
        }
    })?;

    Ok(Some(bincode::deserialize(&body)?))
}

/// Encode `message` and write it as one frame, flushing before returning.
pub async fn write_frame<W, M>(writer: &mut W, message: &M) -> Result<()>
where
    W: AsyncWrite + Unpin,
    M: Serialize,
{
    let body = bincode::serialize(message)?;
    if body.len() > MAX_FRAME_LEN as usize {
        return Err(ForemanError::Protocol(format!(
            "refusing to send a {} byte frame",
            body.len()
        )));
    }
    writer.write_all(&(body.len() as u32).to_be_bytes()).await?;
    writer.write_all(&body).await?;
    writer.flush().await?;
    Ok(())
}
