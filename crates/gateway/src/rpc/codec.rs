//! Length-prefixed JSON framing for the RPC dialect: a u32 big-endian
//! length followed by one JSON document.

use bytes::{Buf, BufMut, BytesMut};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{Error, Result};

/// Frames larger than this are refused outright.
pub const MAX_FRAME_LEN: usize = 4 * 1024 * 1024;

pub async fn write_frame<W, T>(writer: &mut W, frame: &T) -> Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let payload = serde_json::to_vec(frame)
        .map_err(|err| Error::internal("cannot serialize frame").with_cause(err))?;
    let mut buf = BytesMut::with_capacity(4 + payload.len());
    buf.put_u32(payload.len() as u32);
    buf.extend_from_slice(&payload);
    writer
        .write_all(&buf)
        .await
        .map_err(|err| Error::internal("cannot send frame").with_cause(err))?;
    Ok(())
}

/// Reads the next frame, buffering partial reads. Returns `None` on a clean
/// end of stream.
pub async fn read_frame<R, T>(reader: &mut R, buffer: &mut BytesMut) -> Result<Option<T>>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    loop {
        if let Some(frame) = try_parse_frame(buffer)? {
            return Ok(Some(frame));
        }

        let read = reader
            .read_buf(buffer)
            .await
            .map_err(|err| Error::internal("cannot read frame").with_cause(err))?;
        if read == 0 {
            if buffer.is_empty() {
                return Ok(None);
            }
            return Err(Error::bad_request("stream ended mid-frame"));
        }
    }
}

fn try_parse_frame<T: DeserializeOwned>(buffer: &mut BytesMut) -> Result<Option<T>> {
    if buffer.len() < 4 {
        return Ok(None);
    }
    let len = u32::from_be_bytes([buffer[0], buffer[1], buffer[2], buffer[3]]) as usize;
    if len > MAX_FRAME_LEN {
        return Err(Error::bad_request(format!("frame of {len} bytes exceeds limit")));
    }
    if buffer.len() < 4 + len {
        return Ok(None);
    }

    buffer.advance(4);
    let payload = buffer.split_to(len);
    let frame = serde_json::from_slice(&payload)
        .map_err(|err| Error::bad_request("cannot parse frame").with_cause(err))?;
    Ok(Some(frame))
}
