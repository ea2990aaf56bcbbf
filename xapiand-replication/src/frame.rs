use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{Error, Result};

/// Largest frame accepted off the wire. Larger lengths are treated as a
/// framing error and destroy the connection.
pub const FRAME_MAX_LEN: u64 = 64 * 1024 * 1024;

/// Appends `value` as a little-endian varint: 7 bits per byte, high bit
/// set on every byte but the last.
pub fn put_varint(buf: &mut Vec<u8>, mut value: u64) {
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        if value == 0 {
            buf.push(byte);
            return;
        }
        buf.push(byte | 0x80);
    }
}

/// Reads a varint off the front of `data`, returning the value and the
/// bytes consumed.
pub fn get_varint(data: &[u8]) -> Result<(u64, usize)> {
    let mut value = 0u64;
    let mut shift = 0u32;
    for (index, byte) in data.iter().enumerate() {
        if shift >= 64 {
            return Err(Error::BadMessage("varint overflow"));
        }
        value |= u64::from(byte & 0x7f) << shift;
        if byte & 0x80 == 0 {
            return Ok((value, index + 1));
        }
        shift += 7;
    }
    Err(Error::BadMessage("varint ran past end of data"))
}

async fn read_varint<R>(reader: &mut R) -> Result<u64>
where
    R: AsyncRead + Unpin,
{
    let mut value = 0u64;
    let mut shift = 0u32;
    loop {
        let byte = match reader.read_u8().await {
            Ok(byte) => byte,
            Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => {
                return Err(Error::ConnectionClosed)
            }
            Err(err) => return Err(err.into()),
        };
        if shift >= 64 {
            return Err(Error::BadMessage("varint overflow"));
        }
        value |= u64::from(byte & 0x7f) << shift;
        if byte & 0x80 == 0 {
            return Ok(value);
        }
        shift += 7;
    }
}

/// Reads one `{len varint, type u8, payload}` frame. `len` counts the
/// type byte plus the payload.
pub async fn read_frame<R>(reader: &mut R) -> Result<(u8, Bytes)>
where
    R: AsyncRead + Unpin,
{
    let len = read_varint(reader).await?;
    if len == 0 || len > FRAME_MAX_LEN {
        return Err(Error::BadMessage("frame length out of bounds"));
    }
    let ty = reader.read_u8().await.map_err(map_eof)?;
    let mut payload = vec![0u8; (len - 1) as usize];
    reader.read_exact(&mut payload).await.map_err(map_eof)?;
    Ok((ty, Bytes::from(payload)))
}

pub async fn write_frame<W>(writer: &mut W, ty: u8, payload: &[u8]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut head = Vec::with_capacity(12);
    put_varint(&mut head, payload.len() as u64 + 1);
    head.push(ty);
    writer.write_all(&head).await?;
    writer.write_all(payload).await?;
    writer.flush().await?;
    Ok(())
}

fn map_eof(err: std::io::Error) -> Error {
    if err.kind() == std::io::ErrorKind::UnexpectedEof {
        Error::ConnectionClosed
    } else {
        err.into()
    }
}
