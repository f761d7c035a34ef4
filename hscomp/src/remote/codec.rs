//! Length-prefixed framing
//!
//! Every frame is a big-endian `u32` payload length followed by the payload,
//! a bincode-encoded [`RemoteMessage`].

use super::message::RemoteMessage;
use crate::error::{Error, Result};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub const FRAME_HEADER_LEN: usize = 4;

pub async fn write_frame<W>(writer: &mut W, payload: &[u8], max_len: usize) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    if payload.len() > max_len || payload.len() > u32::MAX as usize {
        return Err(Error::protocol(
            format!("frame of {} bytes exceeds limit of {max_len}", payload.len()),
            None,
            None,
        ));
    }
    writer.write_all(&(payload.len() as u32).to_be_bytes()).await?;
    writer.write_all(payload).await?;
    writer.flush().await?;
    Ok(())
}

/// Reads one frame. `Ok(None)` means the peer closed the stream between
/// frames.
pub async fn read_frame<R>(reader: &mut R, max_len: usize) -> Result<Option<Vec<u8>>>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; FRAME_HEADER_LEN];
    match reader.read_exact(&mut header).await {
        Ok(_) => {}
        Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(err) => return Err(err.into()),
    }
    let len = u32::from_be_bytes(header) as usize;
    if len > max_len {
        return Err(Error::protocol(
            format!("incoming frame of {len} bytes exceeds limit of {max_len}"),
            None,
            None,
        ));
    }
    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    Ok(Some(payload))
}

pub async fn write_message<W>(writer: &mut W, message: &RemoteMessage, max_len: usize) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    write_frame(writer, &message.encode()?, max_len).await
}

pub async fn read_message<R>(reader: &mut R, max_len: usize) -> Result<Option<RemoteMessage>>
where
    R: AsyncRead + Unpin,
{
    match read_frame(reader, max_len).await? {
        Some(payload) => Ok(Some(RemoteMessage::decode(&payload)?)),
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::message::{MessageBody, COOKIE_ROUTER, COOKIE_UNKNOWN};

    #[tokio::test]
    async fn test_frames_arrive_in_order() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        let first = RemoteMessage::new(COOKIE_UNKNOWN, COOKIE_ROUTER, MessageBody::QueryService);
        let second = RemoteMessage::new(300, COOKIE_ROUTER, MessageBody::ByeServer);

        write_message(&mut client, &first, 1024).await.unwrap();
        write_message(&mut client, &second, 1024).await.unwrap();
        drop(client);

        assert_eq!(read_message(&mut server, 1024).await.unwrap(), Some(first));
        assert_eq!(read_message(&mut server, 1024).await.unwrap(), Some(second));
        assert_eq!(read_message(&mut server, 1024).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_oversized_frames_are_refused() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        let err = write_frame(&mut client, &[0u8; 100], 64).await.unwrap_err();
        assert_eq!(err.category(), "protocol");

        client.write_all(&1000u32.to_be_bytes()).await.unwrap();
        let err = read_frame(&mut server, 64).await.unwrap_err();
        assert!(matches!(err, Error::Protocol { .. }));
    }
}
