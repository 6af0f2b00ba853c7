//! `Content-Length` framing for the engine channel.

use std::io;

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Frames above this size are treated as a corrupt stream.
pub const MAX_FRAME_BYTES: usize = 64 * 1024 * 1024;

pub async fn write_frame<W>(writer: &mut W, body: &[u8]) -> io::Result<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let header = format!("Content-Length: {}\r\n\r\n", body.len());
    writer.write_all(header.as_bytes()).await?;
    writer.write_all(body).await?;
    writer.flush().await
}

/// Read one frame body. `Ok(None)` means the peer closed the stream between frames.
pub async fn read_frame<R>(reader: &mut R) -> io::Result<Option<Vec<u8>>>
where
    R: AsyncBufRead + Unpin + ?Sized,
{
    let mut content_length: Option<usize> = None;
    let mut line = String::new();
    let mut saw_header = false;

    loop {
        line.clear();
        let read = reader.read_line(&mut line).await?;
        if read == 0 {
            if saw_header {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "stream closed inside frame header",
                ));
            }
            return Ok(None);
        }
        let trimmed = line.trim();
        if trimmed.is_empty() {
            if saw_header {
                break;
            }
            // stray blank line between frames
            continue;
        }
        saw_header = true;
        if let Some((name, value)) = trimmed.split_once(':') {
            if name.trim().eq_ignore_ascii_case("content-length") {
                let len = value.trim().parse::<usize>().map_err(|err| {
                    io::Error::new(
                        io::ErrorKind::InvalidData,
                        format!("bad Content-Length {:?}: {err}", value.trim()),
                    )
                })?;
                content_length = Some(len);
            }
        }
    }

    let len = content_length.ok_or_else(|| {
        io::Error::new(io::ErrorKind::InvalidData, "missing Content-Length header")
    })?;
    if len > MAX_FRAME_BYTES {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame of {len} bytes exceeds limit"),
        ));
    }
    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    Ok(Some(body))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::BufReader;

    #[tokio::test]
    async fn reads_back_to_back_frames() {
        let mut wire = Vec::new();
        write_frame(&mut wire, br#"{"id":1}"#).await.unwrap();
        wire.extend_from_slice(b"Content-Type: application/vscode-jsonrpc; charset=utf-8\r\n");
        wire.extend_from_slice(b"content-length: 8\r\n\r\n{\"id\":2}");

        let mut reader = BufReader::new(wire.as_slice());
        assert_eq!(read_frame(&mut reader).await.unwrap().unwrap(), br#"{"id":1}"#);
        assert_eq!(read_frame(&mut reader).await.unwrap().unwrap(), br#"{"id":2}"#);
        assert!(read_frame(&mut reader).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn frames_survive_split_writes() {
        let (client, server) = tokio::io::duplex(16);
        let writer = tokio::spawn(async move {
            let mut client = client;
            let body = vec![b'x'; 1000];
            write_frame(&mut client, &body).await.unwrap();
        });
        let mut reader = BufReader::new(server);
        let body = read_frame(&mut reader).await.unwrap().unwrap();
        assert_eq!(body.len(), 1000);
        writer.await.unwrap();
    }

    #[tokio::test]
    async fn rejects_missing_length_and_truncated_body() {
        let mut reader = BufReader::new(&b"X-Other: 1\r\n\r\n{}"[..]);
        let err = read_frame(&mut reader).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);

        let mut reader = BufReader::new(&b"Content-Length: 10\r\n\r\n{}"[..]);
        let err = read_frame(&mut reader).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }
}
