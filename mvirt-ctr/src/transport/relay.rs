use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

const BUF_SIZE: usize = 32 * 1024;

/// Copy `reader` into `writer` until EOF, flushing after every chunk so an
/// interactive peer sees output immediately. Shuts the writer down at the
/// end. EIO from a terminal master whose slave side closed counts as EOF.
pub async fn pump<R, W>(mut reader: R, mut writer: W) -> std::io::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; BUF_SIZE];
    let mut total = 0u64;

    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.raw_os_error() == Some(libc::EIO) => break,
            Err(e) => return Err(e),
        };
        writer.write_all(&buf[..n]).await?;
        writer.flush().await?;
        total += n as u64;
    }

    let _ = writer.shutdown().await;
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_pump_copies_and_closes() {
        let (mut src_w, src_r) = tokio::io::duplex(16);
        let (dst_w, mut dst_r) = tokio::io::duplex(1024);

        let task = tokio::spawn(pump(src_r, dst_w));
        src_w.write_all(b"hello, world").await.unwrap();
        drop(src_w);

        assert_eq!(task.await.unwrap().unwrap(), 12);
        let mut out = Vec::new();
        dst_r.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"hello, world");
    }
}
