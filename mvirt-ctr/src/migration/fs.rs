//! Filesystem transfer over a migration data channel.
//!
//! Every transferred object is a run of chunks (`u32` big-endian length
//! plus bytes) closed by a zero-length chunk, so streams can follow each
//! other on one channel.

use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::process::Stdio;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::wire::FsMethod;
use crate::error::{Error, Result};
use crate::storage::{StorageBackend, btrfs};

const CHUNK_SIZE: usize = 64 * 1024;
/// Largest chunk a peer may announce.
const MAX_CHUNK: usize = 4 * 1024 * 1024;

pub async fn write_chunk<W>(writer: &mut W, data: &[u8]) -> Result<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    writer.write_u32(data.len() as u32).await?;
    writer.write_all(data).await?;
    Ok(())
}

pub async fn write_end<W>(writer: &mut W) -> Result<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    writer.write_u32(0).await?;
    writer.flush().await?;
    Ok(())
}

/// Next chunk, or `None` at the end of the stream.
pub async fn read_chunk<R>(reader: &mut R) -> Result<Option<Vec<u8>>>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let len = match reader.read_u32().await {
        Ok(len) => len as usize,
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            return Err(Error::Protocol("filesystem stream truncated".into()));
        }
        Err(e) => return Err(e.into()),
    };
    if len == 0 {
        return Ok(None);
    }
    if len > MAX_CHUNK {
        return Err(Error::Protocol(format!("chunk of {len} bytes exceeds limit")));
    }

    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf).await?;
    Ok(Some(buf))
}

/// Frame everything `reader` yields onto `channel`, then end the stream.
pub async fn send_stream<R, W>(mut reader: R, channel: &mut W) -> Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut buf = vec![0u8; CHUNK_SIZE];
    let mut total = 0u64;
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        write_chunk(channel, &buf[..n]).await?;
        total += n as u64;
    }
    write_end(channel).await?;
    Ok(total)
}

/// Copy one framed stream from `channel` into `writer`. If the writer
/// fails, the rest of the stream is still consumed so the channel stays in
/// sync; the write error is returned afterwards.
pub async fn receive_stream<R, W>(channel: &mut R, mut writer: W) -> Result<u64>
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin,
{
    let mut total = 0u64;
    let mut write_err: Option<std::io::Error> = None;

    while let Some(chunk) = read_chunk(channel).await? {
        total += chunk.len() as u64;
        if write_err.is_none()
            && let Err(e) = writer.write_all(&chunk).await
        {
            write_err = Some(e);
        }
    }

    if let Some(e) = write_err {
        return Err(e.into());
    }
    writer.shutdown().await?;
    Ok(total)
}

/// Sending end of a run of trees on one channel. With btrfs every tree
/// is snapshotted read-only under `scratch` and streamed against the
/// previous one, so later sends only carry the difference.
pub struct FsSender {
    method: FsMethod,
    scratch: PathBuf,
    sent: Vec<PathBuf>,
}

impl FsSender {
    pub fn new(method: FsMethod, scratch: PathBuf) -> Self {
        Self {
            method,
            scratch,
            sent: Vec::new(),
        }
    }

    /// Send the tree at `src`.
    pub async fn send<W>(&mut self, src: &Path, channel: &mut W) -> Result<()>
    where
        W: AsyncWrite + Unpin + Send + ?Sized,
    {
        debug!(method = ?self.method, src = %src.display(), "Sending filesystem");
        match self.method {
            FsMethod::Tar => send_tar(src, channel).await,
            FsMethod::Btrfs => {
                let (snap, parent) = self.next_snapshot();
                tokio::fs::create_dir_all(&self.scratch).await?;
                btrfs(&[
                    "subvolume",
                    "snapshot",
                    "-r",
                    &src.to_string_lossy(),
                    &snap.to_string_lossy(),
                ])
                .await?;
                self.sent.push(snap.clone());
                send_btrfs(&snap, parent.as_deref(), channel).await
            }
        }
    }

    /// Path for the next send snapshot and the one before it, if any.
    fn next_snapshot(&self) -> (PathBuf, Option<PathBuf>) {
        (
            self.scratch.join(object_name(self.sent.len())),
            self.sent.last().cloned(),
        )
    }

    /// Delete the send snapshots, newest first.
    pub async fn finish(self, storage: &dyn StorageBackend) {
        for snap in self.sent.iter().rev() {
            if let Err(e) = storage.delete_subvolume(snap).await {
                warn!(path = %snap.display(), error = %e, "Failed to delete send snapshot");
            }
        }
    }
}

/// Receiving end matching [`FsSender`]. Received btrfs snapshots stay
/// read-only under `scratch` so the next incremental stream finds its
/// parent; each tree gets a writable snapshot at its destination.
pub struct FsReceiver {
    method: FsMethod,
    scratch: PathBuf,
    received: Vec<PathBuf>,
}

impl FsReceiver {
    pub fn new(method: FsMethod, scratch: PathBuf) -> Self {
        Self {
            method,
            scratch,
            received: Vec::new(),
        }
    }

    /// Receive one tree into `dst`.
    pub async fn receive<R>(&mut self, dst: &Path, channel: &mut R) -> Result<()>
    where
        R: AsyncRead + Unpin + Send + ?Sized,
    {
        debug!(method = ?self.method, dst = %dst.display(), "Receiving filesystem");
        match self.method {
            FsMethod::Tar => receive_tar(dst, channel).await,
            FsMethod::Btrfs => {
                let received = self.scratch.join(object_name(self.received.len()));
                receive_btrfs(&self.scratch, channel).await?;
                self.received.push(received.clone());

                if let Some(parent) = dst.parent() {
                    tokio::fs::create_dir_all(parent).await?;
                }
                btrfs(&[
                    "subvolume",
                    "snapshot",
                    &received.to_string_lossy(),
                    &dst.to_string_lossy(),
                ])
                .await
            }
        }
    }

    /// Delete the received read-only snapshots, newest first.
    pub async fn finish(self, storage: &dyn StorageBackend) {
        for snap in self.received.iter().rev() {
            if let Err(e) = storage.delete_subvolume(snap).await {
                warn!(path = %snap.display(), error = %e, "Failed to delete received snapshot");
            }
        }
    }
}

/// Name of the `index`th transferred tree. Sender and receiver count the
/// same way, and `btrfs receive` keeps the sender's subvolume name.
fn object_name(index: usize) -> String {
    format!("object-{index}")
}

/// Arguments for `btrfs send` of `snap`, incremental against `parent`.
pub fn btrfs_send_args(snap: &Path, parent: Option<&Path>) -> Vec<String> {
    let mut args = vec!["send".to_string(), "-q".to_string()];
    if let Some(parent) = parent {
        args.push("-p".to_string());
        args.push(parent.to_string_lossy().into_owned());
    }
    args.push(snap.to_string_lossy().into_owned());
    args
}

pub async fn send_tar<W>(src: &Path, channel: &mut W) -> Result<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let (tx, mut rx) = mpsc::channel::<Vec<u8>>(8);
    let src = src.to_path_buf();
    let task = tokio::task::spawn_blocking(move || -> std::io::Result<()> {
        let mut builder = tar::Builder::new(ChunkWriter::new(tx));
        builder.follow_symlinks(false);
        builder.append_dir_all(".", &src)?;
        let mut writer = builder.into_inner()?;
        writer.flush()
    });

    let mut write_err = None;
    while let Some(chunk) = rx.recv().await {
        if let Err(e) = write_chunk(channel, &chunk).await {
            write_err = Some(e);
            break;
        }
    }
    // Unblocks the archiver if the channel failed.
    drop(rx);

    let built = task
        .await
        .map_err(|e| Error::Io(std::io::Error::other(e)))?;
    if let Some(e) = write_err {
        return Err(e);
    }
    built?;
    write_end(channel).await
}

pub async fn receive_tar<R>(dst: &Path, channel: &mut R) -> Result<()>
where
    R: AsyncRead + Unpin + ?Sized,
{
    tokio::fs::create_dir_all(dst).await?;

    let (tx, rx) = mpsc::channel::<Vec<u8>>(8);
    let dst = dst.to_path_buf();
    let preserve_owner = nix::unistd::geteuid().is_root();
    let task = tokio::task::spawn_blocking(move || -> std::io::Result<()> {
        let mut archive = tar::Archive::new(ChunkReader::new(rx));
        archive.set_preserve_permissions(true);
        archive.set_preserve_ownerships(preserve_owner);
        archive.set_overwrite(true);
        archive.unpack(&dst)
    });

    let mut read_err = None;
    loop {
        match read_chunk(channel).await {
            Ok(Some(chunk)) => {
                // The unpacker may stop at the archive end marker; keep draining.
                let _ = tx.send(chunk).await;
            }
            Ok(None) => break,
            Err(e) => {
                read_err = Some(e);
                break;
            }
        }
    }
    drop(tx);

    let unpacked = task
        .await
        .map_err(|e| Error::Io(std::io::Error::other(e)))?;
    if let Some(e) = read_err {
        return Err(e);
    }
    unpacked?;
    Ok(())
}

async fn send_btrfs<W>(snap: &Path, parent: Option<&Path>, channel: &mut W) -> Result<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut child = Command::new("btrfs")
        .args(btrfs_send_args(snap, parent))
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| Error::Runtime("btrfs send stdout not captured".into()))?;

    send_stream(stdout, channel).await?;

    let output = child.wait_with_output().await?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(Error::Runtime(format!("btrfs send failed: {}", stderr.trim())));
    }
    Ok(())
}

async fn receive_btrfs<R>(scratch: &Path, channel: &mut R) -> Result<()>
where
    R: AsyncRead + Unpin + ?Sized,
{
    tokio::fs::create_dir_all(scratch).await?;

    let mut child = Command::new("btrfs")
        .arg("receive")
        .arg(scratch)
        .stdin(Stdio::piped())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()?;
    let stdin = child
        .stdin
        .take()
        .ok_or_else(|| Error::Runtime("btrfs receive stdin not captured".into()))?;

    let copied = receive_stream(channel, stdin).await;
    let output = child.wait_with_output().await?;
    copied?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(Error::Runtime(format!(
            "btrfs receive failed: {}",
            stderr.trim()
        )));
    }
    Ok(())
}

/// Blocking writer handing fixed-size chunks to an async consumer.
struct ChunkWriter {
    tx: mpsc::Sender<Vec<u8>>,
    buf: Vec<u8>,
}

impl ChunkWriter {
    fn new(tx: mpsc::Sender<Vec<u8>>) -> Self {
        Self {
            tx,
            buf: Vec::with_capacity(CHUNK_SIZE),
        }
    }

    fn send_buf(&mut self) -> std::io::Result<()> {
        if self.buf.is_empty() {
            return Ok(());
        }
        let chunk = std::mem::replace(&mut self.buf, Vec::with_capacity(CHUNK_SIZE));
        self.tx
            .blocking_send(chunk)
            .map_err(|_| std::io::Error::from(std::io::ErrorKind::BrokenPipe))
    }
}

impl Write for ChunkWriter {
    fn write(&mut self, data: &[u8]) -> std::io::Result<usize> {
        let n = data.len().min(CHUNK_SIZE - self.buf.len());
        self.buf.extend_from_slice(&data[..n]);
        if self.buf.len() >= CHUNK_SIZE {
            self.send_buf()?;
        }
        Ok(n)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.send_buf()
    }
}

/// Blocking reader fed by an async producer. A closed channel reads as EOF.
struct ChunkReader {
    rx: mpsc::Receiver<Vec<u8>>,
    current: Vec<u8>,
    pos: usize,
}

impl ChunkReader {
    fn new(rx: mpsc::Receiver<Vec<u8>>) -> Self {
        Self {
            rx,
            current: Vec::new(),
            pos: 0,
        }
    }
}

impl Read for ChunkReader {
    fn read(&mut self, out: &mut [u8]) -> std::io::Result<usize> {
        while self.pos == self.current.len() {
            match self.rx.blocking_recv() {
                Some(chunk) => {
                    self.current = chunk;
                    self.pos = 0;
                }
                None => return Ok(0),
            }
        }
        let n = out.len().min(self.current.len() - self.pos);
        out[..n].copy_from_slice(&self.current[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }
}

/// Scratch directory for btrfs send snapshots below a migration dir.
pub fn send_scratch(migration_dir: &Path) -> PathBuf {
    migration_dir.join("send")
}

/// Scratch directory for received btrfs streams below a migration dir.
pub fn receive_scratch(migration_dir: &Path) -> PathBuf {
    migration_dir.join("receive")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_tar_streams_back_to_back() {
        let tmp = tempfile::tempdir().unwrap();
        let a = tmp.path().join("a");
        let b = tmp.path().join("b");
        std::fs::create_dir_all(a.join("etc")).unwrap();
        std::fs::write(a.join("etc/hostname"), "alpha\n").unwrap();
        std::fs::create_dir_all(&b).unwrap();
        std::fs::write(b.join("big"), vec![7u8; 300 * 1024]).unwrap();

        let (mut tx, mut rx) = tokio::io::duplex(8 * 1024);
        let out = tmp.path().join("out");
        let (out_a, out_b) = (out.join("a"), out.join("b"));

        let sender = tokio::spawn(async move {
            send_tar(&a, &mut tx).await.unwrap();
            send_tar(&b, &mut tx).await.unwrap();
        });
        receive_tar(&out_a, &mut rx).await.unwrap();
        receive_tar(&out_b, &mut rx).await.unwrap();
        sender.await.unwrap();

        assert_eq!(
            std::fs::read_to_string(out_a.join("etc/hostname")).unwrap(),
            "alpha\n"
        );
        assert_eq!(std::fs::read(out_b.join("big")).unwrap().len(), 300 * 1024);
    }

    #[tokio::test]
    async fn test_truncated_stream_is_error() {
        let (mut tx, mut rx) = tokio::io::duplex(1024);
        write_chunk(&mut tx, b"partial").await.unwrap();
        drop(tx);

        let err = receive_stream(&mut rx, tokio::io::sink()).await.unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
    }

    #[test]
    fn test_btrfs_send_args() {
        let snap = Path::new("/var/lib/mvirt/migration/web/send/object-1");
        assert_eq!(
            btrfs_send_args(snap, None),
            vec!["send", "-q", "/var/lib/mvirt/migration/web/send/object-1"]
        );

        let parent = Path::new("/var/lib/mvirt/migration/web/send/object-0");
        assert_eq!(
            btrfs_send_args(snap, Some(parent)),
            vec![
                "send",
                "-q",
                "-p",
                "/var/lib/mvirt/migration/web/send/object-0",
                "/var/lib/mvirt/migration/web/send/object-1",
            ]
        );
    }

    #[test]
    fn test_send_snapshots_chain_in_scratch() {
        let scratch = send_scratch(Path::new("/data/migration/web"));
        let mut sender = FsSender::new(FsMethod::Btrfs, scratch.clone());

        let (first, parent) = sender.next_snapshot();
        assert_eq!(first, scratch.join("object-0"));
        assert_eq!(parent, None);
        sender.sent.push(first.clone());

        let (second, parent) = sender.next_snapshot();
        assert_eq!(second, scratch.join("object-1"));
        assert_eq!(parent, Some(first));

        // Another instance's migration snapshots elsewhere.
        let other = FsSender::new(FsMethod::Btrfs, send_scratch(Path::new("/data/migration/db")));
        assert_ne!(other.next_snapshot().0, scratch.join("object-0"));
    }
}
