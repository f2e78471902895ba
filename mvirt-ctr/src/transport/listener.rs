//! Network acceptance for session channels.
//!
//! A client opens a stream, sends `<secret>\n` and from then on the stream
//! is the channel. The registry routes the secret to the owning session.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream, UnixListener, UnixStream};
use tokio::sync::{RwLock, watch};
use tracing::{debug, info, warn};

use super::{BoxedChannel, ChannelRole, Session};
use crate::error::{Error, Result};

/// Longest accepted handshake line.
const MAX_SECRET_LEN: u64 = 256;
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Something that accepts channels by secret.
#[async_trait]
pub trait ChannelSink: Send + Sync {
    async fn accept(&self, secret: &str, channel: BoxedChannel) -> Result<ChannelRole>;
}

#[async_trait]
impl<T: Clone + Send + Sync + 'static> ChannelSink for Session<T> {
    async fn accept(&self, secret: &str, channel: BoxedChannel) -> Result<ChannelRole> {
        self.connect(secret, channel).await
    }
}

/// Secret -> session routing table.
#[derive(Default)]
pub struct SessionRegistry {
    sessions: RwLock<HashMap<String, Arc<dyn ChannelSink>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self, sink: Arc<dyn ChannelSink>, secrets: &[String]) {
        let mut sessions = self.sessions.write().await;
        for secret in secrets {
            sessions.insert(secret.clone(), sink.clone());
        }
    }

    pub async fn unregister(&self, secrets: &[String]) {
        let mut sessions = self.sessions.write().await;
        for secret in secrets {
            sessions.remove(secret);
        }
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }

    pub async fn dispatch(&self, secret: &str, channel: BoxedChannel) -> Result<ChannelRole> {
        let sink = self
            .sessions
            .read()
            .await
            .get(secret)
            .cloned()
            .ok_or_else(|| Error::NotFound("unknown channel secret".into()))?;

        sink.accept(secret, channel).await
    }

    /// Read the handshake line from `stream` and route it.
    pub async fn handle<S>(&self, stream: S) -> Result<ChannelRole>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let mut reader = BufReader::new(stream);
        let mut line = Vec::new();
        let read = tokio::time::timeout(
            HANDSHAKE_TIMEOUT,
            (&mut reader).take(MAX_SECRET_LEN).read_until(b'\n', &mut line),
        )
        .await
        .map_err(|_| Error::Protocol("handshake timed out".into()))??;

        if read == 0 || line.last() != Some(&b'\n') {
            return Err(Error::Protocol("malformed handshake".into()));
        }
        let secret = std::str::from_utf8(&line[..line.len() - 1])
            .map_err(|_| Error::Protocol("handshake is not UTF-8".into()))?
            .trim_end_matches('\r');

        self.dispatch(secret, Box::new(reader)).await
    }
}

/// Accept TCP channel connections until `shutdown` flips to true.
pub async fn serve_tcp(
    listener: TcpListener,
    registry: Arc<SessionRegistry>,
    mut shutdown: watch::Receiver<bool>,
) {
    info!(addr = ?listener.local_addr().ok(), "Channel listener started");
    loop {
        tokio::select! {
            _ = shutdown.wait_for(|s| *s) => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    let _ = stream.set_nodelay(true);
                    let registry = registry.clone();
                    tokio::spawn(async move {
                        match registry.handle(stream).await {
                            Ok(role) => debug!(peer = %peer, channel = %role, "Channel accepted"),
                            Err(e) => warn!(peer = %peer, error = %e, "Rejected channel connection"),
                        }
                    });
                }
                Err(e) => warn!(error = %e, "Accept failed"),
            }
        }
    }
    info!("Channel listener stopped");
}

/// Accept Unix socket channel connections until `shutdown` flips to true.
pub async fn serve_unix(
    listener: UnixListener,
    registry: Arc<SessionRegistry>,
    mut shutdown: watch::Receiver<bool>,
) {
    info!("Channel listener started on unix socket");
    loop {
        tokio::select! {
            _ = shutdown.wait_for(|s| *s) => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, _)) => {
                    let registry = registry.clone();
                    tokio::spawn(async move {
                        match registry.handle(stream).await {
                            Ok(role) => debug!(channel = %role, "Channel accepted"),
                            Err(e) => warn!(error = %e, "Rejected channel connection"),
                        }
                    });
                }
                Err(e) => warn!(error = %e, "Accept failed"),
            }
        }
    }
    info!("Channel listener stopped");
}

/// Open a channel to a remote listener. `addr` is `host:port` or
/// `unix:/path`.
pub async fn dial(addr: &str, secret: &str) -> Result<BoxedChannel> {
    let mut channel: BoxedChannel = match addr.strip_prefix("unix:") {
        Some(path) => Box::new(UnixStream::connect(path).await?),
        None => {
            let stream = TcpStream::connect(addr).await?;
            stream.set_nodelay(true)?;
            Box::new(stream)
        }
    };

    channel.write_all(secret.as_bytes()).await?;
    channel.write_all(b"\n").await?;
    channel.flush().await?;
    Ok(channel)
}
