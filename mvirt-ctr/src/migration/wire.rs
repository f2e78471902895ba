//! Migration control protocol.
//!
//! Messages travel on the control channel as a 4-byte big-endian length
//! followed by a protobuf-encoded [`ControlMessage`].

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{Error, Result};

/// Upper bound for one control frame.
pub const MAX_FRAME: usize = 64 * 1024 * 1024;

#[derive(Clone, PartialEq, prost::Message)]
pub struct Config {
    #[prost(string, tag = "1")]
    pub key: String,
    #[prost(string, tag = "2")]
    pub value: String,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct Device {
    #[prost(string, tag = "1")]
    pub name: String,
    #[prost(message, repeated, tag = "2")]
    pub config: Vec<Config>,
}

/// Descriptor of an instance or snapshot being transferred. Timestamps
/// are epoch seconds, zero meaning unset.
#[derive(Clone, PartialEq, prost::Message)]
pub struct Snapshot {
    #[prost(string, tag = "1")]
    pub name: String,
    #[prost(message, repeated, tag = "2")]
    pub local_config: Vec<Config>,
    #[prost(string, repeated, tag = "3")]
    pub profiles: Vec<String>,
    #[prost(bool, tag = "4")]
    pub ephemeral: bool,
    #[prost(message, repeated, tag = "5")]
    pub local_devices: Vec<Device>,
    #[prost(int32, tag = "6")]
    pub architecture: i32,
    #[prost(bool, tag = "7")]
    pub stateful: bool,
    #[prost(int64, tag = "8")]
    pub creation_date: i64,
    #[prost(int64, tag = "9")]
    pub last_used_date: i64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum FsMethod {
    Tar = 0,
    Btrfs = 1,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum CheckpointMethod {
    None = 0,
    Criu = 1,
}

/// Source -> sink offer.
#[derive(Clone, PartialEq, prost::Message)]
pub struct MigrationHeader {
    #[prost(enumeration = "FsMethod", repeated, tag = "1")]
    pub fs_methods: Vec<i32>,
    #[prost(enumeration = "CheckpointMethod", tag = "2")]
    pub checkpoint: i32,
    /// Oldest first.
    #[prost(message, repeated, tag = "3")]
    pub snapshots: Vec<Snapshot>,
    #[prost(message, optional, tag = "4")]
    pub instance: Option<Snapshot>,
    /// Instance filesystem is sent again after the final checkpoint.
    #[prost(bool, tag = "5")]
    pub live: bool,
}

/// Sink -> source selection.
#[derive(Clone, PartialEq, prost::Message)]
pub struct MigrationReply {
    #[prost(enumeration = "FsMethod", tag = "1")]
    pub fs_method: i32,
    #[prost(enumeration = "CheckpointMethod", tag = "2")]
    pub checkpoint: i32,
}

/// Announces the checkpoint image that follows on the checkpoint channel.
#[derive(Clone, PartialEq, prost::Message)]
pub struct CheckpointRound {
    #[prost(uint32, tag = "1")]
    pub round: u32,
    #[prost(bool, tag = "2")]
    pub final_dump: bool,
    #[prost(uint64, tag = "3")]
    pub size: u64,
}

/// Terminal status, sent by either side.
#[derive(Clone, PartialEq, prost::Message)]
pub struct MigrationControl {
    #[prost(bool, tag = "1")]
    pub success: bool,
    #[prost(string, tag = "2")]
    pub message: String,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct ControlMessage {
    #[prost(oneof = "control_message::Body", tags = "1, 2, 3, 4")]
    pub body: Option<control_message::Body>,
}

pub mod control_message {
    #[derive(Clone, PartialEq, prost::Oneof)]
    pub enum Body {
        #[prost(message, tag = "1")]
        Header(super::MigrationHeader),
        #[prost(message, tag = "2")]
        Reply(super::MigrationReply),
        #[prost(message, tag = "3")]
        Round(super::CheckpointRound),
        #[prost(message, tag = "4")]
        Control(super::MigrationControl),
    }
}

pub use control_message::Body;

impl From<Body> for ControlMessage {
    fn from(body: Body) -> Self {
        Self { body: Some(body) }
    }
}

impl MigrationHeader {
    /// Offered methods that decode to a known value.
    pub fn offered_methods(&self) -> Vec<FsMethod> {
        self.fs_methods
            .iter()
            .filter_map(|m| FsMethod::try_from(*m).ok())
            .collect()
    }
}

pub async fn write_frame<W>(writer: &mut W, msg: &ControlMessage) -> Result<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let buf = prost::Message::encode_to_vec(msg);
    if buf.len() > MAX_FRAME {
        return Err(Error::Protocol(format!(
            "control frame of {} bytes exceeds limit",
            buf.len()
        )));
    }
    writer.write_u32(buf.len() as u32).await?;
    writer.write_all(&buf).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one frame. A clean EOF before the length prefix yields `None`.
pub async fn read_frame<R>(reader: &mut R) -> Result<Option<ControlMessage>>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let len = match reader.read_u32().await {
        Ok(len) => len as usize,
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    if len > MAX_FRAME {
        return Err(Error::Protocol(format!(
            "control frame of {len} bytes exceeds limit"
        )));
    }

    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf).await?;
    let msg = <ControlMessage as prost::Message>::decode(buf.as_slice())?;
    Ok(Some(msg))
}
