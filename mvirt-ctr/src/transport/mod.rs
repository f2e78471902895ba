//! Multi-channel session transport.
//!
//! A [`Session`] binds a control channel and a fixed number of data
//! channels into one logical operation. Callers learn one secret per
//! channel; connections presenting a secret fill the matching slot. Two
//! barriers gate the relay: one fires when the control channel is in, the
//! other once every channel is. The session carries a single terminal
//! outcome that is published exactly once.

pub mod listener;
pub mod relay;

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{Mutex, watch};
use tracing::debug;
use uuid::Uuid;

use crate::error::{Error, Result, SessionFailure};

/// A bidirectional byte stream carrying one session channel.
pub trait Channel: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> Channel for T {}

pub type BoxedChannel = Box<dyn Channel>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ChannelRole {
    Control,
    Data(usize),
}

impl fmt::Display for ChannelRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChannelRole::Control => f.write_str("control"),
            ChannelRole::Data(i) => write!(f, "{i}"),
        }
    }
}

/// Terminal result of a session.
pub type Outcome<T> = std::result::Result<T, SessionFailure>;

enum Slot {
    Empty,
    Ready(BoxedChannel),
    /// Connected and handed to the operation.
    Taken,
}

impl Slot {
    fn is_connected(&self) -> bool {
        !matches!(self, Slot::Empty)
    }
}

struct Slots {
    control: Slot,
    data: Vec<Slot>,
    closed: bool,
}

impl Slots {
    fn get_mut(&mut self, role: ChannelRole) -> Option<&mut Slot> {
        match role {
            ChannelRole::Control => Some(&mut self.control),
            ChannelRole::Data(i) => self.data.get_mut(i),
        }
    }

    fn missing(&self) -> Vec<ChannelRole> {
        let mut missing = Vec::new();
        if !self.control.is_connected() {
            missing.push(ChannelRole::Control);
        }
        for (i, slot) in self.data.iter().enumerate() {
            if !slot.is_connected() {
                missing.push(ChannelRole::Data(i));
            }
        }
        missing
    }
}

pub struct Session<T> {
    secrets: BTreeMap<ChannelRole, String>,
    slots: Mutex<Slots>,
    control_connected: watch::Sender<bool>,
    all_connected: watch::Sender<bool>,
    outcome: watch::Sender<Option<Outcome<T>>>,
}

impl<T: Clone + Send + Sync> Session<T> {
    pub fn new(data_channels: usize) -> Self {
        let mut secrets = BTreeMap::new();
        secrets.insert(ChannelRole::Control, new_secret());
        for i in 0..data_channels {
            secrets.insert(ChannelRole::Data(i), new_secret());
        }

        Self {
            secrets,
            slots: Mutex::new(Slots {
                control: Slot::Empty,
                data: (0..data_channels).map(|_| Slot::Empty).collect(),
                closed: false,
            }),
            control_connected: watch::Sender::new(false),
            all_connected: watch::Sender::new(false),
            outcome: watch::Sender::new(None),
        }
    }

    /// Channel name ("control", "0", "1", ...) to secret.
    pub fn secrets(&self) -> BTreeMap<String, String> {
        self.secrets
            .iter()
            .map(|(role, secret)| (role.to_string(), secret.clone()))
            .collect()
    }

    pub fn secret(&self, role: ChannelRole) -> Option<&str> {
        self.secrets.get(&role).map(String::as_str)
    }

    fn role_for(&self, secret: &str) -> Option<ChannelRole> {
        self.secrets
            .iter()
            .find(|(_, s)| s.as_str() == secret)
            .map(|(role, _)| *role)
    }

    /// Attach an inbound connection to the slot its secret names.
    pub async fn connect(&self, secret: &str, channel: BoxedChannel) -> Result<ChannelRole> {
        let role = self
            .role_for(secret)
            .ok_or_else(|| Error::NotFound("unknown channel secret".into()))?;

        let mut slots = self.slots.lock().await;
        if slots.closed {
            return Err(Error::Conflict(format!(
                "session is closed, rejecting {role} channel"
            )));
        }

        let slot = slots
            .get_mut(role)
            .ok_or_else(|| Error::NotFound(format!("no {role} channel")))?;
        if slot.is_connected() {
            return Err(Error::Conflict(format!("{role} channel already connected")));
        }
        *slot = Slot::Ready(channel);
        debug!(channel = %role, "Channel connected");

        if role == ChannelRole::Control {
            self.control_connected.send_replace(true);
        }
        if slots.missing().is_empty() {
            self.all_connected.send_replace(true);
        }
        Ok(role)
    }

    /// Wait for the control channel alone and take it.
    pub async fn wait_control(&self, timeout: Duration) -> Result<BoxedChannel> {
        let mut rx = self.control_connected.subscribe();
        if tokio::time::timeout(timeout, rx.wait_for(|c| *c)).await.is_err() {
            return Err(self.expire().await);
        }

        let mut slots = self.slots.lock().await;
        match std::mem::replace(&mut slots.control, Slot::Taken) {
            Slot::Ready(channel) => Ok(channel),
            other => {
                slots.control = other;
                Err(Error::Conflict("control channel already taken".into()))
            }
        }
    }

    /// Wait until every channel is connected, then take the data channels
    /// in index order.
    pub async fn wait_data(&self, timeout: Duration) -> Result<Vec<BoxedChannel>> {
        let mut rx = self.all_connected.subscribe();
        if tokio::time::timeout(timeout, rx.wait_for(|c| *c)).await.is_err() {
            return Err(self.expire().await);
        }

        let mut slots = self.slots.lock().await;
        let mut channels = Vec::with_capacity(slots.data.len());
        for slot in slots.data.iter_mut() {
            match std::mem::replace(slot, Slot::Taken) {
                Slot::Ready(channel) => channels.push(channel),
                _ => return Err(Error::Conflict("data channels already taken".into())),
            }
        }
        Ok(channels)
    }

    /// Close after a barrier timeout and describe what never arrived.
    async fn expire(&self) -> Error {
        let missing = {
            let slots = self.slots.lock().await;
            slots.missing()
        };
        self.close().await;

        let names: Vec<String> = missing.iter().map(ChannelRole::to_string).collect();
        Error::ConnectTimeout(format!("missing channels: {}", names.join(", ")))
    }

    /// Reject further connections and drop every channel not yet taken.
    pub async fn close(&self) {
        let mut slots = self.slots.lock().await;
        slots.closed = true;
        if let Slot::Ready(_) = slots.control {
            slots.control = Slot::Taken;
        }
        for slot in slots.data.iter_mut() {
            if let Slot::Ready(_) = slot {
                *slot = Slot::Taken;
            }
        }
    }

    /// Publish the terminal outcome. Only the first call has any effect;
    /// it returns whether this call won.
    pub async fn finish(&self, outcome: Outcome<T>) -> bool {
        let published = self.outcome.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            *current = Some(outcome);
            true
        });

        if published {
            self.close().await;
        }
        published
    }

    /// The outcome, if already published.
    pub fn finished(&self) -> Option<Outcome<T>> {
        self.outcome.borrow().clone()
    }

    /// Wait for the outcome.
    pub async fn result(&self) -> Outcome<T> {
        let mut rx = self.outcome.subscribe();
        let value = match rx.wait_for(Option::is_some).await {
            Ok(value) => value.clone(),
            Err(_) => None,
        };
        value.unwrap_or_else(|| {
            Err(SessionFailure::new(
                crate::error::ErrorKind::Internal,
                "session dropped without a result",
            ))
        })
    }
}

/// 32 random bytes, hex encoded.
fn new_secret() -> String {
    format!("{}{}", Uuid::new_v4().simple(), Uuid::new_v4().simple())
}
