//! Named, bounded FIFO channels shared between the coordinator and its drivers.
//!
//! Two backends implement the same contract: kernel message queues for process fleets
//! ([`posix`]) and an in-process namespace of condvar-guarded queues for thread fleets
//! ([`local`]). Opening a name is idempotent: the first opener fixes the capacity and
//! message size, later openers attach to the existing channel and must agree on both.

use std::io;
use std::time::{Duration, SystemTime};

use thiserror::Error;

use crate::types::{DriverId, Wire};

pub mod local;
#[cfg(target_os = "linux")]
pub mod posix;

/// Maximum number of pending messages per channel.
pub const CHANNEL_CAPACITY: usize = 10;
/// Default name of the shared task channel.
pub const TASK_CHANNEL: &str = "/driver_fleet_tasks";
const RESULT_CHANNEL_PREFIX: &str = "/driver_fleet_results_";

/// Name of the private result channel owned by `driver`.
pub fn result_channel_name(driver: DriverId) -> String {
    format!("{RESULT_CHANNEL_PREFIX}{driver}")
}

/// Names follow the kernel message-queue rules: one leading slash, no other slashes.
pub fn validate_name(name: &str) -> Result<(), ChannelError> {
    let valid = name.len() > 1
        && name.starts_with('/')
        && !name[1..].contains('/')
        && !name.contains('\0');
    if valid {
        Ok(())
    } else {
        Err(ChannelError::InvalidName(name.to_string()))
    }
}

/// Capacity and message size, fixed for the lifetime of a channel.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ChannelAttrs {
    pub capacity: usize,
    pub message_size: usize,
}

impl ChannelAttrs {
    /// Default-capacity channel sized for messages of type `M`.
    pub const fn for_message<M: Wire>() -> Self {
        Self {
            capacity: CHANNEL_CAPACITY,
            message_size: M::SIZE,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Access {
    Read,
    Write,
}

/// Absolute point in wall-clock time after which a receive gives up.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Deadline(SystemTime);

impl Deadline {
    pub fn after(timeout: Duration) -> Self {
        Self(SystemTime::now() + timeout)
    }

    pub const fn at(instant: SystemTime) -> Self {
        Self(instant)
    }

    pub fn instant(&self) -> SystemTime {
        self.0
    }

    /// Time left before the deadline; `None` once it has passed.
    pub fn remaining(&self) -> Option<Duration> {
        match self.0.duration_since(SystemTime::now()) {
            Ok(left) if !left.is_zero() => Some(left),
            _ => None,
        }
    }
}

/// How long a receive may wait for a message.
#[derive(Clone, Copy, Debug)]
pub enum Wait {
    Forever,
    Until(Deadline),
    Never,
}

/// Outcome of a receive. Timeouts and empty polls are expected, not errors.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Received<M> {
    Message(M),
    TimedOut,
    WouldBlock,
}

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("invalid channel name {0:?}")]
    InvalidName(String),
    #[error("failed to open channel {name}: {source}")]
    Open {
        name: String,
        #[source]
        source: io::Error,
    },
    #[error("failed to unlink channel {name}: {source}")]
    Unlink {
        name: String,
        #[source]
        source: io::Error,
    },
    #[error("send on channel {name} failed: {source}")]
    Send {
        name: String,
        #[source]
        source: io::Error,
    },
    #[error("receive on channel {name} failed: {source}")]
    Receive {
        name: String,
        #[source]
        source: io::Error,
    },
    #[error("channel {name} exists with {existing:?}, requested {requested:?}")]
    AttrsMismatch {
        name: String,
        existing: ChannelAttrs,
        requested: ChannelAttrs,
    },
    #[error("channel {name} carries {expected}-byte messages, got {actual}")]
    MessageSize {
        name: String,
        expected: usize,
        actual: usize,
    },
    #[error("channel {name} handle is not open for {wanted:?}")]
    Access { name: String, wanted: Access },
}

/// A handle to one named channel.
pub trait Channel {
    fn name(&self) -> &str;

    fn attrs(&self) -> ChannelAttrs;

    /// Enqueue one whole message, blocking while the channel is full.
    fn send_bytes(&self, message: &[u8]) -> Result<(), ChannelError>;

    /// Dequeue one whole message into `buf` (at least `message_size` long), returning its length.
    fn receive_bytes(&self, buf: &mut [u8], wait: Wait) -> Result<Received<usize>, ChannelError>;

    /// Number of messages currently queued.
    fn pending(&self) -> Result<usize, ChannelError>;

    fn send<M: Wire>(&self, message: &M) -> Result<(), ChannelError> {
        let mut buf = vec![0u8; M::SIZE];
        message.encode(&mut buf);
        self.send_bytes(&buf)
    }

    /// Block until a message arrives.
    ///
    /// Part of the channel contract alongside the deadline and non-blocking receives; the
    /// simulation itself only waits with deadlines.
    #[allow(dead_code)]
    fn receive<M: Wire>(&self) -> Result<M, ChannelError> {
        loop {
            if let Received::Message(message) = self.receive_with(Wait::Forever)? {
                return Ok(message);
            }
        }
    }

    /// Block until a message arrives or `deadline` passes.
    fn receive_until<M: Wire>(&self, deadline: Deadline) -> Result<Received<M>, ChannelError> {
        self.receive_with(Wait::Until(deadline))
    }

    /// Take a message if one is queued; never blocks.
    fn try_receive<M: Wire>(&self) -> Result<Received<M>, ChannelError> {
        self.receive_with(Wait::Never)
    }

    fn receive_with<M: Wire>(&self, wait: Wait) -> Result<Received<M>, ChannelError> {
        let attrs = self.attrs();
        let mut buf = vec![0u8; attrs.message_size.max(M::SIZE)];
        let len = match self.receive_bytes(&mut buf, wait)? {
            Received::Message(len) => len,
            Received::TimedOut => return Ok(Received::TimedOut),
            Received::WouldBlock => return Ok(Received::WouldBlock),
        };
        match M::decode(&buf[..len]) {
            Some(message) => Ok(Received::Message(message)),
            None => Err(ChannelError::MessageSize {
                name: self.name().to_string(),
                expected: M::SIZE,
                actual: len,
            }),
        }
    }
}

/// Creates, attaches to, and removes named channels.
pub trait ChannelFactory: Clone + Send + Sync + 'static {
    type Channel: Channel + Send;

    /// Create a fresh channel, replacing anything left under `name` by an earlier run.
    fn create(
        &self,
        name: &str,
        attrs: ChannelAttrs,
        access: Access,
    ) -> Result<Self::Channel, ChannelError>;

    /// Attach to `name`, creating it with `attrs` if it does not exist yet.
    fn open(
        &self,
        name: &str,
        attrs: ChannelAttrs,
        access: Access,
    ) -> Result<Self::Channel, ChannelError>;

    /// Remove `name`; open handles keep working. Returns whether it existed.
    fn unlink(&self, name: &str) -> Result<bool, ChannelError>;
}
