//! The modem transport collaborator seam
//!
//! The engine performs no device I/O: the embedding daemon implements
//! [`DeviceChannel`] over its ioctl-based command path and blocking
//! multi-record event read, and the engine drives it synchronously from the
//! single event-loop thread.

use thiserror::Error;

use crate::container::Container;

/// Transport to the modem, implemented by the embedding daemon
pub trait DeviceChannel {
    /// Enqueue one command for asynchronous completion
    ///
    /// An `Err` means the command was refused immediately; the container
    /// rides back in the failure so pool accounting stays balanced.
    fn send(&mut self, container: Box<Container>) -> Result<(), SendFailure>;

    /// Block until the modem produces events, returning which event classes
    /// fired plus the batch of completed containers
    fn get_event(&mut self) -> (EventSet, Vec<Box<Container>>);

    /// Hand back every accepted container that has not yet been delivered
    /// through [`get_event`](DeviceChannel::get_event)
    ///
    /// Called when the modem is powered down: the replies these containers
    /// were waiting for can never arrive, so the engine reclaims them.
    fn drain(&mut self) -> Vec<Box<Container>>;

    /// Drive the modem power rail
    fn power_control(&mut self, cmd: PowerCmd);

    /// Power-cycle the modem
    fn reset(&mut self);
}

/// A command the channel refused to accept
#[derive(Debug)]
pub struct SendFailure {
    /// The refused container, returned so the caller can free it
    pub container: Box<Container>,
    /// Why the command was refused
    pub kind: SendFailureKind,
}

/// Immediate-failure classes for [`DeviceChannel::send`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SendFailureKind {
    /// A modem reset is in progress; retry after resynchronization
    #[error("modem reset in progress")]
    ResetInProgress,
    /// The device rejected the command outright
    #[error("device rejected the command")]
    Rejected,
}

/// Power-rail commands for [`DeviceChannel::power_control`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum PowerCmd {
    On,
    Off,
}

/// Bitmask of event classes yielded by one blocking read
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EventSet(u32);

impl EventSet {
    /// Command replies are present in the container batch
    pub const REPLY: Self = Self(1 << 0);
    /// The modem reset; the container batch is invalidated in-flight work
    pub const RESET: Self = Self(1 << 1);
    /// Unsolicited report containers are present in the batch
    pub const REPORT: Self = Self(1 << 2);
    /// The modem announced a power-state change
    pub const POWER_NOTICE: Self = Self(1 << 3);

    /// Whether all bits of `other` fired
    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Whether no event class fired
    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl std::ops::BitOr for EventSet {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl std::ops::BitOrAssign for EventSet {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}
