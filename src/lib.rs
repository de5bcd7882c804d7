//! Request/response bridging logic for ALT1250-class LTE modems
//!
//! altcom-proto contains a fully deterministic implementation of the bridging
//! engine that sits between a kernel socket-proxy interface (usrsock) and a
//! cellular modem speaking the ALTCOM command protocol. It contains no device
//! or kernel I/O of its own: the embedding daemon owns the file descriptors
//! and feeds the engine through the [`DeviceChannel`] trait, draining replies
//! destined for the socket proxy via [`Bridge::poll_reply`].
//!
//! The most important type is [`Bridge`], which owns the socket-context table,
//! the fixed-capacity pool of in-flight command containers, and the
//! accumulated modem state. Inbound socket-verb requests enter through
//! [`Bridge::handle_request`]; completed modem commands and unsolicited modem
//! events are drained through [`Bridge::process_events`], which invokes each
//! container's continuation to advance the owning socket's state machine and
//! produce the user-visible acknowledgement.

#![warn(missing_docs)]
#![cfg_attr(test, allow(dead_code))]
#![allow(clippy::cognitive_complexity)]
#![allow(clippy::too_many_arguments)]

mod atcmd;
mod bridge;
mod command;
mod composer;
mod config;
mod container;
mod device;
mod fwupdate;
mod modem;
mod postproc;
mod reset_seq;
mod sms;
mod socket;
mod usrsock;

#[cfg(test)]
mod tests;

pub use crate::bridge::{Bridge, SocketHandle};
pub use crate::command::{ApiId, CommandArgs, CommandReply};
pub use crate::config::{BridgeConfig, ConfigError};
pub use crate::container::Container;
pub use crate::device::{DeviceChannel, EventSet, PowerCmd, SendFailure, SendFailureKind};
pub use crate::fwupdate::FwHeader;
pub use crate::modem::PowerState;
pub use crate::reset_seq::BootstrapError;
pub use crate::sms::{SmsReport, SmsState};
pub use crate::socket::SocketState;
pub use crate::usrsock::{
    errno, AckData, EventCtl, FwUpdateRequest, IoctlRequest, Lwm2mRequest, PowerRequest, Reply,
    Request, RequestId, ShutdownHow, SmsRequest, SocketEvents, VendorRequest, Xid, AF_INET,
    AF_INET6, SOCK_DGRAM, SOCK_STREAM, SOL_SOCKET, SO_ERROR,
};
