//! Typed model of the kernel socket-proxy (usrsock) interface
//!
//! The byte-level framing of usrsock request records belongs to the transport
//! collaborator; the engine only sees the decoded, typed form below. Replies
//! flow the other way: one plain ack, one data-carrying ack, or an
//! asynchronous socket-event notification per completed request.

use std::net::SocketAddr;
use std::ops::{BitOr, BitOrAssign};

use bytes::Bytes;

use crate::bridge::SocketHandle;

/// Transaction id correlating a socket-proxy request to its eventual reply
pub type Xid = u32;

/// IPv4 address family
pub const AF_INET: u8 = 2;
/// IPv6 address family
pub const AF_INET6: u8 = 10;
/// Stream (TCP) socket type
pub const SOCK_STREAM: u8 = 1;
/// Datagram (UDP) socket type
pub const SOCK_DGRAM: u8 = 2;
/// Socket-level option namespace
pub const SOL_SOCKET: i32 = 1;
/// Pending-error option, read to resolve a nonblocking connect
pub const SO_ERROR: i32 = 4;

/// Largest socket-option value the engine will forward to the modem
pub(crate) const MAX_SOCKOPT_VALLEN: usize = 64;
/// Largest payload accepted for a single sendto
pub(crate) const MAX_SEND_LEN: usize = 1500;

/// Errno values used in ack results, Linux convention
///
/// Defined locally so the sans-I/O core carries no libc dependency.
#[allow(missing_docs)]
pub mod errno {
    pub const EPERM: i32 = 1;
    pub const EIO: i32 = 5;
    pub const EBADF: i32 = 9;
    pub const EAGAIN: i32 = 11;
    pub const EBUSY: i32 = 16;
    pub const EINVAL: i32 = 22;
    pub const EDESTADDRREQ: i32 = 89;
    pub const EMSGSIZE: i32 = 90;
    pub const EPROTONOSUPPORT: i32 = 93;
    pub const EOPNOTSUPP: i32 = 95;
    pub const EAFNOSUPPORT: i32 = 97;
    pub const ENETDOWN: i32 = 100;
    pub const ECONNABORTED: i32 = 103;
    pub const ENOBUFS: i32 = 105;
    pub const EISCONN: i32 = 106;
    pub const ENOTCONN: i32 = 107;
    pub const EALREADY: i32 = 114;
    pub const EINPROGRESS: i32 = 115;
}

/// Discriminant of a socket-proxy request record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[allow(missing_docs)]
pub enum RequestId {
    Socket,
    Close,
    Connect,
    SendTo,
    RecvFrom,
    SetSockOpt,
    GetSockOpt,
    GetSockName,
    GetPeerName,
    Bind,
    Listen,
    Accept,
    Ioctl,
    Shutdown,
}

/// Which direction(s) of a stream socket to shut down
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum ShutdownHow {
    Read,
    Write,
    Both,
}

/// One decoded socket-proxy request
#[derive(Debug, Clone)]
#[allow(missing_docs)]
pub enum Request {
    Socket {
        xid: Xid,
        domain: u8,
        ty: u8,
        protocol: u8,
    },
    Close {
        xid: Xid,
        usockid: SocketHandle,
    },
    Connect {
        xid: Xid,
        usockid: SocketHandle,
        addr: SocketAddr,
    },
    SendTo {
        xid: Xid,
        usockid: SocketHandle,
        flags: u16,
        addr: Option<SocketAddr>,
        data: Bytes,
    },
    RecvFrom {
        xid: Xid,
        usockid: SocketHandle,
        flags: u16,
        max_buflen: u32,
    },
    SetSockOpt {
        xid: Xid,
        usockid: SocketHandle,
        level: i32,
        option: i32,
        value: Bytes,
    },
    GetSockOpt {
        xid: Xid,
        usockid: SocketHandle,
        level: i32,
        option: i32,
        max_vallen: u16,
    },
    GetSockName {
        xid: Xid,
        usockid: SocketHandle,
    },
    GetPeerName {
        xid: Xid,
        usockid: SocketHandle,
    },
    Bind {
        xid: Xid,
        usockid: SocketHandle,
        addr: SocketAddr,
    },
    Listen {
        xid: Xid,
        usockid: SocketHandle,
        backlog: u16,
    },
    Accept {
        xid: Xid,
        usockid: SocketHandle,
    },
    Shutdown {
        xid: Xid,
        usockid: SocketHandle,
        how: ShutdownHow,
    },
    Ioctl {
        xid: Xid,
        usockid: SocketHandle,
        req: IoctlRequest,
    },
}

impl Request {
    /// The discriminant of this request
    pub fn id(&self) -> RequestId {
        use Request::*;
        match self {
            Socket { .. } => RequestId::Socket,
            Close { .. } => RequestId::Close,
            Connect { .. } => RequestId::Connect,
            SendTo { .. } => RequestId::SendTo,
            RecvFrom { .. } => RequestId::RecvFrom,
            SetSockOpt { .. } => RequestId::SetSockOpt,
            GetSockOpt { .. } => RequestId::GetSockOpt,
            GetSockName { .. } => RequestId::GetSockName,
            GetPeerName { .. } => RequestId::GetPeerName,
            Bind { .. } => RequestId::Bind,
            Listen { .. } => RequestId::Listen,
            Accept { .. } => RequestId::Accept,
            Shutdown { .. } => RequestId::Shutdown,
            Ioctl { .. } => RequestId::Ioctl,
        }
    }

    /// The transaction id the eventual ack must carry
    pub fn xid(&self) -> Xid {
        use Request::*;
        match *self {
            Socket { xid, .. }
            | Close { xid, .. }
            | Connect { xid, .. }
            | SendTo { xid, .. }
            | RecvFrom { xid, .. }
            | SetSockOpt { xid, .. }
            | GetSockOpt { xid, .. }
            | GetSockName { xid, .. }
            | GetPeerName { xid, .. }
            | Bind { xid, .. }
            | Listen { xid, .. }
            | Accept { xid, .. }
            | Shutdown { xid, .. }
            | Ioctl { xid, .. } => xid,
        }
    }
}

/// Secondary dispatch payload for ioctl-class requests, keyed by command group
#[derive(Debug, Clone)]
pub enum IoctlRequest {
    /// Query the modem firmware version string
    GetVersion,
    /// Query whether the network interface is up (answered locally)
    IfStatus,
    /// Event-registration group: which unsolicited reports the client wants
    Event(EventCtl),
    /// Power group
    Power(PowerRequest),
    /// Firmware-update group
    FwUpdate(FwUpdateRequest),
    /// LWM2M group
    Lwm2m(Lwm2mRequest),
    /// Vendor-extension group
    Vendor(VendorRequest),
}

/// Report subscription bits for [`IoctlRequest::Event`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EventCtl {
    /// Bitwise OR of [`EventCtl::SMS`] / [`EventCtl::NETINFO`]
    pub events: u32,
}

impl EventCtl {
    /// Subscribe to unsolicited SMS report events
    pub const SMS: u32 = 1 << 0;
    /// Subscribe to network-information report events
    pub const NETINFO: u32 = 1 << 1;
}

/// Power-group ioctl commands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum PowerRequest {
    On,
    Off,
    RadioOn,
    RadioOff,
    Reset,
    Resume,
}

/// Firmware-update-group ioctl commands
#[derive(Debug, Clone)]
pub enum FwUpdateRequest {
    /// Inject a chunk of the fixed-size update header
    InjectHeader(Bytes),
    /// Inject a chunk of the update body
    InjectBody(Bytes),
    /// Ask the modem how many bytes it has accepted so far
    GetInjected,
    /// Apply the fully injected image
    Execute,
}

/// LWM2M-group ioctl commands
#[derive(Debug, Clone, Copy)]
pub enum Lwm2mRequest {
    /// Whether the modem firmware supports LWM2M (answered locally)
    IsSupported,
    /// Enable or disable the LWM2M client
    Enable(bool),
}

/// Vendor-extension-group ioctl commands
#[derive(Debug, Clone)]
pub enum VendorRequest {
    /// SMS session operations
    Sms(SmsRequest),
    /// Opaque vendor command forwarded verbatim
    Raw {
        /// Vendor command code
        cmd: u32,
        /// Vendor payload
        data: Bytes,
    },
}

/// SMS session operations carried through the vendor-extension group
#[derive(Debug, Clone, Copy)]
#[allow(missing_docs)]
pub enum SmsRequest {
    Init,
    Fin,
    Read,
    Delete { index: u16 },
}

/// Data rider on a [`Reply::DataAck`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AckData {
    /// No payload (result-only data ack)
    None,
    /// An address, for getsockname/getpeername/accept
    Addr(SocketAddr),
    /// A socket-option value blob
    Opt(Bytes),
    /// Received payload plus source address, for recvfrom
    AddrData {
        /// Source address if the modem reported one
        addr: Option<SocketAddr>,
        /// Received bytes
        data: Bytes,
    },
    /// Modem firmware version string
    Version(String),
    /// Whether the network interface is up
    IfUp(bool),
    /// Whether the modem firmware supports LWM2M
    Supported(bool),
    /// Bytes the modem reports as injected so far
    Injected(u32),
    /// A fully reassembled SMS payload
    Sms(Bytes),
}

/// One reply to the socket proxy
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// Plain acknowledgement
    Ack {
        /// Transaction this acks
        xid: Xid,
        /// Call result; negative errno on failure
        result: i32,
    },
    /// Acknowledgement carrying a data payload
    DataAck {
        /// Transaction this acks
        xid: Xid,
        /// Call result; negative errno on failure
        result: i32,
        /// Typed payload
        data: AckData,
    },
    /// Asynchronous socket-event notification
    Event {
        /// The socket the event concerns
        usockid: SocketHandle,
        /// Which events fired
        events: SocketEvents,
    },
}

/// Socket-event bits reported to the proxy
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SocketEvents(u8);

impl SocketEvents {
    /// The socket was torn down under the application (modem reset)
    pub const ABORT: Self = Self(1 << 0);
    /// The socket can accept outbound data
    pub const SENDTO_READY: Self = Self(1 << 1);
    /// The socket has inbound data waiting
    pub const RECVFROM_AVAIL: Self = Self(1 << 2);
    /// The remote end closed a stream socket
    pub const REMOTE_CLOSED: Self = Self(1 << 3);

    /// Whether all bits of `other` are set in `self`
    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Whether no bits are set
    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub(crate) fn insert(&mut self, other: Self) {
        self.0 |= other.0;
    }

    pub(crate) fn remove(&mut self, other: Self) {
        self.0 &= !other.0;
    }
}

impl BitOr for SocketEvents {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for SocketEvents {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}
