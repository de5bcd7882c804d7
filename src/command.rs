//! ALTCOM command identifiers and typed argument/reply slots
//!
//! A [`Container`](crate::Container) carries one `ApiId` plus a `CommandArgs`
//! variant down to the device channel, and comes back with a `CommandReply`
//! variant filled in by the channel once the modem answers.

use std::net::SocketAddr;

use bytes::Bytes;

use crate::sms::SmsReport;
use crate::usrsock::ShutdownHow;

/// Identifier of one ALTCOM command
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[allow(missing_docs)]
pub enum ApiId {
    /// Placeholder for a cleared container; never sent
    #[default]
    None,
    SocketNew,
    SocketClose,
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
    Fcntl,
    Shutdown,
    Select,
    RadioOn,
    RadioOff,
    ReportNetinfo,
    ActivatePdn,
    GetVersion,
    AtCommand,
    Lwm2mEnable,
    SmsInit,
    SmsFin,
    SmsDelete,
    SmsReportRecv,
    FwInjectHeader,
    FwInjectBody,
    FwGetInjected,
    FwExecute,
    Resume,
    VendorCmd,
}

/// `fcntl` F_SETFL command code, the only fcntl the engine issues
pub(crate) const FCNTL_SETFL: i32 = 4;
/// `O_NONBLOCK` flag value passed with [`FCNTL_SETFL`]
pub(crate) const O_NONBLOCK: i32 = 0o4000;

/// Input parameters for one command, borrowed by the channel for the
/// duration of the send
#[derive(Debug, Clone, Default)]
#[allow(missing_docs)]
pub enum CommandArgs {
    #[default]
    None,
    SocketNew {
        domain: u8,
        ty: u8,
        protocol: u8,
    },
    SocketClose {
        altsockid: i32,
    },
    Fcntl {
        altsockid: i32,
        cmd: i32,
        flags: i32,
    },
    Connect {
        altsockid: i32,
        addr: SocketAddr,
    },
    SendTo {
        altsockid: i32,
        flags: u16,
        addr: Option<SocketAddr>,
        data: Bytes,
    },
    RecvFrom {
        altsockid: i32,
        flags: u16,
        max_buflen: u32,
    },
    SetSockOpt {
        altsockid: i32,
        level: i32,
        option: i32,
        value: Bytes,
    },
    GetSockOpt {
        altsockid: i32,
        level: i32,
        option: i32,
        max_vallen: u16,
    },
    /// getsockname/getpeername/accept/shutdown-free single-socket commands
    Sock {
        altsockid: i32,
    },
    Bind {
        altsockid: i32,
        addr: SocketAddr,
    },
    Listen {
        altsockid: i32,
        backlog: u16,
    },
    Shutdown {
        altsockid: i32,
        how: ShutdownHow,
    },
    /// Bitmaps of altsockids to watch, one bit per id
    Select {
        read_set: u64,
        write_set: u64,
    },
    /// A formatted AT command line from the composer collaborator
    At {
        line: String,
    },
    Enable {
        enable: bool,
    },
    SmsDelete {
        index: u16,
    },
    FwChunk {
        data: Bytes,
    },
    Vendor {
        cmd: u32,
        data: Bytes,
    },
}

/// Reply fields written by the device channel when the modem answers
#[derive(Debug, Clone)]
pub enum CommandReply {
    /// Paired modem result and errno, the shape most commands return
    Result {
        /// Raw modem result; negative means "consult `errcode`"
        result: i32,
        /// Modem-side errno, valid when `result` is negative
        errcode: i32,
    },
    /// recvfrom completion
    Recv {
        /// Bytes received, or negative
        result: i32,
        /// Modem-side errno
        errcode: i32,
        /// Source address if the modem reported one
        addr: Option<SocketAddr>,
        /// Received payload
        data: Bytes,
    },
    /// getsockname/getpeername/accept completion
    SockName {
        /// Modem result; for accept, the new modem-side socket id
        result: i32,
        /// Modem-side errno
        errcode: i32,
        /// The reported address
        addr: Option<SocketAddr>,
    },
    /// getsockopt completion
    OptValue {
        /// Modem result
        result: i32,
        /// Modem-side errno
        errcode: i32,
        /// Raw option value
        value: Bytes,
    },
    /// Readiness snapshot for a select command
    Select {
        /// Modem result
        result: i32,
        /// Modem-side errno
        errcode: i32,
        /// Readable altsockids, one bit per id
        readable: u64,
        /// Writable altsockids, one bit per id
        writable: u64,
    },
    /// Raw AT reply text for an [`ApiId::AtCommand`]
    At {
        /// Modem result
        result: i32,
        /// Reply text, e.g. `%GETACFG: 1.1\r\nOK`
        line: String,
    },
    /// Firmware version query completion
    Version {
        /// Modem result
        result: i32,
        /// Modem-side errno
        errcode: i32,
        /// Version string, e.g. `RK_03_02_000`
        version: String,
    },
    /// Injected-size query completion
    Injected {
        /// Modem result
        result: i32,
        /// Modem-side errno
        errcode: i32,
        /// Bytes the modem has accepted so far
        injected: u32,
    },
    /// An unsolicited SMS report delivered through the armed report container
    SmsReport(SmsReport),
}

impl CommandReply {
    /// The raw result/errno pair, for handlers that only need the combine rule
    pub(crate) fn result_errcode(&self) -> (i32, i32) {
        match *self {
            CommandReply::Result { result, errcode }
            | CommandReply::Recv {
                result, errcode, ..
            }
            | CommandReply::SockName {
                result, errcode, ..
            }
            | CommandReply::OptValue {
                result, errcode, ..
            }
            | CommandReply::Select {
                result, errcode, ..
            }
            | CommandReply::Version {
                result, errcode, ..
            }
            | CommandReply::Injected {
                result, errcode, ..
            } => (result, errcode),
            CommandReply::At { result, .. } => (result, 0),
            CommandReply::SmsReport(_) => (0, 0),
        }
    }
}
