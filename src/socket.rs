//! Per-socket context and state machine

use std::net::SocketAddr;

use bytes::Bytes;
use tracing::warn;

use crate::usrsock::{RequestId, ShutdownHow, SocketEvents, Xid, SOCK_STREAM};

/// State of one logical application socket
///
/// `Prealloc` is the initial state after a create-socket request, before the
/// modem-side socket exists; the open happens lazily on the first operation
/// that needs a live modem socket. `Connecting` means the connect command is
/// in flight; `WaitConn` means the modem answered `-EINPROGRESS` and
/// completion must be polled through a `SO_ERROR` read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum SocketState {
    Closed,
    Prealloc,
    Open,
    Opened,
    Connecting,
    WaitConn,
    Connected,
    Aborted,
    Closing,
}

impl SocketState {
    /// Whether only close/shutdown may still be requested
    pub fn is_closed(self) -> bool {
        matches!(self, SocketState::Closed | SocketState::Closing)
    }

    /// Whether `next` is a documented edge out of `self`
    pub(crate) fn may_transition(self, next: SocketState) -> bool {
        use SocketState::*;
        match self {
            Closed => matches!(next, Prealloc),
            Prealloc => matches!(next, Open | Closing),
            Open => matches!(next, Opened | Prealloc | Aborted | Closing),
            Opened => matches!(next, Connecting | Aborted | Closing),
            // Connecting/WaitConn fall back to Opened when the connect fails
            Connecting => matches!(next, WaitConn | Connected | Opened | Aborted | Closing),
            WaitConn => matches!(next, Connected | Opened | Aborted | Closing),
            Connected => matches!(next, Aborted | Closing),
            Aborted => matches!(next, Closing),
            Closing => matches!(next, Closed),
        }
    }
}

/// Parameters of the request currently outstanding on a context
///
/// Exactly one variant is active at a time, keyed by the request that set it.
#[derive(Debug, Clone, Default)]
pub(crate) enum PendingRequest {
    #[default]
    None,
    Connect {
        addr: SocketAddr,
    },
    Bind {
        addr: SocketAddr,
    },
    Listen {
        backlog: u16,
    },
    SetSockOpt {
        level: i32,
        option: i32,
        value: Bytes,
    },
    GetSockOpt {
        level: i32,
        option: i32,
        max_vallen: u16,
    },
    Name {
        peer: bool,
    },
    SendTo {
        len: u32,
    },
    RecvFrom {
        max_buflen: u32,
    },
    Shutdown {
        how: ShutdownHow,
    },
}

/// Context for one logical application socket, owned by the socket table
pub(crate) struct SocketContext {
    pub(crate) domain: u8,
    pub(crate) ty: u8,
    pub(crate) protocol: u8,
    state: SocketState,
    /// Modem-side socket handle, present once the open chain completed
    pub(crate) altsockid: Option<i32>,
    pub(crate) pending: PendingRequest,
    /// Request id + xid of the outstanding request; at most one at a time
    pub(crate) pending_xid: Option<(RequestId, Xid)>,
    /// Connect xid parked while the modem resolves an -EINPROGRESS connect
    pub(crate) wait_conn_xid: Option<Xid>,
    /// Readiness side-bitmask, updated independently of `state`
    pub(crate) select: SocketEvents,
    pub(crate) listening: bool,
}

impl SocketContext {
    pub(crate) fn new(domain: u8, ty: u8, protocol: u8) -> Self {
        Self {
            domain,
            ty,
            protocol,
            state: SocketState::Prealloc,
            altsockid: None,
            pending: PendingRequest::None,
            pending_xid: None,
            wait_conn_xid: None,
            select: SocketEvents::default(),
            listening: false,
        }
    }

    /// Context for a connection handed over by accept; born connected, with
    /// the modem-side socket already open and flagged non-blocking
    pub(crate) fn accepted(domain: u8, ty: u8, protocol: u8, altsockid: i32) -> Self {
        let mut ctx = Self::new(domain, ty, protocol);
        ctx.state = SocketState::Connected;
        ctx.altsockid = Some(altsockid);
        ctx
    }

    pub(crate) fn state(&self) -> SocketState {
        self.state
    }

    pub(crate) fn set_state(&mut self, next: SocketState) {
        if !self.state.may_transition(next) {
            warn!(?next, current = ?self.state, "illegal socket state transition");
            debug_assert!(false, "illegal transition {:?} -> {:?}", self.state, next);
        }
        self.state = next;
    }

    pub(crate) fn is_stream(&self) -> bool {
        self.ty == SOCK_STREAM
    }

    /// Whether a request is outstanding (one-outstanding gate)
    pub(crate) fn busy(&self) -> bool {
        self.pending_xid.is_some()
    }

    /// Record a new outstanding request
    pub(crate) fn begin(&mut self, id: RequestId, xid: Xid, pending: PendingRequest) {
        debug_assert!(self.pending_xid.is_none());
        self.pending = pending;
        self.pending_xid = Some((id, xid));
    }

    /// Release the outstanding-request slot, returning its xid
    pub(crate) fn finish(&mut self) -> Option<Xid> {
        self.pending = PendingRequest::None;
        self.pending_xid.take().map(|(_, xid)| xid)
    }

    /// Abandon the outstanding request without acking, e.g. on close
    pub(crate) fn abandon(&mut self) {
        self.pending = PendingRequest::None;
        self.pending_xid = None;
    }
}
