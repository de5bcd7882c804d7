//! Request composers: usrsock requests in, modem commands out
//!
//! Each handler validates the request against the owning socket's state,
//! answers locally when no modem round trip is needed, and otherwise fills a
//! container and hands it to the device channel. Stream sockets open their
//! modem-side socket lazily, on the first operation that needs one; datagram
//! sockets open eagerly at create time so the id ack can double as the open
//! confirmation.

use bytes::Bytes;
use std::net::SocketAddr;
use tracing::{debug, trace, warn};

use crate::bridge::{Bridge, SocketHandle};
use crate::command::{ApiId, CommandArgs};
use crate::device::{DeviceChannel, PowerCmd};
use crate::modem::PowerState;
use crate::postproc::{Continuation, DeferredOp, Disposition};
use crate::socket::{PendingRequest, SocketContext, SocketState};
use crate::usrsock::errno::*;
use crate::usrsock::{
    AckData, EventCtl, FwUpdateRequest, IoctlRequest, Lwm2mRequest, PowerRequest, Request,
    RequestId, ShutdownHow, SmsRequest, VendorRequest, Xid, MAX_SEND_LEN, MAX_SOCKOPT_VALLEN,
    SOCK_DGRAM, SOCK_STREAM, SOL_SOCKET, SO_ERROR,
};

impl<D: DeviceChannel> Bridge<D> {
    /// Feed one decoded socket-proxy request into the engine
    ///
    /// Every request is eventually answered through [`poll_reply`]: either
    /// immediately (local answers and validation failures) or once the modem
    /// command it spawned completes.
    ///
    /// [`poll_reply`]: Bridge::poll_reply
    pub fn handle_request(&mut self, req: Request) {
        trace!(id = ?req.id(), xid = req.xid(), "usrsock request");
        if !self.modem.api_enabled
            && !matches!(
                req,
                Request::Ioctl {
                    req: IoctlRequest::Power(_),
                    ..
                }
            )
        {
            // A hibernation resume is still restoring modem state
            return self.ack(req.xid(), -EAGAIN);
        }
        match req {
            Request::Socket {
                xid,
                domain,
                ty,
                protocol,
            } => self.on_socket(xid, domain, ty, protocol),
            Request::Close { xid, usockid } => self.on_close(xid, usockid),
            Request::Connect { xid, usockid, addr } => self.on_connect(xid, usockid, addr),
            Request::SendTo {
                xid,
                usockid,
                flags,
                addr,
                data,
            } => self.on_sendto(xid, usockid, flags, addr, data),
            Request::RecvFrom {
                xid,
                usockid,
                flags,
                max_buflen,
            } => self.on_recvfrom(xid, usockid, flags, max_buflen),
            Request::SetSockOpt {
                xid,
                usockid,
                level,
                option,
                value,
            } => self.on_setsockopt(xid, usockid, level, option, value),
            Request::GetSockOpt {
                xid,
                usockid,
                level,
                option,
                max_vallen,
            } => self.on_getsockopt(xid, usockid, level, option, max_vallen),
            Request::GetSockName { xid, usockid } => self.on_name(xid, usockid, false),
            Request::GetPeerName { xid, usockid } => self.on_name(xid, usockid, true),
            Request::Bind { xid, usockid, addr } => self.on_bind(xid, usockid, addr),
            Request::Listen {
                xid,
                usockid,
                backlog,
            } => self.on_listen(xid, usockid, backlog),
            Request::Accept { xid, usockid } => self.on_accept(xid, usockid),
            Request::Shutdown { xid, usockid, how } => self.on_shutdown(xid, usockid, how),
            Request::Ioctl { xid, req, .. } => self.on_ioctl(xid, req),
        }
    }

    /// Validate the socket id, acking `-EBADF` when it names nothing
    fn lookup(&mut self, usockid: SocketHandle, xid: Xid) -> Option<SocketHandle> {
        if self.sockets.contains(usockid.0) {
            Some(usockid)
        } else {
            self.ack(xid, -EBADF);
            None
        }
    }

    /// Common liveness and one-outstanding gates; acks and returns false on
    /// refusal
    fn gate_live(&mut self, h: SocketHandle, xid: Xid) -> bool {
        let state = self.sockets[h].state();
        if state == SocketState::Aborted {
            self.ack(xid, -ECONNABORTED);
            return false;
        }
        if state.is_closed() {
            self.ack(xid, -EBADF);
            return false;
        }
        if self.sockets[h].busy() {
            self.ack(xid, -EAGAIN);
            return false;
        }
        true
    }

    fn on_socket(&mut self, xid: Xid, domain: u8, ty: u8, protocol: u8) {
        if self.modem.power != PowerState::RadioOn {
            return self.ack(xid, -ENETDOWN);
        }
        if domain != crate::usrsock::AF_INET && domain != crate::usrsock::AF_INET6 {
            return self.ack(xid, -EAFNOSUPPORT);
        }
        if ty != SOCK_STREAM && ty != SOCK_DGRAM {
            return self.ack(xid, -EPROTONOSUPPORT);
        }
        if self.sockets.len() >= self.max_sockets {
            return self.ack(xid, -ENOBUFS);
        }
        let key = self.sockets.insert(SocketContext::new(domain, ty, protocol));
        let h = SocketHandle(key);
        if ty == SOCK_STREAM {
            // The modem socket opens lazily; the id is usable immediately
            debug!(?h, "stream socket created");
            return self.ack(xid, h.0 as i32);
        }
        // Datagram sockets open eagerly; the ack waits for the open chain
        let Some(mut c) = self.pool.alloc() else {
            self.sockets.remove(key);
            return self.ack(xid, -EAGAIN);
        };
        debug!(?h, "datagram socket created, opening");
        c.owner = Some(h);
        c.xid = Some(xid);
        c.cmd = ApiId::SocketNew;
        c.args = CommandArgs::SocketNew {
            domain,
            ty,
            protocol,
        };
        c.continuation = Some(Continuation::SocketOpen { deferred: None });
        self.sockets[h].begin(RequestId::Socket, xid, PendingRequest::None);
        self.sockets[h].set_state(SocketState::Open);
        if !self.send_container(c) {
            // The proxy never learned this handle; don't strand the entry
            self.destroy_socket(h);
        }
    }

    fn on_close(&mut self, xid: Xid, usockid: SocketHandle) {
        let Some(h) = self.lookup(usockid, xid) else {
            return;
        };
        if self.sockets[h].state().is_closed() {
            // A close is already running; treat the repeat as done
            return self.ack(xid, 0);
        }
        // Close cuts through the one-outstanding gate: anything in flight is
        // abandoned and its eventual reply discarded.
        self.sockets[h].abandon();
        let Some(altsockid) = self.sockets[h].altsockid else {
            // No modem-side socket to tear down
            self.sockets[h].set_state(SocketState::Closing);
            self.destroy_socket(h);
            return self.ack(xid, 0);
        };
        let Some(mut c) = self.pool.alloc() else {
            // Leave the context untouched so the proxy can retry
            return self.ack(xid, -EAGAIN);
        };
        c.owner = Some(h);
        c.xid = Some(xid);
        c.cmd = ApiId::SocketClose;
        c.args = CommandArgs::SocketClose { altsockid };
        c.continuation = Some(Continuation::CloseSock);
        self.sockets[h].begin(RequestId::Close, xid, PendingRequest::None);
        self.sockets[h].set_state(SocketState::Closing);
        self.send_container(c);
    }

    fn on_connect(&mut self, xid: Xid, usockid: SocketHandle, addr: SocketAddr) {
        let Some(h) = self.lookup(usockid, xid) else {
            return;
        };
        match self.sockets[h].state() {
            SocketState::Connected => return self.ack(xid, -EISCONN),
            SocketState::WaitConn => return self.ack(xid, -EALREADY),
            _ => {}
        }
        if !self.gate_live(h, xid) {
            return;
        }
        match self.sockets[h].state() {
            SocketState::Prealloc | SocketState::Opened => self.lazy_or_direct(
                h,
                RequestId::Connect,
                xid,
                PendingRequest::Connect { addr },
                DeferredOp::Connect,
            ),
            other => {
                warn!(?h, state = ?other, "connect refused in this state");
                self.ack(xid, -EINVAL);
            }
        }
    }

    fn on_sendto(
        &mut self,
        xid: Xid,
        usockid: SocketHandle,
        flags: u16,
        addr: Option<SocketAddr>,
        data: Bytes,
    ) {
        let Some(h) = self.lookup(usockid, xid) else {
            return;
        };
        if !self.gate_live(h, xid) {
            return;
        }
        if data.len() > MAX_SEND_LEN {
            return self.ack(xid, -EMSGSIZE);
        }
        let ctx = &self.sockets[h];
        let connected = ctx.state() == SocketState::Connected;
        if ctx.is_stream() {
            if !connected {
                return self.ack(xid, -ENOTCONN);
            }
        } else {
            if !connected && ctx.state() != SocketState::Opened {
                return self.ack(xid, -ENOTCONN);
            }
            if !connected && addr.is_none() {
                return self.ack(xid, -EDESTADDRREQ);
            }
        }
        let Some(altsockid) = ctx.altsockid else {
            return self.ack(xid, -EBADF);
        };
        let Some(mut c) = self.pool.alloc() else {
            return self.ack(xid, -EAGAIN);
        };
        let len = data.len() as u32;
        c.owner = Some(h);
        c.xid = Some(xid);
        c.cmd = ApiId::SendTo;
        c.args = CommandArgs::SendTo {
            altsockid,
            flags,
            addr,
            data,
        };
        c.continuation = Some(Continuation::SendTo { len });
        self.sockets[h].begin(RequestId::SendTo, xid, PendingRequest::SendTo { len });
        self.send_container(c);
    }

    fn on_recvfrom(&mut self, xid: Xid, usockid: SocketHandle, flags: u16, max_buflen: u32) {
        let Some(h) = self.lookup(usockid, xid) else {
            return;
        };
        if !self.gate_live(h, xid) {
            return;
        }
        let ctx = &self.sockets[h];
        let live = matches!(
            ctx.state(),
            SocketState::Opened | SocketState::Connected
        );
        if ctx.is_stream() && ctx.state() != SocketState::Connected {
            return self.ack(xid, -ENOTCONN);
        }
        if !live {
            return self.ack(xid, -ENOTCONN);
        }
        let Some(altsockid) = ctx.altsockid else {
            return self.ack(xid, -EBADF);
        };
        let Some(mut c) = self.pool.alloc() else {
            return self.ack(xid, -EAGAIN);
        };
        let max_buflen = max_buflen.min(MAX_SEND_LEN as u32);
        c.owner = Some(h);
        c.xid = Some(xid);
        c.cmd = ApiId::RecvFrom;
        c.args = CommandArgs::RecvFrom {
            altsockid,
            flags,
            max_buflen,
        };
        c.continuation = Some(Continuation::RecvFrom);
        self.sockets[h].begin(
            RequestId::RecvFrom,
            xid,
            PendingRequest::RecvFrom { max_buflen },
        );
        self.send_container(c);
    }

    fn on_setsockopt(
        &mut self,
        xid: Xid,
        usockid: SocketHandle,
        level: i32,
        option: i32,
        value: Bytes,
    ) {
        let Some(h) = self.lookup(usockid, xid) else {
            return;
        };
        if !self.gate_live(h, xid) {
            return;
        }
        if value.len() > MAX_SOCKOPT_VALLEN {
            return self.ack(xid, -EINVAL);
        }
        match self.sockets[h].state() {
            SocketState::Prealloc | SocketState::Opened | SocketState::Connected => self
                .lazy_or_direct(
                    h,
                    RequestId::SetSockOpt,
                    xid,
                    PendingRequest::SetSockOpt {
                        level,
                        option,
                        value,
                    },
                    DeferredOp::SetSockOpt,
                ),
            _ => self.ack(xid, -EINVAL),
        }
    }

    fn on_getsockopt(
        &mut self,
        xid: Xid,
        usockid: SocketHandle,
        level: i32,
        option: i32,
        max_vallen: u16,
    ) {
        let Some(h) = self.lookup(usockid, xid) else {
            return;
        };
        // WaitConn is deliberately not gated out: an SO_ERROR read is how a
        // parked nonblocking connect resolves.
        match self.sockets[h].state() {
            SocketState::Aborted => return self.ack(xid, -ECONNABORTED),
            s if s.is_closed() => return self.ack(xid, -EBADF),
            _ => {}
        }
        if self.sockets[h].busy() {
            return self.ack(xid, -EAGAIN);
        }
        if max_vallen as usize > MAX_SOCKOPT_VALLEN {
            return self.ack(xid, -EINVAL);
        }
        let so_error_probe = level == SOL_SOCKET && option == SO_ERROR;
        match self.sockets[h].state() {
            SocketState::Prealloc
            | SocketState::Opened
            | SocketState::WaitConn
            | SocketState::Connected => self.lazy_or_direct(
                h,
                RequestId::GetSockOpt,
                xid,
                PendingRequest::GetSockOpt {
                    level,
                    option,
                    max_vallen,
                },
                DeferredOp::GetSockOpt { so_error_probe },
            ),
            _ => self.ack(xid, -EINVAL),
        }
    }

    fn on_name(&mut self, xid: Xid, usockid: SocketHandle, peer: bool) {
        let Some(h) = self.lookup(usockid, xid) else {
            return;
        };
        if !self.gate_live(h, xid) {
            return;
        }
        let state = self.sockets[h].state();
        if peer && state != SocketState::Connected {
            return self.ack(xid, -ENOTCONN);
        }
        match state {
            SocketState::Prealloc
            | SocketState::Opened
            | SocketState::WaitConn
            | SocketState::Connected => self.lazy_or_direct(
                h,
                if peer {
                    RequestId::GetPeerName
                } else {
                    RequestId::GetSockName
                },
                xid,
                PendingRequest::Name { peer },
                DeferredOp::Name { peer },
            ),
            _ => self.ack(xid, -EINVAL),
        }
    }

    fn on_bind(&mut self, xid: Xid, usockid: SocketHandle, addr: SocketAddr) {
        let Some(h) = self.lookup(usockid, xid) else {
            return;
        };
        if !self.gate_live(h, xid) {
            return;
        }
        match self.sockets[h].state() {
            SocketState::Prealloc | SocketState::Opened => self.lazy_or_direct(
                h,
                RequestId::Bind,
                xid,
                PendingRequest::Bind { addr },
                DeferredOp::Bind,
            ),
            _ => self.ack(xid, -EINVAL),
        }
    }

    fn on_listen(&mut self, xid: Xid, usockid: SocketHandle, backlog: u16) {
        let Some(h) = self.lookup(usockid, xid) else {
            return;
        };
        if !self.gate_live(h, xid) {
            return;
        }
        if !self.sockets[h].is_stream() {
            return self.ack(xid, -EOPNOTSUPP);
        }
        match self.sockets[h].state() {
            SocketState::Prealloc | SocketState::Opened => self.lazy_or_direct(
                h,
                RequestId::Listen,
                xid,
                PendingRequest::Listen { backlog },
                DeferredOp::Listen,
            ),
            _ => self.ack(xid, -EINVAL),
        }
    }

    fn on_accept(&mut self, xid: Xid, usockid: SocketHandle) {
        let Some(h) = self.lookup(usockid, xid) else {
            return;
        };
        if !self.gate_live(h, xid) {
            return;
        }
        let ctx = &self.sockets[h];
        if !ctx.is_stream() || !ctx.listening {
            return self.ack(xid, -EINVAL);
        }
        let Some(altsockid) = ctx.altsockid else {
            return self.ack(xid, -EINVAL);
        };
        let Some(mut c) = self.pool.alloc() else {
            return self.ack(xid, -EAGAIN);
        };
        c.owner = Some(h);
        c.xid = Some(xid);
        c.cmd = ApiId::Accept;
        c.args = CommandArgs::Sock { altsockid };
        c.continuation = Some(Continuation::Accept);
        self.sockets[h].begin(RequestId::Accept, xid, PendingRequest::None);
        self.send_container(c);
    }

    fn on_shutdown(&mut self, xid: Xid, usockid: SocketHandle, how: ShutdownHow) {
        let Some(h) = self.lookup(usockid, xid) else {
            return;
        };
        if !self.sockets[h].is_stream() {
            return self.ack(xid, -EOPNOTSUPP);
        }
        let state = self.sockets[h].state();
        // A dead or dying socket has nothing left to shut down
        if state.is_closed() || state == SocketState::Aborted {
            return self.ack(xid, 0);
        }
        if self.sockets[h].busy() {
            return self.ack(xid, -EAGAIN);
        }
        let Some(altsockid) = self.sockets[h].altsockid else {
            return self.ack(xid, 0);
        };
        let Some(mut c) = self.pool.alloc() else {
            return self.ack(xid, -EAGAIN);
        };
        c.owner = Some(h);
        c.xid = Some(xid);
        c.cmd = ApiId::Shutdown;
        c.args = CommandArgs::Shutdown { altsockid, how };
        c.continuation = Some(Continuation::Shutdown);
        self.sockets[h].begin(RequestId::Shutdown, xid, PendingRequest::Shutdown { how });
        self.send_container(c);
    }

    /// Issue `op` now if the modem socket exists, or chain it behind a lazy
    /// socket-open when the context is still `Prealloc`
    fn lazy_or_direct(
        &mut self,
        h: SocketHandle,
        id: RequestId,
        xid: Xid,
        pending: PendingRequest,
        op: DeferredOp,
    ) {
        let Some(mut c) = self.pool.alloc() else {
            return self.ack(xid, -EAGAIN);
        };
        c.owner = Some(h);
        c.xid = Some(xid);
        self.sockets[h].begin(id, xid, pending);
        if self.sockets[h].state() == SocketState::Prealloc {
            let ctx = &self.sockets[h];
            debug!(?h, ?op, "lazy modem socket open");
            c.cmd = ApiId::SocketNew;
            c.args = CommandArgs::SocketNew {
                domain: ctx.domain,
                ty: ctx.ty,
                protocol: ctx.protocol,
            };
            c.continuation = Some(Continuation::SocketOpen { deferred: Some(op) });
            self.sockets[h].set_state(SocketState::Open);
            self.send_container(c);
        } else {
            match self.resume_deferred(h, op, &mut c) {
                Disposition::SwallowReissued => {
                    self.send_container(c);
                }
                Disposition::Ack(reply) => {
                    self.replies.push_back(reply);
                    self.pool.free(c);
                }
                _ => self.pool.free(c),
            }
        }
    }

    fn on_ioctl(&mut self, xid: Xid, req: IoctlRequest) {
        match req {
            IoctlRequest::GetVersion => {
                if self.modem.power < PowerState::On {
                    return self.ack(xid, -ENETDOWN);
                }
                self.issue_global(xid, ApiId::GetVersion, CommandArgs::None, Continuation::GetVersion);
            }
            IoctlRequest::IfStatus => {
                let up = self.modem.power == PowerState::RadioOn;
                self.reply_data(xid, 0, AckData::IfUp(up));
            }
            IoctlRequest::Event(ctl) => self.on_event_ctl(xid, ctl),
            IoctlRequest::Power(p) => self.on_power(xid, p),
            IoctlRequest::FwUpdate(f) => self.on_fw_update(xid, f),
            IoctlRequest::Lwm2m(l) => self.on_lwm2m(xid, l),
            IoctlRequest::Vendor(v) => self.on_vendor(xid, v),
        }
    }

    fn on_event_ctl(&mut self, xid: Xid, ctl: EventCtl) {
        if self.modem.power < PowerState::On {
            return self.ack(xid, -ENETDOWN);
        }
        self.modem.subscribed_reports = ctl.events;
        if ctl.events & EventCtl::SMS != 0 {
            self.arm_report();
        }
        // Unsubscribing leaves an armed report container in flight; its
        // reports are simply dropped by the session.
        self.ack(xid, 0);
    }

    fn on_power(&mut self, xid: Xid, p: PowerRequest) {
        match p {
            PowerRequest::On => {
                if self.modem.power != PowerState::Off {
                    return self.ack(xid, -EALREADY);
                }
                self.device.power_control(PowerCmd::On);
                self.modem.power = PowerState::BeforeOn;
                match self.run_bootstrap() {
                    Ok(()) => {
                        self.modem.power = PowerState::On;
                        debug!("modem powered on, bootstrap complete");
                        self.ack(xid, 0);
                    }
                    Err(e) => {
                        warn!(error = %e, "modem bootstrap failed");
                        self.ack(xid, -EIO);
                    }
                }
            }
            PowerRequest::Off => {
                if self.modem.power == PowerState::Off {
                    return self.ack(xid, -EALREADY);
                }
                self.device.power_control(PowerCmd::Off);
                self.abort_sockets();
                // Nothing in flight can complete once the rail is down; the
                // armed select/report containers come back here too.
                let stranded = self.device.drain();
                self.pool.free_all(stranded);
                self.modem.on_reset();
                self.modem.power = PowerState::Off;
                self.select_armed = false;
                self.report_armed = false;
                self.ack(xid, 0);
            }
            PowerRequest::RadioOn => {
                if self.modem.power != PowerState::On {
                    return self.ack(xid, -EBUSY);
                }
                self.issue_global(xid, ApiId::RadioOn, CommandArgs::None, Continuation::RadioOn);
            }
            PowerRequest::RadioOff => {
                if self.modem.power != PowerState::RadioOn {
                    return self.ack(xid, -EBUSY);
                }
                self.issue_global(xid, ApiId::RadioOff, CommandArgs::None, Continuation::RadioOff);
            }
            PowerRequest::Reset => {
                if self.modem.power == PowerState::Off {
                    return self.ack(xid, -ENETDOWN);
                }
                // The reset event arrives through the channel and triggers
                // the usual abort-and-bootstrap path.
                self.device.reset();
                self.ack(xid, 0);
            }
            PowerRequest::Resume => {
                if self.modem.power != PowerState::Off {
                    return self.ack(xid, -EALREADY);
                }
                // Wake from hibernation: the modem restores its own state, so
                // the bootstrap negotiation is skipped. The API stays gated
                // until the modem confirms.
                self.device.power_control(PowerCmd::On);
                self.modem.power = PowerState::On;
                self.modem.api_enabled = false;
                self.issue_global(xid, ApiId::Resume, CommandArgs::None, Continuation::Resume);
            }
        }
    }

    fn on_fw_update(&mut self, xid: Xid, f: FwUpdateRequest) {
        if self.modem.power < PowerState::On {
            return self.ack(xid, -ENETDOWN);
        }
        match f {
            FwUpdateRequest::InjectHeader(data) => {
                if data.is_empty() {
                    return self.ack(xid, -EINVAL);
                }
                if self.modem.fw.header.is_some() {
                    return self.ack(xid, -EPERM);
                }
                if !self.modem.fw.header_fits(data.len()) {
                    return self.ack(xid, -EINVAL);
                }
                self.issue_global(
                    xid,
                    ApiId::FwInjectHeader,
                    CommandArgs::FwChunk { data: data.clone() },
                    Continuation::FwInjectHeader { data },
                );
            }
            FwUpdateRequest::InjectBody(data) => {
                if data.is_empty() {
                    return self.ack(xid, -EINVAL);
                }
                if self.modem.fw.header.is_none() {
                    return self.ack(xid, -EPERM);
                }
                let len = data.len() as u32;
                if !self.modem.fw.body_fits(len) {
                    return self.ack(xid, -EINVAL);
                }
                self.issue_global(
                    xid,
                    ApiId::FwInjectBody,
                    CommandArgs::FwChunk { data },
                    Continuation::FwInjectBody { len },
                );
            }
            FwUpdateRequest::GetInjected => {
                self.issue_global(
                    xid,
                    ApiId::FwGetInjected,
                    CommandArgs::None,
                    Continuation::FwGetInjected,
                );
            }
            FwUpdateRequest::Execute => {
                if !self.modem.fw.complete() {
                    return self.ack(xid, -EPERM);
                }
                self.issue_global(xid, ApiId::FwExecute, CommandArgs::None, Continuation::FwExecute);
            }
        }
    }

    fn on_lwm2m(&mut self, xid: Xid, l: Lwm2mRequest) {
        match l {
            Lwm2mRequest::IsSupported => {
                // Support is derived from the version string; unknown until a
                // version query has completed.
                if self.modem.version.is_none() {
                    return self.ack(xid, -EAGAIN);
                }
                self.reply_data(xid, 0, AckData::Supported(self.modem.lwm2m_supported));
            }
            Lwm2mRequest::Enable(enable) => {
                if !self.modem.lwm2m_supported {
                    return self.ack(xid, -EOPNOTSUPP);
                }
                self.issue_global(
                    xid,
                    ApiId::Lwm2mEnable,
                    CommandArgs::Enable { enable },
                    Continuation::Lwm2mEnable,
                );
            }
        }
    }

    fn on_vendor(&mut self, xid: Xid, v: VendorRequest) {
        match v {
            VendorRequest::Sms(s) => self.on_sms(xid, s),
            VendorRequest::Raw { cmd, data } => {
                if data.len() > MAX_SEND_LEN {
                    return self.ack(xid, -EMSGSIZE);
                }
                self.issue_global(
                    xid,
                    ApiId::VendorCmd,
                    CommandArgs::Vendor { cmd, data },
                    Continuation::Vendor,
                );
            }
        }
    }

    fn on_sms(&mut self, xid: Xid, s: SmsRequest) {
        use crate::sms::SmsState;
        match s {
            SmsRequest::Init => {
                if self.modem.power != PowerState::RadioOn {
                    return self.ack(xid, -ENETDOWN);
                }
                if self.modem.sms.state() != SmsState::Uninit {
                    return self.ack(xid, -EALREADY);
                }
                self.issue_global(
                    xid,
                    ApiId::SmsInit,
                    CommandArgs::None,
                    Continuation::SmsInit { reopen: false },
                );
            }
            SmsRequest::Fin => {
                if self.modem.sms.state() == SmsState::Uninit {
                    return self.ack(xid, -EOPNOTSUPP);
                }
                self.issue_global(
                    xid,
                    ApiId::SmsFin,
                    CommandArgs::None,
                    Continuation::SmsFin { reinit: false },
                );
            }
            SmsRequest::Read => match self.modem.sms.read() {
                Err(e) => self.ack(xid, e),
                Ok(data) => {
                    // Flush the modem's assembly buffer before the next
                    // message; the read itself is answered right away.
                    self.flush_sms_reopen();
                    let result = data.len() as i32;
                    self.reply_data(xid, result, AckData::Sms(data));
                }
            },
            SmsRequest::Delete { index } => {
                if self.modem.sms.state() == SmsState::Uninit {
                    return self.ack(xid, -EOPNOTSUPP);
                }
                self.issue_global(
                    xid,
                    ApiId::SmsDelete,
                    CommandArgs::SmsDelete { index },
                    Continuation::SmsDelete { index },
                );
            }
        }
    }

    /// Issue the fin half of the SMS reopen exchange, deferring to a later
    /// event drain when no container is free
    pub(crate) fn flush_sms_reopen(&mut self) {
        let Some(mut c) = self.pool.alloc() else {
            warn!("no container for SMS session reopen, deferring");
            self.modem.sms_reopen_pending = true;
            return;
        };
        self.modem.sms_reopen_pending = false;
        c.cmd = ApiId::SmsFin;
        c.args = CommandArgs::None;
        c.continuation = Some(Continuation::SmsFin { reinit: true });
        self.send_container(c);
    }

    /// Send a socket-independent command, acking `-EAGAIN` on pool exhaustion
    fn issue_global(&mut self, xid: Xid, cmd: ApiId, args: CommandArgs, cont: Continuation) {
        let Some(mut c) = self.pool.alloc() else {
            return self.ack(xid, -EAGAIN);
        };
        c.xid = Some(xid);
        c.cmd = cmd;
        c.args = args;
        c.continuation = Some(cont);
        self.send_container(c);
    }
}
