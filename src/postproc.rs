//! Postprocessor chain: continuations invoked when a container's reply lands
//!
//! A continuation is a tagged enum variant capturing the next-step parameters,
//! dispatched through the single [`Bridge::advance`] match. Several handlers
//! chain: on success they refill the same container with the next command of a
//! fixed sequence and return a `*Reissued` disposition, so the container stays
//! alive across the chain and only the terminal handler produces the
//! user-visible ack.

use bytes::Bytes;
use tracing::{debug, trace, warn};

use crate::bridge::{Bridge, SocketHandle};
use crate::command::{ApiId, CommandArgs, CommandReply, FCNTL_SETFL, O_NONBLOCK};
use crate::container::Container;
use crate::device::DeviceChannel;
use crate::modem::PowerState;
use crate::sms::SmsAdvance;
use crate::socket::{PendingRequest, SocketContext, SocketState};
use crate::usrsock::errno::*;
use crate::usrsock::{AckData, Reply, SocketEvents, Xid};

/// Combine a modem result with its paired errno
///
/// Every postprocessor reading a result/errno pair goes through here: a
/// negative result means the errno carries the real failure.
pub(crate) fn combine(result: i32, errcode: i32) -> i32 {
    if result < 0 {
        -errcode
    } else {
        result
    }
}

/// The operation parked behind a lazy modem-socket open
///
/// Parameters live in the owning context's pending-request slot; the tag
/// only selects which composer to resume once the socket is `Opened`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DeferredOp {
    Connect,
    Bind,
    Listen,
    SetSockOpt,
    GetSockOpt { so_error_probe: bool },
    Name { peer: bool },
}

/// Continuation slot carried by every container
#[derive(Debug, Clone)]
pub(crate) enum Continuation {
    SocketOpen { deferred: Option<DeferredOp> },
    SetNonblock { deferred: Option<DeferredOp> },
    Connect,
    SendTo { len: u32 },
    RecvFrom,
    SetSockOpt,
    GetSockOpt { so_error_probe: bool },
    SockName { peer: bool },
    Bind,
    Listen,
    Accept,
    Shutdown,
    CloseSock,
    RadioOn,
    ReportNetinfo,
    ActivatePdn,
    RadioOff,
    GetVersion,
    Lwm2mEnable,
    Vendor,
    Select,
    SmsReport,
    SmsInit { reopen: bool },
    SmsFin { reinit: bool },
    SmsDelete { index: u16 },
    FwInjectHeader { data: Bytes },
    FwInjectBody { len: u32 },
    FwGetInjected,
    FwExecute,
    Resume,
}

/// What the caller must do with the container and the original request
#[derive(Debug)]
pub(crate) enum Disposition {
    /// Emit the reply, free the container
    Ack(Reply),
    /// Emit the reply; the container was refilled for a chained send
    AckReissued(Reply),
    /// No user-visible reply (mid-sequence); free the container
    Swallow,
    /// No reply; the container was refilled for a chained send
    SwallowReissued,
    /// Treat as a modem reset: abort the batch and resynchronize
    NeedsReset,
}

impl<D: DeviceChannel> Bridge<D> {
    /// Run the continuation of one completed container
    pub(crate) fn advance(&mut self, c: &mut Container) -> Disposition {
        let Some(cont) = c.continuation.take() else {
            warn!(api = ?c.api(), "completed container without continuation");
            return Disposition::Swallow;
        };
        let Some(reply) = c.take_reply() else {
            // A container handed back with no reply is invalidated in-flight
            // work; only a reset produces that.
            warn!(api = ?c.api(), "completed container without reply");
            return Disposition::NeedsReset;
        };

        // Results for sockets torn down while the command was in flight are
        // discarded; only the close command itself may still complete.
        if let Some(h) = c.owner {
            match self.sockets.get(h.0) {
                None => {
                    trace!(?h, "reply for a vanished socket");
                    return Disposition::Swallow;
                }
                Some(ctx)
                    if ctx.state().is_closed() && !matches!(cont, Continuation::CloseSock) =>
                {
                    trace!(?h, "discarding reply for a closing socket");
                    return Disposition::Swallow;
                }
                _ => {}
            }
        }

        match cont {
            Continuation::SocketOpen { deferred } => self.on_socket_open(c, reply, deferred),
            Continuation::SetNonblock { deferred } => self.on_set_nonblock(c, reply, deferred),
            Continuation::Connect => self.on_connect_reply(c, reply),
            Continuation::SendTo { len } => self.on_sendto_reply(c, reply, len),
            Continuation::RecvFrom => self.on_recvfrom_reply(c, reply),
            Continuation::SetSockOpt => self.ack_combined(c, reply),
            Continuation::GetSockOpt { so_error_probe } => {
                self.on_getsockopt_reply(c, reply, so_error_probe)
            }
            Continuation::SockName { peer } => self.on_sockname_reply(c, reply, peer),
            Continuation::Bind => self.ack_combined(c, reply),
            Continuation::Listen => self.on_listen_reply(c, reply),
            Continuation::Accept => self.on_accept_reply(c, reply),
            Continuation::Shutdown => self.ack_combined(c, reply),
            Continuation::CloseSock => self.on_close_reply(c, reply),
            Continuation::RadioOn => self.on_radio_on_reply(c, reply),
            Continuation::ReportNetinfo => self.on_report_netinfo_reply(c, reply),
            Continuation::ActivatePdn => self.on_activate_pdn_reply(c, reply),
            Continuation::RadioOff => self.on_radio_off_reply(c, reply),
            Continuation::GetVersion => self.on_version_reply(c, reply),
            Continuation::Lwm2mEnable => self.ack_combined(c, reply),
            Continuation::Vendor => self.ack_combined(c, reply),
            Continuation::Select => self.on_select_reply(c, reply),
            Continuation::SmsReport => self.on_sms_report(c, reply),
            Continuation::SmsInit { reopen } => self.on_sms_init_reply(c, reply, reopen),
            Continuation::SmsFin { reinit } => self.on_sms_fin_reply(c, reply, reinit),
            Continuation::SmsDelete { index } => self.on_sms_delete_reply(c, reply, index),
            Continuation::FwInjectHeader { data } => self.on_fw_header_reply(c, reply, data),
            Continuation::FwInjectBody { len } => self.on_fw_body_reply(c, reply, len),
            Continuation::FwGetInjected => self.on_fw_injected_reply(c, reply),
            Continuation::FwExecute => self.on_fw_execute_reply(c, reply),
            Continuation::Resume => self.on_resume_reply(c, reply),
        }
    }

    /// Terminal handler for commands that only need the combine rule
    fn ack_combined(&mut self, c: &Container, reply: CommandReply) -> Disposition {
        let (result, errcode) = reply.result_errcode();
        let combined = combine(result, errcode);
        match self.finish_xid(c) {
            Some(xid) => Disposition::Ack(Reply::Ack {
                xid,
                result: combined,
            }),
            None => Disposition::Swallow,
        }
    }

    /// Release the owner's outstanding-request slot and yield the ack xid
    fn finish_xid(&mut self, c: &Container) -> Option<Xid> {
        match c.owner {
            Some(h) => self.sockets.get_mut(h.0).and_then(SocketContext::finish),
            None => c.xid,
        }
    }

    fn on_socket_open(
        &mut self,
        c: &mut Container,
        reply: CommandReply,
        deferred: Option<DeferredOp>,
    ) -> Disposition {
        let (result, errcode) = reply.result_errcode();
        let combined = combine(result, errcode);
        let Some(h) = c.owner else {
            return Disposition::Swallow;
        };
        if combined < 0 {
            let xid = self.sockets[h].finish().or(c.xid);
            match deferred {
                // Eager open on socket(): the context dies with the failure
                None => self.destroy_socket(h),
                // Lazy open: fall back so a later request may retry
                Some(_) => self.sockets[h].set_state(SocketState::Prealloc),
            }
            return match xid {
                Some(xid) => Disposition::Ack(Reply::Ack {
                    xid,
                    result: combined,
                }),
                None => Disposition::Swallow,
            };
        }
        let altsockid = combined;
        let ctx = &mut self.sockets[h];
        ctx.altsockid = Some(altsockid);
        self.by_altsock.insert(altsockid, h);
        // First live modem socket arms the readiness snapshot loop
        self.arm_select();
        debug!(?h, altsockid, "modem socket open, flagging non-blocking");
        c.cmd = ApiId::Fcntl;
        c.args = CommandArgs::Fcntl {
            altsockid,
            cmd: FCNTL_SETFL,
            flags: O_NONBLOCK,
        };
        c.continuation = Some(Continuation::SetNonblock { deferred });
        Disposition::SwallowReissued
    }

    fn on_set_nonblock(
        &mut self,
        c: &mut Container,
        reply: CommandReply,
        deferred: Option<DeferredOp>,
    ) -> Disposition {
        let (result, errcode) = reply.result_errcode();
        let combined = combine(result, errcode);
        let Some(h) = c.owner else {
            return Disposition::Swallow;
        };
        if combined < 0 {
            let xid = self.sockets[h].finish().or(c.xid);
            // The modem socket is open but unusable; close it out of band
            if let Some(alt) = self.sockets[h].altsockid.take() {
                self.by_altsock.remove(&alt);
                self.close_orphan(alt);
            }
            match deferred {
                None => self.destroy_socket(h),
                Some(_) => self.sockets[h].set_state(SocketState::Prealloc),
            }
            return match xid {
                Some(xid) => Disposition::Ack(Reply::Ack {
                    xid,
                    result: combined,
                }),
                None => Disposition::Swallow,
            };
        }
        self.sockets[h].set_state(SocketState::Opened);
        match deferred {
            None => {
                // Eager open: the socket() request acks with the new id
                let xid = self.sockets[h].finish().or(c.xid);
                match xid {
                    Some(xid) => Disposition::Ack(Reply::Ack {
                        xid,
                        result: h.0 as i32,
                    }),
                    None => Disposition::Swallow,
                }
            }
            Some(op) => self.resume_deferred(h, op, c),
        }
    }

    /// Refill `c` with the composer output for the parked operation
    ///
    /// Also used for the direct (already-open) path, so the per-verb argument
    /// marshalling exists exactly once.
    pub(crate) fn resume_deferred(
        &mut self,
        h: SocketHandle,
        op: DeferredOp,
        c: &mut Container,
    ) -> Disposition {
        let ctx = &mut self.sockets[h];
        let Some(altsockid) = ctx.altsockid else {
            warn!(?h, "deferred op resumed without a modem socket");
            let xid = ctx.finish().or(c.xid);
            return match xid {
                Some(xid) => Disposition::Ack(Reply::Ack { xid, result: -EIO }),
                None => Disposition::Swallow,
            };
        };
        match (op, ctx.pending.clone()) {
            (DeferredOp::Connect, PendingRequest::Connect { addr }) => {
                c.cmd = ApiId::Connect;
                c.args = CommandArgs::Connect { altsockid, addr };
                c.continuation = Some(Continuation::Connect);
                ctx.set_state(SocketState::Connecting);
            }
            (DeferredOp::Bind, PendingRequest::Bind { addr }) => {
                c.cmd = ApiId::Bind;
                c.args = CommandArgs::Bind { altsockid, addr };
                c.continuation = Some(Continuation::Bind);
            }
            (DeferredOp::Listen, PendingRequest::Listen { backlog }) => {
                c.cmd = ApiId::Listen;
                c.args = CommandArgs::Listen { altsockid, backlog };
                c.continuation = Some(Continuation::Listen);
            }
            (DeferredOp::SetSockOpt, PendingRequest::SetSockOpt { level, option, value }) => {
                c.cmd = ApiId::SetSockOpt;
                c.args = CommandArgs::SetSockOpt {
                    altsockid,
                    level,
                    option,
                    value,
                };
                c.continuation = Some(Continuation::SetSockOpt);
            }
            (
                DeferredOp::GetSockOpt { so_error_probe },
                PendingRequest::GetSockOpt {
                    level,
                    option,
                    max_vallen,
                },
            ) => {
                c.cmd = ApiId::GetSockOpt;
                c.args = CommandArgs::GetSockOpt {
                    altsockid,
                    level,
                    option,
                    max_vallen,
                };
                c.continuation = Some(Continuation::GetSockOpt { so_error_probe });
            }
            (DeferredOp::Name { peer }, PendingRequest::Name { .. }) => {
                c.cmd = if peer {
                    ApiId::GetPeerName
                } else {
                    ApiId::GetSockName
                };
                c.args = CommandArgs::Sock { altsockid };
                c.continuation = Some(Continuation::SockName { peer });
            }
            (op, pending) => {
                warn!(?op, ?pending, "deferred op does not match pending request");
                let xid = ctx.finish().or(c.xid);
                return match xid {
                    Some(xid) => Disposition::Ack(Reply::Ack { xid, result: -EIO }),
                    None => Disposition::Swallow,
                };
            }
        }
        Disposition::SwallowReissued
    }

    fn on_connect_reply(&mut self, c: &mut Container, reply: CommandReply) -> Disposition {
        let (result, errcode) = reply.result_errcode();
        let combined = combine(result, errcode);
        let Some(h) = c.owner else {
            return Disposition::Swallow;
        };
        let ctx = &mut self.sockets[h];
        if combined == 0 {
            ctx.set_state(SocketState::Connected);
            ctx.select.insert(SocketEvents::SENDTO_READY);
            let xid = ctx.finish().or(c.xid);
            return match xid {
                Some(xid) => Disposition::Ack(Reply::Ack { xid, result: 0 }),
                None => Disposition::Swallow,
            };
        }
        if combined == -EINPROGRESS {
            // Nonblocking connect still resolving: park the xid; completion
            // is polled through a SO_ERROR read.
            ctx.set_state(SocketState::WaitConn);
            ctx.wait_conn_xid = ctx.finish().or(c.xid);
            debug!(?h, "connect pending, parked for SO_ERROR poll");
            return Disposition::Swallow;
        }
        ctx.set_state(SocketState::Opened);
        let xid = ctx.finish().or(c.xid);
        match xid {
            Some(xid) => Disposition::Ack(Reply::Ack {
                xid,
                result: combined,
            }),
            None => Disposition::Swallow,
        }
    }

    fn on_sendto_reply(&mut self, c: &Container, reply: CommandReply, len: u32) -> Disposition {
        let (result, errcode) = reply.result_errcode();
        let combined = combine(result, errcode);
        if combined >= 0 && combined as u32 != len {
            trace!(sent = combined, requested = len, "short send");
        }
        self.ack_plain(c, combined)
    }

    fn on_recvfrom_reply(&mut self, c: &Container, reply: CommandReply) -> Disposition {
        let CommandReply::Recv {
            result,
            errcode,
            addr,
            data,
        } = reply
        else {
            return self.wrong_shape(c);
        };
        let combined = combine(result, errcode);
        if let Some(h) = c.owner {
            if let Some(ctx) = self.sockets.get_mut(h.0) {
                // Consume readiness; the next select snapshot re-arms it
                ctx.select.remove(SocketEvents::RECVFROM_AVAIL);
                if combined == 0 && ctx.is_stream() {
                    ctx.select.insert(SocketEvents::REMOTE_CLOSED);
                }
            }
        }
        let Some(xid) = self.finish_xid(c) else {
            return Disposition::Swallow;
        };
        if combined < 0 {
            return Disposition::Ack(Reply::Ack {
                xid,
                result: combined,
            });
        }
        Disposition::Ack(Reply::DataAck {
            xid,
            result: combined,
            data: AckData::AddrData { addr, data },
        })
    }

    fn on_getsockopt_reply(
        &mut self,
        c: &Container,
        reply: CommandReply,
        so_error_probe: bool,
    ) -> Disposition {
        let CommandReply::OptValue {
            result,
            errcode,
            value,
        } = reply
        else {
            return self.wrong_shape(c);
        };
        let combined = combine(result, errcode);
        if so_error_probe && combined >= 0 {
            if let Some(h) = c.owner {
                self.resolve_wait_conn(h, &value);
            }
        }
        let Some(xid) = self.finish_xid(c) else {
            return Disposition::Swallow;
        };
        if combined < 0 {
            return Disposition::Ack(Reply::Ack {
                xid,
                result: combined,
            });
        }
        Disposition::Ack(Reply::DataAck {
            xid,
            result: combined,
            data: AckData::Opt(value),
        })
    }

    /// A successful SO_ERROR read resolves a parked nonblocking connect
    fn resolve_wait_conn(&mut self, h: SocketHandle, value: &Bytes) {
        let ctx = &mut self.sockets[h];
        if ctx.state() != SocketState::WaitConn {
            return;
        }
        let pending_err = match value.as_ref().try_into() {
            Ok(raw) => i32::from_le_bytes(raw),
            Err(_) => return,
        };
        let Some(cxid) = ctx.wait_conn_xid.take() else {
            return;
        };
        if pending_err == 0 {
            ctx.set_state(SocketState::Connected);
            ctx.select.insert(SocketEvents::SENDTO_READY);
            debug!(?h, "parked connect resolved");
            self.replies.push_back(Reply::Ack {
                xid: cxid,
                result: 0,
            });
        } else {
            ctx.set_state(SocketState::Opened);
            debug!(?h, err = pending_err, "parked connect failed");
            self.replies.push_back(Reply::Ack {
                xid: cxid,
                result: -pending_err,
            });
        }
    }

    fn on_sockname_reply(&mut self, c: &Container, reply: CommandReply, peer: bool) -> Disposition {
        let CommandReply::SockName {
            result,
            errcode,
            addr,
        } = reply
        else {
            return self.wrong_shape(c);
        };
        let _ = peer;
        let combined = combine(result, errcode);
        let Some(xid) = self.finish_xid(c) else {
            return Disposition::Swallow;
        };
        match (combined, addr) {
            (r, _) if r < 0 => Disposition::Ack(Reply::Ack { xid, result: r }),
            (r, Some(addr)) => Disposition::Ack(Reply::DataAck {
                xid,
                result: r,
                data: AckData::Addr(addr),
            }),
            (_, None) => Disposition::Ack(Reply::Ack { xid, result: -EIO }),
        }
    }

    fn on_listen_reply(&mut self, c: &Container, reply: CommandReply) -> Disposition {
        let (result, errcode) = reply.result_errcode();
        let combined = combine(result, errcode);
        if combined >= 0 {
            if let Some(h) = c.owner {
                if let Some(ctx) = self.sockets.get_mut(h.0) {
                    ctx.listening = true;
                }
            }
        }
        self.ack_plain(c, combined)
    }

    fn on_accept_reply(&mut self, c: &Container, reply: CommandReply) -> Disposition {
        let CommandReply::SockName {
            result,
            errcode,
            addr,
        } = reply
        else {
            return self.wrong_shape(c);
        };
        let combined = combine(result, errcode);
        let Some(h) = c.owner else {
            return Disposition::Swallow;
        };
        if combined < 0 {
            return self.ack_plain(c, combined);
        }
        let new_alt = combined;
        if self.sockets.len() >= self.max_sockets {
            // No table slot for the accepted connection: close the modem-side
            // socket so it does not leak, then refuse.
            warn!(new_alt, "socket table full, dropping accepted connection");
            self.close_orphan(new_alt);
            return self.ack_plain(c, -ENOBUFS);
        }
        let (domain, ty, protocol) = {
            let parent = &self.sockets[h];
            (parent.domain, parent.ty, parent.protocol)
        };
        let mut accepted = SocketContext::accepted(domain, ty, protocol, new_alt);
        accepted.select.insert(SocketEvents::SENDTO_READY);
        let key = self.sockets.insert(accepted);
        let nh = SocketHandle(key);
        self.by_altsock.insert(new_alt, nh);
        self.arm_select();
        debug!(parent = ?h, ?nh, new_alt, "connection accepted");
        let Some(xid) = self.finish_xid(c) else {
            return Disposition::Swallow;
        };
        let data = match addr {
            Some(addr) => AckData::Addr(addr),
            None => AckData::None,
        };
        Disposition::Ack(Reply::DataAck {
            xid,
            result: nh.0 as i32,
            data,
        })
    }

    fn on_close_reply(&mut self, c: &Container, reply: CommandReply) -> Disposition {
        let (result, errcode) = reply.result_errcode();
        let combined = combine(result, errcode);
        let Some(h) = c.owner else {
            // Orphan cleanup close; nothing to ack
            return Disposition::Swallow;
        };
        let xid = self
            .sockets
            .get_mut(h.0)
            .and_then(SocketContext::finish)
            .or(c.xid);
        self.destroy_socket(h);
        match xid {
            // close acks success even when the modem grumbles; the context
            // is gone either way
            Some(xid) => Disposition::Ack(Reply::Ack {
                xid,
                result: if combined < 0 { combined } else { 0 },
            }),
            None => Disposition::Swallow,
        }
    }

    fn on_radio_on_reply(&mut self, c: &mut Container, reply: CommandReply) -> Disposition {
        let (result, errcode) = reply.result_errcode();
        let combined = combine(result, errcode);
        if combined < 0 {
            return self.ack_plain(c, combined);
        }
        c.cmd = ApiId::ReportNetinfo;
        c.args = CommandArgs::None;
        c.continuation = Some(Continuation::ReportNetinfo);
        Disposition::SwallowReissued
    }

    fn on_report_netinfo_reply(&mut self, c: &mut Container, reply: CommandReply) -> Disposition {
        let (result, errcode) = reply.result_errcode();
        let combined = combine(result, errcode);
        if combined < 0 {
            return self.ack_plain(c, combined);
        }
        c.cmd = ApiId::ActivatePdn;
        c.args = CommandArgs::None;
        c.continuation = Some(Continuation::ActivatePdn);
        Disposition::SwallowReissued
    }

    fn on_activate_pdn_reply(&mut self, c: &Container, reply: CommandReply) -> Disposition {
        let (result, errcode) = reply.result_errcode();
        let combined = combine(result, errcode);
        if combined >= 0 {
            self.modem.power = PowerState::RadioOn;
            debug!("radio on, PDN active");
        }
        self.ack_plain(c, if combined < 0 { combined } else { 0 })
    }

    fn on_radio_off_reply(&mut self, c: &Container, reply: CommandReply) -> Disposition {
        let (result, errcode) = reply.result_errcode();
        let combined = combine(result, errcode);
        if combined >= 0 {
            self.modem.power = PowerState::On;
        }
        self.ack_plain(c, if combined < 0 { combined } else { 0 })
    }

    fn on_version_reply(&mut self, c: &Container, reply: CommandReply) -> Disposition {
        let CommandReply::Version {
            result,
            errcode,
            version,
        } = reply
        else {
            return self.wrong_shape(c);
        };
        let combined = combine(result, errcode);
        if combined < 0 {
            return self.ack_plain(c, combined);
        }
        self.modem.note_version(version.clone());
        let Some(xid) = self.finish_xid(c) else {
            return Disposition::Swallow;
        };
        Disposition::Ack(Reply::DataAck {
            xid,
            result: 0,
            data: AckData::Version(version),
        })
    }

    fn on_select_reply(&mut self, c: &mut Container, reply: CommandReply) -> Disposition {
        let mut last_event = None;
        if let CommandReply::Select {
            result,
            errcode,
            readable,
            writable,
        } = reply
        {
            let combined = combine(result, errcode);
            if combined < 0 {
                warn!(combined, "select snapshot failed, re-arming");
            } else {
                for (key, ctx) in self.sockets.iter_mut() {
                    let Some(alt) = ctx.altsockid else { continue };
                    if !(0..64).contains(&alt) {
                        continue;
                    }
                    let bit = 1u64 << alt;
                    let mut fired = SocketEvents::default();
                    if readable & bit != 0 && !ctx.select.contains(SocketEvents::RECVFROM_AVAIL) {
                        ctx.select.insert(SocketEvents::RECVFROM_AVAIL);
                        fired.insert(SocketEvents::RECVFROM_AVAIL);
                    }
                    if writable & bit != 0 && !ctx.select.contains(SocketEvents::SENDTO_READY) {
                        ctx.select.insert(SocketEvents::SENDTO_READY);
                        fired.insert(SocketEvents::SENDTO_READY);
                    }
                    if !fired.is_empty() {
                        let event = Reply::Event {
                            usockid: SocketHandle(key),
                            events: fired,
                        };
                        if let Some(prev) = last_event.replace(event) {
                            self.replies.push_back(prev);
                        }
                    }
                }
            }
        } else {
            warn!("mismatched reply shape for select");
        }
        let (read_set, write_set) = self.select_masks();
        c.cmd = ApiId::Select;
        c.args = CommandArgs::Select {
            read_set,
            write_set,
        };
        c.continuation = Some(Continuation::Select);
        match last_event {
            Some(event) => Disposition::AckReissued(event),
            None => Disposition::SwallowReissued,
        }
    }

    fn on_sms_report(&mut self, c: &mut Container, reply: CommandReply) -> Disposition {
        if let CommandReply::SmsReport(rep) = reply {
            match self.modem.sms.on_report(&rep) {
                SmsAdvance::Desync => {
                    warn!(index = rep.index, "SMS size desync, forcing reset");
                    return Disposition::NeedsReset;
                }
                SmsAdvance::Ready => {
                    trace!(index = rep.index, "SMS message assembled");
                }
                SmsAdvance::Pending | SmsAdvance::Ignored => {}
            }
        } else {
            warn!("mismatched reply shape for SMS report");
        }
        c.cmd = ApiId::SmsReportRecv;
        c.args = CommandArgs::None;
        c.continuation = Some(Continuation::SmsReport);
        Disposition::SwallowReissued
    }

    fn on_sms_init_reply(&mut self, c: &Container, reply: CommandReply, reopen: bool) -> Disposition {
        let (result, errcode) = reply.result_errcode();
        let combined = combine(result, errcode);
        if combined < 0 {
            if reopen {
                warn!(combined, "SMS reinit failed, dropping session");
                self.modem.sms.reset();
                return Disposition::Swallow;
            }
            return self.ack_plain(c, combined);
        }
        self.modem.sms.init_done();
        if reopen {
            // Internal flush exchange; the read was already acked
            return Disposition::Swallow;
        }
        self.ack_plain(c, 0)
    }

    fn on_sms_fin_reply(&mut self, c: &mut Container, reply: CommandReply, reinit: bool) -> Disposition {
        let (result, errcode) = reply.result_errcode();
        let combined = combine(result, errcode);
        if combined < 0 {
            if reinit {
                warn!(combined, "SMS finalize failed mid-reopen, dropping session");
                self.modem.sms.reset();
                return Disposition::Swallow;
            }
            return self.ack_plain(c, combined);
        }
        if reinit {
            c.cmd = ApiId::SmsInit;
            c.args = CommandArgs::None;
            c.continuation = Some(Continuation::SmsInit { reopen: true });
            return Disposition::SwallowReissued;
        }
        self.modem.sms.fin_done();
        self.ack_plain(c, 0)
    }

    fn on_sms_delete_reply(&mut self, c: &Container, reply: CommandReply, index: u16) -> Disposition {
        let (result, errcode) = reply.result_errcode();
        let combined = combine(result, errcode);
        if combined >= 0 {
            self.modem.sms.delete_index(index);
        }
        self.ack_plain(c, combined)
    }

    fn on_fw_header_reply(&mut self, c: &Container, reply: CommandReply, data: Bytes) -> Disposition {
        let (result, errcode) = reply.result_errcode();
        let combined = combine(result, errcode);
        if combined < 0 {
            return self.ack_plain(c, combined);
        }
        let written = data.len() as i32;
        match self.modem.fw.inject_header(&data) {
            Ok(_) => self.ack_plain(c, written),
            Err(e) => self.ack_plain(c, e),
        }
    }

    fn on_fw_body_reply(&mut self, c: &Container, reply: CommandReply, len: u32) -> Disposition {
        let (result, errcode) = reply.result_errcode();
        let combined = combine(result, errcode);
        if combined < 0 {
            return self.ack_plain(c, combined);
        }
        match self.modem.fw.inject_body(len) {
            Ok(()) => self.ack_plain(c, len as i32),
            Err(e) => self.ack_plain(c, e),
        }
    }

    fn on_fw_injected_reply(&mut self, c: &Container, reply: CommandReply) -> Disposition {
        let CommandReply::Injected {
            result,
            errcode,
            injected,
        } = reply
        else {
            return self.wrong_shape(c);
        };
        let combined = combine(result, errcode);
        if combined < 0 {
            return self.ack_plain(c, combined);
        }
        if !self.modem.fw.verify_injected(injected) {
            // Our count and the modem's disagree. There is no way to resync
            // the stream; abort the update and power-cycle.
            warn!(
                ours = self.modem.fw.total_injected(),
                theirs = injected,
                "fw injection count desync"
            );
            if let Some(xid) = self.finish_xid(c) {
                self.replies.push_back(Reply::Ack { xid, result: -EIO });
            }
            return Disposition::NeedsReset;
        }
        let Some(xid) = self.finish_xid(c) else {
            return Disposition::Swallow;
        };
        Disposition::Ack(Reply::DataAck {
            xid,
            result: 0,
            data: AckData::Injected(injected),
        })
    }

    fn on_fw_execute_reply(&mut self, c: &Container, reply: CommandReply) -> Disposition {
        let (result, errcode) = reply.result_errcode();
        let combined = combine(result, errcode);
        if combined >= 0 {
            // The modem reboots into the new image; a reset event follows
            self.modem.fw.reset();
        }
        self.ack_plain(c, if combined < 0 { combined } else { 0 })
    }

    fn on_resume_reply(&mut self, c: &Container, reply: CommandReply) -> Disposition {
        let (result, errcode) = reply.result_errcode();
        let combined = combine(result, errcode);
        if combined >= 0 {
            self.modem.api_enabled = true;
            debug!("hibernation resume complete, API re-enabled");
        } else {
            warn!(combined, "hibernation resume failed");
        }
        self.ack_plain(c, if combined < 0 { combined } else { 0 })
    }

    fn ack_plain(&mut self, c: &Container, result: i32) -> Disposition {
        match self.finish_xid(c) {
            Some(xid) => Disposition::Ack(Reply::Ack { xid, result }),
            None => Disposition::Swallow,
        }
    }

    fn wrong_shape(&mut self, c: &Container) -> Disposition {
        warn!(api = ?c.api(), "mismatched reply shape");
        self.ack_plain(c, -EIO)
    }
}
