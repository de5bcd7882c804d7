//! The bridging engine core
//!
//! [`Bridge`] owns every piece of engine state: the logical socket table, the
//! fixed container pool, the accumulated modem state, and the queue of
//! replies destined for the socket proxy. It performs no I/O; the embedding
//! daemon calls [`Bridge::handle_request`] for each decoded proxy request and
//! [`Bridge::process_events`] whenever the device channel has completions to
//! drain, then ships out everything [`Bridge::poll_reply`] yields.

use std::collections::VecDeque;
use std::ops::{Index, IndexMut};

use rustc_hash::FxHashMap;
use slab::Slab;
use tracing::{debug, trace, warn};

use crate::command::{ApiId, CommandArgs};
use crate::config::{BridgeConfig, ConfigError};
use crate::container::{Container, ContainerPool};
use crate::device::{DeviceChannel, EventSet, SendFailureKind};
use crate::modem::{ModemState, PowerState};
use crate::postproc::{Continuation, Disposition};
use crate::reset_seq::{self, BootstrapError, BootstrapOutcome};
use crate::sms::SmsState;
use crate::socket::{SocketContext, SocketState};
use crate::usrsock::errno::*;
use crate::usrsock::{AckData, EventCtl, Reply, SocketEvents, Xid};

/// Opaque handle naming one logical socket in the table
///
/// This is the `usockid` the socket proxy sees; it stays stable for the life
/// of the socket and is reused only after the context is destroyed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SocketHandle(pub usize);

impl From<SocketHandle> for usize {
    fn from(x: SocketHandle) -> Self {
        x.0
    }
}

impl Index<SocketHandle> for Slab<SocketContext> {
    type Output = SocketContext;
    fn index(&self, h: SocketHandle) -> &SocketContext {
        &self[h.0]
    }
}

impl IndexMut<SocketHandle> for Slab<SocketContext> {
    fn index_mut(&mut self, h: SocketHandle) -> &mut SocketContext {
        &mut self[h.0]
    }
}

/// The usrsock/ALTCOM bridging engine
///
/// Deterministic and single-threaded; all progress happens inside
/// [`handle_request`](Bridge::handle_request) and
/// [`process_events`](Bridge::process_events).
pub struct Bridge<D: DeviceChannel> {
    pub(crate) device: D,
    pub(crate) pool: ContainerPool,
    pub(crate) sockets: Slab<SocketContext>,
    /// Modem-side socket id back to table handle, for readiness snapshots
    pub(crate) by_altsock: FxHashMap<i32, SocketHandle>,
    pub(crate) modem: ModemState,
    pub(crate) replies: VecDeque<Reply>,
    pub(crate) select_armed: bool,
    pub(crate) report_armed: bool,
    pub(crate) max_sockets: usize,
    pub(crate) at_budget: usize,
}

impl<D: DeviceChannel> Bridge<D> {
    /// Create an engine over `device` with the given resource limits
    pub fn new(config: &BridgeConfig, device: D) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            device,
            pool: ContainerPool::new(config.containers),
            sockets: Slab::with_capacity(config.sockets),
            by_altsock: FxHashMap::default(),
            modem: ModemState::new(),
            replies: VecDeque::new(),
            select_armed: false,
            report_armed: false,
            max_sockets: config.sockets,
            at_budget: config.at_budget,
        })
    }

    /// Dequeue the next reply bound for the socket proxy
    pub fn poll_reply(&mut self) -> Option<Reply> {
        self.replies.pop_front()
    }

    /// Drain one batch of completions from the device channel
    ///
    /// Blocks in the channel's `get_event` the same way the embedding event
    /// loop does. A reset event aborts every socket and re-runs the bootstrap
    /// negotiation before returning.
    pub fn process_events(&mut self) {
        let (events, batch) = self.device.get_event();
        trace!(?events, batch = batch.len(), "device events");
        if events.contains(EventSet::RESET) {
            // The batch is invalidated in-flight work, not completions
            self.pool.free_all(batch);
            self.handle_reset();
            return;
        }
        let mut needs_reset = false;
        for c in batch {
            if needs_reset {
                self.pool.free(c);
                continue;
            }
            needs_reset = self.process_container(c);
        }
        if needs_reset {
            // The channel delivers the actual reset event (with the remaining
            // in-flight batch) on a later get_event.
            self.device.reset();
        } else if self.modem.sms_reopen_pending {
            // The batch freed containers; retry the deferred reopen flush
            self.flush_sms_reopen();
        }
    }

    /// Run one completed container through its continuation
    fn process_container(&mut self, mut c: Box<Container>) -> bool {
        match self.advance(&mut c) {
            Disposition::Ack(reply) => {
                self.replies.push_back(reply);
                self.pool.free(c);
                false
            }
            Disposition::AckReissued(reply) => {
                self.replies.push_back(reply);
                self.send_container(c);
                false
            }
            Disposition::Swallow => {
                self.pool.free(c);
                false
            }
            Disposition::SwallowReissued => {
                self.send_container(c);
                false
            }
            Disposition::NeedsReset => {
                self.pool.free(c);
                true
            }
        }
    }

    /// Abort everything a modem reset invalidated, then renegotiate
    fn handle_reset(&mut self) {
        debug!("modem reset, aborting all sockets");
        self.abort_sockets();
        let was_off = self.modem.power == PowerState::Off;
        self.modem.on_reset();
        self.select_armed = false;
        self.report_armed = false;
        if was_off {
            // Spurious reset while powered down; nothing to renegotiate
            self.modem.power = PowerState::Off;
            return;
        }
        match self.run_bootstrap() {
            Ok(()) => {
                // Radio state does not survive a reset
                self.modem.power = PowerState::On;
                if self.modem.subscribed_reports & EventCtl::SMS != 0 {
                    self.arm_report();
                }
            }
            Err(e) => warn!(error = %e, "bootstrap after reset failed"),
        }
    }

    /// Mark every live socket aborted and tell the proxy
    pub(crate) fn abort_sockets(&mut self) {
        let mut doomed = Vec::new();
        for (key, ctx) in self.sockets.iter_mut() {
            if ctx.state() == SocketState::Closing {
                // The modem side is gone either way; an interrupted close
                // counts as done and the slot is reclaimed.
                if let Some(xid) = ctx.finish() {
                    self.replies.push_back(Reply::Ack { xid, result: 0 });
                }
                doomed.push(key);
                continue;
            }
            // Outstanding requests can never complete now
            if let Some(xid) = ctx.finish() {
                self.replies.push_back(Reply::Ack {
                    xid,
                    result: -ECONNABORTED,
                });
            }
            if let Some(xid) = ctx.wait_conn_xid.take() {
                self.replies.push_back(Reply::Ack {
                    xid,
                    result: -ECONNABORTED,
                });
            }
            ctx.select = SocketEvents::default();
            ctx.altsockid = None;
            if matches!(
                ctx.state(),
                SocketState::Open
                    | SocketState::Opened
                    | SocketState::Connecting
                    | SocketState::WaitConn
                    | SocketState::Connected
            ) {
                ctx.set_state(SocketState::Aborted);
                self.replies.push_back(Reply::Event {
                    usockid: SocketHandle(key),
                    events: SocketEvents::ABORT,
                });
            }
        }
        for key in doomed {
            self.sockets.remove(key);
        }
        self.by_altsock.clear();
    }

    /// Run the post-reset bootstrap negotiation to completion
    pub(crate) fn run_bootstrap(&mut self) -> Result<(), BootstrapError> {
        const MAX_PASSES: u32 = 8;
        for _ in 0..MAX_PASSES {
            match reset_seq::run(&mut self.pool, &mut self.device, self.at_budget)? {
                BootstrapOutcome::Done => return Ok(()),
                BootstrapOutcome::Restart => continue,
            }
        }
        Err(BootstrapError::NotConverging(MAX_PASSES))
    }

    /// Hand a filled container to the device channel
    ///
    /// On refusal the container is reclaimed, optimistic socket state rolled
    /// back, and the originating request nacked.
    pub(crate) fn send_container(&mut self, c: Box<Container>) -> bool {
        match self.device.send(c) {
            Ok(()) => true,
            Err(failure) => {
                let c = failure.container;
                warn!(kind = %failure.kind, api = ?c.api(), "device refused command");
                match c.continuation {
                    Some(Continuation::Select) => self.select_armed = false,
                    Some(Continuation::SmsReport) => self.report_armed = false,
                    _ => {}
                }
                let result = match failure.kind {
                    SendFailureKind::ResetInProgress => -ENETDOWN,
                    SendFailureKind::Rejected => -EIO,
                };
                let xid = match c.owner {
                    Some(h) => match self.sockets.get_mut(h.0) {
                        Some(ctx) => {
                            match ctx.state() {
                                SocketState::Open => ctx.set_state(SocketState::Prealloc),
                                SocketState::Connecting => ctx.set_state(SocketState::Opened),
                                _ => {}
                            }
                            ctx.finish().or(c.xid)
                        }
                        None => c.xid,
                    },
                    None => c.xid,
                };
                self.pool.free(c);
                if let Some(xid) = xid {
                    self.ack(xid, result);
                }
                false
            }
        }
    }

    /// Queue a plain acknowledgement
    pub(crate) fn ack(&mut self, xid: Xid, result: i32) {
        if result < 0 {
            trace!(xid, result, "nack");
        }
        self.replies.push_back(Reply::Ack { xid, result });
    }

    /// Queue a data-carrying acknowledgement
    pub(crate) fn reply_data(&mut self, xid: Xid, result: i32, data: AckData) {
        self.replies.push_back(Reply::DataAck { xid, result, data });
    }

    /// Remove a context from the table and every index that references it
    pub(crate) fn destroy_socket(&mut self, h: SocketHandle) {
        if let Some(ctx) = self.sockets.try_remove(h.0) {
            if let Some(alt) = ctx.altsockid {
                self.by_altsock.remove(&alt);
            }
            trace!(?h, "socket context destroyed");
        }
    }

    /// Fire-and-forget close of a modem socket no context owns
    pub(crate) fn close_orphan(&mut self, altsockid: i32) {
        let Some(mut c) = self.pool.alloc() else {
            warn!(altsockid, "modem socket leaked, no container for cleanup close");
            return;
        };
        c.cmd = ApiId::SocketClose;
        c.args = CommandArgs::SocketClose { altsockid };
        c.continuation = Some(Continuation::CloseSock);
        self.send_container(c);
    }

    /// Watch bitmaps for the readiness snapshot, one bit per modem socket id
    pub(crate) fn select_masks(&self) -> (u64, u64) {
        let mut read_set = 0u64;
        let mut write_set = 0u64;
        for (_, ctx) in self.sockets.iter() {
            let Some(alt) = ctx.altsockid else { continue };
            if !(0..64).contains(&alt) {
                continue;
            }
            if matches!(
                ctx.state(),
                SocketState::Opened | SocketState::WaitConn | SocketState::Connected
            ) {
                read_set |= 1 << alt;
                write_set |= 1 << alt;
            }
        }
        (read_set, write_set)
    }

    /// Arm the long-lived readiness-snapshot container
    ///
    /// The container is consumed from the pool for as long as it stays armed;
    /// every completion re-issues it with fresh masks.
    pub(crate) fn arm_select(&mut self) {
        if self.select_armed {
            return;
        }
        let (read_set, write_set) = self.select_masks();
        let Some(mut c) = self.pool.alloc() else {
            warn!("no container free to arm the readiness snapshot");
            return;
        };
        c.cmd = ApiId::Select;
        c.args = CommandArgs::Select {
            read_set,
            write_set,
        };
        c.continuation = Some(Continuation::Select);
        self.select_armed = self.send_container(c);
    }

    /// Arm the long-lived SMS report container
    pub(crate) fn arm_report(&mut self) {
        if self.report_armed {
            return;
        }
        let Some(mut c) = self.pool.alloc() else {
            warn!("no container free to arm SMS reports");
            return;
        };
        c.cmd = ApiId::SmsReportRecv;
        c.args = CommandArgs::None;
        c.continuation = Some(Continuation::SmsReport);
        self.report_armed = self.send_container(c);
    }

    /// Current modem power progression
    pub fn power_state(&self) -> PowerState {
        self.modem.power
    }

    /// State of one logical socket, if the handle is live
    pub fn socket_state(&self, usockid: SocketHandle) -> Option<SocketState> {
        self.sockets.get(usockid.0).map(SocketContext::state)
    }

    /// Current SMS session state
    pub fn sms_state(&self) -> SmsState {
        self.modem.sms.state()
    }

    /// Containers currently out with the device channel
    pub fn in_flight(&self) -> usize {
        self.pool.in_flight()
    }

    /// Live entries in the socket table
    pub fn open_sockets(&self) -> usize {
        self.sockets.len()
    }

    /// Access the device channel, e.g. to drive a test double
    pub fn device(&self) -> &D {
        &self.device
    }

    /// Mutable access to the device channel
    pub fn device_mut(&mut self) -> &mut D {
        &mut self.device
    }
}
