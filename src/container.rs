//! Fixed-capacity pool of in-flight command containers
//!
//! A container is the unit of in-flight modem work: it carries one command
//! down to the device channel and its reply back up to the continuation that
//! will interpret it. The pool never grows and never blocks; exhaustion is a
//! recoverable condition the caller surfaces as a "retry later" outcome.

use tracing::{trace, warn};

use crate::bridge::SocketHandle;
use crate::command::{ApiId, CommandArgs, CommandReply};
use crate::postproc::Continuation;
use crate::usrsock::Xid;

/// One in-flight modem command
#[derive(Debug, Default)]
pub struct Container {
    pub(crate) owner: Option<SocketHandle>,
    pub(crate) cmd: ApiId,
    pub(crate) args: CommandArgs,
    pub(crate) xid: Option<Xid>,
    pub(crate) continuation: Option<Continuation>,
    reply: Option<CommandReply>,
}

impl Container {
    /// The command this container carries
    pub fn api(&self) -> ApiId {
        self.cmd
    }

    /// The command's input parameters
    pub fn args(&self) -> &CommandArgs {
        &self.args
    }

    /// Record the modem's reply; called by the device channel
    pub fn complete(&mut self, reply: CommandReply) {
        self.reply = Some(reply);
    }

    pub(crate) fn take_reply(&mut self) -> Option<CommandReply> {
        self.reply.take()
    }

    /// Reset all request/reply slots for reuse
    fn clear(&mut self) {
        self.owner = None;
        self.cmd = ApiId::None;
        self.args = CommandArgs::None;
        self.xid = None;
        self.continuation = None;
        self.reply = None;
    }
}

/// Fixed pool of containers; capacity is set once at construction
pub(crate) struct ContainerPool {
    free: Vec<Box<Container>>,
    capacity: usize,
}

impl ContainerPool {
    pub(crate) fn new(capacity: usize) -> Self {
        let mut free = Vec::with_capacity(capacity);
        free.resize_with(capacity, Box::default);
        Self { free, capacity }
    }

    /// Take a cleared container, or `None` when every slot is in flight
    ///
    /// Never blocks. The caller must map `None` to an EAGAIN-class outcome.
    pub(crate) fn alloc(&mut self) -> Option<Box<Container>> {
        match self.free.pop() {
            Some(mut c) => {
                c.clear();
                Some(c)
            }
            None => {
                warn!("container pool exhausted ({} in flight)", self.capacity);
                None
            }
        }
    }

    /// Return one container to the pool
    pub(crate) fn free(&mut self, c: Box<Container>) {
        debug_assert!(self.free.len() < self.capacity, "container freed twice");
        self.free.push(c);
    }

    /// Bulk reclaim, used when a modem reset invalidates an in-flight batch
    pub(crate) fn free_all(&mut self, batch: Vec<Box<Container>>) {
        trace!("reclaiming {} containers", batch.len());
        for c in batch {
            self.free(c);
        }
    }

    pub(crate) fn in_flight(&self) -> usize {
        self.capacity - self.free.len()
    }

    pub(crate) fn capacity(&self) -> usize {
        self.capacity
    }
}
