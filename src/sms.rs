//! Concatenated-SMS reassembly
//!
//! Multi-part messages arrive as a series of modem report events sharing a
//! message index. The session accumulates part payloads until the part whose
//! sequence number equals the declared maximum, then exposes the assembled
//! message for exactly one read. Completing the read triggers a finalize +
//! reinitialize exchange with the modem (`Reopen`) so its internal assembly
//! buffer is flushed between logical messages.

use bytes::{Bytes, BytesMut};
use tracing::{debug, warn};

use crate::usrsock::errno::*;

/// SMS session state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SmsState {
    /// No SMS session established
    #[default]
    Uninit,
    /// Steady state, waiting for a message report
    WaitMsg,
    /// First part of a concatenated message seen
    WaitMsgConcat,
    /// Accumulating the total length across further parts
    CalcSize,
    /// A complete message is available for one read
    ReadReady,
    /// Finalize/reinit exchange in flight after a read
    Reopen,
}

/// One unsolicited SMS report event from the modem
#[derive(Debug, Clone)]
pub struct SmsReport {
    /// Modem-side message index, shared by all parts of one message
    pub index: u16,
    /// Concatenation reference id of this part
    pub ref_id: u16,
    /// Sequence number of this part, 1-based
    pub seq: u8,
    /// Declared number of parts; 1 for a single-part message
    pub max_seq: u8,
    /// The modem's declared total length of the whole message, valid on the
    /// final part
    pub declared_total: u32,
    /// This part's payload
    pub data: Bytes,
}

/// Outcome of feeding one report into the session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SmsAdvance {
    /// Accumulated; more parts expected
    Pending,
    /// A complete message is now readable
    Ready,
    /// Report ignored (no session, duplicate part, or message still unread)
    Ignored,
    /// Accumulated size disagrees with the modem's declared total; this path
    /// has no recovery and demands a modem reset
    Desync,
}

#[derive(Debug, Default)]
pub(crate) struct SmsSession {
    state: SmsState,
    msg_index: Option<u16>,
    expect_max: u8,
    next_seq: u8,
    assembled: BytesMut,
    /// Message indexes seen, kept for delete bookkeeping; all parts of a
    /// concatenated message share one index
    pub(crate) msg_indexes: Vec<u16>,
}

impl SmsSession {
    pub(crate) fn state(&self) -> SmsState {
        self.state
    }

    fn set_state(&mut self, next: SmsState) {
        self.state = next;
    }

    /// The modem confirmed session init (first init or reopen completion)
    pub(crate) fn init_done(&mut self) {
        self.msg_index = None;
        self.expect_max = 0;
        self.next_seq = 1;
        self.assembled.clear();
        self.set_state(SmsState::WaitMsg);
    }

    /// Session finalized without reinit
    pub(crate) fn fin_done(&mut self) {
        self.reset();
    }

    pub(crate) fn reset(&mut self) {
        *self = Self::default();
    }

    /// Feed one report event into the state machine
    pub(crate) fn on_report(&mut self, rep: &SmsReport) -> SmsAdvance {
        match self.state {
            SmsState::Uninit | SmsState::Reopen => {
                debug!(index = rep.index, "SMS report with no active session");
                SmsAdvance::Ignored
            }
            SmsState::ReadReady => {
                // The previous message has not been read yet; the modem will
                // redeliver after the reopen flush.
                warn!(index = rep.index, "SMS report while a message is unread");
                SmsAdvance::Ignored
            }
            SmsState::WaitMsg => {
                if rep.max_seq <= 1 {
                    self.assembled.extend_from_slice(&rep.data);
                    self.note_index(rep.index);
                    if rep.declared_total as usize != self.assembled.len() {
                        return SmsAdvance::Desync;
                    }
                    self.set_state(SmsState::ReadReady);
                    return SmsAdvance::Ready;
                }
                if rep.seq != 1 {
                    warn!(seq = rep.seq, "concatenated SMS starting mid-sequence");
                    return SmsAdvance::Ignored;
                }
                self.msg_index = Some(rep.index);
                self.expect_max = rep.max_seq;
                self.next_seq = 2;
                self.assembled.extend_from_slice(&rep.data);
                self.note_index(rep.index);
                self.set_state(SmsState::WaitMsgConcat);
                SmsAdvance::Pending
            }
            SmsState::WaitMsgConcat | SmsState::CalcSize => {
                if self.msg_index != Some(rep.index) || rep.seq != self.next_seq {
                    warn!(
                        index = rep.index,
                        seq = rep.seq,
                        "out-of-order concatenated SMS part"
                    );
                    return SmsAdvance::Ignored;
                }
                self.assembled.extend_from_slice(&rep.data);
                self.note_index(rep.index);
                if rep.seq == self.expect_max {
                    if rep.declared_total as usize != self.assembled.len() {
                        return SmsAdvance::Desync;
                    }
                    self.set_state(SmsState::ReadReady);
                    return SmsAdvance::Ready;
                }
                self.next_seq += 1;
                self.set_state(SmsState::CalcSize);
                SmsAdvance::Pending
            }
        }
    }

    /// Take the assembled message, entering the reopen exchange
    ///
    /// Errors are negative errnos: not-yet-ready while a message is still
    /// being assembled (or a read is already draining), no-session otherwise.
    pub(crate) fn read(&mut self) -> Result<Bytes, i32> {
        match self.state {
            SmsState::ReadReady => {
                let data = self.assembled.split().freeze();
                self.set_state(SmsState::Reopen);
                Ok(data)
            }
            SmsState::WaitMsg | SmsState::WaitMsgConcat | SmsState::CalcSize => Err(-EAGAIN),
            SmsState::Reopen => Err(-EAGAIN),
            SmsState::Uninit => Err(-EOPNOTSUPP),
        }
    }

    fn note_index(&mut self, index: u16) {
        if !self.msg_indexes.contains(&index) {
            self.msg_indexes.push(index);
        }
    }

    /// The modem confirmed deletion of the message at `index`
    pub(crate) fn delete_index(&mut self, index: u16) {
        self.msg_indexes.retain(|&i| i != index);
    }
}
