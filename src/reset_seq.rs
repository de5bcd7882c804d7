//! Post-reset bootstrap sequencer
//!
//! After every modem power-on or reset the engine walks a fixed table of
//! AT-level configuration checks before any other command may flow. Each step
//! reads one config key and, when the value is off-policy, writes the
//! corrective value. A corrected run ends in a forced modem reset so the
//! modem picks the new values up, and the whole sequence runs again from the
//! top; a clean run ends the bootstrap. The exchanges are deliberately
//! synchronous: the engine owns the channel exclusively during bootstrap, so
//! each command blocks on `get_event` until its own reply arrives.

use thiserror::Error;
use tracing::{debug, trace, warn};

use crate::atcmd;
use crate::command::{ApiId, CommandArgs, CommandReply};
use crate::container::ContainerPool;
use crate::device::{DeviceChannel, EventSet};

/// Result of one full pass over the config table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BootstrapOutcome {
    /// Every key matched policy; the modem is ready
    Done,
    /// The sequence must run again from the top (corrective write or a reset
    /// landed mid-pass)
    Restart,
}

/// Bootstrap negotiation failure
#[derive(Debug, Error)]
pub enum BootstrapError {
    /// The container pool had no free slot for the exchange
    #[error("no free container for bootstrap exchange")]
    NoContainer,
    /// The channel produced something other than the expected AT reply
    #[error("unexpected reply during bootstrap exchange")]
    UnexpectedReply,
    /// The modem refused a corrective config write
    #[error("modem refused corrective write for {0}")]
    Refused(&'static str),
    /// A formatted AT line exceeded the configured budget
    #[error("AT command exceeds the configured line budget")]
    Compose,
    /// The channel refused the command outright
    #[error("device refused bootstrap command: {0}")]
    Send(crate::device::SendFailureKind),
    /// The sequence kept restarting without converging
    #[error("bootstrap did not converge after {0} passes")]
    NotConverging(u32),
}

enum Check {
    Is(&'static str),
    IsNot(&'static str),
}

impl Check {
    fn ok(&self, value: &str) -> bool {
        match self {
            Check::Is(want) => value == *want,
            Check::IsNot(reject) => value != *reject,
        }
    }
}

struct ConfigStep {
    key: &'static str,
    check: Check,
    corrective: &'static str,
}

/// The policy table, walked in order on every pass
const STEPS: [ConfigStep; 6] = [
    ConfigStep {
        key: "LWM2M.Config.Enable",
        check: Check::Is("true"),
        corrective: "true",
    },
    ConfigStep {
        key: "LWM2M.Config.AutoConnect",
        check: Check::Is("false"),
        corrective: "false",
    },
    ConfigStep {
        key: "LWM2M.Config.Version",
        check: Check::Is("1.1"),
        corrective: "1.1",
    },
    ConfigStep {
        key: "LWM2M.Config.NameMode",
        check: Check::Is("0"),
        corrective: "0",
    },
    // An unprovisioned operator profile reads back as the factory default;
    // clearing it forces reselection.
    ConfigStep {
        key: "Radio.Operator",
        check: Check::IsNot("DEFAULT"),
        corrective: "",
    },
    ConfigStep {
        key: "Radio.ScanPlan.Enable",
        check: Check::Is("false"),
        corrective: "false",
    },
];

enum Exchange {
    Reply(String),
    /// A reset event landed before the reply; the pass is void
    Restarted,
}

/// Send one AT line and block until its reply (or a reset) arrives
fn exchange<D: DeviceChannel>(
    pool: &mut ContainerPool,
    device: &mut D,
    line: String,
) -> Result<Exchange, BootstrapError> {
    let mut c = pool.alloc().ok_or(BootstrapError::NoContainer)?;
    c.cmd = ApiId::AtCommand;
    c.args = CommandArgs::At { line };
    // No continuation: the sequencer consumes the reply inline
    device.send(c).map_err(|f| {
        let kind = f.kind;
        pool.free(f.container);
        BootstrapError::Send(kind)
    })?;
    loop {
        let (events, batch) = device.get_event();
        if events.contains(EventSet::RESET) {
            debug!("reset landed mid-bootstrap, restarting the sequence");
            pool.free_all(batch);
            return Ok(Exchange::Restarted);
        }
        if batch.is_empty() {
            trace!(?events, "eventless wakeup during bootstrap");
            continue;
        }
        let mut text = None;
        for mut c in batch {
            if text.is_none() && c.api() == ApiId::AtCommand {
                if let Some(CommandReply::At { result, line }) = c.take_reply() {
                    if result >= 0 {
                        text = Some(line);
                    }
                }
            } else {
                warn!(api = ?c.api(), "unexpected container during bootstrap");
            }
            pool.free(c);
        }
        return match text {
            Some(line) => Ok(Exchange::Reply(line)),
            None => Err(BootstrapError::UnexpectedReply),
        };
    }
}

/// One full pass over the config table
pub(crate) fn run<D: DeviceChannel>(
    pool: &mut ContainerPool,
    device: &mut D,
    at_budget: usize,
) -> Result<BootstrapOutcome, BootstrapError> {
    let mut corrected = false;
    for step in &STEPS {
        let line =
            atcmd::compose_getacfg(at_budget, step.key).map_err(|_| BootstrapError::Compose)?;
        let text = match exchange(pool, device, line)? {
            Exchange::Restarted => return Ok(BootstrapOutcome::Restart),
            Exchange::Reply(text) => text,
        };
        let value = atcmd::atreply_value(&text).ok_or(BootstrapError::UnexpectedReply)?;
        if step.check.ok(value) {
            trace!(key = step.key, value, "config key on policy");
            continue;
        }
        debug!(key = step.key, value, "config key off policy, correcting");
        let line = atcmd::compose_setacfg(at_budget, step.key, step.corrective)
            .map_err(|_| BootstrapError::Compose)?;
        let text = match exchange(pool, device, line)? {
            Exchange::Restarted => return Ok(BootstrapOutcome::Restart),
            Exchange::Reply(text) => text,
        };
        if !atcmd::check_atreply_ok(&text) {
            return Err(BootstrapError::Refused(step.key));
        }
        corrected = true;
    }
    if corrected {
        // New values only take effect after a power cycle; void this pass
        debug!("corrective writes applied, forcing modem reset");
        device.reset();
        return Ok(BootstrapOutcome::Restart);
    }
    Ok(BootstrapOutcome::Done)
}
