//! Accumulated modem device state
//!
//! One instance lives inside the [`Bridge`](crate::Bridge); it replaces the
//! original daemon's file-scope statics with an explicit context struct.
//! Mutated only by the postprocessor chain and the bootstrap sequencer; read
//! by the composers to gate behavior. Single-threaded access is an invariant
//! of the whole engine.

use crate::fwupdate::FwUpdater;
use crate::sms::SmsSession;

/// Modem power progression
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum PowerState {
    /// Power rail off
    Off,
    /// Powered, bootstrap negotiation not yet finished
    BeforeOn,
    /// Bootstrap done, radio still off
    On,
    /// Radio on and PDN active; sockets are usable
    RadioOn,
}

pub(crate) struct ModemState {
    pub(crate) power: PowerState,
    /// False while a hibernation resume is restoring modem state; non-power
    /// requests are refused until it completes
    pub(crate) api_enabled: bool,
    pub(crate) version: Option<String>,
    pub(crate) lwm2m_supported: bool,
    pub(crate) subscribed_reports: u32,
    pub(crate) fw: FwUpdater,
    pub(crate) sms: SmsSession,
    /// An SMS reopen flush could not get a container; retry on the next
    /// event drain
    pub(crate) sms_reopen_pending: bool,
}

impl ModemState {
    pub(crate) fn new() -> Self {
        Self {
            power: PowerState::Off,
            api_enabled: true,
            version: None,
            lwm2m_supported: false,
            subscribed_reports: 0,
            fw: FwUpdater::default(),
            sms: SmsSession::default(),
            sms_reopen_pending: false,
        }
    }

    /// Reinitialize everything a modem reset invalidates
    pub(crate) fn on_reset(&mut self) {
        self.power = PowerState::BeforeOn;
        self.fw.reset();
        self.sms.reset();
        self.sms_reopen_pending = false;
    }

    /// Firmware versions from RK_03 onward carry the LWM2M client
    pub(crate) fn note_version(&mut self, version: String) {
        self.lwm2m_supported = version
            .strip_prefix("RK_")
            .and_then(|rest| rest.split('_').next())
            .and_then(|major| major.parse::<u32>().ok())
            .is_some_and(|major| major >= 3);
        self.version = Some(version);
    }
}
