use std::collections::{HashMap, VecDeque};
use std::io::{self, Write};
use std::str;

use tracing::subscriber::DefaultGuard;
use tracing_subscriber::EnvFilter;

use crate::command::{ApiId, CommandArgs, CommandReply};
use crate::container::Container;
use crate::device::{DeviceChannel, EventSet, PowerCmd, SendFailure, SendFailureKind};
use crate::usrsock::{IoctlRequest, PowerRequest, Reply, Request, Xid};
use crate::{Bridge, BridgeConfig, SocketHandle};

pub(super) fn subscribe() -> DefaultGuard {
    let sub = tracing_subscriber::FmtSubscriber::builder()
        .with_env_filter(EnvFilter::new("trace"))
        .with_writer(|| TestWriter)
        .finish();
    tracing::subscriber::set_default(sub)
}

struct TestWriter;

impl Write for TestWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        print!(
            "{}",
            str::from_utf8(buf).expect("tried to log invalid UTF-8")
        );
        Ok(buf.len())
    }
    fn flush(&mut self) -> io::Result<()> {
        io::stdout().flush()
    }
}

/// Scripted stand-in for the daemon's modem transport
///
/// Commands land in `sent` until the test completes them; AT commands are
/// auto-answered from a config store so the bootstrap negotiation runs
/// without per-test scripting.
pub(super) struct MockChannel {
    /// Accepted commands awaiting completion, oldest first
    pub(super) sent: VecDeque<Box<Container>>,
    /// Batches queued for delivery by `get_event`
    ready: VecDeque<(EventSet, Vec<Box<Container>>)>,
    /// Backing store for the AT config auto-responder
    pub(super) atcfg: HashMap<String, String>,
    /// Corrective config writes applied, in order
    pub(super) at_sets: Vec<(String, String)>,
    /// Times `reset` was driven
    pub(super) resets: usize,
    /// Power-rail commands received, in order
    pub(super) power: Vec<PowerCmd>,
    /// When set, the next `send` is refused with this kind
    pub(super) fail_next_send: Option<SendFailureKind>,
    reset_pending: bool,
}

impl MockChannel {
    pub(super) fn new(atcfg: HashMap<String, String>) -> Self {
        Self {
            sent: VecDeque::new(),
            ready: VecDeque::new(),
            atcfg,
            at_sets: Vec::new(),
            resets: 0,
            power: Vec::new(),
            fail_next_send: None,
            reset_pending: false,
        }
    }

    /// Complete the oldest sent command carrying `api` with `reply`
    pub(super) fn complete_cmd(&mut self, api: ApiId, reply: CommandReply) {
        let pos = self
            .sent
            .iter()
            .position(|c| c.api() == api)
            .unwrap_or_else(|| panic!("no {api:?} in flight"));
        let mut c = self.sent.remove(pos).unwrap();
        c.complete(reply);
        self.ready.push_back((EventSet::REPLY, vec![c]));
    }

    /// Hand back the oldest sent command with `api` without completing it
    pub(super) fn deliver_empty(&mut self, api: ApiId) {
        let pos = self
            .sent
            .iter()
            .position(|c| c.api() == api)
            .unwrap_or_else(|| panic!("no {api:?} in flight"));
        let c = self.sent.remove(pos).unwrap();
        self.ready.push_back((EventSet::REPLY, vec![c]));
    }

    pub(super) fn sent_apis(&self) -> Vec<ApiId> {
        self.sent.iter().map(|c| c.api()).collect()
    }

    fn answer_at(&mut self, c: &mut Box<Container>) {
        let CommandArgs::At { line } = c.args() else {
            panic!("AT command without AT args");
        };
        let reply = if let Some(rest) = line.strip_prefix("AT%GETACFG=\"") {
            let key = rest.trim_end_matches('\r').trim_end_matches('"');
            let value = self.atcfg.get(key).cloned().unwrap_or_default();
            CommandReply::At {
                result: 0,
                line: format!("%GETACFG: {value}\r\nOK"),
            }
        } else if let Some(rest) = line.strip_prefix("AT%SETACFG=\"") {
            let rest = rest.trim_end_matches('\r');
            let (key, rest) = rest.split_once('"').expect("malformed SETACFG");
            let value = rest
                .trim_start_matches(',')
                .trim_matches('"')
                .to_owned();
            self.atcfg.insert(key.to_owned(), value.clone());
            self.at_sets.push((key.to_owned(), value));
            CommandReply::At {
                result: 0,
                line: "OK".to_owned(),
            }
        } else {
            panic!("unrecognized AT line {line:?}");
        };
        c.complete(reply);
    }
}

impl DeviceChannel for MockChannel {
    fn send(&mut self, mut container: Box<Container>) -> Result<(), SendFailure> {
        if let Some(kind) = self.fail_next_send.take() {
            return Err(SendFailure { container, kind });
        }
        if container.api() == ApiId::AtCommand {
            self.answer_at(&mut container);
            self.ready.push_back((EventSet::REPLY, vec![container]));
        } else {
            self.sent.push_back(container);
        }
        Ok(())
    }

    fn get_event(&mut self) -> (EventSet, Vec<Box<Container>>) {
        if self.reset_pending {
            self.reset_pending = false;
            // Everything in flight comes back invalidated
            return (EventSet::RESET, self.drain());
        }
        match self.ready.pop_front() {
            Some(entry) => entry,
            None => panic!("get_event with nothing queued"),
        }
    }

    fn drain(&mut self) -> Vec<Box<Container>> {
        let mut batch: Vec<_> = self.sent.drain(..).collect();
        for (_, mut ready) in self.ready.drain(..) {
            batch.append(&mut ready);
        }
        batch
    }

    fn power_control(&mut self, cmd: PowerCmd) {
        self.power.push(cmd);
    }

    fn reset(&mut self) {
        self.resets += 1;
        self.reset_pending = true;
    }
}

/// AT config store already matching the bootstrap policy table
pub(super) fn compliant_atcfg() -> HashMap<String, String> {
    [
        ("LWM2M.Config.Enable", "true"),
        ("LWM2M.Config.AutoConnect", "false"),
        ("LWM2M.Config.Version", "1.1"),
        ("LWM2M.Config.NameMode", "0"),
        ("Radio.Operator", "310410"),
        ("Radio.ScanPlan.Enable", "false"),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_owned(), v.to_owned()))
    .collect()
}

pub(super) fn ioctl(xid: Xid, req: IoctlRequest) -> Request {
    Request::Ioctl {
        xid,
        usockid: SocketHandle(0),
        req,
    }
}

/// An engine over a [`MockChannel`] plus drive-and-assert helpers
pub(super) struct Harness {
    pub(super) bridge: Bridge<MockChannel>,
}

impl Harness {
    pub(super) fn new() -> Self {
        Self::with_config(BridgeConfig::default())
    }

    pub(super) fn with_config(config: BridgeConfig) -> Self {
        let device = MockChannel::new(compliant_atcfg());
        Self {
            bridge: Bridge::new(&config, device).unwrap(),
        }
    }

    /// Power the modem on; the bootstrap runs inline off the auto-responder
    pub(super) fn power_on(&mut self) {
        self.bridge
            .handle_request(ioctl(9000, IoctlRequest::Power(PowerRequest::On)));
        self.expect_ack(9000, 0);
    }

    /// Drive the radio-on chain to completion
    pub(super) fn radio_on(&mut self) {
        self.bridge
            .handle_request(ioctl(9001, IoctlRequest::Power(PowerRequest::RadioOn)));
        self.complete_cmd(ApiId::RadioOn, ok_result());
        self.complete_cmd(ApiId::ReportNetinfo, ok_result());
        self.complete_cmd(ApiId::ActivatePdn, ok_result());
        self.expect_ack(9001, 0);
    }

    pub(super) fn power_on_radio(&mut self) {
        self.power_on();
        self.radio_on();
    }

    /// Complete one in-flight command and drain the resulting event batch
    pub(super) fn complete_cmd(&mut self, api: ApiId, reply: CommandReply) {
        self.bridge.device_mut().complete_cmd(api, reply);
        self.bridge.process_events();
    }

    /// Create a datagram socket and drive its eager open chain
    pub(super) fn dgram_socket(&mut self, xid: Xid, altsockid: i32) -> SocketHandle {
        self.bridge.handle_request(Request::Socket {
            xid,
            domain: crate::AF_INET,
            ty: crate::SOCK_DGRAM,
            protocol: 0,
        });
        self.complete_cmd(ApiId::SocketNew, result_of(altsockid));
        self.complete_cmd(ApiId::Fcntl, ok_result());
        match self.expect_reply() {
            Reply::Ack { xid: got, result } if got == xid && result >= 0 => {
                SocketHandle(result as usize)
            }
            other => panic!("expected socket ack, got {other:?}"),
        }
    }

    /// Create a stream socket; no modem traffic yet
    pub(super) fn stream_socket(&mut self, xid: Xid) -> SocketHandle {
        self.bridge.handle_request(Request::Socket {
            xid,
            domain: crate::AF_INET,
            ty: crate::SOCK_STREAM,
            protocol: 0,
        });
        match self.expect_reply() {
            Reply::Ack { xid: got, result } if got == xid && result >= 0 => {
                SocketHandle(result as usize)
            }
            other => panic!("expected socket ack, got {other:?}"),
        }
    }

    pub(super) fn expect_reply(&mut self) -> Reply {
        self.bridge.poll_reply().expect("expected a queued reply")
    }

    pub(super) fn expect_ack(&mut self, xid: Xid, result: i32) {
        match self.expect_reply() {
            Reply::Ack {
                xid: got,
                result: r,
            } => {
                assert_eq!((got, r), (xid, result), "wrong ack");
            }
            other => panic!("expected ack for xid {xid}, got {other:?}"),
        }
    }

    pub(super) fn expect_no_reply(&mut self) {
        if let Some(reply) = self.bridge.poll_reply() {
            panic!("expected silence, got {reply:?}");
        }
    }

    pub(super) fn drain(&mut self) -> Vec<Reply> {
        let mut out = Vec::new();
        while let Some(r) = self.bridge.poll_reply() {
            out.push(r);
        }
        out
    }
}

pub(super) fn ok_result() -> CommandReply {
    CommandReply::Result {
        result: 0,
        errcode: 0,
    }
}

pub(super) fn result_of(result: i32) -> CommandReply {
    CommandReply::Result { result, errcode: 0 }
}

pub(super) fn err_result(errcode: i32) -> CommandReply {
    CommandReply::Result {
        result: -1,
        errcode,
    }
}
