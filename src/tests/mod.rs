use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use assert_matches::assert_matches;
use bytes::{BufMut, Bytes, BytesMut};

use crate::command::{ApiId, CommandArgs, CommandReply};
use crate::device::{DeviceChannel, PowerCmd, SendFailureKind};
use crate::fwupdate::{FW_HEADER_LEN, FW_MAGIC};
use crate::sms::SmsReport;
use crate::usrsock::errno::*;
use crate::usrsock::{
    AckData, EventCtl, FwUpdateRequest, IoctlRequest, Lwm2mRequest, PowerRequest, Reply, Request,
    SmsRequest, SocketEvents, VendorRequest, AF_INET, SOCK_STREAM, SOL_SOCKET, SO_ERROR,
};
use crate::{PowerState, SmsState, SocketHandle, SocketState};

mod util;
use util::*;

fn addr() -> SocketAddr {
    SocketAddr::new(IpAddr::V4(Ipv4Addr::new(198, 51, 100, 7)), 5683)
}

#[test]
fn bootstrap_converges_on_compliant_config() {
    let _guard = subscribe();
    let mut h = Harness::new();
    h.power_on();
    assert_eq!(h.bridge.power_state(), PowerState::On);
    assert_eq!(h.bridge.device().resets, 0);
    assert!(h.bridge.device().at_sets.is_empty());
    assert_eq!(h.bridge.device().power, vec![PowerCmd::On]);
}

#[test]
fn bootstrap_corrects_config_then_resets_once() {
    let _guard = subscribe();
    let mut h = Harness::new();
    {
        // Every key off policy
        let cfg = &mut h.bridge.device_mut().atcfg;
        cfg.insert("LWM2M.Config.Enable".into(), "false".into());
        cfg.insert("LWM2M.Config.AutoConnect".into(), "true".into());
        cfg.insert("LWM2M.Config.Version".into(), "1.0".into());
        cfg.insert("LWM2M.Config.NameMode".into(), "1".into());
        cfg.insert("Radio.Operator".into(), "DEFAULT".into());
        cfg.insert("Radio.ScanPlan.Enable".into(), "true".into());
    }
    h.power_on();
    assert_eq!(h.bridge.power_state(), PowerState::On);
    // Exactly one corrective set per field, one forced reset, one clean pass
    assert_eq!(h.bridge.device().resets, 1);
    let keys: Vec<_> = h
        .bridge
        .device()
        .at_sets
        .iter()
        .map(|(k, _)| k.as_str())
        .collect();
    assert_eq!(
        keys,
        vec![
            "LWM2M.Config.Enable",
            "LWM2M.Config.AutoConnect",
            "LWM2M.Config.Version",
            "LWM2M.Config.NameMode",
            "Radio.Operator",
            "Radio.ScanPlan.Enable",
        ]
    );
    assert_eq!(
        h.bridge.device().atcfg.get("Radio.Operator").unwrap(),
        ""
    );
}

#[test]
fn socket_requires_radio_on() {
    let _guard = subscribe();
    let mut h = Harness::new();
    h.power_on();
    h.bridge.handle_request(Request::Socket {
        xid: 1,
        domain: AF_INET,
        ty: SOCK_STREAM,
        protocol: 0,
    });
    h.expect_ack(1, -ENETDOWN);
}

#[test]
fn dgram_socket_opens_eagerly() {
    let _guard = subscribe();
    let mut h = Harness::new();
    h.power_on_radio();
    let s = h.dgram_socket(1, 5);
    assert_eq!(h.bridge.socket_state(s), Some(SocketState::Opened));
    // The first live modem socket arms the readiness snapshot
    assert!(h.bridge.device().sent_apis().contains(&ApiId::Select));
}

#[test]
fn dgram_open_failure_destroys_context() {
    let _guard = subscribe();
    let mut h = Harness::new();
    h.power_on_radio();
    h.bridge.handle_request(Request::Socket {
        xid: 4,
        domain: AF_INET,
        ty: crate::SOCK_DGRAM,
        protocol: 0,
    });
    h.complete_cmd(ApiId::SocketNew, err_result(ENOBUFS));
    h.expect_ack(4, -ENOBUFS);
    assert_eq!(h.bridge.open_sockets(), 0);
}

#[test]
fn stream_connect_runs_the_lazy_open_chain() {
    let _guard = subscribe();
    let mut h = Harness::new();
    h.power_on_radio();
    let s = h.stream_socket(1);
    assert_eq!(h.bridge.socket_state(s), Some(SocketState::Prealloc));

    h.bridge.handle_request(Request::Connect {
        xid: 2,
        usockid: s,
        addr: addr(),
    });
    // No ack yet: open, nonblock, then the connect itself
    h.expect_no_reply();
    h.complete_cmd(ApiId::SocketNew, result_of(7));
    h.complete_cmd(ApiId::Fcntl, ok_result());
    assert_eq!(h.bridge.socket_state(s), Some(SocketState::Connecting));
    h.complete_cmd(ApiId::Connect, ok_result());
    h.expect_ack(2, 0);
    assert_eq!(h.bridge.socket_state(s), Some(SocketState::Connected));
}

#[test]
fn inprogress_connect_parks_until_so_error_poll() {
    let _guard = subscribe();
    let mut h = Harness::new();
    h.power_on_radio();
    let s = h.stream_socket(1);
    h.bridge.handle_request(Request::Connect {
        xid: 2,
        usockid: s,
        addr: addr(),
    });
    h.complete_cmd(ApiId::SocketNew, result_of(7));
    h.complete_cmd(ApiId::Fcntl, ok_result());
    h.complete_cmd(ApiId::Connect, err_result(EINPROGRESS));
    // The connect stays unanswered while the modem resolves it
    h.expect_no_reply();
    assert_eq!(h.bridge.socket_state(s), Some(SocketState::WaitConn));

    // A second connect while parked is refused
    h.bridge.handle_request(Request::Connect {
        xid: 3,
        usockid: s,
        addr: addr(),
    });
    h.expect_ack(3, -EALREADY);

    h.bridge.handle_request(Request::GetSockOpt {
        xid: 4,
        usockid: s,
        level: SOL_SOCKET,
        option: SO_ERROR,
        max_vallen: 4,
    });
    h.complete_cmd(
        ApiId::GetSockOpt,
        CommandReply::OptValue {
            result: 4,
            errcode: 0,
            value: Bytes::copy_from_slice(&0i32.to_le_bytes()),
        },
    );
    // The parked connect acks first, then the option read itself
    h.expect_ack(2, 0);
    assert_matches!(
        h.expect_reply(),
        Reply::DataAck {
            xid: 4,
            result: 4,
            data: AckData::Opt(_),
        }
    );
    assert_eq!(h.bridge.socket_state(s), Some(SocketState::Connected));
}

#[test]
fn so_error_failure_falls_back_to_opened() {
    let _guard = subscribe();
    let mut h = Harness::new();
    h.power_on_radio();
    let s = h.stream_socket(1);
    h.bridge.handle_request(Request::Connect {
        xid: 2,
        usockid: s,
        addr: addr(),
    });
    h.complete_cmd(ApiId::SocketNew, result_of(7));
    h.complete_cmd(ApiId::Fcntl, ok_result());
    h.complete_cmd(ApiId::Connect, err_result(EINPROGRESS));
    h.bridge.handle_request(Request::GetSockOpt {
        xid: 3,
        usockid: s,
        level: SOL_SOCKET,
        option: SO_ERROR,
        max_vallen: 4,
    });
    h.complete_cmd(
        ApiId::GetSockOpt,
        CommandReply::OptValue {
            result: 4,
            errcode: 0,
            value: Bytes::copy_from_slice(&ECONNABORTED.to_le_bytes()),
        },
    );
    h.expect_ack(2, -ECONNABORTED);
    assert_matches!(h.expect_reply(), Reply::DataAck { xid: 3, .. });
    assert_eq!(h.bridge.socket_state(s), Some(SocketState::Opened));
}

#[test]
fn one_outstanding_request_per_socket() {
    let _guard = subscribe();
    let mut h = Harness::new();
    h.power_on_radio();
    let s = h.dgram_socket(1, 5);
    h.bridge.handle_request(Request::SendTo {
        xid: 2,
        usockid: s,
        flags: 0,
        addr: Some(addr()),
        data: Bytes::from_static(b"ping"),
    });
    h.expect_no_reply();
    h.bridge.handle_request(Request::SendTo {
        xid: 3,
        usockid: s,
        flags: 0,
        addr: Some(addr()),
        data: Bytes::from_static(b"ping"),
    });
    h.expect_ack(3, -EAGAIN);
    h.complete_cmd(ApiId::SendTo, result_of(4));
    h.expect_ack(2, 4);
}

#[test]
fn pool_exhaustion_is_eagain_and_recoverable() {
    let _guard = subscribe();
    let mut cfg = crate::BridgeConfig::default();
    cfg.containers(3);
    let mut h = Harness::with_config(cfg);
    h.power_on_radio();
    let a = h.dgram_socket(1, 5);
    // In flight now: the armed select container
    assert_eq!(h.bridge.in_flight(), 1);
    h.bridge.handle_request(Request::SendTo {
        xid: 2,
        usockid: a,
        flags: 0,
        addr: Some(addr()),
        data: Bytes::from_static(b"x"),
    });
    // Third slot goes to a new socket's open command
    h.bridge.handle_request(Request::Socket {
        xid: 3,
        domain: AF_INET,
        ty: crate::SOCK_DGRAM,
        protocol: 0,
    });
    h.expect_no_reply();
    assert_eq!(h.bridge.in_flight(), 3);

    // Pool empty: a stream socket still works (no container needed)...
    let b = h.stream_socket(4);
    // ...but its first modem-bound op is refused
    h.bridge.handle_request(Request::Connect {
        xid: 5,
        usockid: b,
        addr: addr(),
    });
    h.expect_ack(5, -EAGAIN);
    assert_eq!(h.bridge.in_flight(), 3);
    assert_eq!(h.bridge.socket_state(b), Some(SocketState::Prealloc));

    // Completions free slots and the same request succeeds
    h.complete_cmd(ApiId::SendTo, result_of(1));
    h.expect_ack(2, 1);
    h.bridge.handle_request(Request::Connect {
        xid: 6,
        usockid: b,
        addr: addr(),
    });
    h.expect_no_reply();
    assert_eq!(h.bridge.in_flight(), 3);
}

#[test]
fn reset_aborts_sockets_and_renegotiates() {
    let _guard = subscribe();
    let mut h = Harness::new();
    h.power_on_radio();
    let a = h.dgram_socket(1, 5);
    let b = h.dgram_socket(2, 6);
    h.bridge.handle_request(Request::SendTo {
        xid: 3,
        usockid: a,
        flags: 0,
        addr: Some(addr()),
        data: Bytes::from_static(b"x"),
    });
    h.bridge.handle_request(Request::RecvFrom {
        xid: 4,
        usockid: b,
        flags: 0,
        max_buflen: 64,
    });
    // Three containers out: sendto, recvfrom, and the armed select
    assert_eq!(h.bridge.in_flight(), 3);

    h.bridge.device_mut().reset();
    h.bridge.process_events();

    // Every outstanding request is nacked, both sockets abort, and the
    // engine came back through a fresh bootstrap.
    let replies = h.drain();
    for xid in [3, 4] {
        assert!(replies.contains(&Reply::Ack {
            xid,
            result: -ECONNABORTED
        }));
    }
    for s in [a, b] {
        assert!(replies.contains(&Reply::Event {
            usockid: s,
            events: SocketEvents::ABORT
        }));
        assert_eq!(h.bridge.socket_state(s), Some(SocketState::Aborted));
    }
    assert_eq!(h.bridge.in_flight(), 0);
    assert_eq!(h.bridge.power_state(), PowerState::On);

    // Radio state was lost with the reset
    h.bridge.handle_request(Request::Socket {
        xid: 9,
        domain: AF_INET,
        ty: crate::SOCK_DGRAM,
        protocol: 0,
    });
    h.expect_ack(9, -ENETDOWN);
}

#[test]
fn unknown_handle_is_ebadf() {
    let _guard = subscribe();
    let mut h = Harness::new();
    h.power_on_radio();
    h.bridge.handle_request(Request::Connect {
        xid: 1,
        usockid: SocketHandle(42),
        addr: addr(),
    });
    h.expect_ack(1, -EBADF);
    h.bridge.handle_request(Request::Close {
        xid: 2,
        usockid: SocketHandle(42),
    });
    h.expect_ack(2, -EBADF);
    assert_eq!(h.bridge.in_flight(), 0);
}

#[test]
fn close_discards_the_reply_of_an_abandoned_request() {
    let _guard = subscribe();
    let mut h = Harness::new();
    h.power_on_radio();
    let s = h.dgram_socket(1, 5);
    h.bridge.handle_request(Request::SendTo {
        xid: 2,
        usockid: s,
        flags: 0,
        addr: Some(addr()),
        data: Bytes::from_static(b"x"),
    });
    h.bridge.handle_request(Request::Close { xid: 3, usockid: s });
    h.expect_no_reply();
    assert_eq!(h.bridge.socket_state(s), Some(SocketState::Closing));

    // The abandoned sendto completes into silence
    h.complete_cmd(ApiId::SendTo, result_of(1));
    h.expect_no_reply();

    h.complete_cmd(ApiId::SocketClose, ok_result());
    h.expect_ack(3, 0);
    assert_eq!(h.bridge.socket_state(s), None);
}

#[test]
fn sendto_validation() {
    let _guard = subscribe();
    let mut h = Harness::new();
    h.power_on_radio();
    let d = h.dgram_socket(1, 5);
    let s = h.stream_socket(2);

    let big = BytesMut::zeroed(2000).freeze();
    h.bridge.handle_request(Request::SendTo {
        xid: 3,
        usockid: d,
        flags: 0,
        addr: Some(addr()),
        data: big,
    });
    h.expect_ack(3, -EMSGSIZE);

    // Unconnected datagram send needs a destination
    h.bridge.handle_request(Request::SendTo {
        xid: 4,
        usockid: d,
        flags: 0,
        addr: None,
        data: Bytes::from_static(b"x"),
    });
    h.expect_ack(4, -EDESTADDRREQ);

    // Unconnected stream send is refused outright
    h.bridge.handle_request(Request::SendTo {
        xid: 5,
        usockid: s,
        flags: 0,
        addr: None,
        data: Bytes::from_static(b"x"),
    });
    h.expect_ack(5, -ENOTCONN);
}

#[test]
fn select_snapshot_fires_events_and_rearms() {
    let _guard = subscribe();
    let mut h = Harness::new();
    h.power_on_radio();
    let s = h.dgram_socket(1, 5);
    h.complete_cmd(
        ApiId::Select,
        CommandReply::Select {
            result: 1,
            errcode: 0,
            readable: 1 << 5,
            writable: 0,
        },
    );
    assert_matches!(
        h.expect_reply(),
        Reply::Event { usockid, events } if usockid == s && events.contains(SocketEvents::RECVFROM_AVAIL)
    );
    // Re-armed with the socket in the watch masks
    let sent = &h.bridge.device().sent;
    let select = sent
        .iter()
        .find(|c| c.api() == ApiId::Select)
        .expect("select re-armed");
    assert_matches!(
        select.args(),
        CommandArgs::Select { read_set, .. } if read_set & (1 << 5) != 0
    );

    // An unchanged snapshot does not re-fire the event
    h.complete_cmd(
        ApiId::Select,
        CommandReply::Select {
            result: 1,
            errcode: 0,
            readable: 1 << 5,
            writable: 0,
        },
    );
    h.expect_no_reply();

    // Reading consumes the readiness flag
    h.bridge.handle_request(Request::RecvFrom {
        xid: 2,
        usockid: s,
        flags: 0,
        max_buflen: 128,
    });
    h.complete_cmd(
        ApiId::RecvFrom,
        CommandReply::Recv {
            result: 3,
            errcode: 0,
            addr: Some(addr()),
            data: Bytes::from_static(b"abc"),
        },
    );
    assert_matches!(
        h.expect_reply(),
        Reply::DataAck {
            xid: 2,
            result: 3,
            data: AckData::AddrData { .. },
        }
    );
    // The next identical snapshot fires again
    h.complete_cmd(
        ApiId::Select,
        CommandReply::Select {
            result: 1,
            errcode: 0,
            readable: 1 << 5,
            writable: 0,
        },
    );
    assert_matches!(h.expect_reply(), Reply::Event { .. });
}

#[test]
fn accept_spawns_a_connected_context() {
    let _guard = subscribe();
    let mut h = Harness::new();
    h.power_on_radio();
    let s = h.stream_socket(1);
    h.bridge.handle_request(Request::Bind {
        xid: 2,
        usockid: s,
        addr: addr(),
    });
    h.complete_cmd(ApiId::SocketNew, result_of(7));
    h.complete_cmd(ApiId::Fcntl, ok_result());
    h.complete_cmd(ApiId::Bind, ok_result());
    h.expect_ack(2, 0);
    h.bridge.handle_request(Request::Listen {
        xid: 3,
        usockid: s,
        backlog: 4,
    });
    h.complete_cmd(ApiId::Listen, ok_result());
    h.expect_ack(3, 0);

    h.bridge.handle_request(Request::Accept { xid: 4, usockid: s });
    h.complete_cmd(
        ApiId::Accept,
        CommandReply::SockName {
            result: 9,
            errcode: 0,
            addr: Some(addr()),
        },
    );
    let accepted = match h.expect_reply() {
        Reply::DataAck {
            xid: 4,
            result,
            data: AckData::Addr(_),
        } => SocketHandle(result as usize),
        other => panic!("expected accept data ack, got {other:?}"),
    };
    assert_ne!(accepted, s);
    assert_eq!(
        h.bridge.socket_state(accepted),
        Some(SocketState::Connected)
    );
    assert_eq!(h.bridge.socket_state(s), Some(SocketState::Opened));
}

#[test]
fn sms_report_read_and_reopen() {
    let _guard = subscribe();
    let mut h = Harness::new();
    h.power_on_radio();
    h.bridge.handle_request(ioctl(
        1,
        IoctlRequest::Event(EventCtl {
            events: EventCtl::SMS,
        }),
    ));
    h.expect_ack(1, 0);
    h.bridge
        .handle_request(ioctl(2, IoctlRequest::Vendor(VendorRequest::Sms(SmsRequest::Init))));
    h.complete_cmd(ApiId::SmsInit, ok_result());
    h.expect_ack(2, 0);
    assert_eq!(h.bridge.sms_state(), SmsState::WaitMsg);

    // Reading before anything arrived is a retry
    h.bridge
        .handle_request(ioctl(3, IoctlRequest::Vendor(VendorRequest::Sms(SmsRequest::Read))));
    h.expect_ack(3, -EAGAIN);

    h.complete_cmd(
        ApiId::SmsReportRecv,
        CommandReply::SmsReport(SmsReport {
            index: 1,
            ref_id: 0x41,
            seq: 1,
            max_seq: 1,
            declared_total: 5,
            data: Bytes::from_static(b"hello"),
        }),
    );
    h.expect_no_reply();
    assert_eq!(h.bridge.sms_state(), SmsState::ReadReady);
    // The report container went straight back out
    assert!(h.bridge.device().sent_apis().contains(&ApiId::SmsReportRecv));

    h.bridge
        .handle_request(ioctl(4, IoctlRequest::Vendor(VendorRequest::Sms(SmsRequest::Read))));
    assert_matches!(
        h.expect_reply(),
        Reply::DataAck {
            xid: 4,
            result: 5,
            data: AckData::Sms(data),
        } if data == Bytes::from_static(b"hello")
    );
    // The reopen flush runs behind the ack
    assert_eq!(h.bridge.sms_state(), SmsState::Reopen);
    h.complete_cmd(ApiId::SmsFin, ok_result());
    h.complete_cmd(ApiId::SmsInit, ok_result());
    assert_eq!(h.bridge.sms_state(), SmsState::WaitMsg);
}

#[test]
fn concat_sms_assembles_across_reports() {
    let _guard = subscribe();
    let mut h = Harness::new();
    h.power_on_radio();
    h.bridge.handle_request(ioctl(
        1,
        IoctlRequest::Event(EventCtl {
            events: EventCtl::SMS,
        }),
    ));
    h.expect_ack(1, 0);
    h.bridge
        .handle_request(ioctl(2, IoctlRequest::Vendor(VendorRequest::Sms(SmsRequest::Init))));
    h.complete_cmd(ApiId::SmsInit, ok_result());
    h.expect_ack(2, 0);

    for (seq, data, total) in [(1, &b"aa"[..], 0), (2, &b"bb"[..], 0), (3, &b"c"[..], 5)] {
        h.complete_cmd(
            ApiId::SmsReportRecv,
            CommandReply::SmsReport(SmsReport {
                index: 7,
                ref_id: 0x40 + seq as u16,
                seq,
                max_seq: 3,
                declared_total: total,
                data: Bytes::copy_from_slice(data),
            }),
        );
    }
    assert_eq!(h.bridge.sms_state(), SmsState::ReadReady);
    h.bridge
        .handle_request(ioctl(3, IoctlRequest::Vendor(VendorRequest::Sms(SmsRequest::Read))));
    assert_matches!(
        h.expect_reply(),
        Reply::DataAck {
            xid: 3,
            result: 5,
            data: AckData::Sms(data),
        } if data == Bytes::from_static(b"aabbc")
    );
}

#[test]
fn sms_size_desync_forces_modem_reset() {
    let _guard = subscribe();
    let mut h = Harness::new();
    h.power_on_radio();
    h.bridge.handle_request(ioctl(
        1,
        IoctlRequest::Event(EventCtl {
            events: EventCtl::SMS,
        }),
    ));
    h.expect_ack(1, 0);
    h.bridge
        .handle_request(ioctl(2, IoctlRequest::Vendor(VendorRequest::Sms(SmsRequest::Init))));
    h.complete_cmd(ApiId::SmsInit, ok_result());
    h.expect_ack(2, 0);
    let resets_before = h.bridge.device().resets;

    h.complete_cmd(
        ApiId::SmsReportRecv,
        CommandReply::SmsReport(SmsReport {
            index: 1,
            ref_id: 0x41,
            seq: 1,
            max_seq: 1,
            declared_total: 99,
            data: Bytes::from_static(b"hello"),
        }),
    );
    assert_eq!(h.bridge.device().resets, resets_before + 1);

    // The reset event lands on the next drain; the engine renegotiates and
    // re-arms the subscribed report container.
    h.bridge.process_events();
    assert_eq!(h.bridge.power_state(), PowerState::On);
    assert_eq!(h.bridge.sms_state(), SmsState::Uninit);
    assert!(h.bridge.device().sent_apis().contains(&ApiId::SmsReportRecv));
}

fn fw_header_bytes(body_len: u32) -> Bytes {
    let mut raw = BytesMut::with_capacity(FW_HEADER_LEN);
    raw.put_slice(&FW_MAGIC);
    raw.put_u32_le(body_len);
    let mut ver = [0u8; 32];
    ver[..12].copy_from_slice(b"RK_03_02_000");
    raw.put_slice(&ver);
    raw.resize(FW_HEADER_LEN, 0);
    raw.freeze()
}

#[test]
fn fw_update_inject_verify_execute() {
    let _guard = subscribe();
    let mut h = Harness::new();
    h.power_on();
    let header = fw_header_bytes(100);
    h.bridge.handle_request(ioctl(
        1,
        IoctlRequest::FwUpdate(FwUpdateRequest::InjectHeader(header)),
    ));
    h.complete_cmd(ApiId::FwInjectHeader, ok_result());
    h.expect_ack(1, FW_HEADER_LEN as i32);

    let body = BytesMut::zeroed(100).freeze();
    h.bridge.handle_request(ioctl(
        2,
        IoctlRequest::FwUpdate(FwUpdateRequest::InjectBody(body)),
    ));
    h.complete_cmd(ApiId::FwInjectBody, ok_result());
    h.expect_ack(2, 100);

    h.bridge
        .handle_request(ioctl(3, IoctlRequest::FwUpdate(FwUpdateRequest::GetInjected)));
    h.complete_cmd(
        ApiId::FwGetInjected,
        CommandReply::Injected {
            result: 0,
            errcode: 0,
            injected: FW_HEADER_LEN as u32 + 100,
        },
    );
    assert_matches!(
        h.expect_reply(),
        Reply::DataAck {
            xid: 3,
            result: 0,
            data: AckData::Injected(n),
        } if n == FW_HEADER_LEN as u32 + 100
    );

    h.bridge
        .handle_request(ioctl(4, IoctlRequest::FwUpdate(FwUpdateRequest::Execute)));
    h.complete_cmd(ApiId::FwExecute, ok_result());
    h.expect_ack(4, 0);
}

#[test]
fn fw_injected_count_desync_forces_reset() {
    let _guard = subscribe();
    let mut h = Harness::new();
    h.power_on();
    h.bridge.handle_request(ioctl(
        1,
        IoctlRequest::FwUpdate(FwUpdateRequest::InjectHeader(fw_header_bytes(100))),
    ));
    h.complete_cmd(ApiId::FwInjectHeader, ok_result());
    h.expect_ack(1, FW_HEADER_LEN as i32);
    let resets_before = h.bridge.device().resets;

    h.bridge
        .handle_request(ioctl(2, IoctlRequest::FwUpdate(FwUpdateRequest::GetInjected)));
    h.complete_cmd(
        ApiId::FwGetInjected,
        CommandReply::Injected {
            result: 0,
            errcode: 0,
            injected: 17,
        },
    );
    h.expect_ack(2, -EIO);
    assert_eq!(h.bridge.device().resets, resets_before + 1);
}

#[test]
fn premature_fw_execute_refused() {
    let _guard = subscribe();
    let mut h = Harness::new();
    h.power_on();
    h.bridge
        .handle_request(ioctl(1, IoctlRequest::FwUpdate(FwUpdateRequest::Execute)));
    h.expect_ack(1, -EPERM);
    h.bridge.handle_request(ioctl(
        2,
        IoctlRequest::FwUpdate(FwUpdateRequest::InjectBody(Bytes::from_static(b"x"))),
    ));
    h.expect_ack(2, -EPERM);
}

#[test]
fn resume_gates_requests_until_confirmed() {
    let _guard = subscribe();
    let mut h = Harness::new();
    h.bridge
        .handle_request(ioctl(1, IoctlRequest::Power(PowerRequest::Resume)));
    h.expect_no_reply();

    // Everything but power control is refused mid-resume
    h.bridge.handle_request(Request::Socket {
        xid: 2,
        domain: AF_INET,
        ty: SOCK_STREAM,
        protocol: 0,
    });
    h.expect_ack(2, -EAGAIN);
    h.bridge.handle_request(ioctl(3, IoctlRequest::GetVersion));
    h.expect_ack(3, -EAGAIN);

    h.complete_cmd(ApiId::Resume, ok_result());
    h.expect_ack(1, 0);
    assert_eq!(h.bridge.power_state(), PowerState::On);
    // No bootstrap negotiation on the resume path
    assert!(h.bridge.device().at_sets.is_empty());
    h.bridge.handle_request(ioctl(4, IoctlRequest::GetVersion));
    h.expect_no_reply();
    assert!(h.bridge.device().sent_apis().contains(&ApiId::GetVersion));
}

#[test]
fn version_drives_lwm2m_support() {
    let _guard = subscribe();
    let mut h = Harness::new();
    h.power_on();
    // Support is unknown before a version query
    h.bridge
        .handle_request(ioctl(1, IoctlRequest::Lwm2m(Lwm2mRequest::IsSupported)));
    h.expect_ack(1, -EAGAIN);

    h.bridge.handle_request(ioctl(2, IoctlRequest::GetVersion));
    h.complete_cmd(
        ApiId::GetVersion,
        CommandReply::Version {
            result: 0,
            errcode: 0,
            version: "RK_03_02_000".into(),
        },
    );
    assert_matches!(
        h.expect_reply(),
        Reply::DataAck {
            xid: 2,
            data: AckData::Version(v),
            ..
        } if v == "RK_03_02_000"
    );
    h.bridge
        .handle_request(ioctl(3, IoctlRequest::Lwm2m(Lwm2mRequest::IsSupported)));
    assert_matches!(
        h.expect_reply(),
        Reply::DataAck {
            xid: 3,
            data: AckData::Supported(true),
            ..
        }
    );
    h.bridge
        .handle_request(ioctl(4, IoctlRequest::Lwm2m(Lwm2mRequest::Enable(true))));
    h.complete_cmd(ApiId::Lwm2mEnable, ok_result());
    h.expect_ack(4, 0);
}

#[test]
fn refused_send_is_nacked_and_reclaimed() {
    let _guard = subscribe();
    let mut h = Harness::new();
    h.power_on_radio();
    let s = h.dgram_socket(1, 5);
    let in_flight = h.bridge.in_flight();
    h.bridge.device_mut().fail_next_send = Some(SendFailureKind::Rejected);
    h.bridge.handle_request(Request::SendTo {
        xid: 2,
        usockid: s,
        flags: 0,
        addr: Some(addr()),
        data: Bytes::from_static(b"x"),
    });
    h.expect_ack(2, -EIO);
    assert_eq!(h.bridge.in_flight(), in_flight);
    // The outstanding slot was released; the next request is not gated
    h.bridge.handle_request(Request::SendTo {
        xid: 3,
        usockid: s,
        flags: 0,
        addr: Some(addr()),
        data: Bytes::from_static(b"x"),
    });
    h.expect_no_reply();
    h.complete_cmd(ApiId::SendTo, result_of(1));
    h.expect_ack(3, 1);
}

#[test]
fn shutdown_and_names_on_a_connected_stream() {
    let _guard = subscribe();
    let mut h = Harness::new();
    h.power_on_radio();
    let s = h.stream_socket(1);

    // Peer name before connecting is refused
    h.bridge
        .handle_request(Request::GetPeerName { xid: 2, usockid: s });
    h.expect_ack(2, -ENOTCONN);
    // Shutdown with no modem socket is trivially done
    h.bridge.handle_request(Request::Shutdown {
        xid: 3,
        usockid: s,
        how: crate::ShutdownHow::Both,
    });
    h.expect_ack(3, 0);

    h.bridge.handle_request(Request::Connect {
        xid: 4,
        usockid: s,
        addr: addr(),
    });
    h.complete_cmd(ApiId::SocketNew, result_of(7));
    h.complete_cmd(ApiId::Fcntl, ok_result());
    h.complete_cmd(ApiId::Connect, ok_result());
    h.expect_ack(4, 0);

    h.bridge
        .handle_request(Request::GetSockName { xid: 5, usockid: s });
    h.complete_cmd(
        ApiId::GetSockName,
        CommandReply::SockName {
            result: 0,
            errcode: 0,
            addr: Some(addr()),
        },
    );
    assert_matches!(
        h.expect_reply(),
        Reply::DataAck {
            xid: 5,
            result: 0,
            data: AckData::Addr(_),
        }
    );

    h.bridge.handle_request(Request::Shutdown {
        xid: 6,
        usockid: s,
        how: crate::ShutdownHow::Write,
    });
    h.complete_cmd(ApiId::Shutdown, ok_result());
    h.expect_ack(6, 0);
    assert_eq!(h.bridge.socket_state(s), Some(SocketState::Connected));
}

#[test]
fn power_cycle_reclaims_armed_containers() {
    let _guard = subscribe();
    let mut h = Harness::new();
    h.power_on_radio();
    h.dgram_socket(1, 5);
    // The armed readiness snapshot holds one pool slot
    assert_eq!(h.bridge.in_flight(), 1);

    h.bridge
        .handle_request(ioctl(2, IoctlRequest::Power(PowerRequest::Off)));
    h.drain();
    assert_eq!(h.bridge.in_flight(), 0);

    // The pool survives repeated cycles
    h.power_on_radio();
    let s = h.dgram_socket(3, 6);
    assert_eq!(h.bridge.socket_state(s), Some(SocketState::Opened));
    assert_eq!(h.bridge.in_flight(), 1);
}

#[test]
fn reset_frees_a_closing_socket() {
    let _guard = subscribe();
    let mut h = Harness::new();
    h.power_on_radio();
    let s = h.dgram_socket(1, 5);
    h.bridge.handle_request(Request::Close { xid: 2, usockid: s });
    h.expect_no_reply();
    assert_eq!(h.bridge.socket_state(s), Some(SocketState::Closing));

    h.bridge.device_mut().reset();
    h.bridge.process_events();
    // The modem side is gone; the interrupted close counts as done and the
    // slot does not linger
    let replies = h.drain();
    assert!(replies.contains(&Reply::Ack { xid: 2, result: 0 }));
    assert_eq!(h.bridge.socket_state(s), None);
    assert_eq!(h.bridge.open_sockets(), 0);
}

#[test]
fn refused_eager_open_discards_the_context() {
    let _guard = subscribe();
    let mut h = Harness::new();
    h.power_on_radio();
    h.bridge.device_mut().fail_next_send = Some(SendFailureKind::Rejected);
    h.bridge.handle_request(Request::Socket {
        xid: 1,
        domain: AF_INET,
        ty: crate::SOCK_DGRAM,
        protocol: 0,
    });
    h.expect_ack(1, -EIO);
    // The proxy never learned a handle, so no entry may remain
    assert_eq!(h.bridge.open_sockets(), 0);
    assert_eq!(h.bridge.in_flight(), 0);

    let s = h.dgram_socket(2, 5);
    assert_eq!(h.bridge.socket_state(s), Some(SocketState::Opened));
}

#[test]
fn deferred_sms_reopen_retries_after_a_drain() {
    let _guard = subscribe();
    let mut cfg = crate::BridgeConfig::default();
    cfg.containers(3);
    let mut h = Harness::with_config(cfg);
    h.power_on_radio();
    h.bridge.handle_request(ioctl(
        1,
        IoctlRequest::Event(EventCtl {
            events: EventCtl::SMS,
        }),
    ));
    h.expect_ack(1, 0);
    h.bridge
        .handle_request(ioctl(2, IoctlRequest::Vendor(VendorRequest::Sms(SmsRequest::Init))));
    h.complete_cmd(ApiId::SmsInit, ok_result());
    h.expect_ack(2, 0);
    h.complete_cmd(
        ApiId::SmsReportRecv,
        CommandReply::SmsReport(SmsReport {
            index: 1,
            ref_id: 0x41,
            seq: 1,
            max_seq: 1,
            declared_total: 5,
            data: Bytes::from_static(b"hello"),
        }),
    );
    assert_eq!(h.bridge.sms_state(), SmsState::ReadReady);

    // Fill the pool: report + select + one sendto
    let a = h.dgram_socket(3, 5);
    h.bridge.handle_request(Request::SendTo {
        xid: 4,
        usockid: a,
        flags: 0,
        addr: Some(addr()),
        data: Bytes::from_static(b"x"),
    });
    h.expect_no_reply();
    assert_eq!(h.bridge.in_flight(), 3);

    // The read is answered, but the reopen flush has no container yet
    h.bridge
        .handle_request(ioctl(5, IoctlRequest::Vendor(VendorRequest::Sms(SmsRequest::Read))));
    assert_matches!(
        h.expect_reply(),
        Reply::DataAck {
            xid: 5,
            result: 5,
            data: AckData::Sms(_),
        }
    );
    assert_eq!(h.bridge.sms_state(), SmsState::Reopen);
    assert!(!h.bridge.device().sent_apis().contains(&ApiId::SmsFin));

    // A completion frees a slot and the flush goes out on the same drain
    h.complete_cmd(ApiId::SendTo, result_of(1));
    h.expect_ack(4, 1);
    assert!(h.bridge.device().sent_apis().contains(&ApiId::SmsFin));
    h.complete_cmd(ApiId::SmsFin, ok_result());
    h.complete_cmd(ApiId::SmsInit, ok_result());
    assert_eq!(h.bridge.sms_state(), SmsState::WaitMsg);
}

#[test]
fn power_off_aborts_without_bootstrap() {
    let _guard = subscribe();
    let mut h = Harness::new();
    h.power_on_radio();
    let s = h.dgram_socket(1, 5);
    let resets = h.bridge.device().resets;
    h.bridge
        .handle_request(ioctl(2, IoctlRequest::Power(PowerRequest::Off)));
    let replies = h.drain();
    assert!(replies.contains(&Reply::Ack { xid: 2, result: 0 }));
    assert!(replies.contains(&Reply::Event {
        usockid: s,
        events: SocketEvents::ABORT
    }));
    assert_eq!(h.bridge.power_state(), PowerState::Off);
    assert_eq!(h.bridge.device().resets, resets);
    assert_eq!(h.bridge.device().power.last(), Some(&PowerCmd::Off));
}
