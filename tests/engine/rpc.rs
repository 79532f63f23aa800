use crate::common::device::SimState;
use crate::common::wait_until;
use crate::device_env;
use bytes::Bytes;
use mfdbg::rpc::{EndPoint, Fault, ServerObject};
use mfdbg::wire::{Command, Endian, PayloadReader, PayloadWriter};
use mfdbg::{Error, Rpc};
use serial_test::serial;
use std::time::{Duration, Instant};

const LOCAL: EndPoint = EndPoint::new(0x10, 1);
const REMOTE: EndPoint = EndPoint::new(0x20, 1);

#[test]
#[serial]
fn test_call_round_trip() {
    let state = SimState {
        echo_calls: true,
        ..SimState::default()
    };
    device_env!(state, engine, device, {
        assert!(engine.connect(1, 200, false, None).unwrap());
        let rpc = Rpc::new(&engine).unwrap();
        rpc.register(LOCAL, None).unwrap();

        let echo: Vec<u32> = rpc
            .call(LOCAL, REMOTE, "Echo", vec![1, 2, 3], Duration::from_secs(2))
            .unwrap();
        assert_eq!(echo, vec![1, 2, 3]);
        assert_eq!(device.state().count(Command::MESSAGING_SEND), 1);
    });
}

#[test]
#[serial]
fn test_register() {
    device_env!(SimState::default(), engine, device, {
        assert!(engine.connect(1, 200, false, None).unwrap());
        let rpc = Rpc::new(&engine).unwrap();

        rpc.register(LOCAL, None).unwrap();
        assert!(matches!(
            rpc.register(LOCAL, None),
            Err(Error::EndpointAlreadyRegistered(0x10, 1))
        ));

        device.state().accept_messaging = false;
        assert!(matches!(
            rpc.register(REMOTE, None),
            Err(Error::EndpointRejected(0x20, 1))
        ));
        assert_eq!(rpc.endpoints(), vec![LOCAL]);

        // unknown remote endpoint is not called at all
        assert!(matches!(
            rpc.call::<_, u32>(LOCAL, REMOTE, "Echo", 1, Duration::from_secs(1)),
            Err(Error::EndpointNotFound(0x20, 1))
        ));
        assert_eq!(device.state().count(Command::MESSAGING_SEND), 0);
    });
}

#[test]
#[serial]
fn test_deregister_cancels_outstanding_calls() {
    device_env!(SimState::default(), engine, device, {
        assert!(engine.connect(1, 200, false, None).unwrap());
        let rpc = Rpc::new(&engine).unwrap();
        rpc.register(LOCAL, None).unwrap();

        let started = Instant::now();
        let calls: Vec<_> = (0..2)
            .map(|i| {
                let rpc = rpc.clone();
                std::thread::spawn(move || {
                    rpc.call::<_, u32>(LOCAL, REMOTE, "Echo", i, Duration::from_secs(10))
                })
            })
            .collect();
        assert!(wait_until(Duration::from_secs(2), || {
            device.state().count(Command::MESSAGING_SEND) == 2
        }));

        assert!(rpc.deregister(LOCAL));
        assert!(!rpc.deregister(LOCAL));
        for call in calls {
            assert!(matches!(
                call.join().unwrap(),
                Err(Error::EndpointNotFound(0x10, 1))
            ));
        }
        assert!(started.elapsed() < Duration::from_secs(5));
    });
}

#[test]
#[serial]
fn test_remote_fault() {
    let state = SimState {
        fault_calls: Some(("InvalidOperation".to_string(), "bad state".to_string())),
        ..SimState::default()
    };
    device_env!(state, engine, device, {
        assert!(engine.connect(1, 200, false, None).unwrap());
        let rpc = Rpc::new(&engine).unwrap();
        rpc.register(LOCAL, None).unwrap();

        let result = rpc.call::<_, u32>(LOCAL, REMOTE, "Echo", 1, Duration::from_secs(2));
        match result {
            Err(Error::RemoteFault { type_name, message }) => {
                assert_eq!(type_name, "InvalidOperation");
                assert_eq!(message, "bad state");
            }
            other => panic!("unexpected call outcome: {other:?}"),
        }
        assert_eq!(device.state().count(Command::MESSAGING_SEND), 1);
    });
}

fn inbound_call(seq: u32, to: EndPoint, method: &str, args: serde_json::Value) -> Bytes {
    let body = serde_json::json!({ "method": method, "args": args }).to_string();
    PayloadWriter::new(Endian::Little)
        .u32(seq)
        .u32(REMOTE.kind)
        .u32(REMOTE.id)
        .u32(to.kind)
        .u32(to.id)
        .blob(body.as_bytes())
        .finish()
}

/// Address and JSON body of a reply the host posted.
fn posted_reply(payload: Bytes) -> (u32, serde_json::Value) {
    let mut reader = PayloadReader::new(payload, Endian::Little, "reply");
    let seq = reader.u32().unwrap();
    reader.bytes(16).unwrap();
    let body = serde_json::from_slice(&reader.blob().unwrap()).unwrap();
    (seq, body)
}

#[test]
#[serial]
fn test_serve_inbound_call() {
    device_env!(SimState::default(), engine, device, {
        assert!(engine.connect(1, 200, false, None).unwrap());
        let rpc = Rpc::new(&engine).unwrap();
        let server =
            ServerObject::new().method("Add", |(a, b): (i64, i64)| Ok::<_, Fault>(a + b));
        rpc.register(LOCAL, Some(server)).unwrap();

        device.send(
            Command::MESSAGING_SEND,
            inbound_call(7, LOCAL, "Add", serde_json::json!([2, 3])),
        );

        assert!(wait_until(Duration::from_secs(2), || {
            device.state().replies.len() == 1
        }));
        let (seq, body) = posted_reply(device.state().replies[0].clone());
        assert_eq!(seq, 7);
        assert_eq!(body, serde_json::json!({ "Ok": 5 }));
    });
}

#[test]
#[serial]
fn test_call_to_unserved_endpoint_faults() {
    device_env!(SimState::default(), engine, device, {
        assert!(engine.connect(1, 200, false, None).unwrap());
        let rpc = Rpc::new(&engine).unwrap();
        rpc.register(LOCAL, None).unwrap();

        device.send(
            Command::MESSAGING_SEND,
            inbound_call(9, LOCAL, "Add", serde_json::json!([2, 3])),
        );

        assert!(wait_until(Duration::from_secs(2), || {
            device.state().replies.len() == 1
        }));
        let (seq, body) = posted_reply(device.state().replies[0].clone());
        assert_eq!(seq, 9);
        assert_eq!(body["Fault"]["type_name"], "EndpointNotServed");
    });
}
