mod common;

mod deploy;
mod process;
mod rpc;

use crate::common::device::{SimDevice, SimState};
use crate::common::{test_config, wait_until};
use bytes::Bytes;
use mfdbg::wire::{Command, Packet};
use mfdbg::{Engine, EngineListener, EngineState, Error};
use serial_test::serial;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

#[test]
#[serial]
fn test_engine_lifecycle() {
    let (_device, host) = SimDevice::start(SimState::default());
    let engine = Engine::new(Box::new(host), test_config());
    assert!(matches!(engine.conditions(), Err(Error::NotStarted)));

    engine.start().unwrap();
    assert!(matches!(engine.start(), Err(Error::AlreadyStarted)));
    assert_eq!(engine.state(), EngineState::Started);

    engine.begin_stop().unwrap();
    assert!(matches!(engine.conditions(), Err(Error::ShuttingDown)));
    engine.abort_stop().unwrap();
    assert!(engine.conditions().unwrap().is_some());

    engine.dispose().unwrap();
    assert_eq!(engine.state(), EngineState::Disposed);
    assert!(engine.capabilities().is_none());
}

#[test]
#[serial]
fn test_engine_stop_releases_pending_request() {
    device_env!(SimState::default(), engine, device, {
        device.state().silent = true;
        let waiter = {
            let engine = engine.clone();
            std::thread::spawn(move || engine.conditions())
        };
        assert!(wait_until(Duration::from_secs(1), || {
            engine.pending_requests() == 1
        }));
        engine.stop().unwrap();
        assert!(matches!(waiter.join().unwrap(), Ok(None)));
    });
}

#[derive(Debug, PartialEq)]
enum Seen {
    Noise(Vec<u8>),
    Message(String),
    Command(Command),
}

#[derive(Default)]
struct Recorder {
    seen: Mutex<Vec<Seen>>,
}

impl EngineListener for Recorder {
    fn on_command(&self, _: &Engine, packet: &Packet) -> anyhow::Result<()> {
        self.seen.lock().unwrap().push(Seen::Command(packet.cmd()));
        Ok(())
    }

    fn on_message(&self, _: &Engine, text: &str) -> anyhow::Result<()> {
        self.seen.lock().unwrap().push(Seen::Message(text.to_string()));
        Ok(())
    }

    fn on_noise(&self, _: &Engine, data: &[u8]) -> anyhow::Result<()> {
        self.seen.lock().unwrap().push(Seen::Noise(data.to_vec()));
        Ok(())
    }
}

struct Faulty;

impl EngineListener for Faulty {
    fn on_command(&self, _: &Engine, _: &Packet) -> anyhow::Result<()> {
        anyhow::bail!("listener fail")
    }

    fn on_message(&self, _: &Engine, _: &str) -> anyhow::Result<()> {
        panic!("listener panic")
    }
}

#[test]
#[serial]
fn test_dispatch_order_and_faulty_listener() {
    device_env!(SimState::default(), engine, device, {
        let faulty = Arc::new(Faulty);
        let recorder = Arc::new(Recorder::default());
        let faulty_weak: Weak<dyn EngineListener> = Arc::<Faulty>::downgrade(&faulty);
        let recorder_weak: Weak<dyn EngineListener> = Arc::<Recorder>::downgrade(&recorder);
        engine.add_listener(faulty_weak);
        engine.add_listener(recorder_weak);

        device.send_raw(b"boot log\n");
        device.send(Command::MESSAGE, Bytes::from_static(b"hello\0"));
        device.send(Command::PROGRAM_EXIT, Bytes::new());
        assert!(wait_until(Duration::from_secs(1), || {
            recorder.seen.lock().unwrap().len() == 3
        }));

        assert_eq!(
            *recorder.seen.lock().unwrap(),
            vec![
                Seen::Noise(b"boot log\n".to_vec()),
                Seen::Message("hello".to_string()),
                Seen::Command(Command::PROGRAM_EXIT),
            ]
        );
        // pipeline survives both failures
        assert!(engine.conditions().unwrap().is_some());
    });
}
