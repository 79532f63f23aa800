//! Notification & dispatch pipeline.
//!
//! Single ordered worker: delivers async request completions, unsolicited device
//! commands, device messages, noise and rpc frames to engine listeners.
//! A failing or panicking listener is logged and never stops the pipeline.

use crate::engine::request::ReplyCallback;
use crate::engine::{Engine, Inner};
use crate::wire::Packet;
use bytes::Bytes;
use log::{debug, error};
use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::{Mutex, Weak};
use std::thread::JoinHandle;

pub(crate) enum Notification {
    Shutdown,
    /// Completion of an asynchronous request.
    Reply(ReplyCallback, Option<Packet>),
    /// Unsolicited device command.
    Command(Packet),
    /// Text sent by device program.
    Message(String),
    /// Bytes received outside of any packet.
    Noise(Bytes),
    /// Messaging query/send/reply frame.
    Rpc(Packet),
}

/// Subscriber of engine notifications. All methods are called from the dispatch thread,
/// one at a time and in arrival order.
pub trait EngineListener: Send + Sync {
    /// Unsolicited device command (breakpoint hit, program exit, etc.).
    fn on_command(&self, _engine: &Engine, _packet: &Packet) -> anyhow::Result<()> {
        Ok(())
    }

    /// Text message from device program.
    fn on_message(&self, _engine: &Engine, _text: &str) -> anyhow::Result<()> {
        Ok(())
    }

    /// Raw bytes received outside of packets.
    fn on_noise(&self, _engine: &Engine, _data: &[u8]) -> anyhow::Result<()> {
        Ok(())
    }

    /// Messaging frame addressed to rpc subsystem.
    fn on_rpc(&self, _engine: &Engine, _packet: &Packet) -> anyhow::Result<()> {
        Ok(())
    }

    /// Engine is stopping, called once from the stopping thread.
    fn on_shutdown(&self, _engine: &Engine) {}
}

pub(crate) struct Dispatcher {
    tx: Mutex<Option<Sender<Notification>>>,
}

impl Dispatcher {
    pub(crate) fn new() -> (Self, Receiver<Notification>) {
        let (tx, rx) = channel();
        (
            Self {
                tx: Mutex::new(Some(tx)),
            },
            rx,
        )
    }

    /// Queue notification. Return false if pipeline is already closed.
    pub(crate) fn post(&self, notification: Notification) -> bool {
        match self.tx.lock().unwrap().as_ref() {
            Some(tx) => tx.send(notification).is_ok(),
            None => false,
        }
    }

    /// Ask worker to exit and close the queue.
    pub(crate) fn close(&self) {
        if let Some(tx) = self.tx.lock().unwrap().take() {
            _ = tx.send(Notification::Shutdown);
        }
    }
}

pub(crate) fn spawn(inner: Weak<Inner>, rx: Receiver<Notification>) -> std::io::Result<JoinHandle<()>> {
    std::thread::Builder::new()
        .name("mfdbg-dispatch".to_string())
        .spawn(move || run(inner, rx))
}

fn run(inner: Weak<Inner>, rx: Receiver<Notification>) {
    while let Ok(notification) = rx.recv() {
        if matches!(notification, Notification::Shutdown) {
            break;
        }
        let Some(inner) = inner.upgrade() else {
            break;
        };
        let engine = Engine::from_inner(inner);
        deliver(&engine, notification);
    }
    debug!(target: "engine", "dispatch worker exit");
}

fn guarded(what: &str, f: impl FnOnce() -> anyhow::Result<()>) {
    match panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!(target: "engine", "{what} handler fail: {e:#}"),
        Err(payload) => {
            let msg = payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_default();
            error!(target: "engine", "{what} handler panicked: {msg}");
        }
    }
}

fn deliver(engine: &Engine, notification: Notification) {
    match notification {
        Notification::Shutdown => {}
        Notification::Reply(callback, reply) => guarded("reply", || {
            callback(reply);
            Ok(())
        }),
        Notification::Command(packet) => {
            for listener in engine.listeners() {
                guarded("command", || listener.on_command(engine, &packet));
            }
        }
        Notification::Message(text) => {
            for listener in engine.listeners() {
                guarded("message", || listener.on_message(engine, &text));
            }
        }
        Notification::Noise(data) => {
            for listener in engine.listeners() {
                guarded("noise", || listener.on_noise(engine, &data));
            }
        }
        Notification::Rpc(packet) => {
            for listener in engine.listeners() {
                guarded("rpc", || listener.on_rpc(engine, &packet));
            }
        }
    }
}
