//! Debugger engine.
//!
//! Engine owns a device transport and two background threads:
//! - reader - extracts packets from the byte stream, resolves pending requests,
//!   acknowledges device commands and drives the retry schedule of asynchronous requests
//! - dispatch - delivers notifications to engine listeners, see [`EngineListener`]
//!
//! Only one synchronous exchange may be in flight at a time, asynchronous
//! requests are unlimited.

pub mod capabilities;
pub mod conditions;
pub mod deploy;
mod dispatch;
pub mod request;

pub use capabilities::{CapabilityCategory, CapabilityFlags, ClrCapabilities};
pub use conditions::{ConnectionSource, DeviceState, ExecutionConditions, PingFlags, RebootKind};
pub use dispatch::EngineListener;
pub use request::{total_timeout, RequestHandle};

use crate::config::{EngineConfig, RetryPolicy};
use crate::error::Error;
use crate::transport::Transport;
use crate::wire::{Command, Endian, Frame, Packet, PacketAssembler, PacketFlags};
use crate::wire::{PayloadReader, PayloadWriter};
use crate::{muted_error, weak_error};
use bytes::Bytes;
use dispatch::{Dispatcher, Notification};
use log::{debug, info, warn};
use request::{PendingRequest, PendingRequests, SyncSlot};
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU64, Ordering};
use std::sync::mpsc::Receiver;
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use strum::IntoEnumIterator;
use strum_macros::Display;

const READ_BUFFER_SIZE: usize = 4096;
const BROKEN_LINK_BACKOFF: Duration = Duration::from_millis(20);

/// Engine lifecycle.
///
/// Monotonic except `Stopping -> Resume -> Started`, an edge that aborts an in-progress stop.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Display)]
pub enum EngineState {
    NotStarted,
    Starting,
    Started,
    Stopping,
    Resume,
    Stopped,
    Disposing,
    Disposed,
}

impl EngineState {
    fn can_transit(self, to: EngineState) -> bool {
        use EngineState::*;
        matches!(
            (self, to),
            (NotStarted, Starting)
                | (NotStarted, Disposing)
                | (Starting, Started)
                | (Starting, Stopped)
                | (Started, Stopping)
                | (Stopping, Resume)
                | (Resume, Started)
                | (Stopping, Stopped)
                | (Stopped, Disposing)
                | (Disposing, Disposed)
        )
    }
}

/// Result of the last ping exchange.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ConnectionInfo {
    /// `None` if device does not answer.
    pub source: Option<ConnectionSource>,
    pub flags: PingFlags,
    pub endian: Endian,
}

impl ConnectionInfo {
    pub fn is_connected(&self) -> bool {
        self.source.is_some()
    }
}

pub(crate) struct Inner {
    name: String,
    config: EngineConfig,
    state: Mutex<EngineState>,
    /// Set when stop begins, new requests are rejected.
    shutting_down: AtomicBool,
    /// Set when background threads must exit.
    halted: AtomicBool,
    writer: Mutex<Box<dyn Transport>>,
    /// Serializes synchronous round trips.
    exchange: Mutex<()>,
    pending: PendingRequests,
    seq: AtomicU16,
    handle_seq: AtomicU64,
    last_activity: Mutex<Instant>,
    frames_sent: AtomicU64,
    connection: RwLock<ConnectionInfo>,
    capabilities: Mutex<Option<ClrCapabilities>>,
    listeners: RwLock<Vec<Weak<dyn EngineListener>>>,
    dispatcher: Dispatcher,
    dispatch_rx: Mutex<Option<Receiver<Notification>>>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.halted.store(true, Ordering::SeqCst);
        if let Ok(writer) = self.writer.get_mut() {
            writer.close();
        }
    }
}

/// Handle to a debugger engine. Cheap to clone, all clones share one connection.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<Inner>,
}

impl Engine {
    pub fn new(transport: Box<dyn Transport>, config: EngineConfig) -> Self {
        let (dispatcher, rx) = Dispatcher::new();
        Self {
            inner: Arc::new(Inner {
                name: transport.name().to_string(),
                config,
                state: Mutex::new(EngineState::NotStarted),
                shutting_down: AtomicBool::new(false),
                halted: AtomicBool::new(false),
                writer: Mutex::new(transport),
                exchange: Mutex::new(()),
                pending: PendingRequests::default(),
                seq: AtomicU16::new(1),
                handle_seq: AtomicU64::new(1),
                last_activity: Mutex::new(Instant::now()),
                frames_sent: AtomicU64::new(0),
                connection: RwLock::new(ConnectionInfo::default()),
                capabilities: Mutex::new(None),
                listeners: RwLock::new(vec![]),
                dispatcher,
                dispatch_rx: Mutex::new(Some(rx)),
                threads: Mutex::new(vec![]),
            }),
        }
    }

    pub(crate) fn from_inner(inner: Arc<Inner>) -> Self {
        Self { inner }
    }

    /// Name of underlying transport.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    pub fn state(&self) -> EngineState {
        *self.inner.state.lock().unwrap()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.inner.shutting_down.load(Ordering::SeqCst)
    }

    /// Total number of frames written into transport (including retries and acknowledgements).
    pub fn frames_sent(&self) -> u64 {
        self.inner.frames_sent.load(Ordering::SeqCst)
    }

    /// Number of requests awaiting reply.
    pub fn pending_requests(&self) -> usize {
        self.inner.pending.len()
    }

    /// Subscribe to engine notifications. Engine holds a weak reference only,
    /// a dropped listener is forgotten silently.
    pub fn add_listener(&self, listener: Weak<dyn EngineListener>) {
        self.inner.listeners.write().unwrap().push(listener);
    }

    pub fn remove_listener(&self, listener: &Weak<dyn EngineListener>) {
        self.inner
            .listeners
            .write()
            .unwrap()
            .retain(|l| !Weak::ptr_eq(l, listener));
    }

    pub(crate) fn listeners(&self) -> Vec<Arc<dyn EngineListener>> {
        let mut listeners = self.inner.listeners.write().unwrap();
        listeners.retain(|l| l.strong_count() > 0);
        listeners.iter().filter_map(Weak::upgrade).collect()
    }

    fn transit(&self, to: EngineState) -> Result<EngineState, Error> {
        let mut state = self.inner.state.lock().unwrap();
        let from = *state;
        if !from.can_transit(to) {
            return Err(Error::InvalidStateTransition { from, to });
        }
        *state = to;
        debug!(target: "engine", "{}: {from} -> {to}", self.inner.name);
        Ok(from)
    }

    /// Open transport and spawn background threads.
    pub fn start(&self) -> Result<(), Error> {
        if self.state() == EngineState::Started {
            return Err(Error::AlreadyStarted);
        }
        self.transit(EngineState::Starting)?;
        match self.spawn_workers() {
            Ok(()) => {
                self.transit(EngineState::Started)?;
                info!(target: "engine", "{}: engine started", self.inner.name);
                Ok(())
            }
            Err(e) => {
                self.inner.shutting_down.store(true, Ordering::SeqCst);
                self.inner.halted.store(true, Ordering::SeqCst);
                self.inner.dispatcher.close();
                self.transit(EngineState::Stopped)?;
                Err(e)
            }
        }
    }

    fn spawn_workers(&self) -> Result<(), Error> {
        let reader = {
            let mut writer = self.inner.writer.lock().unwrap();
            writer.open()?;
            writer.try_clone()?
        };
        let rx = self
            .inner
            .dispatch_rx
            .lock()
            .unwrap()
            .take()
            .ok_or(Error::AlreadyStarted)?;

        let dispatch = dispatch::spawn(Arc::downgrade(&self.inner), rx)?;
        let weak = Arc::downgrade(&self.inner);
        let reader = thread::Builder::new()
            .name("mfdbg-reader".to_string())
            .spawn(move || reader_loop(weak, reader))?;

        self.inner.threads.lock().unwrap().extend([dispatch, reader]);
        Ok(())
    }

    /// Begin stop: new requests are rejected, outstanding requests still complete.
    pub fn begin_stop(&self) -> Result<(), Error> {
        self.transit(EngineState::Stopping)?;
        self.inner.shutting_down.store(true, Ordering::SeqCst);
        Ok(())
    }

    /// Abort stop started by [`Engine::begin_stop`].
    pub fn abort_stop(&self) -> Result<(), Error> {
        self.transit(EngineState::Resume)?;
        self.inner.shutting_down.store(false, Ordering::SeqCst);
        self.transit(EngineState::Started)?;
        Ok(())
    }

    /// Finish stop: cancel pending requests, notify listeners and shutdown threads.
    pub fn complete_stop(&self) -> Result<(), Error> {
        self.transit(EngineState::Stopped)?;

        for req in self.inner.pending.drain() {
            if let Some((callback, reply)) = req.complete(None) {
                self.inner
                    .dispatcher
                    .post(Notification::Reply(callback, reply));
            }
        }
        for listener in self.listeners() {
            listener.on_shutdown(self);
        }

        self.inner.halted.store(true, Ordering::SeqCst);
        self.inner.dispatcher.close();
        self.inner.writer.lock().unwrap().close();

        let current = thread::current().id();
        let threads = std::mem::take(&mut *self.inner.threads.lock().unwrap());
        for handle in threads {
            // stop may be requested from a listener running on the dispatch thread
            if handle.thread().id() != current {
                _ = handle.join();
            }
        }
        info!(target: "engine", "{}: engine stopped", self.inner.name);
        Ok(())
    }

    pub fn stop(&self) -> Result<(), Error> {
        self.begin_stop()?;
        self.complete_stop()
    }

    /// Stop engine if required and release cached device state.
    pub fn dispose(&self) -> Result<(), Error> {
        match self.state() {
            EngineState::Started => self.stop()?,
            EngineState::Stopping => self.complete_stop()?,
            _ => {}
        }
        self.transit(EngineState::Disposing)?;
        self.inner.capabilities.lock().unwrap().take();
        *self.inner.connection.write().unwrap() = ConnectionInfo::default();
        self.inner.listeners.write().unwrap().clear();
        self.transit(EngineState::Disposed)?;
        Ok(())
    }

    fn ensure_accepting(&self) -> Result<(), Error> {
        if self.is_shutting_down() {
            return Err(Error::ShuttingDown);
        }
        match self.state() {
            EngineState::Started | EngineState::Resume => Ok(()),
            EngineState::NotStarted | EngineState::Starting => Err(Error::NotStarted),
            _ => Err(Error::ShuttingDown),
        }
    }

    #[inline(always)]
    fn next_seq(&self) -> u16 {
        self.inner.seq.fetch_add(1, Ordering::SeqCst)
    }

    #[inline(always)]
    fn next_handle(&self) -> RequestHandle {
        RequestHandle(self.inner.handle_seq.fetch_add(1, Ordering::SeqCst))
    }

    fn write(&self, raw: &[u8]) -> Result<(), Error> {
        self.inner.writer.lock().unwrap().write(raw)?;
        self.inner.frames_sent.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    /// Blocking round trip. `Ok(None)` means no reply within the total timeout or cancellation.
    fn exchange(
        &self,
        cmd: Command,
        flags: PacketFlags,
        payload: Bytes,
        retries: u32,
        per_retry: Duration,
    ) -> Result<Option<Packet>, Error> {
        self.ensure_accepting()?;
        let _exchange = self.inner.exchange.lock().unwrap();

        let packet = Packet::new(cmd, self.next_seq(), flags, payload);
        let raw = packet.encode();
        let slot = Arc::new(SyncSlot::default());
        let handle = self.next_handle();
        self.inner.pending.push(PendingRequest::new_sync(
            handle,
            cmd,
            packet.header.seq,
            slot.clone(),
        ));

        let total = total_timeout(retries, per_retry);
        let started = Instant::now();
        if let Err(e) = self.write(&raw) {
            self.inner.pending.take(handle);
            return Err(e);
        }

        let mut retries_left = retries;
        loop {
            let elapsed = started.elapsed();
            if elapsed >= total {
                break;
            }
            if let Some(reply) = slot.wait(per_retry.min(total - elapsed)) {
                return Ok(reply);
            }
            if started.elapsed() >= total {
                break;
            }
            if retries_left > 0 {
                retries_left -= 1;
                debug!(target: "engine", "retry {cmd} (seq {}), {retries_left} left", packet.header.seq);
                weak_error!(self.write(&raw), "resend:");
            }
        }

        if self.inner.pending.take(handle).is_none() {
            // reply (or cancellation) arrived between timeout and removal
            return Ok(slot.wait(Duration::ZERO).flatten());
        }
        debug!(target: "engine", "no reply for {cmd} (seq {}) within {total:?}", packet.header.seq);
        Ok(None)
    }

    /// Send command and block until reply or total timeout.
    ///
    /// Returns `Ok(None)` when no reply arrives, or [`Error::CommunicationFailure`]
    /// if `throw_on_communication_failure` is configured.
    pub fn send_sync(
        &self,
        cmd: Command,
        flags: PacketFlags,
        payload: Bytes,
        retries: u32,
        timeout: Duration,
    ) -> Result<Option<Packet>, Error> {
        let reply = self.exchange(cmd, flags, payload, retries, timeout)?;
        if reply.is_none()
            && self.inner.config.throw_on_communication_failure
            && !self.is_shutting_down()
        {
            return Err(Error::CommunicationFailure(cmd));
        }
        Ok(reply)
    }

    /// Send command without blocking. `callback` runs on the dispatch thread with
    /// a reply or with `None` if request expired or was cancelled.
    pub fn send_async<F>(
        &self,
        cmd: Command,
        flags: PacketFlags,
        payload: Bytes,
        retries: u32,
        timeout: Duration,
        callback: F,
    ) -> Result<RequestHandle, Error>
    where
        F: FnOnce(Option<Packet>) + Send + 'static,
    {
        self.ensure_accepting()?;
        let packet = Packet::new(cmd, self.next_seq(), flags, payload);
        let raw = packet.encode();
        let handle = self.next_handle();
        self.inner.pending.push(PendingRequest::new_async(
            handle,
            &packet,
            raw.clone(),
            retries,
            timeout,
            Box::new(callback),
        ));
        if let Err(e) = self.write(&raw) {
            self.inner.pending.take(handle);
            return Err(e);
        }
        Ok(handle)
    }

    /// Cancel pending request, waiter receives no reply. Return false if request
    /// already completed.
    pub fn cancel(&self, handle: RequestHandle) -> bool {
        let Some(req) = self.inner.pending.take(handle) else {
            return false;
        };
        if let Some((callback, reply)) = req.complete(None) {
            self.inner
                .dispatcher
                .post(Notification::Reply(callback, reply));
        }
        true
    }

    /// Fire-and-forget command, no reply is expected.
    pub fn post(&self, cmd: Command, flags: PacketFlags, payload: Bytes) -> Result<(), Error> {
        self.ensure_accepting()?;
        let packet = Packet::new(cmd, self.next_seq(), flags, payload);
        self.write(&packet.encode())
    }

    /// Reply to a device-initiated command.
    pub fn reply(&self, request: &Packet, flags: PacketFlags, payload: Bytes) -> Result<(), Error> {
        let packet = Packet::reply_to(&request.header, self.next_seq(), flags, payload);
        self.write(&packet.encode())
    }

    /// Payload writer in device byte order.
    pub fn writer(&self) -> PayloadWriter {
        PayloadWriter::new(self.endian())
    }

    /// Payload reader in device byte order.
    pub fn reader(&self, payload: Bytes, what: &'static str) -> PayloadReader {
        PayloadReader::new(payload, self.endian(), what)
    }

    pub fn endian(&self) -> Endian {
        self.inner.connection.read().unwrap().endian
    }

    /// Synchronous request with the default retry policy.
    /// A negative acknowledgement is treated as no reply.
    pub fn request(&self, cmd: Command, payload: Bytes) -> Result<Option<Packet>, Error> {
        let reply = self.send_sync(
            cmd,
            PacketFlags::empty(),
            payload,
            self.inner.config.retries,
            self.inner.config.timeout(),
        )?;
        Ok(reply.filter(|r| {
            if r.is_nack() {
                debug!(target: "engine", "device rejects {cmd}");
            }
            !r.is_nack()
        }))
    }

    /// Same as [`Engine::request`] but returns a reader over reply payload.
    pub fn request_reader(
        &self,
        cmd: Command,
        payload: Bytes,
        what: &'static str,
    ) -> Result<Option<PayloadReader>, Error> {
        Ok(self
            .request(cmd, payload)?
            .map(|reply| self.reader(reply.payload, what)))
    }

    /// Request without a meaningful reply payload, `false` if device rejects or ignores it.
    pub fn request_ack(&self, cmd: Command, payload: Bytes) -> Result<bool, Error> {
        Ok(self.request(cmd, payload)?.is_some())
    }

    pub fn connection(&self) -> ConnectionInfo {
        *self.inner.connection.read().unwrap()
    }

    pub fn is_connected(&self) -> bool {
        self.connection().is_connected()
    }

    fn mark_disconnected(&self) {
        *self.inner.connection.write().unwrap() = ConnectionInfo::default();
    }

    /// Ping device.
    ///
    /// On the first successful connection to a TinyCLR (or when `force` is set) device
    /// capabilities are negotiated and cached. Return false if device does not answer or
    /// answers from a source other than `expected`.
    pub fn connect(
        &self,
        retries: u32,
        wait_ms: u64,
        force: bool,
        expected: Option<ConnectionSource>,
    ) -> Result<bool, Error> {
        // ping is always little-endian, device byte order is not known yet
        let payload = PayloadWriter::new(Endian::Little)
            .u32(ConnectionSource::Host.raw())
            .u32(0)
            .finish();
        let reply = self.exchange(
            Command::PING,
            PacketFlags::empty(),
            payload,
            retries,
            Duration::from_millis(wait_ms),
        )?;
        let Some(reply) = reply.filter(|r| !r.is_nack()) else {
            debug!(target: "engine", "{}: ping unanswered", self.inner.name);
            self.mark_disconnected();
            return Ok(false);
        };

        let mut reader = PayloadReader::new(reply.payload, Endian::Little, "ping");
        let source = ConnectionSource::from_raw(reader.u32()?);
        let flags = if reader.remaining() >= 4 {
            PingFlags::from_bits_retain(reader.u32()?)
        } else {
            PingFlags::empty()
        };
        let endian = if flags.contains(PingFlags::BIG_ENDIAN) {
            Endian::Big
        } else {
            Endian::Little
        };
        *self.inner.connection.write().unwrap() = ConnectionInfo {
            source: Some(source),
            flags,
            endian,
        };
        debug!(target: "engine", "{}: ping reply from {source}, flags {flags:?}", self.inner.name);

        if let Some(expected) = expected {
            if expected != source {
                info!(target: "engine", "{}: expect {expected} but {source} answers", self.inner.name);
                return Ok(false);
            }
        }

        if source == ConnectionSource::TinyClr {
            let mut caps = self.inner.capabilities.lock().unwrap();
            if force || caps.is_none() {
                *caps = Some(self.query_capabilities()?);
            }
        }
        Ok(true)
    }

    fn query_capabilities(&self) -> Result<ClrCapabilities, Error> {
        let mut caps = ClrCapabilities::default();
        for category in CapabilityCategory::iter() {
            let payload = self.writer().u32(category as u32).finish();
            match self.request_reader(Command::EXECUTION_QUERY_CAPABILITIES, payload, "capabilities")? {
                Some(mut reader) => {
                    weak_error!(caps.apply(category, &mut reader), "capabilities:");
                }
                None => debug!(target: "engine", "capability category {category} is not reported"),
            }
        }
        info!(target: "engine", "{}: device capabilities {:?}", self.inner.name, caps.flags);
        Ok(caps)
    }

    /// Cached device capabilities, `None` before the first connection to TinyCLR.
    pub fn capabilities(&self) -> Option<ClrCapabilities> {
        self.inner.capabilities.lock().unwrap().clone()
    }

    pub fn supports(&self, flag: CapabilityFlags) -> bool {
        self.inner
            .capabilities
            .lock()
            .unwrap()
            .as_ref()
            .map(|c| c.supports(flag))
            .unwrap_or_default()
    }

    /// Set and reset execution conditions. Return the resulting conditions,
    /// `None` if device does not answer.
    pub fn change_conditions(
        &self,
        set: ExecutionConditions,
        reset: ExecutionConditions,
    ) -> Result<Option<ExecutionConditions>, Error> {
        let payload = self.writer().u32(set.bits()).u32(reset.bits()).finish();
        let Some(mut reader) =
            self.request_reader(Command::EXECUTION_CHANGE_CONDITIONS, payload, "execution conditions")?
        else {
            return Ok(None);
        };
        Ok(Some(ExecutionConditions::from_bits_retain(reader.u32()?)))
    }

    /// Current execution conditions.
    pub fn conditions(&self) -> Result<Option<ExecutionConditions>, Error> {
        self.change_conditions(ExecutionConditions::empty(), ExecutionConditions::empty())
    }

    /// Reboot device and reconnect.
    ///
    /// CLR-only restart falls back to a hard reboot on devices without soft reboot capability.
    /// If `wait_for_initialize` is set, wait until device reports initialize state.
    pub fn reboot(&self, kind: RebootKind, wait_for_initialize: bool) -> Result<(), Error> {
        let kind = if kind == RebootKind::ClrOnly && !self.supports(CapabilityFlags::SOFT_REBOOT) {
            warn!(target: "engine", "{}: soft reboot is not supported, use hard reboot", self.inner.name);
            RebootKind::Hard
        } else {
            kind
        };
        let policy = match kind {
            RebootKind::ClrOnly => self.inner.config.reboot.soft,
            RebootKind::Hard | RebootKind::EnterBootloader => self.inner.config.reboot.hard,
        };

        info!(target: "engine", "{}: reboot ({kind})", self.inner.name);
        let payload = self.writer().u32(kind.raw()).finish();
        self.post(Command::REBOOT, PacketFlags::NON_CRITICAL, payload)?;
        self.mark_disconnected();

        self.reconnect(policy)?;
        if wait_for_initialize && kind != RebootKind::EnterBootloader {
            self.wait_initialize_state()?;
        }
        Ok(())
    }

    /// Ping device until it answers or `policy` is exhausted.
    pub fn reconnect(&self, policy: RetryPolicy) -> Result<(), Error> {
        for attempt in 1..=policy.retries {
            thread::sleep(policy.backoff());
            if self.connect(0, self.inner.config.timeout_ms, false, None)? {
                info!(target: "engine", "{}: reconnected after {attempt} attempts", self.inner.name);
                return Ok(());
            }
        }
        Err(Error::Reconnect {
            attempts: policy.retries,
        })
    }

    fn wait_initialize_state(&self) -> Result<(), Error> {
        let policy = self.inner.config.initialize_state;
        for _ in 0..policy.retries {
            if let Some(conditions) = muted_error!(self.conditions()).flatten() {
                if conditions.device_state() == DeviceState::Initialize {
                    return Ok(());
                }
            }
            thread::sleep(policy.backoff());
        }
        Err(Error::DeviceNotInitialized {
            attempts: policy.retries,
        })
    }

    fn retry_tick(&self) {
        let last_activity = *self.inner.last_activity.lock().unwrap();
        let tick = self.inner.pending.tick(Instant::now(), last_activity);
        for raw in tick.resend {
            weak_error!(self.write(&raw), "resend:");
        }
        for req in tick.expired {
            if let Some((callback, reply)) = req.complete(None) {
                self.inner
                    .dispatcher
                    .post(Notification::Reply(callback, reply));
            }
        }
    }

    pub(crate) fn acknowledge(&self, packet: &Packet) {
        if !packet.header.flags.contains(PacketFlags::NON_CRITICAL) {
            weak_error!(
                self.reply(packet, PacketFlags::ACK, Bytes::new()),
                "acknowledge:"
            );
        }
    }

    fn on_packet(&self, packet: Packet) {
        if packet.is_reply() {
            match self.inner.pending.take_match(&packet) {
                Some(req) => {
                    if let Some((callback, reply)) = req.complete(Some(packet)) {
                        self.inner
                            .dispatcher
                            .post(Notification::Reply(callback, reply));
                    }
                }
                None => {
                    debug!(target: "engine", "unexpected reply {} (seq_reply {})", packet.cmd(), packet.header.seq_reply)
                }
            }
            return;
        }

        let cmd = packet.cmd();
        if cmd.is_messaging() {
            self.inner.dispatcher.post(Notification::Rpc(packet));
            return;
        }

        match cmd {
            Command::PING => {
                let payload = PayloadWriter::new(Endian::Little)
                    .u32(ConnectionSource::Host.raw())
                    .u32(0)
                    .finish();
                weak_error!(
                    self.reply(&packet, PacketFlags::empty(), payload),
                    "ping reply:"
                );
            }
            Command::MESSAGE => {
                self.acknowledge(&packet);
                let text = String::from_utf8_lossy(&packet.payload)
                    .trim_end_matches('\0')
                    .to_string();
                self.inner.dispatcher.post(Notification::Message(text));
            }
            _ => {
                self.acknowledge(&packet);
                self.inner.dispatcher.post(Notification::Command(packet));
            }
        }
    }
}

fn reader_loop(inner: Weak<Inner>, mut transport: Box<dyn Transport>) {
    let mut assembler = PacketAssembler::new();
    let mut buf = vec![0u8; READ_BUFFER_SIZE];
    let mut link_broken = false;

    loop {
        let Some(inner) = inner.upgrade() else {
            break;
        };
        if inner.halted.load(Ordering::SeqCst) {
            break;
        }
        let engine = Engine::from_inner(inner);

        match transport.read(&mut buf) {
            Ok(0) => {}
            Ok(n) => {
                link_broken = false;
                *engine.inner.last_activity.lock().unwrap() = Instant::now();
                assembler.push(&buf[..n]);
                while let Some(frame) = assembler.next_frame() {
                    match frame {
                        Frame::Packet(packet) => engine.on_packet(packet),
                        Frame::Noise(data) => {
                            engine.inner.dispatcher.post(Notification::Noise(data));
                        }
                    }
                }
            }
            Err(e) => {
                if !link_broken {
                    warn!(target: "engine", "{}: transport read error: {e}", engine.inner.name);
                    link_broken = true;
                }
                drop(engine);
                thread::sleep(BROKEN_LINK_BACKOFF);
                continue;
            }
        }

        engine.retry_tick();
    }
    transport.close();
    debug!(target: "engine", "reader exit");
}
