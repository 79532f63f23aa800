//! Host-side mirror of the debugged device program.
//!
//! [`Process`] keeps arenas of threads, assemblies and app-domains keyed by device
//! ids, entities refer to each other by id and resolve through the process.
//! Collections are refreshed by diffing device lists against the cached state,
//! every difference becomes a [`DebugEvent`].
//!
//! # Stop accounting
//!
//! The device stops either on host request ([`Process::stop`]) or on its own when a
//! breakpoint fires. Once a breakpoint hit is reported the device is stopped until
//! the host resumes it, no matter whether some breakpoint elects to break.
//! A device resume is issued only when all of these hold:
//! - no host stop is outstanding (every `stop` and every taken stopping event was
//!   followed by `resume`)
//! - no breakpoint hit is being voted on
//! - no stopping event waits in the event queue

pub mod appdomain;
pub mod assembly;
pub mod eval;
pub mod event;
pub mod scratchpad;
pub mod thread;
pub mod value;

pub use appdomain::{AppDomain, AssemblyInstance};
pub use assembly::{Assembly, TokenKind};
pub use eval::Evaluation;
pub use event::DebugEvent;
pub use scratchpad::{ScratchPad, ScratchSlot};
pub use thread::{Chain, Frame, FrameInfo, Function, Thread};
pub use value::{DataType, RuntimeValue, StackSlot, ValueData};

use crate::breakpoint::{BreakpointFlags, BreakpointKind, BreakpointRegistry};
use crate::engine::{ConnectionSource, Engine, EngineListener, ExecutionConditions, RebootKind};
use crate::error::Error;
use crate::symbols::SymbolResolver;
use crate::version::Version;
use crate::wire::{Command, Packet};
use crate::{consistency_check, weak_error};
use bytes::Bytes;
use indexmap::IndexMap;
use log::{debug, info, warn};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, Weak};
use std::thread::JoinHandle;
use std::time::Instant;
use strum_macros::Display;

#[derive(Default)]
pub(crate) struct ProcessState {
    pub(crate) threads: IndexMap<u32, Thread>,
    pub(crate) assemblies: IndexMap<u32, Assembly>,
    pub(crate) app_domains: IndexMap<u32, AppDomain>,
    pub(crate) scratch: ScratchPad,
    /// Incremented on every device stop and resume, cached stack chains of an
    /// older epoch are stale.
    pub(crate) epoch: u64,
}

#[derive(Debug, Default)]
pub(crate) struct PauseState {
    pub(crate) paused: bool,
    pub(crate) exited: bool,
    /// Outstanding host stops.
    pub(crate) stop_count: u32,
    /// Breakpoint notifications being drained and voted on.
    pub(crate) pending_hits: u32,
    /// Incremented whenever a device stop is observed. A resume that raced with a
    /// stop sees a changed generation.
    pub(crate) generation: u64,
}

impl PauseState {
    /// `queued` is a number of stopping events in the event queue.
    pub(crate) fn may_resume_device(&self, queued: usize) -> bool {
        self.stop_count == 0 && self.pending_hits == 0 && queued == 0 && !self.exited
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Display)]
enum Teardown {
    Detach,
    Terminate,
}

/// How to prepare the device before attaching.
#[derive(Clone, Debug, Default)]
pub struct AttachOptions {
    /// Deployment image written before reboot.
    pub image: Option<Vec<u8>>,
    pub reboot: Option<RebootKind>,
}

pub struct Process {
    engine: Engine,
    symbols: Arc<dyn SymbolResolver>,
    pub(crate) state: Mutex<ProcessState>,
    pub(crate) pause: Mutex<PauseState>,
    pause_cv: Condvar,
    pub(crate) breakpoints: Mutex<BreakpointRegistry>,
    pub(crate) events: Mutex<VecDeque<DebugEvent>>,
    pub(crate) events_cv: Condvar,
    /// Running evaluations keyed by virtual thread id.
    pub(crate) evals: Mutex<HashMap<u32, Evaluation>>,
    pub(crate) eval_cv: Condvar,
    /// Serializes stop and resume exchanges with the device.
    control: Mutex<()>,
    teardown: Mutex<Option<Teardown>>,
    me: Weak<Process>,
}

impl Process {
    fn new(engine: Engine, symbols: Arc<dyn SymbolResolver>) -> Arc<Self> {
        Arc::new_cyclic(|me| Process {
            engine,
            symbols,
            state: Mutex::default(),
            pause: Mutex::default(),
            pause_cv: Condvar::new(),
            breakpoints: Mutex::default(),
            events: Mutex::default(),
            events_cv: Condvar::new(),
            evals: Mutex::default(),
            eval_cv: Condvar::new(),
            control: Mutex::default(),
            teardown: Mutex::default(),
            me: me.clone(),
        })
    }

    /// Attach to a program running on connected (or connectable) device.
    ///
    /// Enables source level debugging, mirrors app-domains, assemblies and threads
    /// and installs default watches. A device that is already stopped is attached
    /// in stopped state with one outstanding host stop.
    pub fn attach(engine: &Engine, symbols: Arc<dyn SymbolResolver>) -> Result<Arc<Self>, Error> {
        if engine.connection().source != Some(ConnectionSource::TinyClr) {
            let config = engine.config();
            if !engine.connect(
                config.retries,
                config.timeout_ms,
                false,
                Some(ConnectionSource::TinyClr),
            )? {
                return Err(Error::NotConnected);
            }
        }

        let conditions = engine
            .change_conditions(
                ExecutionConditions::SOURCE_LEVEL_DEBUGGING,
                ExecutionConditions::empty(),
            )?
            .ok_or(Error::NotConnected)?;

        let process = Process::new(engine.clone(), symbols);
        engine.add_listener(Arc::downgrade(&process) as Weak<dyn EngineListener>);
        if conditions.contains(ExecutionConditions::STOPPED) {
            let mut pause = process.pause.lock().unwrap();
            pause.paused = true;
            pause.stop_count = 1;
        }

        process.refresh()?;
        process.add_default_watches()?;
        process.sync_breakpoints()?;
        let (assemblies, threads) = {
            let state = process.state.lock().unwrap();
            (state.assemblies.len(), state.threads.len())
        };
        info!(
            target: "process",
            "attached to {}: {assemblies} assemblies, {threads} threads",
            engine.name()
        );
        Ok(process)
    }

    /// Run the whole attach sequence (connect, deploy, reboot, attach) on a separate thread.
    pub fn spawn_attach(
        engine: Engine,
        symbols: Arc<dyn SymbolResolver>,
        options: AttachOptions,
    ) -> Result<JoinHandle<Result<Arc<Self>, Error>>, Error> {
        let handle = std::thread::Builder::new()
            .name("mfdbg-attach".to_string())
            .spawn(move || {
                let config = engine.config();
                if !engine.connect(config.retries, config.timeout_ms, false, None)? {
                    return Err(Error::NotConnected);
                }
                if let Some(image) = &options.image {
                    let report = engine.deploy(image)?;
                    info!(target: "process", "deployed: {report:?}");
                }
                if let Some(kind) = options.reboot {
                    engine.reboot(kind, true)?;
                }
                Process::attach(&engine, symbols)
            })?;
        Ok(handle)
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    fn begin_teardown(&self, kind: Teardown) -> Result<(), Error> {
        let mut teardown = self.teardown.lock().unwrap();
        consistency_check!(
            teardown.is_none(),
            "{kind} requested while {:?} is in progress",
            *teardown
        );
        if teardown.is_some() {
            return Err(Error::ShuttingDown);
        }
        *teardown = Some(kind);
        Ok(())
    }

    fn unsubscribe(&self) {
        self.engine
            .remove_listener(&(self.me.clone() as Weak<dyn EngineListener>));
    }

    /// Stop debugging and let the program run free.
    pub fn detach(&self) -> Result<(), Error> {
        self.begin_teardown(Teardown::Detach)?;
        self.breakpoints.lock().unwrap().clear();
        weak_error!(self.sync_breakpoints(), "detach:");
        weak_error!(
            self.engine.change_conditions(
                ExecutionConditions::empty(),
                ExecutionConditions::STOPPED | ExecutionConditions::SOURCE_LEVEL_DEBUGGING,
            ),
            "detach:"
        );
        self.unsubscribe();

        let mut pause = self.pause.lock().unwrap();
        pause.paused = false;
        pause.exited = true;
        self.pause_cv.notify_all();
        self.eval_cv.notify_all();
        info!(target: "process", "detached from {}", self.engine.name());
        Ok(())
    }

    /// Kill the program with a CLR restart.
    pub fn terminate(&self) -> Result<(), Error> {
        self.begin_teardown(Teardown::Terminate)?;
        self.unsubscribe();
        let result = self.engine.reboot(RebootKind::ClrOnly, false);
        self.mark_exited();
        result
    }

    pub fn is_exited(&self) -> bool {
        self.pause.lock().unwrap().exited
    }

    pub fn is_paused(&self) -> bool {
        self.pause.lock().unwrap().paused
    }

    pub fn stop_count(&self) -> u32 {
        self.pause.lock().unwrap().stop_count
    }

    pub fn pending_hits(&self) -> u32 {
        self.pause.lock().unwrap().pending_hits
    }

    pub(crate) fn ensure_alive(&self) -> Result<(), Error> {
        if self.teardown.lock().unwrap().is_some() {
            return Err(Error::ShuttingDown);
        }
        if self.pause.lock().unwrap().exited {
            return Err(Error::ProcessExited);
        }
        Ok(())
    }

    pub(crate) fn ensure_stopped(&self) -> Result<(), Error> {
        self.ensure_alive()?;
        if !self.pause.lock().unwrap().paused {
            return Err(Error::ProcessNotStopped);
        }
        Ok(())
    }

    /// Stop the device and wait until it is paused. Every successful call must be
    /// paired with [`Process::resume`].
    pub fn stop(&self) -> Result<(), Error> {
        self.ensure_alive()?;
        {
            let _control = self.control.lock().unwrap();
            {
                let mut pause = self.pause.lock().unwrap();
                pause.stop_count += 1;
                if pause.paused {
                    return Ok(());
                }
            }

            let conditions = self
                .engine
                .change_conditions(ExecutionConditions::STOPPED, ExecutionConditions::empty());
            match conditions {
                Ok(Some(c)) if c.contains(ExecutionConditions::STOPPED) => self.mark_paused(),
                Ok(_) => {}
                Err(e) => {
                    self.pause.lock().unwrap().stop_count -= 1;
                    return Err(e);
                }
            }
        }

        let deadline = Instant::now() + self.engine.config().stop_timeout();
        let mut pause = self.pause.lock().unwrap();
        while !pause.paused && !pause.exited {
            let now = Instant::now();
            if now >= deadline {
                pause.stop_count -= 1;
                return Err(Error::StopTimeout);
            }
            pause = self.pause_cv.wait_timeout(pause, deadline - now).unwrap().0;
        }
        if pause.exited {
            pause.stop_count = pause.stop_count.saturating_sub(1);
            return Err(Error::ProcessExited);
        }
        Ok(())
    }

    /// Release one host stop. Return true if the device actually resumes.
    pub fn resume(&self) -> Result<bool, Error> {
        self.ensure_alive()?;
        {
            let mut pause = self.pause.lock().unwrap();
            consistency_check!(
                pause.stop_count > 0,
                "resume without outstanding stop, pause state: {:?}",
                *pause
            );
            pause.stop_count = pause.stop_count.saturating_sub(1);
        }
        self.resume_if_released()
    }

    /// Resume the device if no stop, hit or queued stopping event holds it.
    /// Return true if the device runs.
    pub(crate) fn resume_if_released(&self) -> Result<bool, Error> {
        let control = self.control.lock().unwrap();
        let generation = {
            let pause = self.pause.lock().unwrap();
            let queued = self.queued_events();
            if !pause.may_resume_device(queued) {
                debug!(
                    target: "process",
                    "device stays stopped: {} stops, {} pending hits, {queued} queued events",
                    pause.stop_count,
                    pause.pending_hits
                );
                return Ok(false);
            }
            pause.generation
        };
        self.resume_device(&control, generation)
    }

    /// Let the device run regardless of outstanding stops. `generation` is the pause
    /// generation the decision to resume was made on. The pause lock is not held
    /// during the exchange, if a device stop is observed meanwhile the device is
    /// stopped again and stays paused. Return true if the device runs.
    pub(crate) fn resume_device(
        &self,
        _control: &MutexGuard<'_, ()>,
        generation: u64,
    ) -> Result<bool, Error> {
        debug!(target: "process", "resume device");
        self.state.lock().unwrap().epoch += 1;
        let conditions = self
            .engine
            .change_conditions(ExecutionConditions::empty(), ExecutionConditions::STOPPED)?;
        if conditions.is_none() {
            warn!(target: "process", "device does not confirm resume, consider it stopped");
            return Ok(false);
        }

        let mut pause = self.pause.lock().unwrap();
        if pause.generation == generation {
            pause.paused = false;
            return Ok(true);
        }
        drop(pause);
        debug!(target: "process", "device stopped while resuming, stop it again");
        self.engine
            .change_conditions(ExecutionConditions::STOPPED, ExecutionConditions::empty())?;
        Ok(false)
    }

    /// Take the control lock and the pause generation for an unconditional resume.
    pub(crate) fn resume_device_now(&self) -> Result<bool, Error> {
        let control = self.control.lock().unwrap();
        let generation = self.pause.lock().unwrap().generation;
        self.resume_device(&control, generation)
    }

    /// Stop the device regardless of host stop accounting.
    pub(crate) fn halt_device(&self) -> Result<(), Error> {
        let _control = self.control.lock().unwrap();
        self.engine
            .change_conditions(ExecutionConditions::STOPPED, ExecutionConditions::empty())?;
        self.mark_paused();
        Ok(())
    }

    pub(crate) fn mark_paused(&self) {
        let mut pause = self.pause.lock().unwrap();
        pause.generation += 1;
        if !pause.paused {
            pause.paused = true;
            self.state.lock().unwrap().epoch += 1;
        }
        self.pause_cv.notify_all();
    }

    /// The device reported breakpoint hits. Pause and hold the device until
    /// [`Process::end_hits`].
    pub(crate) fn begin_hits(&self) {
        self.pause.lock().unwrap().pending_hits += 1;
        self.mark_paused();
    }

    pub(crate) fn end_hits(&self) {
        let mut pause = self.pause.lock().unwrap();
        consistency_check!(pause.pending_hits > 0, "unbalanced hit drain, pause state: {:?}", *pause);
        pause.pending_hits = pause.pending_hits.saturating_sub(1);
    }

    /// Forget all threads and release every waiter. Idempotent.
    pub(crate) fn mark_exited(&self) {
        {
            let mut pause = self.pause.lock().unwrap();
            if pause.exited {
                return;
            }
            pause.exited = true;
            pause.paused = false;
        }
        info!(target: "process", "program exited");

        let threads: Vec<u32> = {
            let mut state = self.state.lock().unwrap();
            state.scratch.reset();
            state.epoch += 1;
            state.threads.drain(..).map(|(pid, _)| pid).collect()
        };
        for pid in threads {
            self.queue_event(DebugEvent::ThreadExited { pid });
        }
        self.queue_event(DebugEvent::ProcessExited);

        self.pause_cv.notify_all();
        self.eval_cv.notify_all();
    }

    pub(crate) fn to_device_token(&self, assembly_idx: u32, clr: u32) -> Result<(TokenKind, u32), Error> {
        let state = self.state.lock().unwrap();
        let assembly = state
            .assemblies
            .get(&assembly_idx)
            .ok_or(Error::AssemblyNotFound(assembly_idx))?;
        assembly.to_device(clr)
    }

    // --------------------------------- mirrored collections ------------------------------------

    pub fn threads(&self) -> Vec<u32> {
        self.state.lock().unwrap().threads.keys().copied().collect()
    }

    pub fn assemblies(&self) -> Vec<(u32, String, Version)> {
        self.state
            .lock()
            .unwrap()
            .assemblies
            .values()
            .map(|a| (a.idx, a.name.clone(), a.version))
            .collect()
    }

    pub fn app_domains(&self) -> Vec<AppDomain> {
        self.state.lock().unwrap().app_domains.values().cloned().collect()
    }

    /// Device index of a loaded assembly by name.
    pub fn find_assembly(&self, name: &str) -> Option<u32> {
        self.state
            .lock()
            .unwrap()
            .assemblies
            .values()
            .find(|a| a.name == name)
            .map(|a| a.idx)
    }

    pub fn refresh(&self) -> Result<(), Error> {
        self.refresh_app_domains()?;
        self.refresh_assemblies()?;
        self.refresh_threads()
    }

    fn request_list(&self, cmd: Command, what: &'static str) -> Result<Option<Vec<u32>>, Error> {
        let Some(mut reader) = self.engine.request_reader(cmd, Bytes::new(), what)? else {
            return Ok(None);
        };
        Ok(Some(reader.list(|r| r.u32())?))
    }

    pub fn refresh_threads(&self) -> Result<(), Error> {
        let Some(pids) = self.request_list(Command::THREAD_LIST, "thread list")? else {
            return Ok(());
        };

        let (created, exited, had_threads) = {
            let mut state = self.state.lock().unwrap();
            let had_threads = !state.threads.is_empty();
            // virtual threads live until their evaluation completes
            let exited: Vec<u32> = state
                .threads
                .values()
                .filter(|t| !t.is_virtual() && !pids.contains(&t.pid))
                .map(|t| t.pid)
                .collect();
            for pid in &exited {
                state.threads.shift_remove(pid);
            }
            let created: Vec<u32> = pids
                .iter()
                .filter(|pid| !state.threads.contains_key(*pid))
                .copied()
                .collect();
            for pid in &created {
                state.threads.insert(*pid, Thread::new(*pid));
            }
            (created, exited, had_threads)
        };

        for pid in exited {
            debug!(target: "process", "thread {pid} exited");
            self.queue_event(DebugEvent::ThreadExited { pid });
        }
        for pid in created {
            debug!(target: "process", "thread {pid} created");
            self.queue_event(DebugEvent::ThreadCreated { pid });
        }

        if pids.is_empty() && had_threads {
            let conditions = self.engine.conditions()?.unwrap_or_default();
            if conditions.contains(ExecutionConditions::PROGRAM_EXITED) {
                warn!(target: "process", "device reports exited program, terminate process mirror");
                self.mark_exited();
            }
        }
        Ok(())
    }

    pub fn refresh_assemblies(&self) -> Result<(), Error> {
        let Some(indexes) = self.request_list(Command::TYPE_SYS_ASSEMBLIES, "assembly list")? else {
            return Ok(());
        };

        let (unloaded, fresh): (Vec<u32>, Vec<u32>) = {
            let mut state = self.state.lock().unwrap();
            let unloaded: Vec<u32> = state
                .assemblies
                .keys()
                .filter(|idx| !indexes.contains(*idx))
                .copied()
                .collect();
            for idx in &unloaded {
                state.assemblies.shift_remove(idx);
            }
            let fresh = indexes
                .iter()
                .filter(|idx| !state.assemblies.contains_key(*idx))
                .copied()
                .collect();
            (unloaded, fresh)
        };
        for idx in unloaded {
            self.queue_event(DebugEvent::AssemblyUnloaded { idx });
        }

        for idx in fresh {
            let payload = self.engine.writer().u32(idx).finish();
            let Some(mut reader) =
                self.engine
                    .request_reader(Command::RESOLVE_ASSEMBLY, payload, "assembly")?
            else {
                warn!(target: "process", "assembly {idx} can not be resolved");
                continue;
            };
            let (name, version, flags) = Assembly::read(&mut reader)?;
            let symbols = self.symbols.resolve(&name);
            if symbols.is_none() {
                debug!(target: "process", "no symbols for {name}, use structural token mapping");
            }
            let assembly = Assembly::new(idx, name.clone(), version, flags, symbols);
            self.state.lock().unwrap().assemblies.insert(idx, assembly);
            debug!(target: "process", "assembly {idx} loaded: {name} {version}");
            self.queue_event(DebugEvent::AssemblyLoaded { idx, name });
        }
        Ok(())
    }

    pub fn refresh_app_domains(&self) -> Result<(), Error> {
        let Some(ids) = self.request_list(Command::TYPE_SYS_APP_DOMAINS, "app-domain list")? else {
            return Ok(());
        };

        // assembly sets of live domains change too, resolve all of them
        let mut domains = Vec::with_capacity(ids.len());
        for id in ids {
            let payload = self.engine.writer().u32(id).finish();
            if let Some(mut reader) =
                self.engine
                    .request_reader(Command::RESOLVE_APP_DOMAIN, payload, "app-domain")?
            {
                domains.push(AppDomain::read(id, &mut reader)?);
            }
        }

        let (created, exited) = {
            let mut state = self.state.lock().unwrap();
            let exited: Vec<u32> = state
                .app_domains
                .keys()
                .filter(|id| !domains.iter().any(|d| d.id == **id))
                .copied()
                .collect();
            let created: Vec<(u32, String)> = domains
                .iter()
                .filter(|d| !state.app_domains.contains_key(&d.id))
                .map(|d| (d.id, d.name.clone()))
                .collect();
            state.app_domains = domains.into_iter().map(|d| (d.id, d)).collect();
            (created, exited)
        };

        for id in exited {
            self.queue_event(DebugEvent::AppDomainExited { id });
        }
        for (id, name) in created {
            self.queue_event(DebugEvent::AppDomainCreated { id, name });
        }
        Ok(())
    }

    pub fn set_current_app_domain(&self, id: u32) -> Result<bool, Error> {
        self.ensure_stopped()?;
        if !self.state.lock().unwrap().app_domains.contains_key(&id) {
            return Err(Error::AppDomainNotFound(id));
        }
        let payload = self.engine.writer().u32(id).finish();
        self.engine
            .request_ack(Command::EXECUTION_SET_CURRENT_APP_DOMAIN, payload)
    }

    fn add_default_watches(&self) -> Result<(), Error> {
        let mut registry = self.breakpoints.lock().unwrap();
        for flags in [
            BreakpointFlags::THREAD_CREATED | BreakpointFlags::THREAD_TERMINATED,
            BreakpointFlags::ASSEMBLIES_LOADED,
            BreakpointFlags::BREAK,
        ] {
            registry.add(BreakpointKind::Watch(flags))?;
        }
        Ok(())
    }
}

impl EngineListener for Process {
    fn on_command(&self, _: &Engine, packet: &Packet) -> anyhow::Result<()> {
        if self.teardown.lock().unwrap().is_some() {
            return Ok(());
        }
        match packet.cmd() {
            Command::EXECUTION_BREAKPOINT_HIT => self.on_breakpoint_hit()?,
            Command::PROGRAM_EXIT => self.mark_exited(),
            _ => {}
        }
        Ok(())
    }

    fn on_message(&self, _: &Engine, text: &str) -> anyhow::Result<()> {
        self.queue_event(DebugEvent::Message(text.to_string()));
        Ok(())
    }

    fn on_shutdown(&self, _: &Engine) {
        self.mark_exited();
    }
}
