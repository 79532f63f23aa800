//! Breakpoints.
//!
//! Device keeps one flat list of breakpoint definitions. The host keeps its own
//! registry of logical breakpoints and sends the device a deduplicated list of their
//! definitions on every change. When something fires, the device stops and queues
//! a hit, the host drains the queue and asks every matching breakpoint whether the
//! program should stay stopped.

pub mod stepper;

pub use stepper::{StepKind, StepReason, Stepper};

use crate::error::Error;
use crate::process::assembly::{pack_index, unpack_index, TokenKind};
use crate::process::{DebugEvent, Process};
use crate::wire::{Command, PayloadReader, PayloadWriter};
use crate::{consistency_check, weak_error};
use bitflags::bitflags;
use bytes::Bytes;
use indexmap::IndexMap;
use itertools::Itertools;
use log::{debug, warn};
use stepper::StepDecision;

/// Any thread.
pub const PID_ANY: u32 = 0x7FFF_FFFF;
/// Any stack depth.
pub const DEPTH_ANY: u32 = 0x7FFF_FFFF;

/// Hits drained per breakpoint notification before the device queue is considered
/// runaway. Reaching it leaves the device stopped.
const MAX_DRAINED_HITS: usize = 4096;

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
    pub struct BreakpointFlags: u16 {
        const STEP_IN = 0x0001;
        const STEP_OVER = 0x0002;
        const STEP_OUT = 0x0004;
        const HARD = 0x0008;
        const EXCEPTION_THROWN = 0x0010;
        const EXCEPTION_CAUGHT = 0x0020;
        const EXCEPTION_UNCAUGHT = 0x0040;
        const THREAD_TERMINATED = 0x0080;
        const THREAD_CREATED = 0x0100;
        const ASSEMBLIES_LOADED = 0x0200;
        /// Set on the last hit of the device queue.
        const LAST_BREAKPOINT = 0x0400;
        const STEP_JMC = 0x0800;
        /// `Debugger.Break()` call.
        const BREAK = 0x1000;
        const EVAL_COMPLETE = 0x2000;
        const EXCEPTION_UNWIND = 0x4000;
        const EXCEPTION_FILTER = 0x8000;

        const EXCEPTIONS = Self::EXCEPTION_THROWN.bits()
            | Self::EXCEPTION_CAUGHT.bits()
            | Self::EXCEPTION_UNCAUGHT.bits();
    }
}

/// Breakpoint definition as the device sees it. Also the layout of a reported hit.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
pub struct BreakpointDef {
    pub id: u16,
    pub flags: BreakpointFlags,
    pub pid: u32,
    pub depth: u32,
    pub ip_start: u32,
    pub ip_end: u32,
    /// Packed device index of a method.
    pub md: u32,
    pub type_def: u32,
    pub depth_exception_handler: u32,
}

impl BreakpointDef {
    pub fn write(&self, writer: PayloadWriter) -> PayloadWriter {
        writer
            .u16(self.id)
            .u16(self.flags.bits())
            .u32(self.pid)
            .u32(self.depth)
            .u32(self.ip_start)
            .u32(self.ip_end)
            .u32(self.md)
            .u32(self.type_def)
            .u32(self.depth_exception_handler)
    }

    pub fn read(reader: &mut PayloadReader) -> Result<Self, Error> {
        Ok(BreakpointDef {
            id: reader.u16()?,
            flags: BreakpointFlags::from_bits_retain(reader.u16()?),
            pid: reader.u32()?,
            depth: reader.u32()?,
            ip_start: reader.u32()?,
            ip_end: reader.u32()?,
            md: reader.u32()?,
            type_def: reader.u32()?,
            depth_exception_handler: reader.u32()?,
        })
    }

    /// Definitions equal up to the id are one device breakpoint.
    fn identity(&self) -> BreakpointDef {
        BreakpointDef { id: 0, ..*self }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BreakpointKind {
    /// Method and IL offset, bound to one app-domain when device supports app-domains.
    Function {
        assembly: u32,
        method_clr: u32,
        /// CLR IL offset.
        il_offset: u32,
        app_domain: Option<u32>,
        md: u32,
        /// Device IL offset.
        ip: u32,
    },
    Exception(BreakpointFlags),
    /// Thread, assembly and `Debugger.Break()` notifications.
    Watch(BreakpointFlags),
    Stepper(Stepper),
    /// Completion of evaluation on a virtual thread.
    EvalComplete { pid: u32 },
}

impl BreakpointKind {
    fn def(&self, id: u16) -> BreakpointDef {
        let any = BreakpointDef {
            id,
            pid: PID_ANY,
            depth: DEPTH_ANY,
            ..BreakpointDef::default()
        };
        match self {
            BreakpointKind::Function { md, ip, .. } => BreakpointDef {
                flags: BreakpointFlags::HARD,
                md: *md,
                ip_start: *ip,
                ip_end: *ip,
                ..any
            },
            BreakpointKind::Exception(flags) | BreakpointKind::Watch(flags) => BreakpointDef {
                flags: *flags,
                ..any
            },
            BreakpointKind::Stepper(stepper) => stepper.def(id),
            BreakpointKind::EvalComplete { pid } => BreakpointDef {
                flags: BreakpointFlags::EVAL_COMPLETE,
                pid: *pid,
                ..any
            },
        }
    }

    /// Whether a reported hit concerns this breakpoint. Hits are matched by content,
    /// device reports only one id for deduplicated definitions.
    fn matches(&self, hit: &BreakpointDef) -> bool {
        match self {
            BreakpointKind::Function { md, ip, .. } => {
                hit.flags.contains(BreakpointFlags::HARD) && hit.md == *md && hit.ip_start == *ip
            }
            BreakpointKind::Exception(flags) | BreakpointKind::Watch(flags) => {
                hit.flags.intersects(*flags)
            }
            BreakpointKind::Stepper(stepper) => stepper.matches(hit),
            BreakpointKind::EvalComplete { pid } => {
                hit.flags.contains(BreakpointFlags::EVAL_COMPLETE) && hit.pid == *pid
            }
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Breakpoint {
    pub id: u32,
    pub kind: BreakpointKind,
    pub enabled: bool,
}

/// Host-side breakpoint list. Ids are allocated in the 16 bit space of device
/// definitions, ids of removed breakpoints are reused after a wrap.
#[derive(Debug)]
pub struct BreakpointRegistry {
    items: IndexMap<u32, Breakpoint>,
    next_id: u16,
}

impl Default for BreakpointRegistry {
    fn default() -> Self {
        Self {
            items: IndexMap::new(),
            next_id: 1,
        }
    }
}

impl BreakpointRegistry {
    pub fn add(&mut self, kind: BreakpointKind) -> Result<u32, Error> {
        let id = self.allocate_id()?;
        self.items.insert(
            id,
            Breakpoint {
                id,
                kind,
                enabled: true,
            },
        );
        Ok(id)
    }

    fn allocate_id(&mut self) -> Result<u32, Error> {
        // id 0 is never handed out
        for _ in 0..=u16::MAX {
            let id = self.next_id as u32;
            self.next_id = self.next_id.checked_add(1).unwrap_or(1);
            if id != 0 && !self.items.contains_key(&id) {
                return Ok(id);
            }
        }
        Err(Error::BreakpointLimit(self.items.len()))
    }

    pub fn remove(&mut self, id: u32) -> Option<Breakpoint> {
        self.items.shift_remove(&id)
    }

    pub fn get(&self, id: u32) -> Option<&Breakpoint> {
        self.items.get(&id)
    }

    pub fn set_enabled(&mut self, id: u32, enabled: bool) -> bool {
        match self.items.get_mut(&id) {
            Some(brkpt) => {
                brkpt.enabled = enabled;
                true
            }
            None => false,
        }
    }

    pub fn clear(&mut self) {
        self.items.clear();
    }

    pub fn iter(&self) -> impl Iterator<Item = &Breakpoint> {
        self.items.values()
    }

    /// Install a stepper, a thread has at most one.
    pub(crate) fn replace_stepper(&mut self, stepper: Stepper) -> Result<u32, Error> {
        self.remove_steppers(stepper.pid);
        self.add(BreakpointKind::Stepper(stepper))
    }

    pub(crate) fn remove_steppers(&mut self, pid: u32) {
        self.items
            .retain(|_, b| !matches!(b.kind, BreakpointKind::Stepper(s) if s.pid == pid));
    }

    /// Definition list for the device: enabled breakpoints, structurally equal
    /// definitions are sent once.
    pub fn device_defs(&self) -> Vec<BreakpointDef> {
        self.items
            .values()
            .filter(|b| b.enabled)
            .filter_map(|b| match u16::try_from(b.id) {
                Ok(id) => Some(b.kind.def(id)),
                Err(_) => {
                    warn!(target: "breakpoint", "breakpoint id {} does not fit a device definition", b.id);
                    None
                }
            })
            .unique_by(BreakpointDef::identity)
            .collect()
    }

    /// Enabled breakpoints that a hit concerns.
    pub fn matching(&self, hit: &BreakpointDef) -> Vec<Breakpoint> {
        self.items
            .values()
            .filter(|b| b.enabled && b.kind.matches(hit))
            .cloned()
            .collect()
    }
}

/// Decision of one breakpoint about a hit.
#[derive(Debug)]
pub(crate) enum Vote {
    /// Program may go on.
    Continue,
    /// Stop and tell the host.
    Break(DebugEvent),
    /// Stay stopped, the host is already waiting for this.
    Hold,
    /// Go on with a new stepper in place of the voting one.
    Rearm(Stepper),
}

/// Outcome of a whole drain.
#[derive(Debug, Default)]
struct Drain {
    hits: usize,
    stop: bool,
    resync: bool,
    refresh_threads: bool,
    refresh_assemblies: bool,
}

impl Process {
    /// Send the deduplicated definition list to the device. False if device rejects it.
    pub fn sync_breakpoints(&self) -> Result<bool, Error> {
        let defs = self.breakpoints.lock().unwrap().device_defs();
        debug!(target: "breakpoint", "send {} breakpoint definitions", defs.len());
        let payload = defs
            .iter()
            .fold(self.engine().writer().u32(defs.len() as u32), |w, def| {
                def.write(w)
            })
            .finish();
        let accepted = self
            .engine()
            .request_ack(Command::EXECUTION_BREAKPOINTS, payload)?;
        if !accepted {
            warn!(target: "breakpoint", "device rejects breakpoint list");
        }
        Ok(accepted)
    }

    /// Set a breakpoint at CLR IL offset of a method. The breakpoint is bound in every
    /// app-domain that loads the assembly, one id per binding is returned.
    pub fn set_breakpoint(
        &self,
        assembly_idx: u32,
        method_clr: u32,
        il_offset: u32,
    ) -> Result<Vec<u32>, Error> {
        self.ensure_alive()?;
        let (md, ip, domains) = {
            let state = self.state.lock().unwrap();
            let assembly = state
                .assemblies
                .get(&assembly_idx)
                .ok_or(Error::AssemblyNotFound(assembly_idx))?;
            let (kind, index) = assembly.to_device(method_clr)?;
            if kind != TokenKind::MethodDef {
                return Err(Error::TokenNotFound(method_clr));
            }
            let ip = assembly.il_to_device(method_clr, il_offset);
            let domains: Vec<u32> = state
                .app_domains
                .values()
                .filter(|d| d.contains(assembly_idx))
                .map(|d| d.id)
                .collect();
            (pack_index(assembly_idx, index), ip, domains)
        };

        let bindings = if domains.is_empty() {
            vec![None]
        } else {
            domains.into_iter().map(Some).collect()
        };
        let ids = {
            let mut registry = self.breakpoints.lock().unwrap();
            bindings
                .into_iter()
                .map(|app_domain| {
                    registry.add(BreakpointKind::Function {
                        assembly: assembly_idx,
                        method_clr,
                        il_offset,
                        app_domain,
                        md,
                        ip,
                    })
                })
                .collect::<Result<Vec<_>, _>>()?
        };
        self.sync_breakpoints()?;
        Ok(ids)
    }

    /// Break on exceptions, `flags` is a subset of [`BreakpointFlags::EXCEPTIONS`].
    pub fn set_exception_breakpoint(&self, flags: BreakpointFlags) -> Result<u32, Error> {
        self.ensure_alive()?;
        let id = self
            .breakpoints
            .lock()
            .unwrap()
            .add(BreakpointKind::Exception(flags & BreakpointFlags::EXCEPTIONS))?;
        self.sync_breakpoints()?;
        Ok(id)
    }

    pub fn remove_breakpoint(&self, id: u32) -> Result<bool, Error> {
        if self.breakpoints.lock().unwrap().remove(id).is_none() {
            return Ok(false);
        }
        self.sync_breakpoints()
    }

    pub fn enable_breakpoint(&self, id: u32, enabled: bool) -> Result<bool, Error> {
        if !self.breakpoints.lock().unwrap().set_enabled(id, enabled) {
            return Ok(false);
        }
        self.sync_breakpoints()
    }

    pub fn breakpoints(&self) -> Vec<Breakpoint> {
        self.breakpoints.lock().unwrap().iter().cloned().collect()
    }

    /// Ask the device for the next queued hit, `None` if the queue is empty.
    fn breakpoint_status(&self) -> Result<Option<BreakpointDef>, Error> {
        let Some(mut reader) = self.engine().request_reader(
            Command::EXECUTION_BREAKPOINT_STATUS,
            Bytes::new(),
            "breakpoint status",
        )?
        else {
            return Ok(None);
        };
        let hit = BreakpointDef::read(&mut reader)?;
        Ok((!hit.flags.is_empty()).then_some(hit))
    }

    /// Handle a breakpoint notification: drain every queued hit, vote, and resume
    /// the device if nobody needs it stopped. A drain that fails or does not reach
    /// the end of the device queue leaves the device stopped and queues
    /// [`DebugEvent::DrainFailed`].
    pub(crate) fn on_breakpoint_hit(&self) -> Result<(), Error> {
        // the device stops itself before reporting a hit, from now on only an
        // explicit resume lets it run
        self.begin_hits();

        let mut drain = Drain::default();
        let mut result = Ok(());
        loop {
            if drain.hits >= MAX_DRAINED_HITS {
                result = Err(Error::BreakpointQueueOverflow(drain.hits));
                break;
            }
            match self.drain_one(&mut drain) {
                Ok(true) => continue,
                Ok(false) => break,
                Err(e) => {
                    result = Err(e);
                    break;
                }
            }
        }
        debug!(target: "breakpoint", "drained {} hits: {drain:?}", drain.hits);

        if drain.refresh_assemblies {
            weak_error!(self.refresh_app_domains(), "app-domain refresh:");
            weak_error!(self.refresh_assemblies(), "assembly refresh:");
        }
        if drain.refresh_threads {
            weak_error!(self.refresh_threads(), "thread refresh:");
        }
        if drain.resync {
            weak_error!(self.sync_breakpoints(), "breakpoint sync:");
        }

        if let Err(e) = &result {
            // unvoted hits may still wait on the device, the host decides
            warn!(target: "breakpoint", "breakpoint drain failed, device stays stopped: {e:#}");
            self.queue_event(DebugEvent::DrainFailed {
                reason: e.to_string(),
            });
        }
        self.end_hits();

        // the host may have taken and resumed a stop while hits were voted
        if !self.resume_if_released()? && result.is_ok() && !drain.stop {
            debug!(target: "breakpoint", "no breakpoint elects to stop, device is held by host");
        }
        result
    }

    /// Take one hit from the device queue. Return false when the queue is exhausted.
    fn drain_one(&self, drain: &mut Drain) -> Result<bool, Error> {
        let Some(hit) = self.breakpoint_status()? else {
            return Ok(false);
        };
        drain.hits += 1;
        debug!(target: "breakpoint", "hit {hit:?}");

        if hit
            .flags
            .intersects(BreakpointFlags::THREAD_CREATED | BreakpointFlags::THREAD_TERMINATED)
        {
            drain.refresh_threads = true;
        }
        if hit.flags.contains(BreakpointFlags::ASSEMBLIES_LOADED) {
            drain.refresh_assemblies = true;
        }

        let matching = self.breakpoints.lock().unwrap().matching(&hit);
        if matching.is_empty() {
            debug!(target: "breakpoint", "hit does not concern any breakpoint");
        }
        for brkpt in matching {
            match self.vote(&brkpt, &hit)? {
                Vote::Continue => {}
                Vote::Hold => drain.stop = true,
                Vote::Break(event) => {
                    drain.stop = true;
                    if let BreakpointKind::Stepper(stepper) = brkpt.kind {
                        self.breakpoints.lock().unwrap().remove_steppers(stepper.pid);
                        drain.resync = true;
                    }
                    self.queue_event(event);
                }
                Vote::Rearm(stepper) => {
                    self.breakpoints.lock().unwrap().replace_stepper(stepper)?;
                    drain.resync = true;
                }
            }
        }

        Ok(!hit.flags.contains(BreakpointFlags::LAST_BREAKPOINT))
    }

    fn vote(&self, brkpt: &Breakpoint, hit: &BreakpointDef) -> Result<Vote, Error> {
        let vote = match &brkpt.kind {
            BreakpointKind::Function { app_domain, .. } => {
                if let Some(app_domain) = app_domain {
                    if self.thread_app_domain(hit.pid)? != Some(*app_domain) {
                        return Ok(Vote::Continue);
                    }
                }
                Vote::Break(DebugEvent::Breakpoint {
                    id: brkpt.id,
                    pid: hit.pid,
                    md: hit.md,
                    ip: hit.ip_start,
                })
            }
            BreakpointKind::Exception(_) => Vote::Break(DebugEvent::Exception {
                pid: hit.pid,
                kind: hit.flags & BreakpointFlags::EXCEPTIONS,
                depth: hit.depth,
            }),
            BreakpointKind::Watch(flags) => {
                if flags.contains(BreakpointFlags::BREAK) && hit.flags.contains(BreakpointFlags::BREAK) {
                    Vote::Break(DebugEvent::Break { pid: hit.pid })
                } else {
                    Vote::Continue
                }
            }
            BreakpointKind::Stepper(stepper) => {
                match stepper.decide(hit, self.is_user_method(hit.md)) {
                    StepDecision::Continue => Vote::Continue,
                    StepDecision::Rearm(next) => Vote::Rearm(next),
                    StepDecision::Stop(reason) => Vote::Break(DebugEvent::StepComplete {
                        pid: stepper.pid,
                        reason,
                    }),
                }
            }
            BreakpointKind::EvalComplete { pid } => self.on_eval_complete(*pid),
        };
        consistency_check!(
            !matches!(vote, Vote::Rearm(_)) || matches!(brkpt.kind, BreakpointKind::Stepper(_)),
            "only steppers rearm, breakpoint {brkpt:?}"
        );
        Ok(vote)
    }

    /// Methods without symbols count as user code.
    fn is_user_method(&self, md: u32) -> bool {
        let (assembly_idx, index) = unpack_index(md);
        let state = self.state.lock().unwrap();
        let Some(assembly) = state.assemblies.get(&assembly_idx) else {
            return true;
        };
        match assembly.to_clr(TokenKind::MethodDef, index) {
            Ok(clr) => assembly.is_user_code(clr),
            Err(_) => true,
        }
    }
}
