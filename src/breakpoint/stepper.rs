//! Stepping is a transient breakpoint that carries the IL range of the current
//! sequence point. Device reports every step with the frame depth it lands on,
//! the depth delta against the step origin classifies the stop.

use crate::breakpoint::{BreakpointDef, BreakpointFlags, PID_ANY};
use crate::error::Error;
use crate::process::Process;
use log::debug;
use strum_macros::Display;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Display)]
pub enum StepKind {
    Into,
    Over,
    Out,
}

impl StepKind {
    fn flag(self) -> BreakpointFlags {
        match self {
            StepKind::Into => BreakpointFlags::STEP_IN,
            StepKind::Over => BreakpointFlags::STEP_OVER,
            StepKind::Out => BreakpointFlags::STEP_OUT,
        }
    }
}

/// Why a step stops.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Display)]
pub enum StepReason {
    /// Landed in a callee.
    Call,
    /// Next sequence point of the same frame.
    Normal,
    /// Returned to a caller.
    Return,
    /// Exception filter intercepts the step.
    Intercept,
    /// Landed in an exception handler.
    ExceptionHandler,
    /// Stepping thread terminates.
    Exit,
}

pub(crate) enum StepDecision {
    Stop(StepReason),
    /// Still inside the origin range, let the device step further.
    Continue,
    /// Landed in non-user code, step out of it.
    Rearm(Stepper),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Stepper {
    pub pid: u32,
    pub kind: StepKind,
    /// Device depth of the origin frame.
    pub depth: u32,
    /// Packed device index of the origin method.
    pub md: u32,
    /// Device IL range `[start, end)` of the origin sequence point.
    pub range: (u32, u32),
}

const STEP_EVENTS: BreakpointFlags = BreakpointFlags::STEP_IN
    .union(BreakpointFlags::STEP_OVER)
    .union(BreakpointFlags::STEP_OUT)
    .union(BreakpointFlags::EXCEPTION_FILTER)
    .union(BreakpointFlags::EXCEPTION_UNWIND)
    .union(BreakpointFlags::EXCEPTION_CAUGHT)
    .union(BreakpointFlags::THREAD_TERMINATED);

impl Stepper {
    pub(crate) fn def(&self, id: u16) -> BreakpointDef {
        BreakpointDef {
            id,
            flags: self.kind.flag(),
            pid: self.pid,
            depth: self.depth,
            ip_start: self.range.0,
            ip_end: self.range.1,
            md: self.md,
            ..BreakpointDef::default()
        }
    }

    pub(crate) fn matches(&self, hit: &BreakpointDef) -> bool {
        (hit.pid == self.pid || hit.pid == PID_ANY) && hit.flags.intersects(STEP_EVENTS)
    }

    fn in_range(&self, ip: u32) -> bool {
        self.range.0 <= ip && ip < self.range.1
    }

    pub fn classify(&self, hit: &BreakpointDef) -> StepReason {
        if hit.flags.contains(BreakpointFlags::THREAD_TERMINATED) {
            return StepReason::Exit;
        }
        if hit.flags.contains(BreakpointFlags::EXCEPTION_FILTER) {
            return StepReason::Intercept;
        }
        if hit
            .flags
            .intersects(BreakpointFlags::EXCEPTION_UNWIND | BreakpointFlags::EXCEPTION_CAUGHT)
        {
            return StepReason::ExceptionHandler;
        }
        match hit.depth.cmp(&self.depth) {
            std::cmp::Ordering::Greater => StepReason::Call,
            std::cmp::Ordering::Equal => StepReason::Normal,
            std::cmp::Ordering::Less => StepReason::Return,
        }
    }

    /// `user_code` tells whether the landing method is user code.
    pub(crate) fn decide(&self, hit: &BreakpointDef, user_code: bool) -> StepDecision {
        let reason = self.classify(hit);
        match reason {
            StepReason::Normal if hit.md == self.md && self.in_range(hit.ip_start) => {
                StepDecision::Continue
            }
            StepReason::Call | StepReason::Normal | StepReason::Return if !user_code => {
                StepDecision::Rearm(Stepper {
                    pid: self.pid,
                    kind: StepKind::Out,
                    depth: hit.depth,
                    md: hit.md,
                    range: (hit.ip_start, hit.ip_start.saturating_add(1)),
                })
            }
            reason => StepDecision::Stop(reason),
        }
    }
}

impl Process {
    /// Step a thread and let the device run. Return true if the device actually resumes,
    /// see [`Process::resume`].
    pub fn step(&self, pid: u32, kind: StepKind) -> Result<bool, Error> {
        self.ensure_stopped()?;
        let top = self
            .backtrace(pid)?
            .into_iter()
            .next()
            .ok_or(Error::FrameNotFound(0))?;

        let range = {
            let state = self.state.lock().unwrap();
            top.function
                .as_ref()
                .and_then(|f| {
                    state
                        .assemblies
                        .get(&f.assembly)?
                        .sequence_point(f.clr_token, top.ip)
                })
                .unwrap_or((top.ip, top.ip.saturating_add(1)))
        };
        let stepper = Stepper {
            pid,
            kind,
            depth: top.depth,
            md: top.md,
            range,
        };
        debug!(target: "breakpoint", "step {kind} thread {pid} over {range:?} at depth {}", top.depth);

        self.breakpoints.lock().unwrap().replace_stepper(stepper)?;
        self.sync_breakpoints()?;
        self.resume()
    }
}
