use crate::breakpoint::stepper::StepReason;
use crate::breakpoint::BreakpointFlags;
use crate::process::scratchpad::ScratchSlot;
use crate::process::Process;
use std::time::{Duration, Instant};

/// Something the host front-end must know about.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DebugEvent {
    /// Function breakpoint hit.
    Breakpoint { id: u32, pid: u32, md: u32, ip: u32 },
    StepComplete { pid: u32, reason: StepReason },
    /// Device stopped by a `Debugger.Break()` call.
    Break { pid: u32 },
    Exception {
        pid: u32,
        kind: BreakpointFlags,
        depth: u32,
    },
    ThreadCreated { pid: u32 },
    ThreadExited { pid: u32 },
    AssemblyLoaded { idx: u32, name: String },
    AssemblyUnloaded { idx: u32 },
    AppDomainCreated { id: u32, name: String },
    AppDomainExited { id: u32 },
    /// Non-blocking evaluation completes, result is kept in the slot. `pid` is the
    /// real thread, `virtual_pid` identifies the evaluation.
    EvalComplete {
        pid: u32,
        virtual_pid: u32,
        slot: ScratchSlot,
    },
    /// Breakpoint hits could not be drained. The device stays stopped and may still
    /// hold unreported hits.
    DrainFailed { reason: String },
    ProcessExited,
    /// Text sent by device program.
    Message(String),
}

impl DebugEvent {
    /// Events that leave the device stopped until the host resumes it.
    pub fn is_stopping(&self) -> bool {
        matches!(
            self,
            DebugEvent::Breakpoint { .. }
                | DebugEvent::StepComplete { .. }
                | DebugEvent::Break { .. }
                | DebugEvent::Exception { .. }
                | DebugEvent::EvalComplete { .. }
                | DebugEvent::DrainFailed { .. }
        )
    }
}

impl Process {
    pub(crate) fn queue_event(&self, event: DebugEvent) {
        self.events.lock().unwrap().push_back(event);
        self.events_cv.notify_all();
    }

    /// Number of queued events that hold the device stopped.
    pub fn queued_events(&self) -> usize {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.is_stopping())
            .count()
    }

    /// Wait up to `timeout` for the next event.
    ///
    /// A taken stopping event becomes an outstanding host stop, the host pairs it
    /// with [`Process::resume`].
    pub fn next_event(&self, timeout: Duration) -> Option<DebugEvent> {
        let deadline = Instant::now() + timeout;
        loop {
            {
                let mut events = self.events.lock().unwrap();
                while events.is_empty() {
                    let now = Instant::now();
                    if now >= deadline {
                        return None;
                    }
                    events = self.events_cv.wait_timeout(events, deadline - now).unwrap().0;
                }
            }

            // pause lock goes first, a taken stopping event and its stop are one step
            let mut pause = self.pause.lock().unwrap();
            let Some(event) = self.events.lock().unwrap().pop_front() else {
                continue;
            };
            if event.is_stopping() {
                pause.stop_count += 1;
            }
            return Some(event);
        }
    }

    /// Take all queued events.
    pub fn drain_events(&self) -> Vec<DebugEvent> {
        let mut pause = self.pause.lock().unwrap();
        let events: Vec<_> = self.events.lock().unwrap().drain(..).collect();
        pause.stop_count += events.iter().filter(|e| e.is_stopping()).count() as u32;
        events
    }
}
