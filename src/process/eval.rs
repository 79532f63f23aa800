//! Function evaluation.
//!
//! The device runs an evaluated method on a new "virtual" thread created on top of
//! a stopped real thread. Virtual threads of a real thread form a stack, the top one
//! is active. The result lands in a scratch pad slot, completion is reported as an
//! `EVAL_COMPLETE` breakpoint hit on the virtual thread.

use crate::breakpoint::{BreakpointKind, Vote};
use crate::error::Error;
use crate::process::assembly::{pack_index, TokenKind};
use crate::process::event::DebugEvent;
use crate::process::scratchpad::ScratchSlot;
use crate::process::thread::Thread;
use crate::process::value::RuntimeValue;
use crate::process::Process;
use crate::{consistency_check, weak_error};
use crate::wire::Command;
use log::{debug, warn};
use std::time::Instant;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Evaluation {
    /// Real thread the evaluation runs on top of.
    pub real: u32,
    pub virtual_pid: u32,
    /// Result slot.
    pub slot: ScratchSlot,
    breakpoint: u32,
    done: bool,
    /// Caller waits for completion, no event is raised.
    blocking: bool,
}

impl Process {
    /// Evaluate a method on thread `pid` and wait for the result.
    ///
    /// Arguments are scratch pad slots (see [`Process::allocate_string`] and
    /// [`Process::allocate_object`]). `None` means that the method returns nothing
    /// or the device cannot read the result. If the evaluation does not complete within
    /// configured timeout the virtual thread is killed and the device is stopped again.
    ///
    /// Evaluations nest: an evaluation started while another one on the same real
    /// thread is stopped runs on top of the active virtual thread.
    pub fn evaluate(
        &self,
        pid: u32,
        assembly_idx: u32,
        method_clr: u32,
        args: &[ScratchSlot],
    ) -> Result<Option<RuntimeValue>, Error> {
        let virtual_pid = self.start_evaluation(pid, assembly_idx, method_clr, args, true)?;

        let deadline = Instant::now() + self.engine().config().eval_timeout();
        let mut evals = self.evals.lock().unwrap();
        loop {
            match evals.get(&virtual_pid) {
                Some(eval) if eval.done => break,
                Some(_) => {}
                None => return Err(Error::ProcessExited),
            }
            if self.is_exited() {
                drop(evals);
                self.finish_evaluation(virtual_pid);
                return Err(Error::ProcessExited);
            }
            let now = Instant::now();
            if now >= deadline {
                drop(evals);
                warn!(target: "process", "evaluation on virtual thread {virtual_pid} timed out");
                self.abort_evaluation(virtual_pid);
                return Err(Error::EvaluationTimeout);
            }
            evals = self.eval_cv.wait_timeout(evals, deadline - now).unwrap().0;
        }
        drop(evals);

        let Some(eval) = self.finish_evaluation(virtual_pid) else {
            return Err(Error::ProcessExited);
        };
        let value = self.scratch_value(eval.slot);
        weak_error!(self.release_slot(eval.slot), "evaluation result slot:");
        value
    }

    /// Start evaluation and return the virtual thread it runs on, completion is
    /// reported as [`DebugEvent::EvalComplete`]. Result is taken with
    /// [`Process::end_evaluate`].
    pub fn begin_evaluate(
        &self,
        pid: u32,
        assembly_idx: u32,
        method_clr: u32,
        args: &[ScratchSlot],
    ) -> Result<u32, Error> {
        self.start_evaluation(pid, assembly_idx, method_clr, args, false)
    }

    /// Take result of a completed non-blocking evaluation. `pid` is a virtual thread
    /// or a real thread, for the latter its innermost evaluation is taken.
    pub fn end_evaluate(&self, pid: u32) -> Result<Option<RuntimeValue>, Error> {
        let virtual_pid = self.evaluation_of(pid).ok_or(Error::ThreadNotFound(pid))?;
        match self.evals.lock().unwrap().get(&virtual_pid) {
            Some(eval) if eval.done => {}
            Some(_) => return Err(Error::EvaluationInProgress(virtual_pid)),
            None => return Err(Error::ThreadNotFound(pid)),
        }
        let Some(eval) = self.finish_evaluation(virtual_pid) else {
            return Err(Error::ThreadNotFound(pid));
        };
        let value = self.scratch_value(eval.slot);
        weak_error!(self.release_slot(eval.slot), "evaluation result slot:");
        value
    }

    /// Whether an evaluation runs on virtual thread `pid` or on top of real thread `pid`.
    pub fn is_evaluating(&self, pid: u32) -> bool {
        self.evaluation_of(pid).is_some()
    }

    /// Innermost evaluation of a thread.
    fn evaluation_of(&self, pid: u32) -> Option<u32> {
        let stack = self
            .state
            .lock()
            .unwrap()
            .threads
            .get(&pid)
            .map(|t| t.virtual_threads.clone())
            .unwrap_or_default();
        let evals = self.evals.lock().unwrap();
        if evals.contains_key(&pid) {
            return Some(pid);
        }
        stack.into_iter().rev().find(|v| evals.contains_key(v))
    }

    fn start_evaluation(
        &self,
        pid: u32,
        assembly_idx: u32,
        method_clr: u32,
        args: &[ScratchSlot],
        blocking: bool,
    ) -> Result<u32, Error> {
        self.ensure_stopped()?;
        let real = self.real_thread(pid)?;
        let (kind, index) = self.to_device_token(assembly_idx, method_clr)?;
        if kind != TokenKind::MethodDef {
            return Err(Error::TokenNotFound(method_clr));
        }
        let active = {
            let state = self.state.lock().unwrap();
            for arg in args {
                state.scratch.validate(*arg)?;
            }
            state
                .threads
                .get(&real)
                .map(Thread::active)
                .ok_or(Error::ThreadNotFound(real))?
        };

        let slot = self.reserve_slot()?;
        let payload = self
            .engine()
            .writer()
            .u32(pack_index(assembly_idx, index))
            .u32(slot.index)
            .u32(active)
            .u32(args.len() as u32);
        let payload = args
            .iter()
            .fold(payload, |w, arg| w.u32(arg.index))
            .finish();
        let created = self
            .engine()
            .request_reader(Command::THREAD_CREATE_EX, payload, "create thread");
        let virtual_pid = match created {
            Ok(Some(mut reader)) => reader.u32(),
            Ok(None) => Err(Error::Rejected(Command::THREAD_CREATE_EX)),
            Err(e) => Err(e),
        };
        let virtual_pid = match virtual_pid {
            Ok(pid) if self.evals.lock().unwrap().contains_key(&pid) => {
                Err(Error::EvaluationInProgress(pid))
            }
            other => other,
        };
        let virtual_pid = match virtual_pid {
            Ok(pid) => pid,
            Err(e) => {
                weak_error!(self.release_slot(slot), "evaluation result slot:");
                return Err(e);
            }
        };
        let added = self
            .breakpoints
            .lock()
            .unwrap()
            .add(BreakpointKind::EvalComplete { pid: virtual_pid });
        let breakpoint = match added {
            Ok(id) => id,
            Err(e) => {
                weak_error!(self.kill_thread(virtual_pid), "kill evaluation thread:");
                weak_error!(self.release_slot(slot), "evaluation result slot:");
                return Err(e);
            }
        };
        debug!(target: "process", "evaluate on virtual thread {virtual_pid} over {active}, real thread {real}");

        {
            let mut state = self.state.lock().unwrap();
            state
                .threads
                .insert(virtual_pid, Thread::new_virtual(virtual_pid, real));
            if let Some(thread) = state.threads.get_mut(&real) {
                thread.virtual_threads.push(virtual_pid);
            }
        }
        self.evals.lock().unwrap().insert(
            virtual_pid,
            Evaluation {
                real,
                virtual_pid,
                slot,
                breakpoint,
                done: false,
                blocking,
            },
        );

        // evaluation runs even when host stops are outstanding
        let started = self
            .sync_breakpoints()
            .and_then(|_| self.resume_device_now());
        if let Err(e) = started {
            if let Some(eval) = self.finish_evaluation(virtual_pid) {
                weak_error!(self.release_slot(eval.slot), "evaluation result slot:");
            }
            return Err(e);
        }
        Ok(virtual_pid)
    }

    /// Called while draining hits, virtual thread `pid` finished its method.
    pub(crate) fn on_eval_complete(&self, virtual_pid: u32) -> Vote {
        let mut evals = self.evals.lock().unwrap();
        let Some(eval) = evals.get_mut(&virtual_pid) else {
            warn!(target: "process", "completion of unknown evaluation on {virtual_pid}");
            return Vote::Continue;
        };
        eval.done = true;
        self.eval_cv.notify_all();
        if eval.blocking {
            Vote::Hold
        } else {
            Vote::Break(DebugEvent::EvalComplete {
                pid: eval.real,
                virtual_pid,
                slot: eval.slot,
            })
        }
    }

    /// Drop evaluation bookkeeping: breakpoint, virtual thread and its stack entry.
    fn finish_evaluation(&self, virtual_pid: u32) -> Option<Evaluation> {
        let eval = self.evals.lock().unwrap().remove(&virtual_pid)?;
        {
            let mut state = self.state.lock().unwrap();
            state.threads.shift_remove(&virtual_pid);
            if let Some(thread) = state.threads.get_mut(&eval.real) {
                consistency_check!(
                    thread.virtual_threads.last() == Some(&virtual_pid),
                    "evaluation on {virtual_pid} ends out of order, virtual threads of {}: {:?}",
                    eval.real,
                    thread.virtual_threads
                );
                thread.virtual_threads.retain(|v| *v != virtual_pid);
            }
        }
        self.breakpoints.lock().unwrap().remove(eval.breakpoint);
        weak_error!(self.sync_breakpoints(), "evaluation cleanup:");
        Some(eval)
    }

    fn abort_evaluation(&self, virtual_pid: u32) {
        weak_error!(self.kill_thread(virtual_pid), "kill evaluation thread:");
        // evaluation thread may hang, take the device back
        if let Err(e) = self.halt_device() {
            warn!(target: "process", "stop after evaluation timeout: {e:#}");
        }
        if let Some(eval) = self.finish_evaluation(virtual_pid) {
            weak_error!(self.release_slot(eval.slot), "evaluation result slot:");
        }
    }
}
