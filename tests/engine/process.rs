use crate::common::device::{local_reference, SimState};
use crate::common::{app_method, program, wait_until};
use crate::device_env;
use mfdbg::breakpoint::{BreakpointDef, BreakpointFlags, StepKind, StepReason};
use mfdbg::engine::ExecutionConditions;
use mfdbg::symbols::NoSymbols;
use mfdbg::wire::Command;
use mfdbg::process::StackSlot;
use mfdbg::{DebugEvent, Error, Process};
use serial_test::serial;
use std::sync::Arc;
use std::time::{Duration, Instant};

const EVENT_TIMEOUT: Duration = Duration::from_secs(2);

/// Skip notifications up to the next event that stops the program.
fn next_stop(process: &Process) -> DebugEvent {
    loop {
        let event = process
            .next_event(EVENT_TIMEOUT)
            .expect("no stopping event");
        if event.is_stopping() {
            return event;
        }
    }
}

fn hard_hit(pid: u32, md: u32, ip: u32) -> BreakpointDef {
    BreakpointDef {
        flags: BreakpointFlags::HARD,
        pid,
        depth: 1,
        md,
        ip_start: ip,
        ip_end: ip,
        ..BreakpointDef::default()
    }
}

fn attach(engine: &mfdbg::Engine) -> Arc<Process> {
    Process::attach(engine, Arc::new(NoSymbols)).unwrap()
}

#[test]
#[serial]
fn test_attach_and_detach() {
    device_env!(program(), engine, device, {
        let process = attach(&engine);
        assert_eq!(process.threads(), vec![1]);
        let assemblies = process.assemblies();
        assert_eq!(assemblies.len(), 1);
        assert_eq!(assemblies[0].1, "App");
        assert_eq!(process.find_assembly("App"), Some(1));
        assert_eq!(process.app_domains()[0].name, "default");
        assert!(!process.is_paused());

        let events = process.drain_events();
        assert!(events.contains(&DebugEvent::ThreadCreated { pid: 1 }));
        assert!(events.contains(&DebugEvent::AssemblyLoaded {
            idx: 1,
            name: "App".to_string()
        }));
        assert!(events.contains(&DebugEvent::AppDomainCreated {
            id: 1,
            name: "default".to_string()
        }));
        assert_eq!(process.stop_count(), 0);

        {
            let state = device.state();
            assert!(state
                .conditions
                .contains(ExecutionConditions::SOURCE_LEVEL_DEBUGGING));
            // thread, assembly and break watches
            assert_eq!(state.last_breakpoints().len(), 3);
        }

        process.detach().unwrap();
        let state = device.state();
        assert!(!state
            .conditions
            .contains(ExecutionConditions::SOURCE_LEVEL_DEBUGGING));
        assert!(state.last_breakpoints().is_empty());
        assert!(matches!(process.stop(), Err(Error::ShuttingDown)));
    });
}

#[test]
#[serial]
fn test_attach_to_stopped_device() {
    let mut state = program();
    state.conditions |= ExecutionConditions::STOPPED;
    device_env!(state, engine, device, {
        let process = attach(&engine);
        assert!(process.is_paused());
        assert_eq!(process.stop_count(), 1);

        assert!(process.resume().unwrap());
        assert!(!process.is_paused());
        assert_eq!(device.state().resumes, 1);
    });
}

#[test]
#[serial]
fn test_breakpoint_hit_holds_device_until_resume() {
    device_env!(program(), engine, device, {
        let process = attach(&engine);
        let ids = process.set_breakpoint(1, 0x0600_0003, 12).unwrap();
        assert_eq!(ids.len(), 1);
        assert!(device
            .state()
            .last_breakpoints()
            .contains(&BreakpointDef {
                id: ids[0] as u16,
                ..BreakpointDef {
                    pid: 0x7FFF_FFFF,
                    depth: 0x7FFF_FFFF,
                    ..hard_hit(0, app_method(2), 12)
                }
            }));

        device.hit([hard_hit(1, app_method(2), 12)], true);
        assert_eq!(
            next_stop(&process),
            DebugEvent::Breakpoint {
                id: ids[0],
                pid: 1,
                md: app_method(2),
                ip: 12
            }
        );
        assert!(process.is_paused());
        assert_eq!(process.stop_count(), 1);

        let backtrace = process.backtrace(1).unwrap();
        assert_eq!(backtrace.len(), 2);
        assert_eq!(backtrace[0].md, app_method(2));
        assert_eq!(backtrace[0].ip, 12);
        assert_eq!(backtrace[0].depth, 1);
        let function = backtrace[0].function.as_ref().unwrap();
        assert_eq!(function.assembly, 1);
        assert_eq!(function.clr_token, 0x0600_0003);
        assert_eq!(backtrace[1].depth, 0);
        assert_eq!(process.frame(1, 0).unwrap().md, app_method(0));

        assert!(wait_until(EVENT_TIMEOUT, || process.pending_hits() == 0));
        assert_eq!(device.state().resumes, 0);
        assert!(process.resume().unwrap());
        assert!(!process.is_paused());
        assert_eq!(device.state().resumes, 1);
        assert!(matches!(process.backtrace(1), Err(Error::ProcessNotStopped)));
    });
}

#[test]
#[serial]
fn test_resume_gated_by_queued_event() {
    device_env!(program(), engine, device, {
        let process = attach(&engine);
        process.drain_events();
        process.set_breakpoint(1, 0x0600_0003, 12).unwrap();

        process.stop().unwrap();
        assert!(process.is_paused());
        assert_eq!(process.stop_count(), 1);

        device.hit([hard_hit(1, app_method(2), 12)], true);
        assert!(wait_until(EVENT_TIMEOUT, || {
            process.queued_events() == 1 && process.pending_hits() == 0
        }));

        // the breakpoint event is not seen by the host yet
        assert!(!process.resume().unwrap());
        assert_eq!(process.stop_count(), 0);
        assert!(process.is_paused());

        assert!(matches!(next_stop(&process), DebugEvent::Breakpoint { .. }));
        assert_eq!(process.stop_count(), 1);
        assert!(process.resume().unwrap());
        assert_eq!(device.state().resumes, 1);
    });
}

#[test]
#[serial]
fn test_hit_without_stop_vote_resumes_device() {
    device_env!(program(), engine, device, {
        let process = attach(&engine);
        process.drain_events();
        device.state().threads.push(2);

        let created = BreakpointDef {
            flags: BreakpointFlags::THREAD_CREATED,
            pid: 2,
            ..BreakpointDef::default()
        };
        // no end-of-queue marker, the empty status reply ends the drain
        device.hit([created, hard_hit(1, app_method(5), 0)], false);

        assert!(wait_until(EVENT_TIMEOUT, || device.state().resumes == 1));
        assert_eq!(device.state().count(Command::EXECUTION_BREAKPOINT_STATUS), 3);
        assert_eq!(
            process.next_event(EVENT_TIMEOUT),
            Some(DebugEvent::ThreadCreated { pid: 2 })
        );
        assert_eq!(process.threads(), vec![1, 2]);
        assert!(!process.is_paused());
        assert_eq!(process.stop_count(), 0);

        // with the marker the queue is not asked again
        device.hit([hard_hit(1, app_method(5), 0)], true);
        assert!(wait_until(EVENT_TIMEOUT, || device.state().resumes == 2));
        assert_eq!(device.state().count(Command::EXECUTION_BREAKPOINT_STATUS), 4);
    });
}

#[test]
#[serial]
fn test_long_hit_queue_is_drained_before_resume() {
    device_env!(program(), engine, device, {
        let process = attach(&engine);
        process.drain_events();

        // nothing matches these, no end-of-queue marker
        let hits: Vec<_> = (0..70).map(|ip| hard_hit(1, app_method(5), ip)).collect();
        device.hit(hits, false);

        assert!(wait_until(EVENT_TIMEOUT, || device.state().resumes == 1));
        {
            let state = device.state();
            assert!(state.hits.is_empty());
            assert_eq!(state.count(Command::EXECUTION_BREAKPOINT_STATUS), 71);
        }
        assert!(wait_until(EVENT_TIMEOUT, || process.pending_hits() == 0));
        assert!(!process.is_paused());
        assert_eq!(device.state().resumes, 1);
    });
}

#[test]
#[serial]
fn test_failed_drain_keeps_device_stopped() {
    device_env!(program(), engine, device, {
        let process = attach(&engine);
        process.drain_events();
        process.set_breakpoint(1, 0x0600_0003, 12).unwrap();

        device.state().garbled_status = true;
        device.hit([hard_hit(1, app_method(2), 12)], true);

        assert!(matches!(next_stop(&process), DebugEvent::DrainFailed { .. }));
        assert!(wait_until(EVENT_TIMEOUT, || process.pending_hits() == 0));
        assert!(process.is_paused());
        assert_eq!(process.stop_count(), 1);
        assert_eq!(device.state().resumes, 0);

        // the host owns the stop and lets the device go
        device.state().garbled_status = false;
        assert!(process.resume().unwrap());
        assert_eq!(device.state().resumes, 1);
    });
}

#[test]
#[serial]
fn test_pause_state_readable_during_resume() {
    let mut state = program();
    state.conditions |= ExecutionConditions::STOPPED;
    device_env!(state, engine, device, {
        let process = attach(&engine);
        assert_eq!(process.stop_count(), 1);

        device.state().silent = true;
        let sent = device.state().count(Command::EXECUTION_CHANGE_CONDITIONS);
        let resume = {
            let process = process.clone();
            std::thread::spawn(move || process.resume())
        };
        assert!(wait_until(EVENT_TIMEOUT, || {
            device.state().count(Command::EXECUTION_CHANGE_CONDITIONS) > sent
        }));

        // the resume exchange is still waiting for a reply
        let started = Instant::now();
        assert!(process.is_paused());
        assert_eq!(process.stop_count(), 0);
        assert!(started.elapsed() < Duration::from_millis(100));
        assert!(!resume.is_finished());

        // an unconfirmed resume leaves the process paused
        assert!(!matches!(resume.join().unwrap(), Ok(true)));
        assert!(process.is_paused());
    });
}

#[test]
#[serial]
fn test_breakpoint_per_app_domain() {
    let mut state = program();
    state
        .app_domains
        .push((2, "plugin".to_string(), vec![1]));
    state.stacks.get_mut(&1).unwrap().0 = 2;
    device_env!(state, engine, device, {
        let process = attach(&engine);
        let ids = process.set_breakpoint(1, 0x0600_0003, 12).unwrap();
        assert_eq!(ids.len(), 2);

        // both bindings are one device breakpoint
        let hard: Vec<_> = device
            .state()
            .last_breakpoints()
            .into_iter()
            .filter(|d| d.flags.contains(BreakpointFlags::HARD))
            .collect();
        assert_eq!(hard.len(), 1);

        device.hit([hard_hit(1, app_method(2), 12)], true);
        assert_eq!(
            next_stop(&process),
            DebugEvent::Breakpoint {
                id: ids[1],
                pid: 1,
                md: app_method(2),
                ip: 12
            }
        );
        assert_eq!(process.queued_events(), 0);
    });
}

#[test]
#[serial]
fn test_step_over() {
    device_env!(program(), engine, device, {
        let process = attach(&engine);
        process.stop().unwrap();

        assert!(process.step(1, StepKind::Over).unwrap());
        let step = device
            .state()
            .last_breakpoints()
            .into_iter()
            .find(|d| d.flags.contains(BreakpointFlags::STEP_OVER))
            .unwrap();
        assert_eq!((step.pid, step.depth, step.md), (1, 1, app_method(2)));
        assert_eq!((step.ip_start, step.ip_end), (12, 13));
        assert_eq!(device.state().resumes, 1);

        let landed = BreakpointDef {
            flags: BreakpointFlags::STEP_OVER,
            ..hard_hit(1, app_method(2), 20)
        };
        device.hit([landed], true);
        assert_eq!(
            next_stop(&process),
            DebugEvent::StepComplete {
                pid: 1,
                reason: StepReason::Normal
            }
        );
        // the stepper is gone once the step completes
        assert!(wait_until(EVENT_TIMEOUT, || {
            !device
                .state()
                .last_breakpoints()
                .iter()
                .any(|d| d.flags.contains(BreakpointFlags::STEP_OVER))
        }));
    });
}

#[test]
#[serial]
fn test_repeated_step_stops_are_classified_alike() {
    device_env!(program(), engine, device, {
        let process = attach(&engine);
        process.stop().unwrap();

        let installed_stepper = || {
            let def = device
                .state()
                .last_breakpoints()
                .into_iter()
                .find(|d| d.flags.contains(BreakpointFlags::STEP_OVER))
                .unwrap();
            BreakpointDef { id: 0, ..def }
        };
        let step_hit = |ip| BreakpointDef {
            flags: BreakpointFlags::STEP_OVER,
            ..hard_hit(1, app_method(2), ip)
        };

        assert!(process.step(1, StepKind::Over).unwrap());
        let first = installed_stepper();
        assert_eq!(device.state().resumes, 1);

        // the device stops twice inside the origin range, both are transparent
        for resumes in [2, 3] {
            device.hit([step_hit(12)], true);
            assert!(wait_until(EVENT_TIMEOUT, || device.state().resumes == resumes));
            assert_eq!(process.queued_events(), 0);
            assert_eq!(installed_stepper(), first);
        }

        device.hit([step_hit(20)], true);
        let reason = next_stop(&process);
        assert_eq!(
            reason,
            DebugEvent::StepComplete {
                pid: 1,
                reason: StepReason::Normal
            }
        );

        assert!(wait_until(EVENT_TIMEOUT, || {
            !device
                .state()
                .last_breakpoints()
                .iter()
                .any(|d| d.flags.contains(BreakpointFlags::STEP_OVER))
        }));

        // stepping again from the unchanged frame arms the same stepper
        assert!(process.step(1, StepKind::Over).unwrap());
        assert_eq!(installed_stepper(), first);
        device.hit([step_hit(20)], true);
        assert_eq!(next_stop(&process), reason);
        assert_eq!(process.queued_events(), 0);
    });
}

#[test]
#[serial]
fn test_blocking_evaluation() {
    let state = SimState {
        scratch_value: Some(42),
        ..program()
    };
    device_env!(state, engine, device, {
        let process = attach(&engine);
        process.stop().unwrap();

        let evaluation = {
            let process = process.clone();
            std::thread::spawn(move || process.evaluate(1, 1, 0x0600_0001, &[]))
        };
        assert!(wait_until(EVENT_TIMEOUT, || {
            device
                .state()
                .last_breakpoints()
                .iter()
                .any(|d| d.flags.contains(BreakpointFlags::EVAL_COMPLETE) && d.pid == 100)
        }));
        assert!(process.is_evaluating(1));

        let complete = BreakpointDef {
            flags: BreakpointFlags::EVAL_COMPLETE,
            pid: 100,
            ..BreakpointDef::default()
        };
        device.hit([complete], true);

        let value = evaluation.join().unwrap().unwrap().unwrap();
        assert_eq!(value.as_i64(), Some(42));
        assert!(!process.is_evaluating(1));
        assert_eq!(process.threads(), vec![1]);

        // the host stop survives the evaluation
        assert!(process.is_paused());
        assert_eq!(process.stop_count(), 1);
        assert_eq!(process.queued_events(), 0);
        assert_eq!(device.state().count(Command::THREAD_CREATE_EX), 1);
    });
}

fn eval_complete(pid: u32) -> BreakpointDef {
    BreakpointDef {
        flags: BreakpointFlags::EVAL_COMPLETE,
        pid,
        ..BreakpointDef::default()
    }
}

#[test]
#[serial]
fn test_nested_evaluation() {
    let state = SimState {
        scratch_value: Some(42),
        ..program()
    };
    device_env!(state, engine, device, {
        let process = attach(&engine);
        process.stop().unwrap();

        let outer = process.begin_evaluate(1, 1, 0x0600_0001, &[]).unwrap();
        assert_eq!(outer, 100);
        device.hit([eval_complete(outer)], true);
        assert!(matches!(
            next_stop(&process),
            DebugEvent::EvalComplete {
                pid: 1,
                virtual_pid: 100,
                ..
            }
        ));
        assert_eq!(process.stop_count(), 2);

        // the outer evaluation is stopped, a new one runs on top of it
        let inner = {
            let process = process.clone();
            std::thread::spawn(move || process.evaluate(1, 1, 0x0600_0001, &[]))
        };
        assert!(wait_until(EVENT_TIMEOUT, || {
            device
                .state()
                .last_breakpoints()
                .iter()
                .any(|d| d.flags.contains(BreakpointFlags::EVAL_COMPLETE) && d.pid == 101)
        }));
        assert_eq!(device.state().spawned, vec![(100, 1), (101, 100)]);
        assert_eq!(process.threads(), vec![1, 100, 101]);

        device.hit([eval_complete(101)], true);
        let value = inner.join().unwrap().unwrap().unwrap();
        assert_eq!(value.as_i64(), Some(42));
        assert_eq!(process.threads(), vec![1, 100]);
        assert!(process.is_evaluating(1));
        assert!(process.is_evaluating(outer));

        // a virtual thread id that is still in use is refused
        device.state().next_vpid = outer;
        assert!(matches!(
            process.begin_evaluate(1, 1, 0x0600_0001, &[]),
            Err(Error::EvaluationInProgress(100))
        ));

        let value = process.end_evaluate(1).unwrap().unwrap();
        assert_eq!(value.as_i64(), Some(42));
        assert!(!process.is_evaluating(1));
        assert_eq!(process.threads(), vec![1]);
        assert!(process.is_paused());
        assert_eq!(process.stop_count(), 2);
    });
}

#[test]
#[serial]
fn test_rejected_scratch_pad_resize_keeps_capacity() {
    let state = SimState {
        reject_resize: true,
        ..program()
    };
    device_env!(state, engine, device, {
        let process = attach(&engine);
        assert!(matches!(
            process.reserve_slot(),
            Err(Error::Rejected(Command::VALUE_RESIZE_SCRATCH_PAD))
        ));
        // the pad did not grow, the same resize is requested again
        assert!(process.reserve_slot().is_err());
        assert_eq!(device.state().resizes, vec![4, 4]);

        device.state().reject_resize = false;
        let slot = process.reserve_slot().unwrap();
        assert_eq!(slot.index, 0);
        assert_eq!(process.reserve_slot().unwrap().index, 1);
        assert_eq!(device.state().resizes, vec![4, 4, 4]);
    });
}

#[test]
#[serial]
fn test_program_exit() {
    device_env!(program(), engine, device, {
        let process = attach(&engine);
        process.drain_events();

        device.send(Command::PROGRAM_EXIT, bytes::Bytes::new());
        assert_eq!(
            process.next_event(EVENT_TIMEOUT),
            Some(DebugEvent::ThreadExited { pid: 1 })
        );
        assert_eq!(process.next_event(EVENT_TIMEOUT), Some(DebugEvent::ProcessExited));
        assert!(process.is_exited());
        assert!(process.threads().is_empty());
        assert!(matches!(process.stop(), Err(Error::ProcessExited)));
    });
}

#[test]
#[serial]
fn test_thread_suspend_is_edge_triggered() {
    device_env!(program(), engine, device, {
        let process = attach(&engine);
        assert!(process.suspend_thread(1).unwrap());
        assert!(process.suspend_thread(1).unwrap());
        assert!(process.is_thread_suspended(1).unwrap());
        assert_eq!(device.state().count(Command::THREAD_SUSPEND), 1);

        assert!(process.resume_thread(1).unwrap());
        assert!(process.resume_thread(1).unwrap());
        assert!(!process.is_thread_suspended(1).unwrap());
        assert_eq!(device.state().count(Command::THREAD_RESUME), 1);

        assert!(matches!(
            process.suspend_thread(9),
            Err(Error::ThreadNotFound(9))
        ));
    });
}

#[test]
#[serial]
fn test_stack_values() {
    let mut state = program();
    state.locals.insert((1, 1, 0), 7);
    device_env!(state, engine, device, {
        let process = attach(&engine);
        assert!(matches!(
            process.stack_value(1, 1, StackSlot::Local(0)),
            Err(Error::ProcessNotStopped)
        ));
        process.stop().unwrap();

        let local = process
            .stack_value(1, 1, StackSlot::Local(0))
            .unwrap()
            .unwrap();
        assert_eq!(local.as_i64(), Some(7));
        assert_eq!(local.reference, local_reference(1, 1, 0));

        assert!(process.set_value(&local, &(-3i32).to_le_bytes()).unwrap());
        assert_eq!(device.state().locals[&(1, 1, 0)], -3);
        let local = process
            .stack_value(1, 1, StackSlot::Local(0))
            .unwrap()
            .unwrap();
        assert_eq!(local.as_i64(), Some(-3));

        // the device rejects unknown slots
        assert_eq!(
            process.stack_value(1, 1, StackSlot::Argument(0)).unwrap(),
            None
        );
    });
}
