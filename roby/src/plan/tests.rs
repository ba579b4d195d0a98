// Licensed under the Apache License, Version 2.0.

use std::sync::Arc;

use crate::event::{CommandFn, Value};
use crate::plan::Plan;
use crate::testutil::{RecordingLogSink, TestClock};

fn new_plan() -> Plan {
    Plan::new(Box::new(RecordingLogSink::new()), Arc::new(TestClock::new()))
}

fn controllable(label: &'static str) -> CommandFn {
    Arc::new(move |_ctx| {
        Ok(Some(vec![Value::Text(label.to_string())]))
    })
}

/// S1: a task with controllable start/stop, `call`ed directly, runs start -> running -> success
/// forwards to stop -> finished(success).
#[test]
fn controllable_task_runs_to_success_via_default_forwarding() {
    let mut plan = new_plan();
    let task = plan.register_task("demo", Some(controllable("start")), Some(controllable("stop")));
    plan.add_mission(task);

    let start = plan.task(task).unwrap().start_event();
    plan.call(start, Vec::new()).unwrap();
    assert_eq!(plan.task(task).unwrap().state.to_string(), "running");

    let success = plan.task(task).unwrap().event_id(crate::task::SUCCESS).unwrap();
    plan.emit(success, Vec::new()).unwrap();

    let finished = plan.task(task).unwrap();
    assert!(finished.finished());
    assert_eq!(finished.success(), Some(true));
}

#[test]
fn failed_forwards_to_stop_as_failure() {
    let mut plan = new_plan();
    let task = plan.register_task("demo", Some(controllable("start")), Some(controllable("stop")));
    plan.add_mission(task);

    let start = plan.task(task).unwrap().start_event();
    plan.call(start, Vec::new()).unwrap();

    let failed = plan.task(task).unwrap().event_id(crate::task::FAILED).unwrap();
    plan.emit(failed, Vec::new()).unwrap();

    let finished = plan.task(task).unwrap();
    assert_eq!(finished.success(), Some(false));
    assert!(finished.failure_reason.is_some());
}

#[test]
fn internal_error_forwards_to_failed_and_raises_exception() {
    let mut plan = new_plan();
    let task = plan.register_task("demo", Some(controllable("start")), Some(controllable("stop")));
    plan.add_mission(task);
    let start = plan.task(task).unwrap().start_event();
    plan.call(start, Vec::new()).unwrap();

    let internal_error = plan
        .task(task)
        .unwrap()
        .event_id(crate::task::INTERNAL_ERROR)
        .unwrap();
    plan.emit(internal_error, Vec::new()).unwrap();

    assert_eq!(plan.task(task).unwrap().success(), Some(false));
    let exceptions = plan.take_propagation_exceptions();
    assert_eq!(exceptions.len(), 1);
}

#[test]
fn non_mission_non_running_task_is_collected() {
    let mut plan = new_plan();
    let task = plan.register_task("demo", Some(controllable("start")), Some(controllable("stop")));
    // Not marked as mission or permanent: immediately useless, and not running, so a GC pass
    // should finalize it right away.
    plan.garbage_collect(&Default::default());
    assert!(!plan.contains_task(task));
}

#[test]
fn mission_task_survives_gc_while_running() {
    let mut plan = new_plan();
    let task = plan.register_task("demo", Some(controllable("start")), Some(controllable("stop")));
    plan.add_mission(task);
    let start = plan.task(task).unwrap().start_event();
    plan.call(start, Vec::new()).unwrap();
    assert!(plan.task(task).unwrap().running());

    plan.garbage_collect(&Default::default());
    assert!(plan.contains_task(task), "a running mission task must not be finalized out from under itself");
}

#[test]
fn quarantined_task_is_excluded_from_further_gc_attempts() {
    let mut plan = new_plan();
    let parent = plan.register_task("parent", None, None);
    let child = plan.register_task("child", None, None);
    plan.add_hierarchy(parent, child).unwrap();
    plan.add_mission(parent);

    plan.quarantine(child);
    assert!(plan.is_quarantined(child));

    // Quarantine severed the hierarchy edge, so `child` is no longer reachable from the mission
    // and would ordinarily be GC'd; being quarantined instead leaves it untouched rather than
    // finalized out from under whatever still references it directly.
    plan.garbage_collect(&Default::default());
    assert!(plan.contains_task(child));
}

#[test]
fn and_combinator_waits_for_every_source() {
    let mut plan = new_plan();
    let a = plan.register_event(None);
    let b = plan.register_event(None);
    let and_id = plan.new_and(&[a, b]);

    plan.emit(a, vec![Value::Int(1)]).unwrap();
    assert!(!plan.event(and_id).unwrap().happened());

    plan.emit(b, vec![Value::Int(2)]).unwrap();
    assert!(plan.event(and_id).unwrap().happened());
}

#[test]
fn or_combinator_fires_on_first_source() {
    let mut plan = new_plan();
    let a = plan.register_event(None);
    let b = plan.register_event(None);
    let or_id = plan.new_or(&[a, b]);

    plan.emit(a, vec![Value::Int(1)]).unwrap();
    assert!(plan.event(or_id).unwrap().happened());
}

#[test]
fn call_on_non_controllable_event_is_rejected() {
    let mut plan = new_plan();
    let free = plan.register_event(None);
    assert!(plan.call(free, Vec::new()).is_err());
}
