// Licensed under the Apache License, Version 2.0.

//! `ExecutionEngine`: owns the single engine thread that drives `Plan` through its cycles, and
//! the thread-safe submission queues other threads use to reach it (§4.7, §4.7.1, §5).
//!
//! Grounded on the teacher's `task_executor::Executor`: a small `tokio` current-thread runtime
//! kept around only to drive background I/O for controllable commands that defer emission, never
//! to drive the cycle loop itself (§9 "Single-threaded engine, not async/await").

use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::ThreadId;
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender};
use fnv::FnvHashSet as HashSet;
use tokio::runtime::{Builder, Runtime};

use crate::clock::{Clock, SystemClock};
use crate::error::RobyError;
use crate::ids::PlanObjectId;
use crate::logging::{DefaultLogSink, LogEvent, LogSink};
use crate::plan::Plan;

/// Cycle pacing and garbage-collection policy (§6 "External interfaces").
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Target wall-clock duration of one cycle; the engine sleeps out the remainder.
    pub cycle_length: Duration,
    /// Whether `garbage_collect` runs automatically at the end of every cycle.
    pub control_gc: bool,
    /// Grace period `quit` waits for outstanding tasks to stop on their own before the engine
    /// force-quarantines what remains and exits.
    pub quit_grace_period: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            cycle_length: Duration::from_millis(100),
            control_gc: true,
            quit_grace_period: Duration::from_secs(5),
        }
    }
}

type OnceJob = Box<dyn FnOnce(&mut Plan) + Send>;
type CycleJob = Box<dyn FnMut(&mut Plan) + Send>;

enum ExecuteReply<T> {
    Done(T),
}

/// A handle other threads use to reach a running engine: the thread-safe half of §4.7.1.
#[derive(Clone)]
pub struct EngineHandle {
    once_tx: Sender<OnceJob>,
    quit_requested: Arc<AtomicBool>,
    engine_thread: Arc<Mutex<Option<ThreadId>>>,
}

impl EngineHandle {
    /// Submits a job to run once at the start of the engine's next cycle, from any thread.
    pub fn once(&self, job: impl FnOnce(&mut Plan) + Send + 'static) {
        let _ = self.once_tx.send(Box::new(job));
    }

    /// Runs `job` on the engine thread and blocks the calling thread until it completes,
    /// returning its result. If called from the engine thread itself, runs inline instead of
    /// deadlocking on its own queue (§4.7.1's "execute-on-engine blocking trampoline").
    pub fn execute<T: Send + 'static>(&self, job: impl FnOnce(&mut Plan) -> T + Send + 'static) -> T {
        if self.on_engine_thread() {
            panic!("EngineHandle::execute called recursively from the engine thread");
        }
        let (reply_tx, reply_rx) = crossbeam_channel::bounded::<ExecuteReply<T>>(1);
        self.once(move |plan| {
            let result = job(plan);
            let _ = reply_tx.send(ExecuteReply::Done(result));
        });
        match reply_rx.recv() {
            Ok(ExecuteReply::Done(value)) => value,
            Err(_) => panic!("engine shut down before executing the submitted job"),
        }
    }

    pub fn on_engine_thread(&self) -> bool {
        self.engine_thread.lock().unwrap().as_ref() == Some(&std::thread::current().id())
    }

    pub fn quit(&self) {
        self.quit_requested.store(true, Ordering::SeqCst);
    }
}

impl fmt::Debug for EngineHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineHandle").finish_non_exhaustive()
    }
}

/// The cycle-driving engine. `run` (or `run_for`) owns the calling thread for its duration: that
/// thread becomes "the engine thread" for the lifetime of the run, and every `Plan` mutation not
/// routed through `EngineHandle` must originate from it (`RobyError::ThreadMismatch` otherwise).
pub struct Engine {
    plan: Plan,
    config: EngineConfig,
    clock: Arc<dyn Clock>,
    once_rx: Receiver<OnceJob>,
    once_tx: Sender<OnceJob>,
    each_cycle: Vec<CycleJob>,
    at_cycle_end: Vec<CycleJob>,
    cycle_index: u64,
    quit_requested: Arc<AtomicBool>,
    engine_thread: Arc<Mutex<Option<ThreadId>>>,
    background: Runtime,
}

impl Engine {
    pub fn new(config: EngineConfig) -> Self {
        Self::with_clock_and_log(config, Arc::new(SystemClock), Box::new(DefaultLogSink))
    }

    pub fn with_clock_and_log(config: EngineConfig, clock: Arc<dyn Clock>, log: Box<dyn LogSink>) -> Self {
        let (once_tx, once_rx) = crossbeam_channel::unbounded();
        let background = Builder::new_current_thread()
            .enable_time()
            .build()
            .expect("failed to start background runtime for deferred commands");
        Engine {
            plan: Plan::new(log, clock.clone()),
            config,
            clock,
            once_rx,
            once_tx,
            each_cycle: Vec::new(),
            at_cycle_end: Vec::new(),
            cycle_index: 0,
            quit_requested: Arc::new(AtomicBool::new(false)),
            engine_thread: Arc::new(Mutex::new(None)),
            background,
        }
    }

    pub fn handle(&self) -> EngineHandle {
        EngineHandle {
            once_tx: self.once_tx.clone(),
            quit_requested: self.quit_requested.clone(),
            engine_thread: self.engine_thread.clone(),
        }
    }

    pub fn plan(&self) -> &Plan {
        &self.plan
    }

    pub fn plan_mut(&mut self) -> &mut Plan {
        &mut self.plan
    }

    /// Registers a job that runs once per cycle, every cycle, in registration order, after
    /// propagation but before garbage collection.
    pub fn each_cycle(&mut self, job: impl FnMut(&mut Plan) + Send + 'static) {
        self.each_cycle.push(Box::new(job));
    }

    /// Registers a job that runs once per cycle, after garbage collection.
    pub fn at_cycle_end(&mut self, job: impl FnMut(&mut Plan) + Send + 'static) {
        self.at_cycle_end.push(Box::new(job));
    }

    /// Hands a future to the background runtime; used by controllable commands that return
    /// `Ok(None)` (deferred emission) to kick off async I/O and later call back into the engine
    /// through `EngineHandle::once`/`execute` once it resolves.
    pub fn spawn_background<F>(&self, future: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        self.background.spawn(future);
    }

    /// Runs cycles until `quit`/`quit_now` is called on a handle, or `should_continue` returns
    /// false. Takes over the calling thread as "the engine thread" for the duration.
    pub fn run(&mut self, mut should_continue: impl FnMut() -> bool) {
        *self.engine_thread.lock().unwrap() = Some(std::thread::current().id());
        while should_continue() && !self.quit_requested.load(Ordering::SeqCst) {
            self.run_cycle();
        }
        self.shutdown();
    }

    /// Runs exactly one cycle; useful for tests and for embedding the engine in a caller-driven
    /// event loop instead of `run`'s owned loop.
    pub fn run_cycle(&mut self) {
        *self.engine_thread.lock().unwrap() = Some(std::thread::current().id());
        let started = self.clock.now();
        self.cycle_index += 1;
        self.plan.log_cycle_start(self.cycle_index);

        self.drain_once_jobs();
        self.plan.drain_delayed_signals();
        self.plan.run_propagation();

        for job in &mut self.each_cycle {
            job(&mut self.plan);
        }
        self.plan.run_poll_handlers();

        // Structure checks (§4.7): mission/permanent-task failures feed the same pipeline as
        // propagation's own fatal errors, so a failed mission routes through exception handlers
        // and, if unhandled, is killed in the same cycle it failed in (S6).
        let mut errors = self.plan.mission_failure_checks();
        errors.extend(self.plan.take_propagation_exceptions());
        let fatal = self.plan.propagate_exceptions(errors);

        if self.config.control_gc {
            let mut kill_set: HashSet<PlanObjectId> = HashSet::default();
            for exc in &fatal {
                log::error!("unhandled fatal exception from {}: {}", exc.origin, exc.error);
                kill_set.extend(self.plan.kill_set_for(exc.origin));
            }
            self.plan.garbage_collect(&kill_set);
        } else {
            for exc in &fatal {
                log::error!("unhandled fatal exception from {}: {}", exc.origin, exc.error);
            }
        }

        for job in &mut self.at_cycle_end {
            job(&mut self.plan);
        }
        self.plan.log_cycle_end(self.cycle_index);

        let elapsed = self.clock.now().saturating_duration_since(started);
        if let Some(remaining) = self.config.cycle_length.checked_sub(elapsed) {
            std::thread::sleep(remaining);
        }
    }

    fn drain_once_jobs(&mut self) {
        while let Ok(job) = self.once_rx.try_recv() {
            let result = catch_unwind(AssertUnwindSafe(|| job(&mut self.plan)));
            if result.is_err() {
                log::error!("a once-submitted job panicked");
            }
        }
    }

    /// Orderly shutdown: gives running tasks `quit_grace_period` to stop themselves (forcing GC
    /// every remaining cycle), then quarantines whatever is left.
    pub fn quit(&mut self) {
        let deadline = self.clock.now() + self.config.quit_grace_period;
        loop {
            let force: HashSet<PlanObjectId> = self.plan.running_task_ids();
            self.plan.garbage_collect(&force);
            if self.plan.task_count() == 0 || self.clock.now() >= deadline {
                break;
            }
            self.plan.run_propagation();
            std::thread::sleep(Duration::from_millis(10));
        }
        self.quit_now();
    }

    /// Immediate shutdown: no grace period, whatever refuses to stop gets quarantined right away.
    pub fn quit_now(&mut self) {
        let force: HashSet<PlanObjectId> = self.plan.running_task_ids();
        self.plan.garbage_collect(&force);
        self.quit_requested.store(true, Ordering::SeqCst);
    }

    fn shutdown(&mut self) {
        *self.engine_thread.lock().unwrap() = None;
    }

    pub fn cycle_index(&self) -> u64 {
        self.cycle_index
    }
}

/// Thread-identity guard used by `Plan`'s public mutators when a caller has direct `&mut Plan`
/// access outside the engine loop (e.g. a test driving `Plan` without an `Engine`). Returns
/// `ThreadMismatch` when `expected` is set and differs from the current thread.
pub fn check_engine_thread(expected: Option<ThreadId>) -> Result<(), RobyError> {
    match expected {
        Some(id) if id != std::thread::current().id() => Err(RobyError::ThreadMismatch),
        _ => Ok(()),
    }
}
