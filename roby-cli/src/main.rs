// Licensed under the Apache License, Version 2.0.

//! A small demonstration binary: registers one controllable task, wires its mission, and runs a
//! handful of engine cycles, logging every structural event through `env_logger`.
//!
//! Usage: `roby-cli [--cycles N] [--verbose]`

use std::sync::Arc;
use std::time::Duration;

use roby::{CommandFn, Engine, EngineConfig, Value};

struct Args {
    cycles: u32,
    verbose: bool,
}

fn parse_args() -> Args {
    let mut cycles = 5;
    let mut verbose = false;
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--cycles" => {
                if let Some(value) = args.next() {
                    cycles = value.parse().unwrap_or(cycles);
                }
            }
            "--verbose" => verbose = true,
            other => eprintln!("ignoring unrecognized argument: {other}"),
        }
    }
    Args { cycles, verbose }
}

fn main() {
    let args = parse_args();
    let level = if args.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    let mut engine = Engine::new(EngineConfig {
        cycle_length: Duration::from_millis(50),
        ..EngineConfig::default()
    });

    let start_command: CommandFn = Arc::new(|_ctx: &roby::Context| {
        log::info!("demo task starting");
        Ok(Some(vec![Value::Text("started".to_string())]))
    });
    let stop_command: CommandFn = Arc::new(|_ctx: &roby::Context| {
        log::info!("demo task stopping");
        Ok(Some(vec![Value::Text("stopped".to_string())]))
    });

    let task = {
        let plan = engine.plan_mut();
        let task = plan.register_task("demo_task", Some(start_command), Some(stop_command));
        plan.add_mission(task);
        let start_event = plan.task(task).expect("task just registered").start_event();
        plan.call(start_event, Vec::new()).expect("start is controllable");
        task
    };

    for _ in 0..args.cycles {
        engine.run_cycle();
    }

    let stop_event = engine.plan().task(task).map(|t| t.stop_event());
    if let Some(stop_event) = stop_event {
        let _ = engine.plan_mut().emit(stop_event, Vec::new());
        engine.run_cycle();
    }

    println!("ran {} cycle(s)", engine.cycle_index());
}
