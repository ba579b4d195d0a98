// Licensed under the Apache License, Version 2.0.

//! A plan-based supervision engine: tasks and events wired by typed relations, driven to a
//! propagation fixed point every cycle, with exceptions routed up the task hierarchy and garbage
//! collection reclaiming whatever the plan no longer needs.
//!
//! See `Plan` for the data model entry point and `Engine`/`EngineHandle` for running it.

mod clock;
mod combinators;
mod engine;
mod error;
mod event;
mod ids;
mod logging;
mod object;
mod plan;
mod propagation;
mod relations;
mod task;
pub mod testutil;

pub use clock::{Clock, SystemClock};
pub use combinators::{AndState, CombinatorState, OrState, UntilState};
pub use engine::{check_engine_thread, Engine, EngineConfig, EngineHandle};
pub use error::{ExecutionException, HandlerOutcome, RobyError};
pub use event::{
    CommandFn, Context, Event, EventRef, Handler, HandlerFn, OnReplace, PreconditionFn,
    PropagationMode, TerminalFlag, UnreachableHandler, UnreachableHandlerFn, UnreachableReason,
    Value,
};
pub use ids::{PeerId, PlanObjectId, LOCAL_PEER};
pub use logging::{DefaultLogSink, LogEvent, LogSink};
pub use object::{Executable, PlanObjectState};
pub use plan::Plan;
pub use relations::{DelaySpec, EdgeInfo, RelationKind};
pub use task::{
    ArgumentAlreadySet, ArgumentSlot, DelayedResolver, DelayedResult, PollFn, Task, TaskArguments,
    TaskState, FAILED, INTERNAL_ERROR, START, STOP, SUCCESS,
};
