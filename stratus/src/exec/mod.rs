//! Execution: worker loops, child processes, and the code that runs inside
//! a child.

pub mod child;
pub mod executor;
pub mod overrides;
pub mod worker;

pub use child::{ChildOutcome, ChildRunner, InlineChildRunner, ProcessChildRunner};
pub use executor::{ExecSettings, execute_request, spawn_term_handler};
pub use overrides::{EnvGuard, merge_config_overrides};
pub use worker::{Worker, WorkerConfig};
