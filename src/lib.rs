#![forbid(unsafe_code)]
#![doc = include_str!("../README.md")]

mod core;
mod diagnostics;
pub mod engine;
mod error;
mod orchestrator;
mod utils;
mod work;

pub use crate::core::{Firing, TaskId, TaskType};
pub use crate::diagnostics::{Diagnostics, TaskExecution};
pub use crate::engine::{CallOptions, Many, One, Params, Scope};
pub use crate::error::*;
pub use crate::orchestrator::{Config, Orchestrator, WeakOrchestrator};
pub use crate::work::{Fired, TaskHandle, Work, many, one};

#[cfg(feature = "logging")]
pub use crate::utils::init_logging;
