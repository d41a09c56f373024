//! Work Order Execution Module
//!
//! Admits work orders and drives them through their workflow's steps.
//!
//! # Architecture
//!
//! - [`scheduler`]: Creation, admission, the per-order execution driver
//!   and status queries
//! - [`executor`]: The step executor seam and the bundled shell executor

pub mod executor;
pub mod scheduler;

pub use executor::{OrderContext, ShellExecutor, StepExecutor, StepOutcome};
pub use scheduler::{CreateResponse, WorkOrderScheduler};
