//! Orderflow - Work Order Orchestration Engine
//!
//! Runs work orders, instances of workflow definitions made of sequential
//! steps, behind a semaphore layer that bounds how many orders of a kind
//! may run at once. Policies throttle either a whole workflow or each
//! value of a named parameter, and a per-acquisition timeout reclaims
//! slots held by stuck orders.
//!
//! # Architecture
//!
//! - [`workflow`]: Definition model, validation, parsing and storage
//! - [`semaphore`]: Admission control keyed by workflow or property value
//! - [`order`]: Work order state and persistence
//! - [`execution`]: Scheduler, execution driver and step executors
//! - [`config`]: Runtime configuration
//!
//! # Example
//!
//! ```rust,no_run
//! use std::collections::HashMap;
//! use std::sync::Arc;
//! use std::time::Duration;
//! use orderflow::{load_workflow, ShellExecutor, WorkOrderScheduler};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let scheduler = WorkOrderScheduler::in_memory(Arc::new(ShellExecutor::new()));
//!
//!     let workflow = load_workflow("nightly.yaml")?;
//!     let uri = workflow.workflow_uri.clone();
//!     scheduler.put_workflow(workflow)?;
//!
//!     let mut params = HashMap::new();
//!     params.insert("REGION".to_string(), "emea".to_string());
//!
//!     let response = scheduler.create_work_order(&uri, params, "cli").await?;
//!     if let Some(order_uri) = response.uri {
//!         let order = scheduler
//!             .wait_for_completion(&order_uri, Duration::from_millis(250))
//!             .await?;
//!         println!("{}: {}", order_uri, order.status);
//!     }
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod execution;
pub mod order;
pub mod semaphore;
pub mod workflow;

// Re-export commonly used types
pub use config::EngineConfig;
pub use error::{OrderflowError, Result};
pub use execution::{CreateResponse, ShellExecutor, StepExecutor, StepOutcome, WorkOrderScheduler};
pub use order::{WorkOrder, WorkOrderStatus};
pub use semaphore::SemaphoreManager;
pub use workflow::model::{SemaphoreConfig, SemaphoreType, Step, WorkflowDefinition};
pub use workflow::parser::load_workflow;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Application name
pub const APP_NAME: &str = "Orderflow";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_library_version() {
        assert!(!VERSION.is_empty());
        assert!(VERSION.contains('.'));
    }

    #[test]
    fn test_app_name() {
        assert_eq!(APP_NAME, "Orderflow");
    }

    #[test]
    fn test_module_exports_step() {
        let step = Step::new("test", "echo test");
        assert_eq!(step.name, "test");
        assert_eq!(step.executable, "echo test");
    }

    #[test]
    fn test_module_exports_workflow() {
        let workflow = WorkflowDefinition::new("workflow://test", "first");
        assert!(workflow.is_empty());
        assert_eq!(workflow.semaphore_type, SemaphoreType::None);
    }

    #[test]
    fn test_version_format() {
        let parts: Vec<&str> = VERSION.split('.').collect();
        assert!(parts.len() >= 2, "Version should have at least major.minor");
        for part in parts {
            assert!(part.parse::<u32>().is_ok(), "Version components should be numeric");
        }
    }
}
