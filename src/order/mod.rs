//! Work Order Module
//!
//! Runtime instances of workflow definitions and their persistence.
//!
//! - [`model`]: WorkOrder, WorkOrderStatus and step history
//! - [`store`]: In-memory and file-backed order stores

pub mod model;
pub mod store;

pub use model::{work_order_uri, StepRecord, WorkOrder, WorkOrderStatus};
pub use store::{DirectoryOrderStore, MemoryOrderStore, WorkOrderStore};
