//! Workflow Definition Module
//!
//! Provides data structures and utilities for defining, parsing,
//! validating and storing workflow definitions.
//!
//! # Structure
//!
//! - [`model`]: Core data structures (WorkflowDefinition, Step, Transition)
//! - [`parser`]: YAML/JSON loading and saving
//! - [`validator`]: Structural and semaphore validation
//! - [`store`]: Definition storage by URI

pub mod model;
pub mod parser;
pub mod store;
pub mod validator;

pub use model::{
    split_start_step, ExpectedArgument, NextStep, SemaphoreConfig, SemaphoreType, Step,
    Transition, WorkflowDefinition,
};
pub use parser::{load_workflow, save_workflow};
pub use store::{DefinitionBackend, DirectoryBackend, MemoryBackend, WorkflowStore};
pub use validator::{validate_semaphore, validate_workflow, ValidationError};
