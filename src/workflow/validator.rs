//! Workflow Validation
//!
//! Structural checks run when a definition is put:
//! - Step field validation
//! - Start step and transition target integrity
//! - Semaphore configuration well-formedness

use std::collections::HashSet;

use log::{debug, info, warn};

use super::model::{SemaphoreConfig, SemaphoreType, Step, WorkflowDefinition};
use crate::error::{OrderflowError, Result};

/// Validation error types for user-friendly error messages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    EmptyWorkflowUri,
    EmptyWorkflow,
    DuplicateStepName(String),
    EmptyStepName,
    EmptyExecutable(String),
    UnknownStartStep(String),
    InvalidTransition { step: String, target: String },
    InvalidMaxAllowed(i64),
    NegativeTimeout(i64),
    MissingPropertyName,
    UnexpectedPropertyName(SemaphoreType),
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::EmptyWorkflowUri => write!(f, "Workflow has no URI"),
            Self::EmptyWorkflow => write!(f, "Workflow has no steps"),
            Self::DuplicateStepName(name) => write!(f, "Duplicate step name: '{}'", name),
            Self::EmptyStepName => write!(f, "Step has empty or whitespace-only name"),
            Self::EmptyExecutable(step) => write!(f, "Step '{}' has no executable specified", step),
            Self::UnknownStartStep(name) => write!(f, "Start step '{}' is not defined", name),
            Self::InvalidTransition { step, target } => {
                write!(f, "Step '{}' transitions to unknown step '{}'", step, target)
            }
            Self::InvalidMaxAllowed(value) => {
                write!(f, "Semaphore maxAllowed must be at least 1 (got {})", value)
            }
            Self::NegativeTimeout(value) => {
                write!(f, "Semaphore timeout must not be negative (got {})", value)
            }
            Self::MissingPropertyName => {
                write!(f, "PROPERTY_BASED semaphore requires a propertyName")
            }
            Self::UnexpectedPropertyName(kind) => {
                write!(f, "propertyName is only valid for PROPERTY_BASED semaphores, not {}", kind)
            }
        }
    }
}

impl From<ValidationError> for OrderflowError {
    fn from(err: ValidationError) -> Self {
        OrderflowError::Config(err.to_string())
    }
}

/// Validates a single step's fields.
fn validate_step(step: &Step) -> Vec<ValidationError> {
    let mut errors = Vec::new();

    if step.name.trim().is_empty() {
        errors.push(ValidationError::EmptyStepName);
        return errors;
    }

    if step.executable.trim().is_empty() {
        errors.push(ValidationError::EmptyExecutable(step.name.clone()));
    }

    if step.transitions.is_empty() {
        debug!("Step '{}' has no transitions (finishes the work order)", step.name);
    }

    errors
}

/// Checks a semaphore policy.
///
/// `NONE` accepts any config since it is never consulted.
pub fn validate_semaphore(
    semaphore_type: SemaphoreType,
    config: &SemaphoreConfig,
) -> std::result::Result<(), ValidationError> {
    if semaphore_type == SemaphoreType::None {
        return Ok(());
    }

    if config.max_allowed < 1 {
        return Err(ValidationError::InvalidMaxAllowed(config.max_allowed));
    }

    if config.timeout_secs < 0 {
        return Err(ValidationError::NegativeTimeout(config.timeout_secs));
    }

    let has_property = config
        .property_name
        .as_deref()
        .map(|p| !p.trim().is_empty())
        .unwrap_or(false);

    match (semaphore_type, has_property) {
        (SemaphoreType::PropertyBased, false) => Err(ValidationError::MissingPropertyName),
        (SemaphoreType::WorkflowBased, true) => {
            Err(ValidationError::UnexpectedPropertyName(semaphore_type))
        }
        _ => Ok(()),
    }
}

/// Validates an entire workflow definition.
///
/// Performs the following checks:
/// 1. The definition has a URI and at least one step
/// 2. Step names are unique and non-empty, executables are set
/// 3. The start step exists
/// 4. Every transition targets a defined step or a terminal marker
/// 5. The semaphore config fits the semaphore type
///
/// All problems found are reported together in one configuration error.
pub fn validate_workflow(workflow: &WorkflowDefinition) -> Result<()> {
    info!(
        "Validating workflow {} with {} steps",
        workflow.workflow_uri,
        workflow.steps.len()
    );

    if workflow.workflow_uri.trim().is_empty() {
        return Err(ValidationError::EmptyWorkflowUri.into());
    }

    if workflow.steps.is_empty() {
        return Err(ValidationError::EmptyWorkflow.into());
    }

    let mut seen_names: HashSet<&str> = HashSet::new();
    for step in &workflow.steps {
        if !seen_names.insert(step.name.as_str()) {
            return Err(ValidationError::DuplicateStepName(step.name.clone()).into());
        }
    }

    let mut all_errors = Vec::new();

    if !seen_names.contains(workflow.start_step.as_str()) {
        all_errors.push(ValidationError::UnknownStartStep(workflow.start_step.clone()));
    }

    for step in &workflow.steps {
        all_errors.extend(validate_step(step));

        for transition in &step.transitions {
            if !transition.is_terminal() && !seen_names.contains(transition.target_step.as_str()) {
                all_errors.push(ValidationError::InvalidTransition {
                    step: step.name.clone(),
                    target: transition.target_step.clone(),
                });
            }
        }
    }

    if let Err(e) = validate_semaphore(workflow.semaphore_type, &workflow.semaphore_config) {
        all_errors.push(e);
    }

    if !all_errors.is_empty() {
        let error_messages: Vec<String> = all_errors.iter().map(|e| e.to_string()).collect();
        return Err(OrderflowError::Config(error_messages.join("\n")));
    }

    for name in unreachable_steps(workflow) {
        warn!("Workflow {}: step '{}' is unreachable", workflow.workflow_uri, name);
    }

    info!(
        "Workflow validated: {} steps, semaphore {}",
        workflow.steps.len(),
        workflow.semaphore_type
    );
    Ok(())
}

/// Steps that no path from the start step reaches.
///
/// Reachability is informational only; a step may still be entered through
/// a `#step` start override.
pub fn unreachable_steps(workflow: &WorkflowDefinition) -> Vec<String> {
    let mut visited: HashSet<&str> = HashSet::new();
    let mut stack = vec![workflow.start_step.as_str()];

    while let Some(name) = stack.pop() {
        if !visited.insert(name) {
            continue;
        }
        if let Some(step) = workflow.get_step(name) {
            for transition in &step.transitions {
                if !transition.is_terminal() {
                    stack.push(transition.target_step.as_str());
                }
            }
        }
    }

    workflow
        .steps
        .iter()
        .filter(|s| !visited.contains(s.name.as_str()))
        .map(|s| s.name.clone())
        .collect()
}
