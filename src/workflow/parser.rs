//! Workflow Parser
//!
//! Loads and saves workflow definitions as YAML or JSON files. JSON is
//! chosen by a `.json` extension; everything else is read as YAML.

use std::fs;
use std::path::Path;

use log::{debug, error, info};

use super::model::WorkflowDefinition;
use super::validator::validate_workflow;
use crate::error::{OrderflowError, Result};

/// Definition file encodings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    Yaml,
    Json,
}

impl Format {
    /// Picks the format from a file extension.
    pub fn from_path(path: &Path) -> Self {
        match path.extension().and_then(|e| e.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("json") => Format::Json,
            _ => Format::Yaml,
        }
    }
}

/// Parses a definition from text without validating it.
pub fn parse_workflow(content: &str, format: Format) -> Result<WorkflowDefinition> {
    let workflow = match format {
        Format::Json => serde_json::from_str(content).map_err(|e| {
            OrderflowError::Config(format!(
                "Failed to parse workflow JSON: {}. Check the file format.",
                e
            ))
        })?,
        Format::Yaml => serde_yaml::from_str(content).map_err(|e| {
            OrderflowError::Config(format!(
                "Failed to parse workflow YAML: {}. Check the file format.",
                e
            ))
        })?,
    };
    Ok(workflow)
}

/// Loads a workflow definition from a file.
///
/// This function:
/// 1. Reads the file
/// 2. Parses it as YAML or JSON
/// 3. Validates the definition structure
///
/// # Example
///
/// ```rust,no_run
/// use orderflow::workflow::load_workflow;
///
/// fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let workflow = load_workflow("daily.yaml")?;
///     println!("Loaded {} ({} steps)", workflow.workflow_uri, workflow.len());
///     Ok(())
/// }
/// ```
pub fn load_workflow(path: impl AsRef<Path>) -> Result<WorkflowDefinition> {
    let path = path.as_ref();
    info!("Loading workflow from: {}", path.display());

    let content = fs::read_to_string(path).map_err(|e| {
        error!(
            "Failed to read workflow file '{}': {}. Check that the file exists and is readable.",
            path.display(),
            e
        );
        OrderflowError::Io(e)
    })?;

    debug!("Workflow content loaded ({} bytes)", content.len());

    let workflow = parse_workflow(&content, Format::from_path(path))?;

    info!(
        "Parsed workflow {}: {} steps, semaphore {}",
        workflow.workflow_uri,
        workflow.steps.len(),
        workflow.semaphore_type
    );

    validate_workflow(&workflow)?;

    Ok(workflow)
}

/// Saves a workflow definition, encoding by the file extension.
pub fn save_workflow(workflow: &WorkflowDefinition, path: impl AsRef<Path>) -> Result<()> {
    let path = path.as_ref();
    let content = match Format::from_path(path) {
        Format::Json => serde_json::to_string_pretty(workflow)?,
        Format::Yaml => serde_yaml::to_string(workflow)?,
    };
    fs::write(path, content)?;
    info!("Workflow saved to: {}", path.display());
    Ok(())
}
