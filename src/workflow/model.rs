//! Workflow Data Model
//!
//! Core data structures describing a workflow definition: its steps, the
//! transitions between them and the semaphore policy that gates how many
//! work orders of the definition may run at once.
//!
//! # Example YAML Format
//!
//! ```yaml
//! workflowURI: workflow://reports/daily
//! startStep: extract
//! semaphoreType: PROPERTY_BASED
//! semaphoreConfig:
//!   maxAllowed: 1
//!   propertyName: region
//! expectedArguments:
//!   - name: region
//!     defaultValue: emea
//! steps:
//!   - name: extract
//!     executable: ./extract.sh
//!     transitions:
//!       - name: next
//!         targetStep: publish
//!       - name: error
//!         targetStep: $FAIL
//!   - name: publish
//!     executable: ./publish.sh
//! ```

use std::collections::HashMap;

use serde::de::{self, Deserializer};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Transition target that finishes the work order successfully.
pub const RETURN_TARGET: &str = "$RETURN";

/// Transition target that finishes the work order with an error.
pub const FAIL_TARGET: &str = "$FAIL";

/// Transition name used when an executor reports success without naming one.
pub const DEFAULT_TRANSITION: &str = "next";

/// Admission policy applied to a workflow definition.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SemaphoreType {
    /// No admission control.
    #[default]
    None,
    /// One pool of slots shared by every order of the definition.
    WorkflowBased,
    /// One pool of slots per value of a named parameter.
    PropertyBased,
}

impl std::fmt::Display for SemaphoreType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::None => "NONE",
            Self::WorkflowBased => "WORKFLOW_BASED",
            Self::PropertyBased => "PROPERTY_BASED",
        };
        f.write_str(name)
    }
}

/// Semaphore parameters.
///
/// Numeric fields are signed so that negative values reach validation and
/// produce a configuration error instead of a parse failure.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SemaphoreConfig {
    /// Maximum concurrent holders per lock key
    #[serde(default = "default_max_allowed")]
    pub max_allowed: i64,

    /// Seconds after which a held slot is forcibly released (0 = never)
    #[serde(default, rename = "timeout")]
    pub timeout_secs: i64,

    /// Parameter whose value partitions the lock (PROPERTY_BASED only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub property_name: Option<String>,
}

fn default_max_allowed() -> i64 {
    1
}

impl Default for SemaphoreConfig {
    fn default() -> Self {
        Self {
            max_allowed: default_max_allowed(),
            timeout_secs: 0,
            property_name: None,
        }
    }
}

impl SemaphoreConfig {
    /// Config for a WORKFLOW_BASED semaphore.
    pub fn workflow_based(max_allowed: i64, timeout_secs: i64) -> Self {
        Self {
            max_allowed,
            timeout_secs,
            property_name: None,
        }
    }

    /// Config for a PROPERTY_BASED semaphore.
    pub fn property_based(max_allowed: i64, property_name: impl Into<String>) -> Self {
        Self {
            max_allowed,
            timeout_secs: 0,
            property_name: Some(property_name.into()),
        }
    }
}

/// Accepts the semaphore config either as an object or as a string holding
/// the JSON of that object.
fn config_object_or_string<'de, D>(deserializer: D) -> Result<SemaphoreConfig, D::Error>
where
    D: Deserializer<'de>,
{
    let val = Value::deserialize(deserializer)?;
    match val {
        Value::Null => Ok(SemaphoreConfig::default()),
        Value::String(s) if s.trim().is_empty() => Ok(SemaphoreConfig::default()),
        Value::String(s) => serde_json::from_str(&s).map_err(de::Error::custom),
        Value::Object(_) => serde_json::from_value(val).map_err(de::Error::custom),
        _ => Err(de::Error::custom(
            "Expected semaphoreConfig object or JSON string",
        )),
    }
}

/// A named edge from one step to the next.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Transition {
    /// Name matched against the step's reported result
    pub name: String,

    /// Step to continue with, or `$RETURN` / `$FAIL`
    pub target_step: String,
}

impl Transition {
    pub fn new(name: impl Into<String>, target_step: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            target_step: target_step.into(),
        }
    }

    /// True if the target is one of the reserved terminal markers.
    pub fn is_terminal(&self) -> bool {
        self.target_step == RETURN_TARGET || self.target_step == FAIL_TARGET
    }
}

/// Where a work order goes after a step succeeds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NextStep<'a> {
    /// Continue with the named step
    Step(&'a str),
    /// Finish successfully
    Return,
    /// Finish with an error
    Fail,
}

/// A single executable unit of a workflow.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Step {
    /// Name, unique within the definition
    pub name: String,

    /// Opaque reference handed to the step executor
    pub executable: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// Outgoing transitions, matched by name
    #[serde(default)]
    pub transitions: Vec<Transition>,
}

impl Step {
    /// Creates a step with no transitions.
    ///
    /// # Example
    ///
    /// ```
    /// use orderflow::workflow::Step;
    ///
    /// let step = Step::new("extract", "./extract.sh")
    ///     .with_transition("next", "publish")
    ///     .with_transition("error", "$FAIL");
    /// assert_eq!(step.transitions.len(), 2);
    /// ```
    pub fn new(name: impl Into<String>, executable: impl Into<String>) -> Self {
        Self {
            name: name.into().trim().to_string(),
            executable: executable.into().trim().to_string(),
            description: None,
            transitions: Vec::new(),
        }
    }

    /// Adds a transition.
    pub fn with_transition(
        mut self,
        name: impl Into<String>,
        target_step: impl Into<String>,
    ) -> Self {
        self.transitions.push(Transition::new(name, target_step));
        self
    }

    /// Sets the description.
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Resolves the step reached after this one reports `result`.
    ///
    /// The first transition whose name matches wins. No match finishes the
    /// work order.
    pub fn next_for(&self, result: &str) -> NextStep<'_> {
        match self.transitions.iter().find(|t| t.name == result) {
            Some(t) if t.target_step == RETURN_TARGET => NextStep::Return,
            Some(t) if t.target_step == FAIL_TARGET => NextStep::Fail,
            Some(t) => NextStep::Step(&t.target_step),
            None => NextStep::Return,
        }
    }
}

/// An argument a workflow expects, optionally with a default.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ExpectedArgument {
    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_value: Option<String>,
}

/// A complete workflow definition.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowDefinition {
    #[serde(rename = "workflowURI")]
    pub workflow_uri: String,

    #[serde(default)]
    pub semaphore_type: SemaphoreType,

    #[serde(default, deserialize_with = "config_object_or_string")]
    pub semaphore_config: SemaphoreConfig,

    /// Ordered list of steps
    #[serde(default)]
    pub steps: Vec<Step>,

    /// Name of the step every new work order starts at
    pub start_step: String,

    /// Variables made visible to every step
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub view: HashMap<String, String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub expected_arguments: Vec<ExpectedArgument>,
}

impl WorkflowDefinition {
    /// Creates an empty definition with no admission control.
    pub fn new(workflow_uri: impl Into<String>, start_step: impl Into<String>) -> Self {
        Self {
            workflow_uri: workflow_uri.into().trim().to_string(),
            semaphore_type: SemaphoreType::None,
            semaphore_config: SemaphoreConfig::default(),
            steps: Vec::new(),
            start_step: start_step.into().trim().to_string(),
            view: HashMap::new(),
            expected_arguments: Vec::new(),
        }
    }

    /// Appends a step.
    pub fn with_step(mut self, step: Step) -> Self {
        self.steps.push(step);
        self
    }

    /// Sets the semaphore policy.
    pub fn with_semaphore(mut self, semaphore_type: SemaphoreType, config: SemaphoreConfig) -> Self {
        self.semaphore_type = semaphore_type;
        self.semaphore_config = config;
        self
    }

    /// Declares an expected argument.
    pub fn with_argument(mut self, name: impl Into<String>, default_value: Option<&str>) -> Self {
        self.expected_arguments.push(ExpectedArgument {
            name: name.into(),
            description: None,
            default_value: default_value.map(str::to_string),
        });
        self
    }

    /// Gets a step by name.
    pub fn get_step(&self, name: &str) -> Option<&Step> {
        self.steps.iter().find(|s| s.name == name)
    }

    /// Returns the number of steps.
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    /// Returns true if the definition has no steps.
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Fills in defaults for expected arguments missing from `params`.
    ///
    /// Blank defaults are ignored.
    pub fn apply_defaults(&self, params: &mut HashMap<String, String>) {
        for arg in &self.expected_arguments {
            if params.contains_key(&arg.name) {
                continue;
            }
            if let Some(default) = arg.default_value.as_deref() {
                if !default.trim().is_empty() {
                    params.insert(arg.name.clone(), default.to_string());
                }
            }
        }
    }
}

/// Splits `workflow://path#step` into the definition URI and the optional
/// start-step override.
pub fn split_start_step(uri: &str) -> (&str, Option<&str>) {
    match uri.split_once('#') {
        Some((base, step)) if !step.is_empty() => (base, Some(step)),
        Some((base, _)) => (base, None),
        None => (uri, None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_step_workflow() -> WorkflowDefinition {
        WorkflowDefinition::new("workflow://test/flow", "first")
            .with_step(Step::new("first", "script://a").with_transition("next", "second"))
            .with_step(Step::new("second", "script://b"))
    }

    #[test]
    fn test_step_creation() {
        let step = Step::new(" first ", "script://a")
            .with_transition("next", "second")
            .with_description("does a");

        assert_eq!(step.name, "first");
        assert_eq!(step.executable, "script://a");
        assert_eq!(step.transitions.len(), 1);
        assert_eq!(step.description.as_deref(), Some("does a"));
    }

    #[test]
    fn test_next_for_matching_transition() {
        let step = Step::new("first", "x")
            .with_transition("next", "second")
            .with_transition("retry", "first");

        assert_eq!(step.next_for("next"), NextStep::Step("second"));
        assert_eq!(step.next_for("retry"), NextStep::Step("first"));
    }

    #[test]
    fn test_next_for_terminal_targets() {
        let step = Step::new("first", "x")
            .with_transition("next", RETURN_TARGET)
            .with_transition("error", FAIL_TARGET);

        assert_eq!(step.next_for("next"), NextStep::Return);
        assert_eq!(step.next_for("error"), NextStep::Fail);
    }

    #[test]
    fn test_next_for_no_match_finishes() {
        let step = Step::new("only", "x");
        assert_eq!(step.next_for("next"), NextStep::Return);
    }

    #[test]
    fn test_workflow_get_step() {
        let workflow = two_step_workflow();
        assert!(workflow.get_step("second").is_some());
        assert!(workflow.get_step("missing").is_none());
    }

    #[test]
    fn test_semaphore_config_from_object() {
        let json = r#"{
            "workflowURI": "workflow://test/flow",
            "startStep": "first",
            "semaphoreType": "WORKFLOW_BASED",
            "semaphoreConfig": {"maxAllowed": 3, "timeout": 5},
            "steps": [{"name": "first", "executable": "x"}]
        }"#;
        let workflow: WorkflowDefinition = serde_json::from_str(json).unwrap();

        assert_eq!(workflow.semaphore_type, SemaphoreType::WorkflowBased);
        assert_eq!(workflow.semaphore_config.max_allowed, 3);
        assert_eq!(workflow.semaphore_config.timeout_secs, 5);
        assert!(workflow.semaphore_config.property_name.is_none());
    }

    #[test]
    fn test_semaphore_config_from_string() {
        let json = r#"{
            "workflowURI": "workflow://test/flow",
            "startStep": "first",
            "semaphoreType": "PROPERTY_BASED",
            "semaphoreConfig": "{\"maxAllowed\": 1, \"propertyName\": \"FOO\"}"
        }"#;
        let workflow: WorkflowDefinition = serde_json::from_str(json).unwrap();

        assert_eq!(workflow.semaphore_type, SemaphoreType::PropertyBased);
        assert_eq!(workflow.semaphore_config.property_name.as_deref(), Some("FOO"));
        assert_eq!(workflow.semaphore_config.timeout_secs, 0);
    }

    #[test]
    fn test_semaphore_defaults_when_absent() {
        let json = r#"{"workflowURI": "workflow://t/f", "startStep": "s"}"#;
        let workflow: WorkflowDefinition = serde_json::from_str(json).unwrap();

        assert_eq!(workflow.semaphore_type, SemaphoreType::None);
        assert_eq!(workflow.semaphore_config, SemaphoreConfig::default());
    }

    #[test]
    fn test_semaphore_config_rejects_number() {
        let json = r#"{"workflowURI": "w", "startStep": "s", "semaphoreConfig": 7}"#;
        assert!(serde_json::from_str::<WorkflowDefinition>(json).is_err());
    }

    #[test]
    fn test_semaphore_type_display() {
        assert_eq!(SemaphoreType::PropertyBased.to_string(), "PROPERTY_BASED");
        assert_eq!(SemaphoreType::None.to_string(), "NONE");
    }

    #[test]
    fn test_apply_defaults() {
        let workflow = two_step_workflow()
            .with_argument("region", Some("emea"))
            .with_argument("blank", Some("  "))
            .with_argument("none", None);

        let mut params = HashMap::new();
        params.insert("other".to_string(), "1".to_string());
        workflow.apply_defaults(&mut params);

        assert_eq!(params.get("region").map(String::as_str), Some("emea"));
        assert!(!params.contains_key("blank"));
        assert!(!params.contains_key("none"));

        let mut explicit = HashMap::new();
        explicit.insert("region".to_string(), "apac".to_string());
        workflow.apply_defaults(&mut explicit);
        assert_eq!(explicit.get("region").map(String::as_str), Some("apac"));
    }

    #[test]
    fn test_split_start_step() {
        assert_eq!(split_start_step("workflow://a/b"), ("workflow://a/b", None));
        assert_eq!(split_start_step("workflow://a/b#second"), ("workflow://a/b", Some("second")));
        assert_eq!(split_start_step("workflow://a/b#"), ("workflow://a/b", None));
    }
}
