//! Work Order Model
//!
//! A work order is one runtime instance of a workflow definition. Its
//! status only ever moves forward:
//!
//! ```text
//! PENDING -> RUNNING -> FINISHED
//!                   \-> ERROR
//! ```

use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{OrderflowError, Result};
use crate::semaphore::Permit;

/// Lifecycle state of a work order.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkOrderStatus {
    Pending,
    Running,
    Finished,
    Error,
}

impl WorkOrderStatus {
    /// FINISHED and ERROR never change again.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Finished | Self::Error)
    }

    fn rank(self) -> u8 {
        match self {
            Self::Pending => 0,
            Self::Running => 1,
            Self::Finished | Self::Error => 2,
        }
    }

    /// True if moving from `self` to `next` keeps the status monotonic.
    ///
    /// Re-asserting a non-terminal status is allowed (a running order
    /// records progress while staying RUNNING); nothing leaves a terminal
    /// status, not even a write of the same status.
    pub fn can_transition_to(self, next: WorkOrderStatus) -> bool {
        !self.is_terminal() && next.rank() >= self.rank()
    }
}

impl fmt::Display for WorkOrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Pending => "PENDING",
            Self::Running => "RUNNING",
            Self::Finished => "FINISHED",
            Self::Error => "ERROR",
        };
        f.write_str(name)
    }
}

/// Fails with `InvalidTransition` unless `from -> to` is allowed.
pub fn check_transition(uri: &str, from: WorkOrderStatus, to: WorkOrderStatus) -> Result<()> {
    if from.can_transition_to(to) {
        Ok(())
    } else {
        Err(OrderflowError::InvalidTransition {
            uri: uri.to_string(),
            from: from.to_string(),
            to: to.to_string(),
        })
    }
}

/// One executed step of a work order.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StepRecord {
    pub step: String,
    pub started: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished: Option<DateTime<Utc>>,
    /// Transition name on success, failure reason otherwise
    #[serde(default)]
    pub outcome: String,
    #[serde(default)]
    pub succeeded: bool,
}

/// Persistent state of a work order.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WorkOrder {
    #[serde(rename = "workOrderURI")]
    pub uri: String,

    /// Definition this order runs (not owned)
    #[serde(rename = "workflowURI")]
    pub workflow_uri: String,

    /// Parameters, fixed at creation
    #[serde(default)]
    pub params: HashMap<String, String>,

    /// Caller-supplied context label
    #[serde(default)]
    pub context: String,

    pub status: WorkOrderStatus,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_step: Option<String>,

    pub created: DateTime<Utc>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished: Option<DateTime<Utc>>,

    /// Semaphore acquisition held while the order runs
    pub permit: Permit,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub history: Vec<StepRecord>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl WorkOrder {
    /// Creates a PENDING order positioned at `start_step`.
    pub fn new(
        uri: impl Into<String>,
        workflow_uri: impl Into<String>,
        params: HashMap<String, String>,
        context: impl Into<String>,
        permit: Permit,
        start_step: impl Into<String>,
    ) -> Self {
        Self {
            uri: uri.into(),
            workflow_uri: workflow_uri.into(),
            params,
            context: context.into(),
            status: WorkOrderStatus::Pending,
            current_step: Some(start_step.into()),
            created: Utc::now(),
            finished: None,
            permit,
            history: Vec::new(),
            error: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Moves the order to `status`, stamping the finish time on terminal
    /// states.
    pub fn set_status(&mut self, status: WorkOrderStatus) -> Result<()> {
        check_transition(&self.uri, self.status, status)?;
        self.status = status;
        if status.is_terminal() {
            self.finished = Some(Utc::now());
        }
        Ok(())
    }

    /// Opens a history record for `step` and makes it current.
    pub fn begin_step(&mut self, step: &str) {
        self.current_step = Some(step.to_string());
        self.history.push(StepRecord {
            step: step.to_string(),
            started: Utc::now(),
            finished: None,
            outcome: String::new(),
            succeeded: false,
        });
    }

    /// Closes the most recent history record.
    pub fn end_step(&mut self, succeeded: bool, outcome: impl Into<String>) {
        if let Some(record) = self.history.last_mut() {
            record.finished = Some(Utc::now());
            record.succeeded = succeeded;
            record.outcome = outcome.into();
        }
    }
}

/// Builds `workorder://<start-of-day epoch>/<workflow path>/<sequence>`.
pub fn work_order_uri(workflow_uri: &str, created: DateTime<Utc>, sequence: u64) -> String {
    let day_start = created
        .date_naive()
        .and_hms_opt(0, 0, 0)
        .map(|t| t.and_utc().timestamp())
        .unwrap_or_else(|| created.timestamp());

    let path = workflow_uri
        .split_once("://")
        .map(|(_, rest)| rest)
        .unwrap_or(workflow_uri)
        .trim_matches('/');

    format!("workorder://{}/{}/{}", day_start, path, sequence)
}
