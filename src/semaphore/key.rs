//! Lock Keys
//!
//! Both semaphore policies share one keyed holder table. A WORKFLOW_BASED
//! key is the workflow URI alone; a PROPERTY_BASED key adds the name and
//! value of the partitioning parameter.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use super::manager::DenialReason;
use crate::workflow::{SemaphoreConfig, SemaphoreType};

/// Identity of one pool of semaphore slots.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Hash)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum LockKey {
    #[serde(rename_all = "camelCase")]
    Workflow { workflow_uri: String },
    #[serde(rename_all = "camelCase")]
    Property {
        workflow_uri: String,
        property: String,
        value: String,
    },
}

impl LockKey {
    pub fn workflow(workflow_uri: impl Into<String>) -> Self {
        Self::Workflow {
            workflow_uri: workflow_uri.into(),
        }
    }

    pub fn property(
        workflow_uri: impl Into<String>,
        property: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        Self::Property {
            workflow_uri: workflow_uri.into(),
            property: property.into(),
            value: value.into(),
        }
    }

    /// The workflow this key belongs to.
    pub fn workflow_uri(&self) -> &str {
        match self {
            Self::Workflow { workflow_uri } | Self::Property { workflow_uri, .. } => workflow_uri,
        }
    }
}

impl fmt::Display for LockKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Workflow { workflow_uri } => write!(f, "{}", workflow_uri),
            Self::Property {
                workflow_uri,
                property,
                value,
            } => write!(f, "{}?{}={}", workflow_uri, property, value),
        }
    }
}

/// Builds the lock key for an order of `workflow_uri` with `params`.
///
/// Returns `Ok(None)` for `NONE` (no bookkeeping). A PROPERTY_BASED
/// policy whose property is absent from `params` is denied outright; it
/// never falls back to an unrestricted slot.
pub fn create_lock_key(
    semaphore_type: SemaphoreType,
    config: &SemaphoreConfig,
    workflow_uri: &str,
    params: &HashMap<String, String>,
) -> Result<Option<LockKey>, DenialReason> {
    match semaphore_type {
        SemaphoreType::None => Ok(None),
        SemaphoreType::WorkflowBased => Ok(Some(LockKey::workflow(workflow_uri))),
        SemaphoreType::PropertyBased => {
            let property = config.property_name.clone().unwrap_or_default();
            match params.get(&property) {
                Some(value) => Ok(Some(LockKey::property(workflow_uri, property, value.clone()))),
                None => Err(DenialReason::MissingProperty { property }),
            }
        }
    }
}
