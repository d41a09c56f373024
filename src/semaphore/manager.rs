//! Semaphore Manager
//!
//! Owns the per-key holder table and makes every admission decision.
//!
//! The table is a [`DashMap`], so the check-and-increment for one key runs
//! under that key's shard guard and unrelated keys rarely contend. An entry
//! is dropped with `remove_if` once its last holder leaves. Every granted
//! acquisition gets a unique id and a released flag. Normal completion and
//! the timeout timer both call [`SemaphoreManager::release`]; whichever runs
//! first removes the holder, the other finds nothing to do.
//!
//! A policy that is in use may be widened but never narrowed. Acquisitions
//! hold the reconfiguration gate for reading, so a policy change never
//! interleaves with a check-and-increment.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use log::{debug, info, warn};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use super::key::{create_lock_key, LockKey};
use crate::error::{OrderflowError, Result};
use crate::workflow::{validate_semaphore, SemaphoreConfig, SemaphoreType};

/// Parameter that overrides the configured forced-release timeout for a
/// single acquisition.
pub const LOCK_TIMEOUT_PARAM: &str = "LOCK_TIMEOUT_SECONDS";

/// Why an admission was refused.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DenialReason {
    /// The partitioning parameter was not supplied.
    MissingProperty { property: String },
    /// Every slot for the key is held.
    AtCapacity { key: LockKey, holders: Vec<String> },
}

impl fmt::Display for DenialReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingProperty { property } => write!(
                f,
                "Property {} is not defined and property based locking is in force",
                property
            ),
            Self::AtCapacity { key, holders } => write!(
                f,
                "Unable to acquire a permit for lock key {}. The lock is already being held by: {}",
                key,
                holders.join(", ")
            ),
        }
    }
}

/// Handle for one granted acquisition.
///
/// Serializable so it can be persisted alongside the work order that holds
/// it. An unrestricted permit (from a `NONE` policy) has no key and
/// releasing it does nothing.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Permit {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<LockKey>,
    #[serde(default)]
    pub acquisition: u64,
}

impl Permit {
    pub fn unrestricted() -> Self {
        Self {
            key: None,
            acquisition: 0,
        }
    }

    pub fn is_unrestricted(&self) -> bool {
        self.key.is_none()
    }
}

/// Outcome of [`SemaphoreManager::try_acquire`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    Granted(Permit),
    Denied(DenialReason),
}

impl Admission {
    pub fn is_granted(&self) -> bool {
        matches!(self, Self::Granted(_))
    }
}

/// Configured policy for one workflow.
#[derive(Debug, Clone)]
struct Policy {
    semaphore_type: SemaphoreType,
    config: SemaphoreConfig,
}

impl Policy {
    fn max_allowed(&self) -> usize {
        usize::try_from(self.config.max_allowed).unwrap_or(1)
    }

    fn timeout(&self) -> Duration {
        Duration::from_secs(u64::try_from(self.config.timeout_secs).unwrap_or(0))
    }

    /// True if holders admitted under `self` could exceed `next`.
    fn narrowed_by(&self, next: &Policy) -> bool {
        self.semaphore_type != next.semaphore_type
            || self.config.property_name != next.config.property_name
            || next.max_allowed() < self.max_allowed()
    }
}

/// One current holder of a slot.
struct Holder {
    acquisition: u64,
    holder: String,
    acquired_at: Instant,
    released: Arc<AtomicBool>,
    timer: Option<tokio::task::AbortHandle>,
}

#[derive(Default)]
struct LockEntry {
    holders: Vec<Holder>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ReleaseCause {
    Completion,
    Timeout,
}

#[derive(Default)]
struct Inner {
    policies: DashMap<String, Policy>,
    locks: DashMap<LockKey, LockEntry>,
    reconfigure: RwLock<()>,
    next_acquisition: AtomicU64,
}

/// Per-key admission control for work orders.
///
/// Cheap to clone; clones share the same holder table.
///
/// # Example
///
/// ```rust,no_run
/// use std::collections::HashMap;
/// use orderflow::semaphore::SemaphoreManager;
/// use orderflow::workflow::{SemaphoreConfig, SemaphoreType};
///
/// # async fn demo() -> orderflow::Result<()> {
/// let semaphores = SemaphoreManager::new();
/// semaphores.configure(
///     "workflow://reports/daily",
///     SemaphoreType::WorkflowBased,
///     &SemaphoreConfig::workflow_based(1, 30),
/// )?;
///
/// let admission = semaphores.try_acquire("workflow://reports/daily", &HashMap::new(), || {
///     "order-1".to_string()
/// })?;
/// assert!(admission.is_granted());
/// # Ok(())
/// # }
/// ```
#[derive(Clone, Default)]
pub struct SemaphoreManager {
    inner: Arc<Inner>,
}

impl SemaphoreManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Installs (or replaces) the policy for a workflow.
    ///
    /// While any key of the workflow has holders, the policy may only be
    /// widened: a change of type or property, or a lower `maxAllowed`, is
    /// a `Config` error. Timeout changes apply to later acquisitions.
    pub fn configure(
        &self,
        workflow_uri: &str,
        semaphore_type: SemaphoreType,
        config: &SemaphoreConfig,
    ) -> Result<()> {
        validate_semaphore(semaphore_type, config)?;

        let _gate = self.inner.reconfigure.write();
        let next = Policy {
            semaphore_type,
            config: config.clone(),
        };
        self.check_replacement(workflow_uri, &next)?;
        self.inner.policies.insert(workflow_uri.to_string(), next);
        debug!(
            "Semaphore for {} configured: {} {:?}",
            workflow_uri, semaphore_type, config
        );
        Ok(())
    }

    /// A removed policy whose holders are still running counts as narrowed
    /// by anything, since its limit is no longer known.
    fn check_replacement(&self, workflow_uri: &str, next: &Policy) -> Result<()> {
        let current = self.inner.policies.get(workflow_uri).map(|p| p.value().clone());
        let narrowed = current.as_ref().map_or(true, |c| c.narrowed_by(next));
        if narrowed && self.in_use(workflow_uri) {
            return Err(OrderflowError::Config(format!(
                "Semaphore for {} is in use; {} {:?} cannot replace it until its holders release",
                workflow_uri, next.semaphore_type, next.config
            )));
        }
        Ok(())
    }

    /// True if any key of the workflow has a holder.
    pub fn in_use(&self, workflow_uri: &str) -> bool {
        self.inner
            .locks
            .iter()
            .any(|entry| entry.key().workflow_uri() == workflow_uri && !entry.holders.is_empty())
    }

    /// True if a policy is installed for the workflow.
    pub fn is_configured(&self, workflow_uri: &str) -> bool {
        self.inner.policies.contains_key(workflow_uri)
    }

    /// Drops the policy for a workflow. Existing holders are unaffected.
    pub fn remove_policy(&self, workflow_uri: &str) {
        self.inner.policies.remove(workflow_uri);
    }

    fn policy(&self, workflow_uri: &str) -> Result<Policy> {
        self.inner
            .policies
            .get(workflow_uri)
            .map(|p| p.value().clone())
            .ok_or_else(|| {
                OrderflowError::Config(format!("No semaphore configured for {}", workflow_uri))
            })
    }

    /// Attempts to take a slot for an order of `workflow_uri`.
    ///
    /// `holder` names the acquiring order and is reported to later deniers.
    /// It is only called once the slot is granted, so a denial has no side
    /// effects. Denial is a normal outcome, not an error. Errors are
    /// reserved for a missing policy or a malformed `LOCK_TIMEOUT_SECONDS`
    /// parameter.
    ///
    /// A positive timeout arms a timer on the current Tokio runtime that
    /// forcibly releases the slot; outside a runtime no timer is armed.
    pub fn try_acquire<F>(
        &self,
        workflow_uri: &str,
        params: &HashMap<String, String>,
        holder: F,
    ) -> Result<Admission>
    where
        F: FnOnce() -> String,
    {
        let _gate = self.inner.reconfigure.read();
        let policy = self.policy(workflow_uri)?;

        let key = match create_lock_key(policy.semaphore_type, &policy.config, workflow_uri, params) {
            Ok(Some(key)) => key,
            Ok(None) => return Ok(Admission::Granted(Permit::unrestricted())),
            Err(reason) => {
                warn!("Admission denied for {}: {}", workflow_uri, reason);
                return Ok(Admission::Denied(reason));
            }
        };

        let timeout = match params.get(LOCK_TIMEOUT_PARAM) {
            Some(raw) => raw
                .trim()
                .parse::<u64>()
                .map(Duration::from_secs)
                .map_err(|_| {
                    OrderflowError::Config(format!(
                        "{} must be a non-negative integer (got '{}')",
                        LOCK_TIMEOUT_PARAM, raw
                    ))
                })?,
            None => policy.timeout(),
        };

        let max_allowed = policy.max_allowed();
        let mut entry = self.inner.locks.entry(key.clone()).or_default();

        if entry.holders.len() >= max_allowed {
            let reason = DenialReason::AtCapacity {
                key: key.clone(),
                holders: entry.holders.iter().map(|h| h.holder.clone()).collect(),
            };
            drop(entry);
            warn!("Admission denied for {}: {}", workflow_uri, reason);
            return Ok(Admission::Denied(reason));
        }

        let acquisition = self.inner.next_acquisition.fetch_add(1, Ordering::Relaxed) + 1;
        let released = Arc::new(AtomicBool::new(false));
        let timer = self.arm_timeout(&key, acquisition, &released, timeout);
        let holder = holder();

        info!(
            "Permit {} granted on {} to {} ({}/{})",
            acquisition,
            key,
            holder,
            entry.holders.len() + 1,
            max_allowed
        );
        entry.holders.push(Holder {
            acquisition,
            holder,
            acquired_at: Instant::now(),
            released,
            timer,
        });

        Ok(Admission::Granted(Permit {
            key: Some(key),
            acquisition,
        }))
    }

    /// Spawns the forced-release timer. The task only touches the table
    /// after its sleep, so arming it under a shard guard is safe.
    fn arm_timeout(
        &self,
        key: &LockKey,
        acquisition: u64,
        released: &Arc<AtomicBool>,
        timeout: Duration,
    ) -> Option<tokio::task::AbortHandle> {
        if timeout.is_zero() {
            return None;
        }

        let runtime = match tokio::runtime::Handle::try_current() {
            Ok(handle) => handle,
            Err(_) => {
                warn!(
                    "No async runtime available; permit {} on {} has no timeout",
                    acquisition, key
                );
                return None;
            }
        };

        let manager = self.clone();
        let key = key.clone();
        let released = Arc::clone(released);

        let task = runtime.spawn(async move {
            tokio::time::sleep(timeout).await;
            if released.load(Ordering::Acquire) {
                return;
            }
            if manager.release_with(&key, acquisition, ReleaseCause::Timeout) {
                warn!(
                    "Permit {} on {} forcibly released after {:?} timeout",
                    acquisition, key, timeout
                );
            }
        });

        Some(task.abort_handle())
    }

    /// Releases one acquisition.
    ///
    /// Idempotent: returns true only for the call that actually freed the
    /// slot. Unknown or already released handles are a no-op.
    pub fn release(&self, key: &LockKey, acquisition: u64) -> bool {
        self.release_with(key, acquisition, ReleaseCause::Completion)
    }

    /// Releases the acquisition a permit stands for.
    pub fn release_permit(&self, permit: &Permit) -> bool {
        match &permit.key {
            Some(key) => self.release(key, permit.acquisition),
            None => false,
        }
    }

    fn release_with(&self, key: &LockKey, acquisition: u64, cause: ReleaseCause) -> bool {
        {
            let Some(mut entry) = self.inner.locks.get_mut(key) else {
                return false;
            };
            let Some(pos) = entry.holders.iter().position(|h| h.acquisition == acquisition) else {
                return false;
            };
            if entry.holders[pos].released.swap(true, Ordering::AcqRel) {
                return false;
            }

            let holder = entry.holders.swap_remove(pos);
            if cause == ReleaseCause::Completion {
                if let Some(timer) = holder.timer {
                    timer.abort();
                }
            }

            debug!(
                "Permit {} on {} released by {:?} after {:?} ({} remaining)",
                acquisition,
                key,
                cause,
                holder.acquired_at.elapsed(),
                entry.holders.len()
            );
        }

        // The shard guard must be gone before remove_if locks the shard again.
        self.inner.locks.remove_if(key, |_, entry| entry.holders.is_empty());
        true
    }

    /// Current number of holders of a key.
    pub fn holder_count(&self, key: &LockKey) -> usize {
        self.inner
            .locks
            .get(key)
            .map(|entry| entry.holders.len())
            .unwrap_or(0)
    }

    /// Names of the current holders of a key, in acquisition order.
    pub fn holders(&self, key: &LockKey) -> Vec<String> {
        let Some(entry) = self.inner.locks.get(key) else {
            return Vec::new();
        };
        let mut holders: Vec<(u64, String)> = entry
            .holders
            .iter()
            .map(|h| (h.acquisition, h.holder.clone()))
            .collect();
        holders.sort();
        holders.into_iter().map(|(_, name)| name).collect()
    }

    /// Number of keys with at least one holder.
    pub fn active_keys(&self) -> usize {
        self.inner
            .locks
            .iter()
            .filter(|entry| !entry.holders.is_empty())
            .count()
    }
}
