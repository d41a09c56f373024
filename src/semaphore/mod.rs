//! Admission Control Module
//!
//! Counting semaphores that bound how many work orders of a kind may run
//! at once, under workflow-wide or per-property-value policies.
//!
//! - [`key`]: Lock key construction for both policies
//! - [`manager`]: Holder table, grant/deny decisions and timeouts

pub mod key;
pub mod manager;

pub use key::{create_lock_key, LockKey};
pub use manager::{Admission, DenialReason, Permit, SemaphoreManager, LOCK_TIMEOUT_PARAM};
