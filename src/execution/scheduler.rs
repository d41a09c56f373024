//! Work Order Scheduler
//!
//! Front door of the engine. Creating a work order consults the
//! [`SemaphoreManager`]; a granted order is persisted and handed to its own
//! Tokio task, which walks the workflow's steps through the
//! [`StepExecutor`] and releases the order's slot once it reaches a
//! terminal status.
//!
//! Each order's state has a single writer (its driver task). Status
//! queries read the persisted record and never touch the task.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};

use super::executor::{OrderContext, ShellExecutor, StepExecutor, StepOutcome};
use crate::config::EngineConfig;
use crate::error::{OrderflowError, Result};
use crate::order::{
    work_order_uri, DirectoryOrderStore, MemoryOrderStore, WorkOrder, WorkOrderStatus,
    WorkOrderStore,
};
use crate::semaphore::{Admission, SemaphoreManager};
use crate::workflow::{
    split_start_step, validate_workflow, DirectoryBackend, NextStep, WorkflowDefinition,
    WorkflowStore,
};

/// Attempts at writing an order's terminal status before giving up.
const TERMINAL_WRITE_ATTEMPTS: u32 = 5;

/// Backoff step between terminal write attempts; grows linearly.
const TERMINAL_WRITE_BACKOFF: Duration = Duration::from_millis(100);

/// Answer to a creation request.
///
/// Denial is reported here with `is_created == false`, never as an error.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CreateResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uri: Option<String>,
    pub is_created: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl CreateResponse {
    fn created(uri: String) -> Self {
        Self {
            uri: Some(uri),
            is_created: true,
            message: None,
        }
    }

    fn denied(message: String) -> Self {
        Self {
            uri: None,
            is_created: false,
            message: Some(message),
        }
    }
}

/// Creates work orders and drives them to completion.
///
/// Cheap to clone; clones share stores, semaphores and the URI sequence.
///
/// # Example
///
/// ```rust,no_run
/// use std::collections::HashMap;
/// use std::sync::Arc;
/// use orderflow::execution::{ShellExecutor, WorkOrderScheduler};
/// use orderflow::workflow::{SemaphoreConfig, SemaphoreType, Step, WorkflowDefinition};
///
/// # async fn demo() -> orderflow::Result<()> {
/// let scheduler = WorkOrderScheduler::in_memory(Arc::new(ShellExecutor::new()));
/// scheduler.put_workflow(
///     WorkflowDefinition::new("workflow://reports/daily", "build")
///         .with_step(Step::new("build", "./build_report.sh"))
///         .with_semaphore(SemaphoreType::WorkflowBased, SemaphoreConfig::workflow_based(1, 600)),
/// )?;
///
/// let response = scheduler
///     .create_work_order("workflow://reports/daily", HashMap::new(), "cron")
///     .await?;
/// if !response.is_created {
///     println!("busy: {:?}", response.message);
/// }
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct WorkOrderScheduler {
    workflows: Arc<WorkflowStore>,
    orders: Arc<dyn WorkOrderStore>,
    semaphores: SemaphoreManager,
    executor: Arc<dyn StepExecutor>,
    sequence: Arc<AtomicU64>,
}

impl WorkOrderScheduler {
    pub fn new(
        workflows: WorkflowStore,
        orders: Arc<dyn WorkOrderStore>,
        executor: Arc<dyn StepExecutor>,
    ) -> Self {
        Self {
            workflows: Arc::new(workflows),
            orders,
            semaphores: SemaphoreManager::new(),
            executor,
            sequence: Arc::new(AtomicU64::new(0)),
        }
    }

    /// A scheduler keeping definitions and orders in memory.
    pub fn in_memory(executor: Arc<dyn StepExecutor>) -> Self {
        Self::new(
            WorkflowStore::in_memory(),
            Arc::new(MemoryOrderStore::new()),
            executor,
        )
    }

    /// Builds a scheduler with a [`ShellExecutor`] from configuration.
    ///
    /// With a `state_dir`, definitions live under `<state_dir>/workflows`
    /// and orders under `<state_dir>/orders`.
    pub fn from_config(config: &EngineConfig) -> Result<Self> {
        let mut shell = ShellExecutor::new().with_dry_run(config.dry_run);
        if let Some(dir) = &config.working_dir {
            shell = shell.with_working_dir(dir);
        }
        let executor: Arc<dyn StepExecutor> = Arc::new(shell);

        match &config.state_dir {
            Some(dir) => {
                let workflows =
                    WorkflowStore::new(Box::new(DirectoryBackend::open(dir.join("workflows"))?));
                let orders = Arc::new(DirectoryOrderStore::open(dir.join("orders"))?);
                Ok(Self::new(workflows, orders, executor))
            }
            None => Ok(Self::in_memory(executor)),
        }
    }

    /// Uses an externally constructed semaphore manager.
    pub fn with_semaphores(mut self, semaphores: SemaphoreManager) -> Self {
        self.semaphores = semaphores;
        self
    }

    pub fn semaphores(&self) -> &SemaphoreManager {
        &self.semaphores
    }

    /// Validates a definition, installs its semaphore policy, then stores
    /// it.
    ///
    /// A policy in use may only be widened (see
    /// [`SemaphoreManager::configure`]); a rejected put leaves both the
    /// stored definition and the policy untouched.
    pub fn put_workflow(&self, workflow: WorkflowDefinition) -> Result<()> {
        validate_workflow(&workflow)?;

        let uri = workflow.workflow_uri.clone();
        let previous = self.workflows.get_workflow(&uri).ok();
        self.semaphores
            .configure(&uri, workflow.semaphore_type, &workflow.semaphore_config)?;

        if let Err(e) = self.workflows.put_workflow(workflow) {
            error!("Storing workflow {} failed: {}", uri, e);
            match previous {
                Some(prev) => {
                    if let Err(restore) = self.semaphores.configure(
                        &uri,
                        prev.semaphore_type,
                        &prev.semaphore_config,
                    ) {
                        warn!("Semaphore for {} keeps the new policy: {}", uri, restore);
                    }
                }
                None => self.semaphores.remove_policy(&uri),
            }
            return Err(e);
        }
        Ok(())
    }

    pub fn get_workflow(&self, uri: &str) -> Result<Arc<WorkflowDefinition>> {
        self.workflows.get_workflow(uri)
    }

    pub fn list_workflows(&self) -> Result<Vec<String>> {
        self.workflows.list_workflows()
    }

    /// Removes a definition and its policy. Running orders keep their slots.
    pub fn delete_workflow(&self, uri: &str) -> Result<bool> {
        let removed = self.workflows.delete_workflow(uri)?;
        self.semaphores.remove_policy(uri);
        Ok(removed)
    }

    /// Requests a new work order.
    ///
    /// `workflow_uri` may end in `#step` to start somewhere other than the
    /// definition's start step. Returns as soon as the order is admitted
    /// and persisted; execution continues on a background task.
    ///
    /// Must be called from within a Tokio runtime.
    pub async fn create_work_order(
        &self,
        workflow_uri: &str,
        mut params: HashMap<String, String>,
        context: &str,
    ) -> Result<CreateResponse> {
        let (base_uri, start_override) = split_start_step(workflow_uri);
        let workflow = self.workflows.get_workflow(base_uri)?;

        let start_step = match start_override {
            Some(step) if workflow.get_step(step).is_none() => {
                return Err(OrderflowError::Config(format!(
                    "Step '{}' not found in workflow {}",
                    step, base_uri
                )));
            }
            Some(step) => step.to_string(),
            None => workflow.start_step.clone(),
        };

        workflow.apply_defaults(&mut params);
        self.ensure_policy(&workflow)?;

        let created = Utc::now();
        let mut assigned = None;
        let admission = self.semaphores.try_acquire(base_uri, &params, || {
            let uri = self.next_uri(base_uri, created);
            assigned = Some(uri.clone());
            uri
        })?;

        let permit = match admission {
            Admission::Granted(permit) => permit,
            Admission::Denied(reason) => {
                return Ok(CreateResponse::denied(reason.to_string()));
            }
        };
        // Unrestricted permits never name a holder.
        let uri = assigned.unwrap_or_else(|| self.next_uri(base_uri, created));

        let mut order = WorkOrder::new(&uri, base_uri, params, context, permit, start_step);
        order.created = created;

        if let Err(e) = self.start(&mut order) {
            error!("Failed to start work order {}: {}", uri, e);
            self.semaphores.release_permit(&order.permit);
            return Err(e);
        }

        info!("Work order {} created for {}", uri, base_uri);
        tokio::spawn(self.clone().drive(order, workflow));

        Ok(CreateResponse::created(uri))
    }

    /// Installs the policy for definitions loaded from a persistent
    /// backend that were never put through this scheduler.
    fn ensure_policy(&self, workflow: &WorkflowDefinition) -> Result<()> {
        if self.semaphores.is_configured(&workflow.workflow_uri) {
            return Ok(());
        }
        self.semaphores.configure(
            &workflow.workflow_uri,
            workflow.semaphore_type,
            &workflow.semaphore_config,
        )
    }

    /// Next unused work order URI. Skips URIs left by an earlier process
    /// sharing the same state directory, including unreadable ones.
    fn next_uri(&self, workflow_uri: &str, created: chrono::DateTime<Utc>) -> String {
        loop {
            let sequence = self.sequence.fetch_add(1, Ordering::SeqCst) + 1;
            let uri = work_order_uri(workflow_uri, created, sequence);
            match self.orders.get(&uri) {
                Err(e) if e.is_not_found() => return uri,
                Ok(_) => debug!("Work order URI {} already taken", uri),
                Err(e) => warn!("Skipping work order URI {}: {}", uri, e),
            }
        }
    }

    /// Persists the order as PENDING, then RUNNING.
    fn start(&self, order: &mut WorkOrder) -> Result<()> {
        self.orders.insert(order)?;

        let running = order
            .set_status(WorkOrderStatus::Running)
            .and_then(|_| self.orders.update(order));

        if let Err(e) = running {
            order.status = WorkOrderStatus::Pending;
            order.error = Some(e.to_string());
            if order.set_status(WorkOrderStatus::Error).is_ok() {
                if let Err(e) = self.orders.update(order) {
                    warn!("Could not mark {} as ERROR: {}", order.uri, e);
                }
            }
            return Err(e);
        }
        Ok(())
    }

    /// Execution driver for one order. Ends with exactly one release of the
    /// order's permit.
    ///
    /// The slot is freed before the terminal status is written, so a
    /// caller that observes FINISHED or ERROR can immediately be admitted.
    async fn drive(self, mut order: WorkOrder, workflow: Arc<WorkflowDefinition>) {
        let result = self.run_steps(&mut order, &workflow).await;

        let status = match &result {
            Ok(()) => WorkOrderStatus::Finished,
            Err(_) => WorkOrderStatus::Error,
        };
        order.error = result.err();

        self.semaphores.release_permit(&order.permit);

        match order.set_status(status) {
            Ok(()) => self.persist_terminal(&order).await,
            Err(e) => error!("Work order {} could not finish: {}", order.uri, e),
        }

        match &order.error {
            None => info!("Work order {} {}", order.uri, order.status),
            Some(reason) => warn!("Work order {} {}: {}", order.uri, order.status, reason),
        }
    }

    async fn run_steps(
        &self,
        order: &mut WorkOrder,
        workflow: &WorkflowDefinition,
    ) -> std::result::Result<(), String> {
        let mut current = order
            .current_step
            .clone()
            .unwrap_or_else(|| workflow.start_step.clone());

        loop {
            let step = workflow
                .get_step(&current)
                .ok_or_else(|| format!("Step '{}' not found in {}", current, workflow.workflow_uri))?;

            order.begin_step(&step.name);
            self.persist(order);

            let outcome = self.run_step(order, workflow, &step.name, &step.executable).await;

            match outcome {
                StepOutcome::Success { transition } => {
                    order.end_step(true, transition.as_str());
                    match step.next_for(&transition) {
                        NextStep::Step(next) => {
                            debug!(
                                "{}: {} --{}--> {}",
                                order.uri, step.name, transition, next
                            );
                            current = next.to_string();
                        }
                        NextStep::Return => return Ok(()),
                        NextStep::Fail => {
                            return Err(format!(
                                "Step '{}' took transition '{}' to failure",
                                step.name, transition
                            ));
                        }
                    }
                }
                StepOutcome::Failure { reason } => {
                    order.end_step(false, reason.as_str());
                    return Err(reason);
                }
            }
        }
    }

    /// Runs one step on its own task so a panicking executor fails the
    /// step instead of the driver.
    async fn run_step(
        &self,
        order: &WorkOrder,
        workflow: &WorkflowDefinition,
        step: &str,
        executable: &str,
    ) -> StepOutcome {
        let executor = Arc::clone(&self.executor);
        let executable = executable.to_string();
        let params = order.params.clone();
        let ctx = OrderContext {
            work_order_uri: order.uri.clone(),
            workflow_uri: order.workflow_uri.clone(),
            step: step.to_string(),
            context: order.context.clone(),
            view: workflow.view.clone(),
        };

        debug!("{}: running step '{}'", order.uri, step);
        let task = tokio::spawn(async move { executor.run(&executable, &params, &ctx).await });

        match task.await {
            Ok(outcome) => outcome,
            Err(e) => StepOutcome::failure(format!("Step '{}' aborted: {}", step, e)),
        }
    }

    fn persist(&self, order: &WorkOrder) {
        if let Err(e) = self.orders.update(order) {
            error!("Failed to persist work order {}: {}", order.uri, e);
        }
    }

    /// Writes the terminal status, retrying with a linear backoff.
    async fn persist_terminal(&self, order: &WorkOrder) {
        for attempt in 1..=TERMINAL_WRITE_ATTEMPTS {
            let e = match self.orders.update(order) {
                Ok(()) => return,
                Err(e) => e,
            };
            let rejected = matches!(e, OrderflowError::InvalidTransition { .. });
            if rejected || attempt == TERMINAL_WRITE_ATTEMPTS {
                error!(
                    "Work order {} ended {} but the status could not be stored: {}",
                    order.uri, order.status, e
                );
                return;
            }
            warn!(
                "Storing {} status of {} failed (attempt {}/{}): {}",
                order.status, order.uri, attempt, TERMINAL_WRITE_ATTEMPTS, e
            );
            tokio::time::sleep(TERMINAL_WRITE_BACKOFF * attempt).await;
        }
    }

    /// Current status of an order, including long-finished ones.
    pub fn get_work_order_status(&self, uri: &str) -> Result<WorkOrderStatus> {
        Ok(self.orders.get(uri)?.status)
    }

    pub fn get_work_order(&self, uri: &str) -> Result<WorkOrder> {
        self.orders.get(uri)
    }

    /// Every retained order of a definition, oldest first.
    pub fn list_work_orders(&self, workflow_uri: &str) -> Result<Vec<WorkOrder>> {
        self.orders.list_by_workflow(workflow_uri)
    }

    /// Administratively frees the slot an order holds.
    ///
    /// Goes through the same idempotent release as completion and timeout.
    /// Returns true only if this call freed the slot.
    pub fn release_work_order_lock(&self, uri: &str) -> Result<bool> {
        let order = self.orders.get(uri)?;
        let released = self.semaphores.release_permit(&order.permit);
        if released {
            info!("Lock of work order {} released on request", uri);
        }
        Ok(released)
    }

    /// Polls until the order is terminal and returns its final record.
    pub async fn wait_for_completion(&self, uri: &str, poll_interval: Duration) -> Result<WorkOrder> {
        loop {
            let order = self.orders.get(uri)?;
            if order.is_terminal() {
                return Ok(order);
            }
            tokio::time::sleep(poll_interval).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::semaphore::LockKey;
    use crate::workflow::store::encode_file_name;
    use crate::workflow::{SemaphoreConfig, SemaphoreType, Step};
    use async_trait::async_trait;
    use tempfile::tempdir;

    const POLL: Duration = Duration::from_millis(10);

    /// Interprets executables: `ok`, `fail`, `panic`, `sleep:<ms>`,
    /// `goto:<transition>`.
    struct FakeExecutor;

    #[async_trait]
    impl StepExecutor for FakeExecutor {
        async fn run(
            &self,
            executable: &str,
            _params: &HashMap<String, String>,
            _ctx: &OrderContext,
        ) -> StepOutcome {
            if let Some(ms) = executable.strip_prefix("sleep:") {
                let ms: u64 = ms.parse().unwrap();
                tokio::time::sleep(Duration::from_millis(ms)).await;
                return StepOutcome::success();
            }
            if let Some(name) = executable.strip_prefix("goto:") {
                return StepOutcome::success_with(name);
            }
            match executable {
                "ok" => StepOutcome::success(),
                "panic" => panic!("executor blew up"),
                _ => StepOutcome::failure("step failed"),
            }
        }
    }

    fn scheduler() -> WorkOrderScheduler {
        WorkOrderScheduler::in_memory(Arc::new(FakeExecutor))
    }

    fn single_step(uri: &str, executable: &str) -> WorkflowDefinition {
        WorkflowDefinition::new(uri, "only").with_step(Step::new("only", executable))
    }

    fn no_params() -> HashMap<String, String> {
        HashMap::new()
    }

    async fn create(s: &WorkOrderScheduler, uri: &str) -> CreateResponse {
        s.create_work_order(uri, no_params(), "test").await.unwrap()
    }

    /// Memory store whose next few terminal writes fail.
    #[derive(Default)]
    struct FlakyStore {
        inner: MemoryOrderStore,
        terminal_failures: AtomicU64,
    }

    impl WorkOrderStore for FlakyStore {
        fn insert(&self, order: &WorkOrder) -> Result<()> {
            self.inner.insert(order)
        }

        fn update(&self, order: &WorkOrder) -> Result<()> {
            if order.is_terminal() && self.terminal_failures.load(Ordering::SeqCst) > 0 {
                self.terminal_failures.fetch_sub(1, Ordering::SeqCst);
                return Err(std::io::Error::new(std::io::ErrorKind::Other, "disk full").into());
            }
            self.inner.update(order)
        }

        fn get(&self, uri: &str) -> Result<WorkOrder> {
            self.inner.get(uri)
        }

        fn list_by_workflow(&self, workflow_uri: &str) -> Result<Vec<WorkOrder>> {
            self.inner.list_by_workflow(workflow_uri)
        }
    }

    #[tokio::test]
    async fn test_unknown_workflow_is_not_found() {
        let err = scheduler()
            .create_work_order("workflow://missing", no_params(), "test")
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_order_runs_to_finished() {
        let s = scheduler();
        s.put_workflow(
            WorkflowDefinition::new("workflow://two", "a")
                .with_step(Step::new("a", "ok").with_transition("next", "b"))
                .with_step(Step::new("b", "ok")),
        )
        .unwrap();

        let response = create(&s, "workflow://two").await;
        assert!(response.is_created);
        let uri = response.uri.unwrap();

        let order = s.wait_for_completion(&uri, POLL).await.unwrap();
        assert_eq!(order.status, WorkOrderStatus::Finished);
        let visited: Vec<&str> = order.history.iter().map(|r| r.step.as_str()).collect();
        assert_eq!(visited, vec!["a", "b"]);
        assert!(order.error.is_none());
    }

    #[tokio::test]
    async fn test_failure_marks_error() {
        let s = scheduler();
        s.put_workflow(single_step("workflow://bad", "fail")).unwrap();

        let uri = create(&s, "workflow://bad").await.uri.unwrap();
        let order = s.wait_for_completion(&uri, POLL).await.unwrap();
        assert_eq!(order.status, WorkOrderStatus::Error);
        assert_eq!(order.error.as_deref(), Some("step failed"));
    }

    #[tokio::test]
    async fn test_panic_marks_error_and_releases() {
        let s = scheduler();
        s.put_workflow(
            single_step("workflow://panic", "panic").with_semaphore(
                SemaphoreType::WorkflowBased,
                SemaphoreConfig::workflow_based(1, 0),
            ),
        )
        .unwrap();

        let uri = create(&s, "workflow://panic").await.uri.unwrap();
        let order = s.wait_for_completion(&uri, POLL).await.unwrap();
        assert_eq!(order.status, WorkOrderStatus::Error);
        assert_eq!(s.semaphores().holder_count(&LockKey::workflow("workflow://panic")), 0);
    }

    #[tokio::test]
    async fn test_fail_transition() {
        let s = scheduler();
        s.put_workflow(
            WorkflowDefinition::new("workflow://t", "check")
                .with_step(
                    Step::new("check", "goto:reject")
                        .with_transition("accept", "$RETURN")
                        .with_transition("reject", "$FAIL"),
                ),
        )
        .unwrap();

        let uri = create(&s, "workflow://t").await.uri.unwrap();
        let order = s.wait_for_completion(&uri, POLL).await.unwrap();
        assert_eq!(order.status, WorkOrderStatus::Error);
        assert_eq!(order.history[0].outcome, "reject");
    }

    #[tokio::test]
    async fn test_start_step_override() {
        let s = scheduler();
        s.put_workflow(
            WorkflowDefinition::new("workflow://skip", "a")
                .with_step(Step::new("a", "fail").with_transition("next", "b"))
                .with_step(Step::new("b", "ok")),
        )
        .unwrap();

        let uri = create(&s, "workflow://skip#b").await.uri.unwrap();
        let order = s.wait_for_completion(&uri, POLL).await.unwrap();
        assert_eq!(order.status, WorkOrderStatus::Finished);
        assert_eq!(order.workflow_uri, "workflow://skip");
        assert_eq!(order.history.len(), 1);

        let err = s
            .create_work_order("workflow://skip#nope", no_params(), "test")
            .await
            .unwrap_err();
        assert!(matches!(err, OrderflowError::Config(_)));
    }

    #[tokio::test]
    async fn test_denial_has_no_side_effects() {
        let s = scheduler();
        s.put_workflow(
            single_step("workflow://one", "sleep:200").with_semaphore(
                SemaphoreType::WorkflowBased,
                SemaphoreConfig::workflow_based(1, 0),
            ),
        )
        .unwrap();

        let first = create(&s, "workflow://one").await;
        let second = create(&s, "workflow://one").await;
        assert!(first.is_created);
        assert!(!second.is_created);
        assert!(second.uri.is_none());
        assert!(second.message.unwrap().contains(first.uri.as_deref().unwrap()));
        assert_eq!(s.list_work_orders("workflow://one").unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_release_work_order_lock() {
        let s = scheduler();
        s.put_workflow(
            single_step("workflow://stuck", "sleep:500").with_semaphore(
                SemaphoreType::WorkflowBased,
                SemaphoreConfig::workflow_based(1, 0),
            ),
        )
        .unwrap();

        let uri = create(&s, "workflow://stuck").await.uri.unwrap();
        assert!(!create(&s, "workflow://stuck").await.is_created);

        assert!(s.release_work_order_lock(&uri).unwrap());
        assert!(!s.release_work_order_lock(&uri).unwrap());
        assert!(create(&s, "workflow://stuck").await.is_created);

        assert!(s.release_work_order_lock("workorder://none").unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_expected_argument_defaults() {
        let s = scheduler();
        s.put_workflow(
            single_step("workflow://args", "ok")
                .with_argument("REGION", Some("emea"))
                .with_argument("BLANK", Some("  ")),
        )
        .unwrap();

        let uri = create(&s, "workflow://args").await.uri.unwrap();
        let order = s.get_work_order(&uri).unwrap();
        assert_eq!(order.params.get("REGION").map(String::as_str), Some("emea"));
        assert!(!order.params.contains_key("BLANK"));
    }

    #[tokio::test]
    async fn test_uris_are_unique() {
        let s = scheduler();
        s.put_workflow(single_step("workflow://many", "ok")).unwrap();

        let a = create(&s, "workflow://many").await.uri.unwrap();
        let b = create(&s, "workflow://many").await.uri.unwrap();
        assert_ne!(a, b);
        assert!(a.starts_with("workorder://"));
        assert!(a.ends_with("/many/1"));
    }

    #[tokio::test]
    async fn test_denials_do_not_consume_uris() {
        let s = scheduler();
        s.put_workflow(
            single_step("workflow://d", "sleep:200").with_semaphore(
                SemaphoreType::PropertyBased,
                SemaphoreConfig::property_based(1, "KEY"),
            ),
        )
        .unwrap();
        let keyed = |value: &str| HashMap::from([("KEY".to_string(), value.to_string())]);

        for _ in 0..3 {
            assert!(!create(&s, "workflow://d").await.is_created);
        }
        let first = s.create_work_order("workflow://d", keyed("a"), "test").await.unwrap();
        assert!(first.uri.unwrap().ends_with("/d/1"));

        let busy = s.create_work_order("workflow://d", keyed("a"), "test").await.unwrap();
        assert!(!busy.is_created);
        let second = s.create_work_order("workflow://d", keyed("b"), "test").await.unwrap();
        assert!(second.uri.unwrap().ends_with("/d/2"));
    }

    #[tokio::test]
    async fn test_unreadable_order_file_is_skipped() {
        let temp_dir = tempdir().unwrap();
        let dir = temp_dir.path().join("orders");
        let s = WorkOrderScheduler::new(
            WorkflowStore::in_memory(),
            Arc::new(DirectoryOrderStore::open(&dir).unwrap()),
            Arc::new(FakeExecutor),
        );
        s.put_workflow(single_step("workflow://corrupt", "ok")).unwrap();

        let taken = work_order_uri("workflow://corrupt", Utc::now(), 1);
        std::fs::write(dir.join(format!("{}.json", encode_file_name(&taken))), "{ not json").unwrap();

        let response = create(&s, "workflow://corrupt").await;
        assert!(response.is_created);
        let uri = response.uri.unwrap();
        assert!(uri.ends_with("/corrupt/2"));
        assert_eq!(
            s.wait_for_completion(&uri, POLL).await.unwrap().status,
            WorkOrderStatus::Finished
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_terminal_write_is_retried() {
        let store = Arc::new(FlakyStore::default());
        store.terminal_failures.store(3, Ordering::SeqCst);
        let s = WorkOrderScheduler::new(WorkflowStore::in_memory(), store.clone(), Arc::new(FakeExecutor));
        s.put_workflow(
            single_step("workflow://flaky", "ok").with_semaphore(
                SemaphoreType::WorkflowBased,
                SemaphoreConfig::workflow_based(1, 0),
            ),
        )
        .unwrap();

        let uri = create(&s, "workflow://flaky").await.uri.unwrap();
        let order = s.wait_for_completion(&uri, POLL).await.unwrap();

        assert_eq!(order.status, WorkOrderStatus::Finished);
        assert_eq!(store.terminal_failures.load(Ordering::SeqCst), 0);
        assert_eq!(s.semaphores().holder_count(&LockKey::workflow("workflow://flaky")), 0);
    }

    #[tokio::test]
    async fn test_shrinking_in_use_workflow_is_rejected() {
        let s = scheduler();
        let limited = |max: i64| {
            single_step("workflow://shrink", "sleep:300").with_semaphore(
                SemaphoreType::WorkflowBased,
                SemaphoreConfig::workflow_based(max, 0),
            )
        };
        s.put_workflow(limited(2)).unwrap();
        let a = create(&s, "workflow://shrink").await.uri.unwrap();
        let b = create(&s, "workflow://shrink").await.uri.unwrap();

        let err = s.put_workflow(limited(1)).unwrap_err();
        assert!(matches!(err, OrderflowError::Config(_)));
        assert_eq!(s.get_workflow("workflow://shrink").unwrap().semaphore_config.max_allowed, 2);
        assert_eq!(s.semaphores().holder_count(&LockKey::workflow("workflow://shrink")), 2);

        s.wait_for_completion(&a, POLL).await.unwrap();
        s.wait_for_completion(&b, POLL).await.unwrap();
        s.put_workflow(limited(1)).unwrap();
        assert_eq!(s.get_workflow("workflow://shrink").unwrap().semaphore_config.max_allowed, 1);
    }

    #[tokio::test]
    async fn test_delete_workflow() {
        let s = scheduler();
        s.put_workflow(single_step("workflow://gone", "ok")).unwrap();
        assert_eq!(s.list_workflows().unwrap(), vec!["workflow://gone".to_string()]);

        assert!(s.delete_workflow("workflow://gone").unwrap());
        assert!(!s.semaphores().is_configured("workflow://gone"));
        assert!(s.get_workflow("workflow://gone").unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_invalid_workflow_rejected() {
        let s = scheduler();
        let invalid = single_step("workflow://bad", "ok").with_semaphore(
            SemaphoreType::PropertyBased,
            SemaphoreConfig::workflow_based(1, 0),
        );
        assert!(matches!(s.put_workflow(invalid), Err(OrderflowError::Config(_))));
        assert!(!s.semaphores().is_configured("workflow://bad"));
    }

    #[test]
    fn test_create_response_wire_format() {
        let json = serde_json::to_value(CreateResponse::created("workorder://1/a/1".into())).unwrap();
        assert_eq!(json["isCreated"], true);
        assert_eq!(json["uri"], "workorder://1/a/1");
        assert!(json.get("message").is_none());
    }
}
