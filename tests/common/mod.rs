//! Shared helpers for the integration tests.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use orderflow::execution::OrderContext;
use orderflow::{StepExecutor, StepOutcome, WorkOrderScheduler};

/// Step executor driven by the executable string:
///
/// - `ok` succeeds with `next`
/// - `fail` fails
/// - `panic` panics
/// - `sleep:<ms>` sleeps on the Tokio clock, then succeeds
/// - `goto:<name>` succeeds with transition `<name>`
/// - `echo:<param>` succeeds with the value of `<param>` as transition
#[derive(Default)]
pub struct ScriptedExecutor {
    pub runs: AtomicUsize,
}

#[async_trait]
impl StepExecutor for ScriptedExecutor {
    async fn run(
        &self,
        executable: &str,
        params: &HashMap<String, String>,
        _ctx: &OrderContext,
    ) -> StepOutcome {
        self.runs.fetch_add(1, Ordering::SeqCst);

        if let Some(ms) = executable.strip_prefix("sleep:") {
            let ms: u64 = ms.parse().expect("sleep duration");
            tokio::time::sleep(Duration::from_millis(ms)).await;
            return StepOutcome::success();
        }
        if let Some(name) = executable.strip_prefix("goto:") {
            return StepOutcome::success_with(name);
        }
        if let Some(param) = executable.strip_prefix("echo:") {
            return match params.get(param) {
                Some(value) => StepOutcome::success_with(value.clone()),
                None => StepOutcome::failure(format!("missing {}", param)),
            };
        }
        match executable {
            "ok" => StepOutcome::success(),
            "panic" => panic!("scripted panic"),
            other => StepOutcome::failure(format!("{} failed", other)),
        }
    }
}

pub fn scheduler() -> (WorkOrderScheduler, Arc<ScriptedExecutor>) {
    let executor = Arc::new(ScriptedExecutor::default());
    let scheduler = WorkOrderScheduler::in_memory(executor.clone());
    (scheduler, executor)
}

pub fn params(pairs: &[(&str, &str)]) -> HashMap<String, String> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

pub const POLL: Duration = Duration::from_millis(50);
