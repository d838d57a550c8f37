//! Cron-driven scheduler re-entering the call router.
//!
//! Task timing is a pure function: [`next_occurrence`] maps a cron
//! expression and an instant to the next matching instant at or after it.
//! One timer loop serves every task (no per-task background fiber): it
//! fires whatever is due, then sleeps until the earliest upcoming run, an
//! edit, or shutdown. A firing invokes the router with a synthetic session
//! id scoped to the task; its bookkeeping advances regardless of outcome,
//! and one task's failure is caught and logged without touching any other
//! task or future firings of the same one.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use cron::Schedule;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::{RouterError, SchedulerError};
use crate::router::{CallRequest, CallRouter};

/// What a firing invokes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    /// One routed tool call.
    ToolCall,
    /// A multi-step agent task behind the [`AgentTaskRunner`] seam.
    AgentTask,
}

/// The payload of a scheduled task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskDefinition {
    /// Tool call or agent task.
    #[serde(rename = "type")]
    pub kind: TaskKind,
    /// Qualified tool name, or the agent prompt.
    pub target: String,
    /// Arguments for tool calls.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arguments: Option<Value>,
}

/// One cron-triggered task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduledTask {
    /// Stable identity.
    pub uuid: Uuid,
    /// Display name.
    pub name: String,
    /// Standard five-field cron expression (an optional leading seconds
    /// field is accepted).
    pub cron_expression: String,
    /// Inactive tasks are kept but never fire.
    pub is_active: bool,
    /// When the last firing's call completed, success or failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_run_at: Option<DateTime<Utc>>,
    /// The next firing instant; recomputed after every firing or edit.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_run_at: Option<DateTime<Utc>>,
    /// What to invoke.
    pub task_definition: TaskDefinition,
}

/// Executes `agent_task` definitions.
///
/// The scheduler only triggers the chain; decomposed calls are expected to
/// come back through the router with `parent_call_uuid` set so the call
/// tree is reconstructible from the audit trail.
#[async_trait]
pub trait AgentTaskRunner: Send + Sync {
    /// Run one agent task to completion.
    async fn run(
        &self,
        target: &str,
        arguments: Option<Value>,
        session_id: &str,
        parent_call_uuid: Uuid,
    ) -> Result<Value, RouterError>;
}

/// Accept standard five-field cron by prepending a seconds field.
fn normalize_cron(expr: &str) -> String {
    if expr.split_whitespace().count() == 5 {
        format!("0 {expr}")
    } else {
        expr.to_string()
    }
}

/// The next instant matching `expr` at or after `after`.
///
/// Pure; the timer loop and the bookkeeping updates are built on it.
/// Returns `Ok(None)` for expressions with no future occurrence.
///
/// # Errors
///
/// Returns [`SchedulerError::InvalidCron`] when the expression does not
/// parse.
pub fn next_occurrence(
    expr: &str,
    after: DateTime<Utc>,
) -> Result<Option<DateTime<Utc>>, SchedulerError> {
    let schedule =
        Schedule::from_str(&normalize_cron(expr)).map_err(|e| SchedulerError::InvalidCron {
            expr: expr.to_string(),
            reason: e.to_string(),
        })?;
    // `Schedule::after` is exclusive; nudge the cursor back so an `after`
    // that lands exactly on a boundary is itself returned.
    Ok(schedule
        .after(&(after - chrono::Duration::milliseconds(1)))
        .next())
}

/// The scheduler: task set plus the single timer loop.
pub struct Scheduler {
    tasks: DashMap<Uuid, ScheduledTask>,
    router: Arc<CallRouter>,
    agent_runner: Option<Arc<dyn AgentTaskRunner>>,
    notify: Notify,
    cancel: CancellationToken,
}

impl Scheduler {
    /// A scheduler firing into the given router.
    pub fn new(
        router: Arc<CallRouter>,
        agent_runner: Option<Arc<dyn AgentTaskRunner>>,
        cancel: CancellationToken,
    ) -> Arc<Self> {
        Arc::new(Self {
            tasks: DashMap::new(),
            router,
            agent_runner,
            notify: Notify::new(),
            cancel,
        })
    }

    /// Create a task; its first `next_run_at` is computed from now.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError::InvalidCron`] when the expression does not
    /// parse; nothing is stored in that case.
    pub fn create(
        &self,
        name: impl Into<String>,
        cron_expression: impl Into<String>,
        is_active: bool,
        task_definition: TaskDefinition,
    ) -> Result<ScheduledTask, SchedulerError> {
        let cron_expression = cron_expression.into();
        let next_run_at = next_occurrence(&cron_expression, Utc::now())?;
        let task = ScheduledTask {
            uuid: Uuid::new_v4(),
            name: name.into(),
            cron_expression,
            is_active,
            last_run_at: None,
            next_run_at,
            task_definition,
        };
        tracing::info!(
            task = %task.name,
            cron = %task.cron_expression,
            next_run_at = ?task.next_run_at,
            "scheduled task created"
        );
        self.tasks.insert(task.uuid, task.clone());
        self.notify.notify_one();
        Ok(task)
    }

    /// Activate or deactivate a task.
    ///
    /// Deactivation freezes the bookkeeping; reactivation recomputes
    /// `next_run_at` from now.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError::UnknownTask`] for an unknown uuid, or
    /// [`SchedulerError::InvalidCron`] if the stored expression no longer
    /// parses on reactivation.
    pub fn set_active(&self, uuid: Uuid, is_active: bool) -> Result<(), SchedulerError> {
        let mut entry = self
            .tasks
            .get_mut(&uuid)
            .ok_or(SchedulerError::UnknownTask { uuid })?;
        if is_active && !entry.is_active {
            entry.next_run_at = next_occurrence(&entry.cron_expression, Utc::now())?;
        }
        entry.is_active = is_active;
        drop(entry);
        self.notify.notify_one();
        Ok(())
    }

    /// Delete a task.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError::UnknownTask`] for an unknown uuid.
    pub fn remove(&self, uuid: Uuid) -> Result<(), SchedulerError> {
        self.tasks
            .remove(&uuid)
            .ok_or(SchedulerError::UnknownTask { uuid })?;
        self.notify.notify_one();
        Ok(())
    }

    /// A task by uuid.
    pub fn get(&self, uuid: Uuid) -> Option<ScheduledTask> {
        self.tasks.get(&uuid).map(|t| t.clone())
    }

    /// All tasks, sorted by name.
    pub fn list(&self) -> Vec<ScheduledTask> {
        let mut tasks: Vec<ScheduledTask> = self.tasks.iter().map(|t| t.clone()).collect();
        tasks.sort_by(|a, b| a.name.cmp(&b.name));
        tasks
    }

    /// The timer loop. Runs until the cancellation token fires.
    pub async fn run(self: Arc<Self>) {
        loop {
            if self.cancel.is_cancelled() {
                break;
            }

            let now = Utc::now();
            let due: Vec<ScheduledTask> = self
                .tasks
                .iter()
                .filter(|t| t.is_active && t.next_run_at.is_some_and(|at| at <= now))
                .map(|t| t.clone())
                .collect();
            for task in due {
                Self::fire(&self, task, now);
            }

            let wake = self
                .tasks
                .iter()
                .filter(|t| t.is_active)
                .filter_map(|t| t.next_run_at)
                .min();
            match wake {
                Some(at) => {
                    let delay = (at - Utc::now()).to_std().unwrap_or(Duration::ZERO);
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = self.notify.notified() => {}
                        _ = self.cancel.cancelled() => break,
                    }
                }
                None => {
                    tokio::select! {
                        _ = self.notify.notified() => {}
                        _ = self.cancel.cancelled() => break,
                    }
                }
            }
        }
        tracing::debug!("scheduler stopped");
    }

    /// Fire one task: advance `next_run_at` immediately, run the call on
    /// its own task, and set `last_run_at` when the call completes.
    fn fire(scheduler: &Arc<Self>, task: ScheduledTask, fired_at: DateTime<Utc>) {
        let next = next_occurrence(
            &task.cron_expression,
            fired_at + chrono::Duration::seconds(1),
        )
        .ok()
        .flatten();
        if let Some(mut entry) = scheduler.tasks.get_mut(&task.uuid) {
            entry.next_run_at = next;
        }

        tracing::info!(task = %task.name, "scheduled task firing");
        let scheduler = scheduler.clone();
        tokio::spawn(async move {
            match scheduler.execute(&task).await {
                Ok(()) => {
                    tracing::debug!(task = %task.name, "scheduled task completed");
                }
                Err(e) => {
                    // Swallowed by design: one task's failure never affects
                    // other tasks or this task's future firings.
                    tracing::warn!(task = %task.name, error = %e, "scheduled task failed");
                }
            }
            if let Some(mut entry) = scheduler.tasks.get_mut(&task.uuid) {
                entry.last_run_at = Some(fired_at);
            }
        });
    }

    async fn execute(&self, task: &ScheduledTask) -> Result<(), String> {
        let session_id = format!("sched:{}", task.uuid);
        match task.task_definition.kind {
            TaskKind::ToolCall => {
                let request = CallRequest {
                    name: task.task_definition.target.clone(),
                    arguments: task
                        .task_definition
                        .arguments
                        .clone()
                        .unwrap_or_else(|| json!({})),
                    session_id: Some(session_id),
                    parent_call_uuid: None,
                };
                self.router
                    .route(request)
                    .await
                    .map(|_| ())
                    .map_err(|e| e.to_string())
            }
            TaskKind::AgentTask => match &self.agent_runner {
                Some(runner) => runner
                    .run(
                        &task.task_definition.target,
                        task.task_definition.arguments.clone(),
                        &session_id,
                        Uuid::new_v4(),
                    )
                    .await
                    .map(|_| ())
                    .map_err(|e| e.to_string()),
                None => Err("no agent task runner configured".to_string()),
            },
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
