//! Cron scheduler: replays saved-state snapshots on a minute tick.
//!
//! The tick loop re-checks every enabled task against the current
//! minute, so editing the task list needs no job (un)registration and a
//! removed task can never fire again after the edit lands.

mod cron;

pub use cron::{parse_tz, CronExpr};

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Timelike, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use hearth_domain::SavedStateStore;
use hearth_protocol::{types, Message, StateChange};

use crate::logic::LogicEngine;
use crate::sessions::SessionRegistry;
use crate::store::Store;

#[derive(Debug, Error)]
pub enum ScheduleError {
    #[error("malformed cron expression: {0:?}")]
    BadCron(String),
}

/// One scheduled trigger: a cron expression plus the saved states it
/// replays. `actions` holds SavedState UUIDs, never inline snapshots.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Task {
    pub name: String,
    pub uuid: String,
    #[serde(rename = "when")]
    pub cron: String,
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub actions: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskList {
    tasks: HashMap<String, Task>,
}

impl TaskList {
    pub fn get(&self, uuid: &str) -> Option<&Task> {
        self.tasks.get(uuid)
    }

    pub fn add(&mut self, task: Task) {
        self.tasks.insert(task.uuid.clone(), task);
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}

/// Aggregate a task's saved states into one [`StateChange`] per owning
/// node. Missing saved-state references are returned separately so the
/// caller can log and continue.
pub fn state_changes_for(
    task: &Task,
    savedstates: &SavedStateStore,
) -> (HashMap<String, StateChange>, Vec<String>) {
    let mut per_node: HashMap<String, StateChange> = HashMap::new();
    let mut missing = Vec::new();
    for uuid in &task.actions {
        match savedstates.get(uuid) {
            Some(saved) => {
                for (id, state) in &saved.state {
                    per_node
                        .entry(id.node.clone())
                        .or_default()
                        .insert(id.clone(), state.clone());
                }
            }
            None => missing.push(uuid.clone()),
        }
    }
    (per_node, missing)
}

pub struct Scheduler {
    tasks: RwLock<TaskList>,
    tz: chrono_tz::Tz,
}

impl Scheduler {
    pub fn new(tasks: TaskList, tz: chrono_tz::Tz) -> Self {
        Self {
            tasks: RwLock::new(tasks),
            tz,
        }
    }

    pub fn tasks(&self) -> TaskList {
        self.tasks.read().clone()
    }

    /// Replace the whole task list (gui edit).
    pub fn replace(&self, tasks: TaskList) {
        *self.tasks.write() = tasks;
    }

    /// Enabled tasks whose cron expression matches the given minute.
    /// Unparseable expressions are logged and skipped.
    pub fn due_tasks(&self, at: &DateTime<Utc>) -> Vec<Task> {
        let tasks = self.tasks.read();
        let mut due: Vec<Task> = tasks
            .tasks
            .values()
            .filter(|task| task.enabled)
            .filter(|task| match CronExpr::from_str(&task.cron) {
                Ok(expr) => expr.matches(at, self.tz),
                Err(e) => {
                    tracing::warn!(task = %task.uuid, error = %e, "skipping task");
                    false
                }
            })
            .cloned()
            .collect();
        due.sort_by(|a, b| a.uuid.cmp(&b.uuid));
        due
    }

    /// Tick loop: wakes on every minute boundary and fires due tasks
    /// until the token is cancelled.
    pub async fn run(
        &self,
        store: Arc<Store>,
        sessions: Arc<SessionRegistry>,
        logic: Arc<LogicEngine>,
        shutdown: CancellationToken,
    ) {
        tracing::info!(tz = %self.tz, tasks = self.tasks.read().len(), "scheduler started");
        loop {
            let now = Utc::now();
            let to_boundary = 60 - now.second() as u64;
            tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::info!("scheduler stopped");
                    return;
                }
                _ = tokio::time::sleep(std::time::Duration::from_secs(to_boundary)) => {}
            }

            let now = Utc::now();
            for task in self.due_tasks(&now) {
                self.fire(&task, &store, &sessions, &logic).await;
            }
        }
    }

    /// Fire one task invocation: one `state-change` message per owning
    /// node, plus a local merge so rules and gui sessions see the new
    /// state without waiting for the nodes to report back.
    async fn fire(
        &self,
        task: &Task,
        store: &Store,
        sessions: &SessionRegistry,
        logic: &LogicEngine,
    ) {
        tracing::info!(task = %task.uuid, name = %task.name, "task fired");
        let (per_node, missing) = state_changes_for(task, &store.savedstates());
        for uuid in &missing {
            tracing::warn!(task = %task.uuid, savedstate = %uuid, "task references unknown saved state");
        }

        let mut merged = StateChange::new();
        for (node, change) in &per_node {
            merged.extend(change.iter().map(|(id, s)| (id.clone(), s.clone())));
            let node_uuid = match uuid::Uuid::parse_str(node) {
                Ok(u) => u,
                Err(_) => {
                    tracing::warn!(task = %task.uuid, node = %node, "saved state targets a non-uuid node");
                    continue;
                }
            };
            let msg = match Message::new(types::STATE_CHANGE, change) {
                Ok(m) => m,
                Err(e) => {
                    tracing::warn!(task = %task.uuid, error = %e, "failed to encode state-change");
                    continue;
                }
            };
            // One node being offline must not starve the others.
            if let Err(e) = sessions.send_to_node(&node_uuid, &msg).await {
                tracing::warn!(task = %task.uuid, node = %node, error = %e, "state-change not delivered");
            }
        }

        let changed = store.sync_state(&merged);
        if !changed.is_empty() {
            let devices = store.devices();
            if let Ok(msg) = Message::new(types::DEVICES, &devices) {
                sessions.broadcast(&msg);
            }
            logic.evaluate(&devices);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use hearth_domain::{DeviceId, SavedState, State};
    use serde_json::json;

    fn saved(uuid: &str, entries: &[(&str, &str, serde_json::Value)]) -> SavedState {
        SavedState {
            name: uuid.to_string(),
            uuid: uuid.to_string(),
            state: entries
                .iter()
                .map(|(node, id, v)| {
                    (
                        DeviceId::new(*node, *id),
                        serde_json::from_value::<State>(v.clone()).unwrap(),
                    )
                })
                .collect(),
        }
    }

    #[test]
    fn batches_one_state_change_per_node() {
        let mut states = SavedStateStore::new();
        states.add(saved("s1", &[("n1", "1", json!({"on": true}))]));
        states.add(saved(
            "s2",
            &[
                ("n1", "2", json!({"on": false})),
                ("n2", "1", json!({"brightness": 50.0})),
            ],
        ));
        let task = Task {
            name: "evening".into(),
            uuid: "t1".into(),
            cron: "0 18 * * *".into(),
            enabled: true,
            actions: vec!["s1".into(), "s2".into()],
        };

        let (per_node, missing) = state_changes_for(&task, &states);
        assert!(missing.is_empty());
        assert_eq!(per_node.len(), 2);
        assert_eq!(per_node["n1"].len(), 2);
        assert_eq!(per_node["n2"].len(), 1);
    }

    #[test]
    fn missing_savedstate_is_reported_not_fatal() {
        let mut states = SavedStateStore::new();
        states.add(saved("s1", &[("n1", "1", json!({"on": true}))]));
        let task = Task {
            actions: vec!["s1".into(), "gone".into()],
            ..Default::default()
        };

        let (per_node, missing) = state_changes_for(&task, &states);
        assert_eq!(per_node.len(), 1);
        assert_eq!(missing, vec!["gone".to_string()]);
    }

    #[test]
    fn due_tasks_honors_enabled_and_cron() {
        let mut tasks = TaskList::default();
        tasks.add(Task {
            name: "on the hour".into(),
            uuid: "t1".into(),
            cron: "0 * * * *".into(),
            enabled: true,
            actions: vec![],
        });
        tasks.add(Task {
            name: "disabled".into(),
            uuid: "t2".into(),
            cron: "0 * * * *".into(),
            enabled: false,
            actions: vec![],
        });
        tasks.add(Task {
            name: "broken".into(),
            uuid: "t3".into(),
            cron: "not a cron".into(),
            enabled: true,
            actions: vec![],
        });
        let scheduler = Scheduler::new(tasks, chrono_tz::UTC);

        let on_the_hour = Utc.with_ymd_and_hms(2026, 6, 15, 10, 0, 0).unwrap();
        let due = scheduler.due_tasks(&on_the_hour);
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].uuid, "t1");

        let off_hour = Utc.with_ymd_and_hms(2026, 6, 15, 10, 7, 0).unwrap();
        assert!(scheduler.due_tasks(&off_hour).is_empty());
    }

    #[test]
    fn task_list_round_trips_as_plain_map() {
        let mut tasks = TaskList::default();
        tasks.add(Task {
            name: "evening".into(),
            uuid: "t1".into(),
            cron: "0 18 * * *".into(),
            enabled: true,
            actions: vec!["s1".into()],
        });
        let json = serde_json::to_value(&tasks).unwrap();
        assert_eq!(json["t1"]["when"], "0 18 * * *");
        let back: TaskList = serde_json::from_value(json).unwrap();
        assert_eq!(back.len(), 1);
        assert!(back.get("t1").is_some());
    }
}
