//! Edge-triggered rule engine.
//!
//! Rules are re-evaluated synchronously on every device-state mutation.
//! Each rule latches its last boolean result in `active`; actions fire
//! only on a false→true (enter) or true→false (exit) transition, never
//! while the result stays constant. Evaluation errors deactivate only
//! the affected rule for that cycle.

mod action;
mod condition;

pub use action::{Action, ActionRunner, CommandSink, Progress, Step};
pub use condition::{Comparator, Condition};

use std::collections::HashMap;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use hearth_domain::DeviceList;

#[derive(Debug, Error)]
pub enum LogicError {
    #[error("unknown state path: {0}")]
    UnknownStatePath(String),
    #[error("cannot order {path}: {actual} vs {expected}")]
    NotComparable {
        path: String,
        actual: Value,
        expected: Value,
    },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operator {
    #[default]
    And,
    Or,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Rule {
    pub name: String,
    pub uuid: String,
    #[serde(default)]
    pub operator: Operator,
    #[serde(default)]
    pub enabled: bool,
    /// Latched result of the previous evaluation. Persisted so a hub
    /// restart does not re-fire enter actions for an already-true rule.
    #[serde(default)]
    pub active: bool,
    #[serde(default)]
    pub conditions: Vec<Condition>,
    #[serde(default, rename = "enterActions")]
    pub enter_actions: Vec<String>,
    #[serde(default, rename = "exitActions")]
    pub exit_actions: Vec<String>,
}

impl Rule {
    fn eval(&self, flat: &HashMap<String, Value>) -> Result<bool, LogicError> {
        match self.operator {
            Operator::And => {
                for cond in &self.conditions {
                    if !cond.eval(flat)? {
                        return Ok(false);
                    }
                }
                Ok(!self.conditions.is_empty())
            }
            Operator::Or => {
                for cond in &self.conditions {
                    if cond.eval(flat)? {
                        return Ok(true);
                    }
                }
                Ok(false)
            }
        }
    }
}

/// The persisted shape of `rules.json`: rules plus the actions they
/// reference by UUID. Actions are a lookup table, never inlined, so the
/// JSON round-trip stays cycle-free.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuleSet {
    #[serde(default)]
    pub rules: HashMap<String, Rule>,
    #[serde(default)]
    pub actions: HashMap<String, Action>,
}

pub struct LogicEngine {
    ruleset: RwLock<RuleSet>,
    runner: ActionRunner,
}

impl LogicEngine {
    pub fn new(ruleset: RuleSet, runner: ActionRunner) -> Self {
        Self {
            ruleset: RwLock::new(ruleset),
            runner,
        }
    }

    pub fn ruleset(&self) -> RuleSet {
        self.ruleset.read().clone()
    }

    /// Replace rules and actions (gui edit). Latched `active` flags of
    /// surviving rules are preserved so the swap itself never fires
    /// actions.
    pub fn replace(&self, mut incoming: RuleSet) {
        let mut current = self.ruleset.write();
        for (uuid, rule) in &mut incoming.rules {
            if let Some(existing) = current.rules.get(uuid) {
                rule.active = existing.active;
            }
        }
        *current = incoming;
    }

    /// Re-evaluate every enabled rule against the device list and fire
    /// enter/exit actions for rules whose result flipped. Returns the
    /// UUIDs of rules that transitioned (latches changed).
    pub fn evaluate(&self, devices: &DeviceList) -> Vec<String> {
        let flat = devices.flatten();
        let mut transitions = Vec::new();

        let mut ruleset = self.ruleset.write();
        let RuleSet { rules, actions } = &mut *ruleset;
        let mut uuids: Vec<&String> = rules.keys().collect();
        uuids.sort();
        let uuids: Vec<String> = uuids.into_iter().cloned().collect();

        for uuid in uuids {
            let rule = match rules.get_mut(&uuid) {
                Some(r) if r.enabled => r,
                _ => continue,
            };
            let result = match rule.eval(&flat) {
                Ok(v) => v,
                Err(e) => {
                    tracing::warn!(rule = %rule.uuid, name = %rule.name, error = %e, "rule evaluation failed, skipping this cycle");
                    continue;
                }
            };
            if result == rule.active {
                continue;
            }
            rule.active = result;
            transitions.push(rule.uuid.clone());
            let (edge, to_run) = if result {
                ("enter", &rule.enter_actions)
            } else {
                ("exit", &rule.exit_actions)
            };
            tracing::info!(rule = %rule.uuid, name = %rule.name, edge, "rule transitioned");
            for action_uuid in to_run {
                match actions.get(action_uuid) {
                    Some(action) => self.runner.run(action.clone()),
                    None => {
                        tracing::warn!(rule = %rule.uuid, action = %action_uuid, "rule references unknown action");
                    }
                }
            }
        }
        transitions
    }

    pub fn cancel_all_actions(&self) {
        self.runner.cancel_all();
    }
}
