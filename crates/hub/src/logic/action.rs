//! Actions: ordered step sequences run on their own task, cancellable
//! by their next run.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use hearth_domain::{DeviceId, State};

/// One step of an action sequence.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Step {
    /// Push a partial state onto one device (relayed to its owning node).
    StateChange { device: DeviceId, state: State },
    /// Sleep; interrupted immediately when the run is cancelled.
    Pause { ms: u64 },
    Notify { message: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Action {
    pub name: String,
    pub uuid: String,
    #[serde(default)]
    pub steps: Vec<Step>,
}

/// Where step effects land. The hub wires this to the session registry;
/// tests substitute a recorder.
#[async_trait]
pub trait CommandSink: Send + Sync {
    async fn state_change(&self, device: DeviceId, state: State);
    async fn notify(&self, message: &str);
}

/// Progress event for one step of a running action. Delivery is
/// best-effort: a full channel drops the event rather than stalling the
/// run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Progress {
    pub action: String,
    pub step: usize,
    pub total: usize,
}

/// Runs actions with the at-most-one-concurrent-run-per-action
/// invariant: starting an action cancels any in-flight run of the same
/// UUID before the new run's first step.
pub struct ActionRunner {
    sink: Arc<dyn CommandSink>,
    running: Mutex<HashMap<String, CancellationToken>>,
    progress: mpsc::Sender<Progress>,
    shutdown: CancellationToken,
}

impl ActionRunner {
    pub fn new(sink: Arc<dyn CommandSink>) -> (Self, mpsc::Receiver<Progress>) {
        let (progress_tx, progress_rx) = mpsc::channel(32);
        let runner = Self {
            sink,
            running: Mutex::new(HashMap::new()),
            progress: progress_tx,
            shutdown: CancellationToken::new(),
        };
        (runner, progress_rx)
    }

    /// Start a run of `action` on its own task. Any previous run of the
    /// same action is cancelled first; its remaining steps never execute.
    pub fn run(&self, action: Action) {
        let token = {
            let mut running = self.running.lock();
            if let Some(prev) = running.get(&action.uuid) {
                prev.cancel();
            }
            let token = self.shutdown.child_token();
            running.insert(action.uuid.clone(), token.clone());
            token
        };

        let sink = Arc::clone(&self.sink);
        let progress = self.progress.clone();
        tokio::spawn(async move {
            let total = action.steps.len();
            tracing::debug!(action = %action.uuid, name = %action.name, steps = total, "action run started");
            for (i, step) in action.steps.into_iter().enumerate() {
                if token.is_cancelled() {
                    tracing::debug!(action = %action.uuid, step = i, "action run cancelled");
                    return;
                }
                if progress
                    .try_send(Progress {
                        action: action.uuid.clone(),
                        step: i,
                        total,
                    })
                    .is_err()
                {
                    tracing::trace!(action = %action.uuid, "progress channel full, event dropped");
                }
                match step {
                    Step::StateChange { device, state } => {
                        sink.state_change(device, state).await;
                    }
                    Step::Pause { ms } => {
                        tokio::select! {
                            _ = token.cancelled() => {
                                tracing::debug!(action = %action.uuid, step = i, "action run cancelled mid-pause");
                                return;
                            }
                            _ = tokio::time::sleep(Duration::from_millis(ms)) => {}
                        }
                    }
                    Step::Notify { message } => {
                        sink.notify(&message).await;
                    }
                }
            }
            tracing::debug!(action = %action.uuid, "action run finished");
        });
    }

    pub fn cancel(&self, action_uuid: &str) {
        if let Some(token) = self.running.lock().get(action_uuid) {
            token.cancel();
        }
    }

    /// Cancel every in-flight run (process shutdown).
    pub fn cancel_all(&self) {
        self.shutdown.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::sync::mpsc::UnboundedSender;

    struct Recorder {
        events: UnboundedSender<String>,
    }

    #[async_trait]
    impl CommandSink for Recorder {
        async fn state_change(&self, device: DeviceId, _state: State) {
            let _ = self.events.send(format!("state:{device}"));
        }

        async fn notify(&self, message: &str) {
            let _ = self.events.send(format!("notify:{message}"));
        }
    }

    fn recorder() -> (Arc<Recorder>, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(Recorder { events: tx }), rx)
    }

    fn state(v: serde_json::Value) -> State {
        serde_json::from_value(v).unwrap()
    }

    #[tokio::test]
    async fn steps_run_in_order() {
        let (sink, mut rx) = recorder();
        let (runner, _progress) = ActionRunner::new(sink);
        runner.run(Action {
            name: "scene".into(),
            uuid: "a1".into(),
            steps: vec![
                Step::StateChange {
                    device: DeviceId::new("n1", "1"),
                    state: state(json!({"on": true})),
                },
                Step::Notify {
                    message: "done".into(),
                },
            ],
        });

        assert_eq!(rx.recv().await.unwrap(), "state:n1.1");
        assert_eq!(rx.recv().await.unwrap(), "notify:done");
    }

    #[tokio::test(start_paused = true)]
    async fn second_run_cancels_first_mid_pause() {
        let (sink, mut rx) = recorder();
        let (runner, _progress) = ActionRunner::new(sink);
        let action = |tag: &str| Action {
            name: "scene".into(),
            uuid: "a1".into(),
            steps: vec![
                Step::Pause { ms: 5_000 },
                Step::Notify {
                    message: tag.into(),
                },
            ],
        };

        runner.run(action("first"));
        tokio::task::yield_now().await;
        runner.run(action("second"));

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(rx.recv().await.unwrap(), "notify:second");
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn progress_reports_each_step() {
        let (sink, _rx) = recorder();
        let (runner, mut progress) = ActionRunner::new(sink);
        runner.run(Action {
            name: "scene".into(),
            uuid: "a1".into(),
            steps: vec![
                Step::Notify { message: "a".into() },
                Step::Notify { message: "b".into() },
            ],
        });

        let first = progress.recv().await.unwrap();
        assert_eq!(
            first,
            Progress {
                action: "a1".into(),
                step: 0,
                total: 2
            }
        );
        assert_eq!(progress.recv().await.unwrap().step, 1);
    }

    #[test]
    fn step_serializes_with_kebab_case_tag() {
        let step = Step::Pause { ms: 250 };
        let json = serde_json::to_value(&step).unwrap();
        assert_eq!(json["type"], "pause");
        assert_eq!(json["ms"], 250);

        let back: Step = serde_json::from_value(json!({
            "type": "state-change",
            "device": "n1.1",
            "state": {"on": true}
        }))
        .unwrap();
        assert!(matches!(back, Step::StateChange { .. }));
    }
}
