//! Shared application state passed to all handlers.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use hearth_domain::{DeviceId, HubConfig, State};
use hearth_protocol::{types, Message, StateChange};

use crate::ca::CertificateAuthority;
use crate::logic::{ActionRunner, CommandSink, LogicEngine, Progress, RuleSet};
use crate::persist;
use crate::scheduler::{parse_tz, Scheduler, TaskList};
use crate::sessions::SessionRegistry;
use crate::store::Store;

/// Where action steps land: device commands are relayed to the owning
/// node's session, notifications are broadcast to subscribed guis.
struct SessionSink {
    sessions: Arc<SessionRegistry>,
}

#[async_trait]
impl CommandSink for SessionSink {
    async fn state_change(&self, device: DeviceId, state: State) {
        let node_uuid = match uuid::Uuid::parse_str(&device.node) {
            Ok(u) => u,
            Err(_) => {
                tracing::warn!(device = %device, "action targets a non-uuid node");
                return;
            }
        };
        let mut change = StateChange::new();
        change.insert(device.clone(), state);
        let msg = match Message::new(types::STATE_CHANGE, &change) {
            Ok(m) => m,
            Err(e) => {
                tracing::warn!(device = %device, error = %e, "failed to encode state-change");
                return;
            }
        };
        if let Err(e) = self.sessions.send_to_node(&node_uuid, &msg).await {
            tracing::warn!(device = %device, error = %e, "action state-change not delivered");
        }
    }

    async fn notify(&self, message: &str) {
        tracing::info!(message, "notification");
        if let Ok(msg) = Message::new(types::NOTIFICATION, &message) {
            self.sessions.broadcast(&msg);
        }
    }
}

/// Shared application state. Cheap to clone; all fields are Arcs.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<HubConfig>,
    pub data_dir: Arc<PathBuf>,
    pub ca: Arc<CertificateAuthority>,
    pub store: Arc<Store>,
    pub sessions: Arc<SessionRegistry>,
    pub logic: Arc<LogicEngine>,
    pub scheduler: Arc<Scheduler>,
    /// Cancelling this stops every background activity the hub owns.
    pub shutdown: CancellationToken,
}

impl AppState {
    /// Load (or create) everything from the data directory:
    /// `config.json`, the CA material, persisted nodes, saved states,
    /// rules and the schedule.
    pub fn load(data_dir: &Path) -> anyhow::Result<Self> {
        let config = HubConfig::load_or_create(data_dir)?;
        Self::with_config(data_dir, config)
    }

    /// Like [`AppState::load`] but with an explicit config; tests use
    /// this to inject ports bound on demand.
    pub fn with_config(data_dir: &Path, config: HubConfig) -> anyhow::Result<Self> {
        let hosts = server_cert_hosts(&config);
        let ca = Arc::new(CertificateAuthority::load_or_create(
            data_dir,
            &config.name,
            &hosts,
        )?);
        let store = Arc::new(Store::load(data_dir)?);
        let sessions = Arc::new(SessionRegistry::new());

        let ruleset: RuleSet = persist::load_json(&data_dir.join(persist::RULES_FILE))?;
        let (runner, progress) = ActionRunner::new(Arc::new(SessionSink {
            sessions: Arc::clone(&sessions),
        }));
        let logic = Arc::new(LogicEngine::new(ruleset, runner));
        tokio::spawn(log_progress(progress));

        let tasks: TaskList = persist::load_json(&data_dir.join(persist::SCHEDULE_FILE))?;
        let scheduler = Arc::new(Scheduler::new(tasks, parse_tz(&config.timezone)));

        Ok(Self {
            config: Arc::new(config),
            data_dir: Arc::new(data_dir.to_path_buf()),
            ca,
            store,
            sessions,
            logic,
            scheduler,
            shutdown: CancellationToken::new(),
        })
    }

    pub fn save_rules(&self) -> hearth_domain::Result<()> {
        persist::save_json(
            &self.data_dir.join(persist::RULES_FILE),
            &self.logic.ruleset(),
        )
    }

    pub fn save_schedule(&self) -> hearth_domain::Result<()> {
        persist::save_json(
            &self.data_dir.join(persist::SCHEDULE_FILE),
            &self.scheduler.tasks(),
        )
    }
}

/// SAN list for the hub's serving certificate.
fn server_cert_hosts(config: &HubConfig) -> Vec<String> {
    let mut hosts = vec!["localhost".to_string(), "127.0.0.1".to_string()];
    if !config.host.is_empty() && !hosts.contains(&config.host) {
        hosts.push(config.host.clone());
    }
    hosts
}

async fn log_progress(mut progress: tokio::sync::mpsc::Receiver<Progress>) {
    while let Some(p) = progress.recv().await {
        tracing::debug!(action = %p.action, step = p.step, total = p.total, "action progress");
    }
}
