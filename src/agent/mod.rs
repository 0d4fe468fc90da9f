//! Agent: dials every configured gateway and serves the requests tunneled back.
//!
//! Each target gets its own [`TargetPool`], which keeps `pool_idle_size`
//! connections ready (never more than `pool_max_size`), and each connection
//! runs its own [`Executor`] loop.

pub mod executor;
pub mod target;

use std::sync::{Arc, Mutex, PoisonError};

use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::AgentConfig;

pub use executor::Executor;
pub use target::{Connector, TargetPool, WsConnector};

/// Multi-target supervisor.
pub struct Agent {
    config: Arc<AgentConfig>,
    targets: Vec<Arc<TargetPool>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Agent {
    pub fn new(config: AgentConfig, connector: Arc<dyn Connector>) -> Self {
        let config = Arc::new(config);
        let executor = Executor::new(&config);
        let targets = config
            .targets
            .iter()
            .map(|target| {
                TargetPool::new(
                    target.clone(),
                    Arc::clone(&config),
                    Arc::clone(&connector),
                    executor.clone(),
                )
            })
            .collect();
        Self {
            config,
            targets,
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn targets(&self) -> &[Arc<TargetPool>] {
        &self.targets
    }

    /// Start one maintenance loop per target.
    pub fn start(&self) {
        info!(
            name = %self.config.name,
            targets = self.targets.len(),
            idle = self.config.pool_idle_size,
            max = self.config.pool_max_size,
            "Starting agent"
        );
        let mut tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
        for target in &self.targets {
            tasks.push(tokio::spawn(Arc::clone(target).start()));
        }
    }

    /// Stop every loop and close every connection.
    pub async fn shutdown(&self) {
        for target in &self.targets {
            target.shutdown().await;
        }
        let tasks = std::mem::take(&mut *self.tasks.lock().unwrap_or_else(PoisonError::into_inner));
        for task in tasks {
            if let Err(e) = task.await {
                warn!("Target loop ended abnormally: {e}");
            }
        }
    }
}
