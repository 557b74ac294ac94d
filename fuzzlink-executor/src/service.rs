//! Executor service: dial the host and serve one session.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tracing::info;

use fuzzlink_core::{ExecutorConnection, FuzzlinkError};

use crate::config::ExecutorConfig;
use crate::features::{FeatureProbe, StaticProbe};
use crate::runner::{ProcessRunner, ProgramRunner};
use crate::session::{ExecutorSession, ExecutorSettings};

pub struct ExecutorService {
    config: ExecutorConfig,
    running: Arc<AtomicBool>,
}

impl ExecutorService {
    pub fn new(config: ExecutorConfig) -> Self {
        Self {
            config,
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Handle that stops the service when set to `false`.
    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.running)
    }

    /// Connect with the stock process runner and the configured features.
    pub async fn run(&self) -> Result<u64, FuzzlinkError> {
        let probe = StaticProbe::new(self.config.supported_features()?);
        let runner = Arc::new(ProcessRunner::new(&self.config.runner.interpreter));
        self.run_with(&probe, runner).await
    }

    /// Connect and serve until the host closes the session or the service
    /// is stopped. Returns the number of programs executed.
    pub async fn run_with(
        &self,
        probe: &dyn FeatureProbe,
        runner: Arc<dyn ProgramRunner>,
    ) -> Result<u64, FuzzlinkError> {
        self.running.store(true, Ordering::SeqCst);
        let server = self.config.server();
        info!("connecting to {server}");
        let limit = self.config.connect_timeout();
        let conn = tokio::time::timeout(limit, ExecutorConnection::connect(server.to_string()))
            .await
            .map_err(|_| FuzzlinkError::Timeout(limit))??;

        let settings = ExecutorSettings::from_config(&self.config);
        let session = ExecutorSession::establish(conn, &settings, probe, runner).await?;

        tokio::select! {
            result = session.run() => result,
            _ = wait_for_stop(&self.running) => {
                info!("stopped");
                Ok(0)
            }
        }
    }
}

async fn wait_for_stop(running: &Arc<AtomicBool>) {
    loop {
        if !running.load(Ordering::SeqCst) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}
