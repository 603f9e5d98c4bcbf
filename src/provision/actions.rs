//! Cleanup actions registered by the provisioning steps.

use std::path::PathBuf;

use tracing::{info, warn};

use crate::teardown::TeardownAction;

use super::error::{ProvisionError, ServiceResultExt};
use super::ProvisionContext;

/// Command used to capture the device journal.
pub const JOURNAL_COMMAND: &str = "journalctl -a --no-pager";

/// Delete the application created for the run.
#[derive(Debug, Clone)]
pub struct RemoveApplication {
    /// Application name.
    pub name: String,
}

#[async_trait::async_trait]
impl TeardownAction<ProvisionContext, ProvisionError> for RemoveApplication {
    async fn run(self: Box<Self>, ctx: &mut ProvisionContext) -> Result<(), ProvisionError> {
        info!(application = self.name.as_str(), "removing application");
        ctx.services
            .cloud
            .remove_application(&self.name)
            .await
            .during("cloud.remove_application")
    }
}

/// Delete the SSH key uploaded for the run.
#[derive(Debug, Clone)]
pub struct RemoveSshKey {
    /// Key label.
    pub label: String,
}

#[async_trait::async_trait]
impl TeardownAction<ProvisionContext, ProvisionError> for RemoveSshKey {
    async fn run(self: Box<Self>, ctx: &mut ProvisionContext) -> Result<(), ProvisionError> {
        ctx.services
            .cloud
            .remove_ssh_key(&self.label)
            .await
            .during("cloud.remove_ssh_key")
    }
}

/// Hand the hardware worker back.
#[derive(Debug, Clone, Default)]
pub struct ReleaseWorker;

#[async_trait::async_trait]
impl TeardownAction<ProvisionContext, ProvisionError> for ReleaseWorker {
    async fn run(self: Box<Self>, ctx: &mut ProvisionContext) -> Result<(), ProvisionError> {
        info!("worker teardown");
        ctx.services
            .worker
            .teardown()
            .await
            .during("worker.teardown")
    }
}

/// Capture the device journal into a file and archive it.
///
/// The device link is read at drain time. If it was never written, or the
/// command fails, an empty log is archived so the artifact always exists.
#[derive(Debug, Clone)]
pub struct CollectJournalLogs {
    /// Where the log is written before archiving.
    pub path: PathBuf,
}

#[async_trait::async_trait]
impl TeardownAction<ProvisionContext, ProvisionError> for CollectJournalLogs {
    async fn run(self: Box<Self>, ctx: &mut ProvisionContext) -> Result<(), ProvisionError> {
        info!(path = %self.path.display(), "retrieving journal logs");

        let logs = match ctx.state.require::<String>("link") {
            Ok(link) => match ctx
                .services
                .worker
                .execute_in_host_os(JOURNAL_COMMAND, &link)
                .await
            {
                Ok(logs) => logs,
                Err(e) => {
                    warn!(error = %e, "couldn't retrieve journal logs");
                    String::new()
                }
            },
            Err(e) => {
                warn!(error = %e, "device link unknown, archiving empty journal");
                String::new()
            }
        };

        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&self.path, logs).await?;

        ctx.services
            .archiver
            .add(&self.path)
            .await
            .during("archiver.add")
    }
}
