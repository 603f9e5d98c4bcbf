//! The provisioning steps, in suite order.
//!
//! Each step reads what earlier steps wrote to [`ProvisionContext::state`],
//! calls its collaborators, writes its own results back and registers a
//! cleanup action for every resource it creates.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::info;

use crate::step::{Step, SubTest};
use crate::teardown::Teardown;

use super::actions::{CollectJournalLogs, ReleaseWorker, RemoveApplication, RemoveSshKey};
use super::error::{ProvisionError, ServiceResultExt, WaitResultExt};
use super::services::{ApplicationSpec, NetworkSettings, PreloadOptions, ServiceError};
use super::ProvisionContext;

type Registry = Teardown<ProvisionContext, ProvisionError>;

/// Command whose output must match the short device uuid.
pub const HOSTNAME_COMMAND: &str = "cat /etc/hostname";

/// Length of the uuid prefix used as the device hostname.
pub const HOSTNAME_LEN: usize = 7;

/// Log into the cloud.
pub struct Login;

/// Input for [`Login`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoginInput {
    /// API token.
    pub api_key: String,
}

#[async_trait::async_trait]
impl Step<ProvisionContext, ProvisionError> for Login {
    type Input = LoginInput;

    async fn execute(
        ctx: &mut ProvisionContext,
        _teardown: &mut Registry,
        input: &Self::Input,
    ) -> Result<(), ProvisionError> {
        info!("logging into the cloud");
        ctx.services
            .cloud
            .login(&input.api_key)
            .await
            .during("cloud.login")
    }
}

/// Create the run's application.
pub struct CreateApplication;

#[async_trait::async_trait]
impl Step<ProvisionContext, ProvisionError> for CreateApplication {
    type Input = ApplicationSpec;

    async fn execute(
        ctx: &mut ProvisionContext,
        teardown: &mut Registry,
        input: &Self::Input,
    ) -> Result<(), ProvisionError> {
        info!(application = input.name.as_str(), "creating application");
        ctx.state.set_at("balena.application", input.name.as_str());
        ctx.state
            .set_at("balena.organization", input.organization.as_str());

        ctx.services
            .cloud
            .create_application(input)
            .await
            .during("cloud.create_application")?;

        teardown.register(
            "remove application",
            RemoveApplication {
                name: input.name.clone(),
            },
        );
        Ok(())
    }
}

/// Clone the release repository and push it to the application.
pub struct PushRelease;

/// Input for [`PushRelease`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PushReleaseInput {
    /// Git URL of the release source.
    pub repository: String,
    /// Where the source is checked out.
    pub checkout_dir: PathBuf,
}

#[async_trait::async_trait]
impl Step<ProvisionContext, ProvisionError> for PushRelease {
    type Input = PushReleaseInput;

    async fn execute(
        ctx: &mut ProvisionContext,
        _teardown: &mut Registry,
        input: &Self::Input,
    ) -> Result<(), ProvisionError> {
        let application: String = ctx.state.require("balena.application")?;

        info!(repository = input.repository.as_str(), "cloning release repository");
        ctx.services
            .cli
            .clone_repository(&input.repository, &input.checkout_dir)
            .await
            .during("cli.clone_repository")?;
        ctx.state
            .set_at("app_path", input.checkout_dir.display().to_string());

        info!(application = application.as_str(), "pushing release");
        let commit = ctx
            .services
            .cloud
            .push_release(&application, &input.checkout_dir)
            .await
            .during("cloud.push_release")?;
        ctx.state.set_at("balena.initial_commit", commit);
        Ok(())
    }
}

/// Generate an SSH key pair and upload the public half.
pub struct CreateSshKey;

/// Input for [`CreateSshKey`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateSshKeyInput {
    /// Label of the uploaded key.
    pub label: String,
    /// Where the private key is written.
    pub key_path: PathBuf,
}

#[async_trait::async_trait]
impl Step<ProvisionContext, ProvisionError> for CreateSshKey {
    type Input = CreateSshKeyInput;

    async fn execute(
        ctx: &mut ProvisionContext,
        teardown: &mut Registry,
        input: &Self::Input,
    ) -> Result<(), ProvisionError> {
        let public_key = ctx
            .services
            .cli
            .generate_ssh_key(&input.key_path)
            .await
            .during("cli.generate_ssh_key")?;
        ctx.state
            .set_at("ssh_key_path", input.key_path.display().to_string());

        ctx.services
            .cloud
            .create_ssh_key(&input.label, &public_key)
            .await
            .during("cloud.create_ssh_key")?;
        ctx.state.set_at("balena.ssh_key.label", input.label.as_str());

        teardown.register(
            "remove ssh key",
            RemoveSshKey {
                label: input.label.clone(),
            },
        );
        Ok(())
    }
}

/// Pick the device identity.
pub struct GenerateUuid;

#[async_trait::async_trait]
impl Step<ProvisionContext, ProvisionError> for GenerateUuid {
    type Input = ();

    async fn execute(
        ctx: &mut ProvisionContext,
        _teardown: &mut Registry,
        _input: &(),
    ) -> Result<(), ProvisionError> {
        let uuid = ctx.services.cloud.generate_device_uuid();
        info!(uuid = uuid.as_str(), "device uuid generated");
        ctx.state.set_at("balena.uuid", uuid);
        Ok(())
    }
}

/// Fetch the base OS image and read its version.
pub struct FetchOs;

/// Input for [`FetchOs`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchOsInput {
    /// Device type slug.
    pub device_type: String,
    /// Network baked into the image.
    pub network: NetworkSettings,
}

#[async_trait::async_trait]
impl Step<ProvisionContext, ProvisionError> for FetchOs {
    type Input = FetchOsInput;

    async fn execute(
        ctx: &mut ProvisionContext,
        _teardown: &mut Registry,
        input: &Self::Input,
    ) -> Result<(), ProvisionError> {
        ctx.services
            .image
            .fetch(&input.device_type, &input.network)
            .await
            .during("image.fetch")?;
        let release = ctx
            .services
            .image
            .read_os_release()
            .await
            .during("image.read_os_release")?;

        info!(version = release.version.as_str(), "os image fetched");
        ctx.state.set_at("os.version", release.version);
        Ok(())
    }
}

/// Register the device and write its credentials into the image.
pub struct RegisterDevice;

/// Input for [`RegisterDevice`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterDeviceInput {
    /// Pause between registering and reading the device id back.
    pub settle_ms: u64,
}

#[async_trait::async_trait]
impl Step<ProvisionContext, ProvisionError> for RegisterDevice {
    type Input = RegisterDeviceInput;

    async fn execute(
        ctx: &mut ProvisionContext,
        teardown: &mut Registry,
        input: &Self::Input,
    ) -> Result<(), ProvisionError> {
        let application: String = ctx.state.require("balena.application")?;
        let uuid: String = ctx.state.require("balena.uuid")?;
        let version: String = ctx.state.require("os.version")?;
        let cloud = &ctx.services.cloud;

        let mut config = cloud
            .device_config(&application, &version)
            .await
            .during("cloud.device_config")?;

        let registration = cloud
            .register_device(&application, &uuid)
            .await
            .during("cloud.register_device")?;

        tokio::time::sleep(Duration::from_millis(input.settle_ms)).await;
        let device_id = cloud.device_id(&uuid).await.during("cloud.device_id")?;

        let Value::Object(fields) = &mut config else {
            return Err(ProvisionError::Assertion(
                "device config is not a JSON object".to_owned(),
            ));
        };
        fields.insert("uuid".to_owned(), Value::from(uuid.as_str()));
        fields.insert("deviceApiKey".to_owned(), Value::from(registration.api_key));
        fields.insert("deviceId".to_owned(), Value::from(device_id));

        ctx.services
            .image
            .add_cloud_config(config)
            .await
            .during("image.add_cloud_config")?;
        ctx.state.set_at("balena.device_id", device_id);

        teardown.register("worker teardown", ReleaseWorker);
        Ok(())
    }
}

/// Build the final image and preload the pushed release, pinned.
pub struct PreloadImage;

#[async_trait::async_trait]
impl Step<ProvisionContext, ProvisionError> for PreloadImage {
    type Input = ();

    async fn execute(
        ctx: &mut ProvisionContext,
        _teardown: &mut Registry,
        _input: &(),
    ) -> Result<(), ProvisionError> {
        let options = PreloadOptions {
            app: ctx.state.require("balena.application")?,
            commit: ctx.state.require("balena.initial_commit")?,
            pin: true,
        };

        let image_path = ctx
            .services
            .image
            .configure()
            .await
            .during("image.configure")?;
        ctx.state
            .set_at("os.image_path", image_path.display().to_string());

        info!(image = %image_path.display(), commit = options.commit.as_str(), "preloading image");
        ctx.services
            .cli
            .preload(&image_path, &options)
            .await
            .during("cli.preload")
    }
}

/// Configure the worker's network and arrange for journal capture.
pub struct PrepareWorker;

/// Input for [`PrepareWorker`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrepareWorkerInput {
    /// Network offered to the device.
    pub network: NetworkSettings,
    /// Where the captured journal is written.
    pub journal_path: PathBuf,
}

#[async_trait::async_trait]
impl Step<ProvisionContext, ProvisionError> for PrepareWorker {
    type Input = PrepareWorkerInput;

    async fn execute(
        ctx: &mut ProvisionContext,
        teardown: &mut Registry,
        input: &Self::Input,
    ) -> Result<(), ProvisionError> {
        info!("setting up worker");
        ctx.services
            .worker
            .network(&input.network)
            .await
            .during("worker.network")?;

        teardown.register(
            "collect journal logs",
            CollectJournalLogs {
                path: input.journal_path.clone(),
            },
        );
        Ok(())
    }
}

/// Power cycle the device around flashing the image.
pub struct FlashDevice;

#[async_trait::async_trait]
impl Step<ProvisionContext, ProvisionError> for FlashDevice {
    type Input = ();

    async fn execute(
        ctx: &mut ProvisionContext,
        _teardown: &mut Registry,
        _input: &(),
    ) -> Result<(), ProvisionError> {
        let image_path = PathBuf::from(ctx.state.require::<String>("os.image_path")?);
        let worker = &ctx.services.worker;

        worker.power_off().await.during("worker.power_off")?;
        worker.flash(&image_path).await.during("worker.flash")?;
        worker.power_on().await.during("worker.power_on")?;

        let link = worker.link().await.during("worker.link")?;
        ctx.state.set_at("link", link);
        Ok(())
    }
}

/// Wait for the device to report online. A failed status check ends the wait.
pub struct WaitOnline;

#[async_trait::async_trait]
impl Step<ProvisionContext, ProvisionError> for WaitOnline {
    type Input = ();

    async fn execute(
        ctx: &mut ProvisionContext,
        _teardown: &mut Registry,
        _input: &(),
    ) -> Result<(), ProvisionError> {
        let uuid: String = ctx.state.require("balena.uuid")?;
        let cloud = &*ctx.services.cloud;
        let uuid = uuid.as_str();

        info!("waiting for device to be reachable");
        let attempts = ctx
            .poller
            .wait_until(move || async move { cloud.is_online(uuid).await })
            .await
            .waiting_for("device online")?;

        info!(attempts, "device is online and provisioned");
        Ok(())
    }
}

/// Wait until the host OS answers with the expected hostname. Failed
/// attempts are retried until the wait times out.
pub struct WaitHostname;

#[async_trait::async_trait]
impl Step<ProvisionContext, ProvisionError> for WaitHostname {
    type Input = ();

    async fn execute(
        ctx: &mut ProvisionContext,
        _teardown: &mut Registry,
        _input: &(),
    ) -> Result<(), ProvisionError> {
        let uuid: String = ctx.state.require("balena.uuid")?;
        let expected: String = uuid.chars().take(HOSTNAME_LEN).collect();
        let cloud = &*ctx.services.cloud;
        let (uuid, expected) = (uuid.as_str(), expected.as_str());

        let options = ctx.poller.options().tolerate_errors();
        ctx.poller
            .wait_until_with(options, move || async move {
                let hostname = cloud.execute_in_host_os(HOSTNAME_COMMAND, uuid).await?;
                Ok::<_, ServiceError>(hostname.trim() == expected)
            })
            .await
            .waiting_for("device hostname")?;
        Ok(())
    }
}

/// Unpin the device from the preloaded release.
pub struct UnpinRelease;

#[async_trait::async_trait]
impl Step<ProvisionContext, ProvisionError> for UnpinRelease {
    type Input = ();

    async fn execute(
        ctx: &mut ProvisionContext,
        _teardown: &mut Registry,
        _input: &(),
    ) -> Result<(), ProvisionError> {
        let uuid: String = ctx.state.require("balena.uuid")?;
        let cloud = &*ctx.services.cloud;
        let uuid = uuid.as_str();

        info!("unpinning device from release");
        let options = ctx.poller.options().tolerate_errors();
        ctx.poller
            .wait_until_with(options, move || async move {
                cloud.track_application_release(uuid).await?;
                cloud.is_tracking_application_release(uuid).await
            })
            .await
            .waiting_for("device tracking latest release")?;
        Ok(())
    }
}

/// Checks that the device runs the release preloaded into its image.
#[derive(Debug, Clone, Copy, Default)]
pub struct PreloadedReleaseRunning;

#[async_trait::async_trait]
impl SubTest<ProvisionContext, ProvisionError> for PreloadedReleaseRunning {
    fn title(&self) -> &str {
        "preloaded release running"
    }

    async fn run(&self, ctx: &mut ProvisionContext) -> Result<(), ProvisionError> {
        let initial: String = ctx.state.require("balena.initial_commit")?;
        let uuid: String = ctx.state.require("balena.uuid")?;
        let cloud = &*ctx.services.cloud;
        let uuid = uuid.as_str();

        let options = ctx.poller.options().tolerate_errors();
        ctx.poller
            .wait_until_with(options, move || async move {
                Ok::<_, ServiceError>(cloud.device_commit(uuid).await?.is_some())
            })
            .await
            .waiting_for("device to report a commit")?;

        let running = cloud
            .device_commit(uuid)
            .await
            .during("cloud.device_commit")?;
        match running {
            Some(commit) if commit == initial => Ok(()),
            other => Err(ProvisionError::Assertion(format!(
                "device runs {other:?}, expected preloaded commit {initial}"
            ))),
        }
    }
}
