//! Device provisioning suite.
//!
//! Creates a cloud application, pushes a release, builds and preloads an OS
//! image, flashes it onto hardware through a worker and waits for the device
//! to come up running the preloaded release. Every resource created along
//! the way is released in reverse order when the run ends.
//!
//! ```no_run
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! use devrig::config::SuiteConfig;
//! use devrig::provision::{self, memory::MemoryLab};
//! use tokio_util::sync::CancellationToken;
//!
//! let config = SuiteConfig::load("devrig.toml").await?;
//! let lab = MemoryLab::new();
//! let run = provision::prepare(&config, lab.services(), CancellationToken::new()).await?;
//! let result = run.start().await;
//! # Ok(())
//! # }
//! ```

pub mod actions;
pub mod error;
pub mod memory;
pub mod services;
pub mod steps;

use tokio_util::sync::CancellationToken;

use crate::config::SuiteConfig;
use crate::context::Context;
use crate::execution::{Execution, New};
use crate::poll::Poller;

pub use error::ProvisionError;
pub use services::{
    ApplicationSpec, Archiver, CliTool, CloudService, ImageBuilder, NetworkSettings, ServiceError,
    Services, Worker,
};
pub use steps::{
    CreateApplication, CreateSshKey, CreateSshKeyInput, FetchOs, FetchOsInput, FlashDevice,
    GenerateUuid, Login, LoginInput, PrepareWorker, PrepareWorkerInput, PreloadImage,
    PreloadedReleaseRunning, PushRelease, PushReleaseInput, RegisterDevice, RegisterDeviceInput,
    UnpinRelease, WaitHostname, WaitOnline,
};

/// State and collaborators shared by the provisioning steps.
#[derive(Debug)]
pub struct ProvisionContext {
    /// Values written by the steps (`balena.uuid`, `os.image_path`, `link`, ...).
    pub state: Context,
    /// External collaborators.
    pub services: Services,
    /// Poller for eventually-consistent device state.
    pub poller: Poller,
}

impl ProvisionContext {
    /// Create a context with empty state.
    pub fn new(services: Services, poller: Poller) -> Self {
        Self {
            state: Context::new(),
            services,
            poller,
        }
    }
}

crate::workflow! {
    ProvisionSuite<ProvisionContext, ProvisionError> {
        login: Login,
        create_application: CreateApplication,
        push_release: PushRelease,
        create_ssh_key: CreateSshKey,
        generate_uuid: GenerateUuid,
        fetch_os: FetchOs,
        register_device: RegisterDevice,
        preload_image: PreloadImage,
        prepare_worker: PrepareWorker,
        flash_device: FlashDevice,
        wait_online: WaitOnline,
        wait_hostname: WaitHostname,
        unpin_release: UnpinRelease,
    }
}

/// A provisioning run ready to start.
pub type ProvisionRun = Execution<ProvisionContext, ProvisionError, ProvisionSuiteSteps, New>;

impl ProvisionSuiteInputs {
    /// Derive every step's input from the suite configuration.
    ///
    /// Scratch files live under `general.tmpdir`: the release checkout in
    /// `app/`, the SSH key at `id` and the captured journal at `journal.log`.
    pub fn from_config(config: &SuiteConfig) -> Self {
        let id = &config.suite.id;
        let tmpdir = &config.general.tmpdir;
        let network = NetworkSettings::resolve(id, config.network.wired, config.network.wireless);

        Self {
            login: LoginInput {
                api_key: config.balena.api_key.clone(),
            },
            create_application: ApplicationSpec {
                name: id.clone(),
                device_type: config.suite.device_type.clone(),
                organization: config.balena.organization.clone(),
            },
            push_release: PushReleaseInput {
                repository: config.suite.release_repository.clone(),
                checkout_dir: tmpdir.join("app"),
            },
            create_ssh_key: CreateSshKeyInput {
                label: id.clone(),
                key_path: tmpdir.join("id"),
            },
            generate_uuid: (),
            fetch_os: FetchOsInput {
                device_type: config.suite.device_type.clone(),
                network: network.clone(),
            },
            register_device: RegisterDeviceInput {
                settle_ms: config.suite.register_settle_ms,
            },
            preload_image: (),
            prepare_worker: PrepareWorkerInput {
                network,
                journal_path: tmpdir.join("journal.log"),
            },
            flash_device: (),
            wait_online: (),
            wait_hostname: (),
            unpin_release: (),
        }
    }
}

/// Build a provisioning run from configuration.
///
/// Creates the scratch directory, wires `cancel` into both the run and its
/// poller, applies the teardown and run limits and adds the
/// [`PreloadedReleaseRunning`] sub-test.
pub async fn prepare(
    config: &SuiteConfig,
    services: Services,
    cancel: CancellationToken,
) -> Result<ProvisionRun, ProvisionError> {
    tokio::fs::create_dir_all(&config.general.tmpdir).await?;

    let poller = Poller::new(config.poll.options()).with_cancellation(cancel.clone());
    let ctx = ProvisionContext::new(services, poller);

    let mut run = ProvisionSuite::new(ProvisionSuiteInputs::from_config(config))
        .build(ctx)
        .with_cancellation(cancel)
        .with_subtest(PreloadedReleaseRunning);
    if let Some(limit) = config.teardown.action_timeout() {
        run = run.with_teardown_timeout(limit);
    }
    if let Some(limit) = config.run.deadline() {
        run = run.with_deadline(limit);
    }

    tracing::info!(
        suite = config.suite.id.as_str(),
        device_type = config.suite.device_type.as_str(),
        steps = ProvisionSuite::STEPS.len(),
        "provisioning run prepared"
    );
    Ok(run)
}
