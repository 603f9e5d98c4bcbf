//! In-memory collaborators for tests and dry runs.
//!
//! One [`MemoryLab`] plays every collaborator. It records each call in a
//! journal (`"cloud.login"`, `"worker.flash"`, ...) and can be told to fail
//! specific operations, either always or for the next few calls.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::{json, Value};
use uuid::Uuid;

use super::actions::JOURNAL_COMMAND;
use super::services::{
    ApplicationSpec, Archiver, CliTool, CloudService, DeviceRegistration, ImageBuilder,
    NetworkSettings, OsRelease, PreloadOptions, ServiceError, Services, Worker,
};
use super::steps::{HOSTNAME_COMMAND, HOSTNAME_LEN};

/// OS version reported by fetched images.
pub const OS_VERSION: &str = "2.113.18";

#[derive(Debug, Clone)]
struct Injected {
    remaining: Option<u32>,
    error: ServiceError,
}

#[derive(Debug, Clone, Default)]
struct Device {
    id: u64,
    application: String,
    tracking: bool,
    commit: Option<String>,
}

#[derive(Debug, Default)]
struct LabState {
    journal: Vec<String>,
    failures: HashMap<String, Injected>,
    applications: HashSet<String>,
    ssh_keys: HashMap<String, String>,
    releases: HashMap<String, String>,
    devices: HashMap<String, Device>,
    next_device_id: u64,
    online_after: u32,
    online_checks: u32,
    image_config: Option<Value>,
    preloaded: Option<PreloadOptions>,
    network: Option<NetworkSettings>,
    powered: bool,
    flashed: Option<PathBuf>,
    worker_released: bool,
    archived: Vec<(PathBuf, String)>,
}

/// Shared fake of every collaborator.
#[derive(Debug, Default)]
pub struct MemoryLab {
    state: Mutex<LabState>,
}

impl MemoryLab {
    /// Create a lab where every call succeeds.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Bundle this lab as the collaborators of a run.
    pub fn services(self: &Arc<Self>) -> Services {
        Services {
            cloud: self.clone(),
            image: self.clone(),
            cli: self.clone(),
            worker: self.clone(),
            archiver: self.clone(),
        }
    }

    /// Make every call to `operation` fail with `error`.
    pub fn fail_on(&self, operation: &str, error: ServiceError) {
        self.state.lock().failures.insert(
            operation.to_owned(),
            Injected {
                remaining: None,
                error,
            },
        );
    }

    /// Make the next `times` calls to `operation` fail with `error`.
    pub fn fail_next(&self, operation: &str, times: u32, error: ServiceError) {
        self.state.lock().failures.insert(
            operation.to_owned(),
            Injected {
                remaining: Some(times),
                error,
            },
        );
    }

    /// Report the device offline for the first `checks` status checks.
    pub fn online_after(&self, checks: u32) {
        self.state.lock().online_after = checks;
    }

    /// Operations called so far, in order.
    pub fn journal(&self) -> Vec<String> {
        self.state.lock().journal.clone()
    }

    /// Number of calls to `operation`.
    pub fn calls(&self, operation: &str) -> usize {
        self.state.lock().journal.iter().filter(|op| *op == operation).count()
    }

    /// Applications that currently exist.
    pub fn applications(&self) -> Vec<String> {
        let mut apps: Vec<_> = self.state.lock().applications.iter().cloned().collect();
        apps.sort();
        apps
    }

    /// Labels of SSH keys that currently exist.
    pub fn ssh_keys(&self) -> Vec<String> {
        let mut labels: Vec<_> = self.state.lock().ssh_keys.keys().cloned().collect();
        labels.sort();
        labels
    }

    /// Whether the worker has been released.
    pub fn worker_released(&self) -> bool {
        self.state.lock().worker_released
    }

    /// Archived files and their contents when archived.
    pub fn archived(&self) -> Vec<(PathBuf, String)> {
        self.state.lock().archived.clone()
    }

    /// Configuration merged into the image.
    pub fn image_config(&self) -> Option<Value> {
        self.state.lock().image_config.clone()
    }

    /// What was preloaded into the image.
    pub fn preloaded(&self) -> Option<PreloadOptions> {
        self.state.lock().preloaded.clone()
    }

    /// Network configured on the worker.
    pub fn network(&self) -> Option<NetworkSettings> {
        self.state.lock().network.clone()
    }

    /// Override the commit a device reports.
    pub fn set_device_commit(&self, uuid: &str, commit: &str) {
        if let Some(device) = self.state.lock().devices.get_mut(uuid) {
            device.commit = Some(commit.to_owned());
        }
    }

    /// Record the call and return the injected failure, if any.
    fn check(&self, operation: &str) -> Result<(), ServiceError> {
        self.enter(operation).map(drop)
    }

    /// Like [`MemoryLab::check`], but keep the lab locked for the caller.
    fn enter(&self, operation: &str) -> Result<parking_lot::MutexGuard<'_, LabState>, ServiceError> {
        let mut state = self.state.lock();
        state.journal.push(operation.to_owned());

        let failure = match state.failures.get_mut(operation) {
            None => None,
            Some(injected) => match injected.remaining {
                None => Some(injected.error.clone()),
                Some(0) => None,
                Some(n) => {
                    injected.remaining = Some(n - 1);
                    Some(injected.error.clone())
                }
            },
        };
        match failure {
            Some(error) => Err(error),
            None => Ok(state),
        }
    }

    fn host_os_output(state: &LabState, command: &str, uuid: &str) -> Result<String, ServiceError> {
        if !state.devices.contains_key(uuid) || state.flashed.is_none() || !state.powered {
            return Err(ServiceError::Unavailable(format!("device {uuid} unreachable")));
        }
        match command {
            HOSTNAME_COMMAND => {
                let hostname: String = uuid.chars().take(HOSTNAME_LEN).collect();
                Ok(format!("{hostname}\n"))
            }
            JOURNAL_COMMAND => Ok(format!("-- Journal begins --\n{uuid} booted\n")),
            other => Err(ServiceError::Rejected(format!("unsupported command: {other}"))),
        }
    }
}

#[async_trait::async_trait]
impl CloudService for MemoryLab {
    async fn login(&self, api_key: &str) -> Result<(), ServiceError> {
        self.check("cloud.login")?;
        if api_key.is_empty() {
            return Err(ServiceError::Rejected("empty api key".to_owned()));
        }
        Ok(())
    }

    async fn create_application(&self, spec: &ApplicationSpec) -> Result<(), ServiceError> {
        let mut state = self.enter("cloud.create_application")?;
        if !state.applications.insert(spec.name.clone()) {
            return Err(ServiceError::Rejected(format!(
                "application {} already exists",
                spec.name
            )));
        }
        Ok(())
    }

    async fn remove_application(&self, name: &str) -> Result<(), ServiceError> {
        let mut state = self.enter("cloud.remove_application")?;
        if !state.applications.remove(name) {
            return Err(ServiceError::NotFound(format!("application {name}")));
        }
        state.devices.retain(|_, device| device.application != name);
        Ok(())
    }

    async fn push_release(&self, application: &str, _source: &Path) -> Result<String, ServiceError> {
        let mut state = self.enter("cloud.push_release")?;
        if !state.applications.contains(application) {
            return Err(ServiceError::NotFound(format!("application {application}")));
        }
        let commit = Uuid::new_v4().simple().to_string();
        state.releases.insert(application.to_owned(), commit.clone());
        Ok(commit)
    }

    async fn create_ssh_key(&self, label: &str, public_key: &str) -> Result<(), ServiceError> {
        let mut state = self.enter("cloud.create_ssh_key")?;
        state.ssh_keys.insert(label.to_owned(), public_key.to_owned());
        Ok(())
    }

    async fn remove_ssh_key(&self, label: &str) -> Result<(), ServiceError> {
        let mut state = self.enter("cloud.remove_ssh_key")?;
        state
            .ssh_keys
            .remove(label)
            .map(|_| ())
            .ok_or_else(|| ServiceError::NotFound(format!("ssh key {label}")))
    }

    fn generate_device_uuid(&self) -> String {
        self.state.lock().journal.push("cloud.generate_device_uuid".to_owned());
        Uuid::new_v4().simple().to_string()
    }

    async fn device_config(
        &self,
        application: &str,
        os_version: &str,
    ) -> Result<Value, ServiceError> {
        self.check("cloud.device_config")?;
        Ok(json!({
            "applicationName": application,
            "osVersion": os_version,
        }))
    }

    async fn register_device(
        &self,
        application: &str,
        uuid: &str,
    ) -> Result<DeviceRegistration, ServiceError> {
        let mut state = self.enter("cloud.register_device")?;
        if !state.applications.contains(application) {
            return Err(ServiceError::NotFound(format!("application {application}")));
        }
        state.next_device_id += 1;
        let device = Device {
            id: state.next_device_id,
            application: application.to_owned(),
            ..Device::default()
        };
        state.devices.insert(uuid.to_owned(), device);
        Ok(DeviceRegistration {
            api_key: format!("device-key-{uuid}"),
        })
    }

    async fn device_id(&self, uuid: &str) -> Result<u64, ServiceError> {
        let state = self.enter("cloud.device_id")?;
        state
            .devices
            .get(uuid)
            .map(|device| device.id)
            .ok_or_else(|| ServiceError::NotFound(format!("device {uuid}")))
    }

    async fn is_online(&self, uuid: &str) -> Result<bool, ServiceError> {
        let mut state = self.enter("cloud.is_online")?;
        if !state.devices.contains_key(uuid) {
            return Err(ServiceError::NotFound(format!("device {uuid}")));
        }
        state.online_checks += 1;
        Ok(state.powered && state.flashed.is_some() && state.online_checks > state.online_after)
    }

    async fn execute_in_host_os(&self, command: &str, uuid: &str) -> Result<String, ServiceError> {
        let state = self.enter("cloud.execute_in_host_os")?;
        Self::host_os_output(&state, command, uuid)
    }

    async fn track_application_release(&self, uuid: &str) -> Result<(), ServiceError> {
        let mut state = self.enter("cloud.track_application_release")?;
        let device = state
            .devices
            .get_mut(uuid)
            .ok_or_else(|| ServiceError::NotFound(format!("device {uuid}")))?;
        device.tracking = true;
        Ok(())
    }

    async fn is_tracking_application_release(&self, uuid: &str) -> Result<bool, ServiceError> {
        let state = self.enter("cloud.is_tracking_application_release")?;
        state
            .devices
            .get(uuid)
            .map(|device| device.tracking)
            .ok_or_else(|| ServiceError::NotFound(format!("device {uuid}")))
    }

    async fn device_commit(&self, uuid: &str) -> Result<Option<String>, ServiceError> {
        let state = self.enter("cloud.device_commit")?;
        let device = state
            .devices
            .get(uuid)
            .ok_or_else(|| ServiceError::NotFound(format!("device {uuid}")))?;
        if device.commit.is_some() {
            return Ok(device.commit.clone());
        }
        // A device boots into whatever was preloaded.
        let booted = state.powered && state.flashed.is_some();
        Ok(state
            .preloaded
            .as_ref()
            .filter(|_| booted)
            .map(|preload| preload.commit.clone()))
    }
}

#[async_trait::async_trait]
impl ImageBuilder for MemoryLab {
    async fn fetch(
        &self,
        _device_type: &str,
        _network: &NetworkSettings,
    ) -> Result<(), ServiceError> {
        self.check("image.fetch")?;
        Ok(())
    }

    async fn read_os_release(&self) -> Result<OsRelease, ServiceError> {
        self.check("image.read_os_release")?;
        Ok(OsRelease {
            version: OS_VERSION.to_owned(),
        })
    }

    async fn add_cloud_config(&self, config: Value) -> Result<(), ServiceError> {
        let mut state = self.enter("image.add_cloud_config")?;
        state.image_config = Some(config);
        Ok(())
    }

    async fn configure(&self) -> Result<PathBuf, ServiceError> {
        self.check("image.configure")?;
        Ok(std::env::temp_dir().join("devrig-memory").join("balena.img"))
    }
}

#[async_trait::async_trait]
impl CliTool for MemoryLab {
    async fn clone_repository(&self, _url: &str, _dest: &Path) -> Result<(), ServiceError> {
        self.check("cli.clone_repository")?;
        Ok(())
    }

    async fn generate_ssh_key(&self, path: &Path) -> Result<String, ServiceError> {
        self.check("cli.generate_ssh_key")?;
        Ok(format!("ssh-ed25519 AAAA{} devrig", path.display()))
    }

    async fn preload(&self, _image: &Path, options: &PreloadOptions) -> Result<(), ServiceError> {
        let mut state = self.enter("cli.preload")?;
        state.preloaded = Some(options.clone());
        Ok(())
    }
}

#[async_trait::async_trait]
impl Worker for MemoryLab {
    async fn network(&self, settings: &NetworkSettings) -> Result<(), ServiceError> {
        let mut state = self.enter("worker.network")?;
        state.network = Some(settings.clone());
        Ok(())
    }

    async fn power_off(&self) -> Result<(), ServiceError> {
        let mut state = self.enter("worker.power_off")?;
        state.powered = false;
        Ok(())
    }

    async fn power_on(&self) -> Result<(), ServiceError> {
        let mut state = self.enter("worker.power_on")?;
        state.powered = true;
        Ok(())
    }

    async fn flash(&self, image: &Path) -> Result<(), ServiceError> {
        let mut state = self.enter("worker.flash")?;
        if state.powered {
            return Err(ServiceError::Rejected("device is powered".to_owned()));
        }
        state.flashed = Some(image.to_path_buf());
        Ok(())
    }

    async fn link(&self) -> Result<String, ServiceError> {
        let state = self.enter("worker.link")?;
        state
            .devices
            .keys()
            .next()
            .map(|uuid| format!("{uuid}.local"))
            .ok_or_else(|| ServiceError::NotFound("device link".to_owned()))
    }

    async fn execute_in_host_os(&self, command: &str, link: &str) -> Result<String, ServiceError> {
        let state = self.enter("worker.execute_in_host_os")?;
        let uuid = link.trim_end_matches(".local");
        Self::host_os_output(&state, command, uuid)
    }

    async fn teardown(&self) -> Result<(), ServiceError> {
        let mut state = self.enter("worker.teardown")?;
        state.worker_released = true;
        state.powered = false;
        Ok(())
    }
}

#[async_trait::async_trait]
impl Archiver for MemoryLab {
    async fn add(&self, path: &Path) -> Result<(), ServiceError> {
        self.check("archiver.add")?;
        let contents = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| ServiceError::Rejected(format!("{}: {e}", path.display())))?;
        self.state.lock().archived.push((path.to_path_buf(), contents));
        Ok(())
    }
}
