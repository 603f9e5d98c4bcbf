//! Collaborator contracts consumed by the provisioning steps.
//!
//! Nothing here talks to a network. Real deployments plug in clients for the
//! cloud API, the image builder, the CLI, the flashing worker and the
//! artifact archiver; tests use [`super::memory::MemoryLab`].

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Failure reported by a collaborator.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ServiceError {
    /// The collaborator refused the request.
    #[error("request rejected: {0}")]
    Rejected(String),

    /// The referenced entity does not exist.
    #[error("{0} not found")]
    NotFound(String),

    /// The collaborator could not be reached; a later attempt may succeed.
    #[error("temporarily unavailable: {0}")]
    Unavailable(String),
}

impl ServiceError {
    /// Returns `true` if retrying the same call may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}

/// Application to create in the cloud.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplicationSpec {
    /// Application name.
    pub name: String,
    /// Device type slug.
    pub device_type: String,
    /// Owning organization.
    pub organization: String,
}

/// Credentials returned when a device is registered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceRegistration {
    /// Device-scoped API key.
    pub api_key: String,
}

/// OS metadata read from a fetched image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OsRelease {
    /// OS version string.
    pub version: String,
}

/// Wired uplink settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WiredNetwork {
    /// NAT the device behind the worker.
    pub nat: bool,
}

/// Wireless access point settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WirelessNetwork {
    /// Access point name.
    pub ssid: String,
    /// Pre-shared key.
    pub psk: String,
    /// NAT the device behind the worker.
    pub nat: bool,
}

/// Network given to the device. Absent entries are not configured.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkSettings {
    /// Wired uplink.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wired: Option<WiredNetwork>,
    /// Wireless access point.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wireless: Option<WirelessNetwork>,
}

impl NetworkSettings {
    /// Build settings from the on/off switches; the wireless access point is
    /// named after `id`.
    pub fn resolve(id: &str, wired: bool, wireless: bool) -> Self {
        Self {
            wired: wired.then_some(WiredNetwork { nat: true }),
            wireless: wireless.then(|| WirelessNetwork {
                ssid: id.to_owned(),
                psk: format!("{id}_psk"),
                nat: true,
            }),
        }
    }
}

/// What to preload into an image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreloadOptions {
    /// Application name.
    pub app: String,
    /// Release commit.
    pub commit: String,
    /// Pin the device to this release.
    pub pin: bool,
}

/// Cloud API client.
#[async_trait::async_trait]
pub trait CloudService: Send + Sync {
    /// Authenticate with an API token.
    async fn login(&self, api_key: &str) -> Result<(), ServiceError>;
    /// Create an application.
    async fn create_application(&self, spec: &ApplicationSpec) -> Result<(), ServiceError>;
    /// Delete an application.
    async fn remove_application(&self, name: &str) -> Result<(), ServiceError>;
    /// Build and push the source at `source`; returns the release commit.
    async fn push_release(&self, application: &str, source: &Path) -> Result<String, ServiceError>;
    /// Upload a public key under `label`.
    async fn create_ssh_key(&self, label: &str, public_key: &str) -> Result<(), ServiceError>;
    /// Delete the key uploaded under `label`.
    async fn remove_ssh_key(&self, label: &str) -> Result<(), ServiceError>;
    /// A fresh device identifier.
    fn generate_device_uuid(&self) -> String;
    /// Device configuration for `application` at `os_version`.
    async fn device_config(&self, application: &str, os_version: &str)
        -> Result<Value, ServiceError>;
    /// Register a device under `application`.
    async fn register_device(
        &self,
        application: &str,
        uuid: &str,
    ) -> Result<DeviceRegistration, ServiceError>;
    /// Numeric id of a registered device.
    async fn device_id(&self, uuid: &str) -> Result<u64, ServiceError>;
    /// Whether the device is connected.
    async fn is_online(&self, uuid: &str) -> Result<bool, ServiceError>;
    /// Run a shell command in the device's host OS over the cloud tunnel.
    async fn execute_in_host_os(&self, command: &str, uuid: &str) -> Result<String, ServiceError>;
    /// Unpin the device so it follows the application's latest release.
    async fn track_application_release(&self, uuid: &str) -> Result<(), ServiceError>;
    /// Whether the device follows the application's latest release.
    async fn is_tracking_application_release(&self, uuid: &str) -> Result<bool, ServiceError>;
    /// Release commit the device is running, if it reported one.
    async fn device_commit(&self, uuid: &str) -> Result<Option<String>, ServiceError>;
}

/// OS image builder.
#[async_trait::async_trait]
pub trait ImageBuilder: Send + Sync {
    /// Download and unpack the base image.
    async fn fetch(&self, device_type: &str, network: &NetworkSettings)
        -> Result<(), ServiceError>;
    /// Read release metadata from the unpacked image.
    async fn read_os_release(&self) -> Result<OsRelease, ServiceError>;
    /// Merge device configuration into the image.
    async fn add_cloud_config(&self, config: Value) -> Result<(), ServiceError>;
    /// Write the final image; returns its path.
    async fn configure(&self) -> Result<PathBuf, ServiceError>;
}

/// Command-line tooling.
#[async_trait::async_trait]
pub trait CliTool: Send + Sync {
    /// Clone a git repository into `dest`.
    async fn clone_repository(&self, url: &str, dest: &Path) -> Result<(), ServiceError>;
    /// Generate a key pair at `path`; returns the public key.
    async fn generate_ssh_key(&self, path: &Path) -> Result<String, ServiceError>;
    /// Embed an application release into the image at `image`.
    async fn preload(&self, image: &Path, options: &PreloadOptions) -> Result<(), ServiceError>;
}

/// Hardware worker driving the device under test.
#[async_trait::async_trait]
pub trait Worker: Send + Sync {
    /// Configure the network offered to the device.
    async fn network(&self, settings: &NetworkSettings) -> Result<(), ServiceError>;
    /// Cut device power.
    async fn power_off(&self) -> Result<(), ServiceError>;
    /// Restore device power.
    async fn power_on(&self) -> Result<(), ServiceError>;
    /// Write `image` to the device's boot media.
    async fn flash(&self, image: &Path) -> Result<(), ServiceError>;
    /// Address of the device on the worker's network.
    async fn link(&self) -> Result<String, ServiceError>;
    /// Run a shell command in the device's host OS over `link`.
    async fn execute_in_host_os(&self, command: &str, link: &str) -> Result<String, ServiceError>;
    /// Release the worker's own resources.
    async fn teardown(&self) -> Result<(), ServiceError>;
}

/// Test artifact store.
#[async_trait::async_trait]
pub trait Archiver: Send + Sync {
    /// Keep the file at `path` with the run's artifacts.
    async fn add(&self, path: &Path) -> Result<(), ServiceError>;
}

/// The collaborators of one run.
#[derive(Clone)]
pub struct Services {
    /// Cloud API.
    pub cloud: Arc<dyn CloudService>,
    /// Image builder.
    pub image: Arc<dyn ImageBuilder>,
    /// CLI tooling.
    pub cli: Arc<dyn CliTool>,
    /// Hardware worker.
    pub worker: Arc<dyn Worker>,
    /// Artifact store.
    pub archiver: Arc<dyn Archiver>,
}

impl fmt::Debug for Services {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Services").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn network_switches_resolve_to_definitions() {
        let settings = NetworkSettings::resolve("rig-01", true, true);
        assert_eq!(settings.wired, Some(WiredNetwork { nat: true }));
        assert_eq!(
            settings.wireless,
            Some(WirelessNetwork {
                ssid: "rig-01".to_owned(),
                psk: "rig-01_psk".to_owned(),
                nat: true,
            })
        );
    }

    #[test]
    fn disabled_networks_are_omitted() {
        let settings = NetworkSettings::resolve("rig-01", false, false);
        assert_eq!(serde_json::to_value(&settings).unwrap(), serde_json::json!({}));

        let wired_only = NetworkSettings::resolve("rig-01", true, false);
        assert_eq!(
            serde_json::to_value(&wired_only).unwrap(),
            serde_json::json!({ "wired": { "nat": true } })
        );
    }

    #[test]
    fn only_unavailable_is_transient() {
        assert!(ServiceError::Unavailable("tunnel".into()).is_transient());
        assert!(!ServiceError::NotFound("device".into()).is_transient());
    }
}
