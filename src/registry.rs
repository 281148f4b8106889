use async_trait::async_trait;
use futures::{stream, StreamExt};
use log::{debug, error, info, warn};
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::json;
use tokio::time;
use uuid::Uuid;

use crate::config::{AdapterConfig, ThrottleConfig};
use crate::device::{split_evenly, Device};
use crate::error::LoadError;
use crate::sender::build_client;

/// Result of a provisioning round. `devices` may be shorter than `requested`.
#[derive(Debug, Clone, Default)]
pub struct Provisioned {
    pub tenants: Vec<String>,
    pub devices: Vec<Device>,
    pub requested: usize,
}

impl Provisioned {
    pub fn is_partial(&self) -> bool {
        self.devices.len() < self.requested
    }
}

#[async_trait]
pub trait Registry: Send + Sync {
    async fn register(&self, tenants: usize, devices: usize) -> Result<Provisioned, LoadError>;
}

#[derive(Deserialize)]
struct Created {
    id: String,
}

/// Device registry reached over Hono's management HTTP API.
pub struct HonoRegistry {
    client: reqwest::Client,
    base_url: String,
    username: String,
    password: String,
    concurrency: usize,
    throttle: Option<ThrottleConfig>,
}

impl HonoRegistry {
    pub fn new(adapters: &AdapterConfig, concurrency: usize) -> Result<Self, LoadError> {
        Ok(Self {
            client: build_client(adapters)?,
            base_url: adapters.registry_url(),
            username: adapters.registry_username.clone(),
            password: adapters.registry_password.clone(),
            concurrency: concurrency.max(1),
            throttle: None,
        })
    }

    /// Waits before every device registration.
    pub fn with_throttle(mut self, throttle: Option<ThrottleConfig>) -> Self {
        self.throttle = throttle;
        self
    }

    async fn register_device(
        &self,
        tenant_id: &str,
        index: usize,
        total: usize,
    ) -> Result<Device, LoadError> {
        if let Some(throttle) = &self.throttle {
            let delay = throttle.delay(index, total, &mut rand::thread_rng());
            debug!("Registration {}/{} waits {:?}", index + 1, total, delay);
            time::sleep(delay).await;
        }

        self.create_device(tenant_id).await
    }

    async fn create_tenant(&self) -> Result<String, LoadError> {
        let url = format!("{}/v1/tenants", self.base_url);
        let response = self
            .client
            .post(&url)
            .basic_auth(&self.username, Some(&self.password))
            .json(&json!({ "ext": { "messaging-type": "kafka" } }))
            .send()
            .await?;

        if response.status() != StatusCode::CREATED {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(LoadError::provisioning(format!(
                "creating tenant returned {}: {}",
                status, body
            )));
        }

        let created: Created = response.json().await?;
        info!("Created tenant: {}", created.id);

        Ok(created.id)
    }

    async fn create_device(&self, tenant_id: &str) -> Result<Device, LoadError> {
        let device_id = format!("device-{}", &Uuid::new_v4().simple().to_string()[..16]);
        let url = format!("{}/v1/devices/{}/{}", self.base_url, tenant_id, device_id);

        let response = self
            .client
            .post(&url)
            .basic_auth(&self.username, Some(&self.password))
            .json(&json!({}))
            .send()
            .await?;

        match response.status() {
            StatusCode::CREATED => debug!("Device {} created in tenant {}", device_id, tenant_id),
            StatusCode::CONFLICT => {
                warn!("Device {} already exists in tenant {}, reusing it", device_id, tenant_id)
            }
            status => {
                let body = response.text().await.unwrap_or_default();
                return Err(LoadError::provisioning(format!(
                    "creating device {} returned {}: {}",
                    device_id, status, body
                )));
            }
        }

        let password = Uuid::new_v4().simple().to_string();
        let device = Device::new(device_id, tenant_id, password);
        self.set_credentials(&device).await?;

        Ok(device)
    }

    async fn set_credentials(&self, device: &Device) -> Result<(), LoadError> {
        let url = format!(
            "{}/v1/credentials/{}/{}",
            self.base_url, device.tenant_id, device.id
        );
        let body = json!([{
            "type": "hashed-password",
            "auth-id": device.auth_id,
            "secrets": [{ "pwd-plain": device.credential() }],
        }]);

        let response = self
            .client
            .put(&url)
            .basic_auth(&self.username, Some(&self.password))
            .json(&body)
            .send()
            .await?;

        if response.status() != StatusCode::NO_CONTENT {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(LoadError::provisioning(format!(
                "setting credentials for {} returned {}: {}",
                device.id, status, body
            )));
        }

        Ok(())
    }
}

#[async_trait]
impl Registry for HonoRegistry {
    async fn register(&self, tenants: usize, devices: usize) -> Result<Provisioned, LoadError> {
        info!("Setting up {} tenants with {} devices total", tenants, devices);

        let created: Vec<Result<String, LoadError>> = stream::iter(0..tenants)
            .map(|_| self.create_tenant())
            .buffer_unordered(self.concurrency)
            .collect()
            .await;

        let tenant_ids: Vec<String> = created
            .into_iter()
            .filter_map(|result| {
                result
                    .map_err(|e| error!("Failed to create tenant: {}", e))
                    .ok()
            })
            .collect();

        if tenant_ids.is_empty() {
            return Err(LoadError::provisioning("no tenants could be created"));
        }

        info!("Created {}/{} tenants", tenant_ids.len(), tenants);

        let slots: Vec<String> = tenant_ids
            .iter()
            .zip(split_evenly(devices, tenant_ids.len()))
            .flat_map(|(tenant, count)| std::iter::repeat(tenant.clone()).take(count))
            .collect();
        let total = slots.len();

        let registered: Vec<Result<Device, LoadError>> =
            stream::iter(slots.into_iter().enumerate())
                .map(|(index, tenant)| async move {
                    self.register_device(&tenant, index, total).await
                })
                .buffer_unordered(self.concurrency)
                .collect()
                .await;

        let devices_ok: Vec<Device> = registered
            .into_iter()
            .filter_map(|result| {
                result
                    .map_err(|e| error!("Failed to register device: {}", e))
                    .ok()
            })
            .collect();

        info!("Registered {}/{} devices", devices_ok.len(), devices);

        Ok(Provisioned {
            tenants: tenant_ids,
            devices: devices_ok,
            requested: devices,
        })
    }
}
