use crate::errors::{Error, Result};
use crate::model::{Device, DeviceStatus, DeviceType, DEFAULT_DEVICE_NAME};
use crate::pairing;
use crate::store::{DevicePatch, DeviceStore, Mutation, Upserted};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Characters that would break topic routing if they showed up in a device id.
const TOPIC_METACHARACTERS: [char; 3] = ['/', '+', '#'];
const MAX_NAME_LEN: usize = 64;

#[derive(Debug, Clone)]
pub struct RegisterRequest {
    pub device_id: String,
    pub owner_id: String,
    pub device_type: DeviceType,
    pub name: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Registration {
    pub device: Device,
    /// Plaintext token, only present when this call created the device.
    pub pairing_token: Option<String>,
}

impl Registration {
    pub fn created(&self) -> bool {
        self.pairing_token.is_some()
    }
}

pub fn validate_device_id(device_id: &str) -> Result<()> {
    if device_id.trim().is_empty() {
        return Err(Error::Validation("Device ID cannot be empty".to_string()));
    }
    if device_id.contains(TOPIC_METACHARACTERS) {
        return Err(Error::Validation(format!(
            "Device ID {} contains a topic separator or wildcard",
            device_id
        )));
    }
    Ok(())
}

fn validate_name(name: &str) -> Result<String> {
    let name = name.trim();
    if name.is_empty() {
        return Err(Error::Validation("Device name cannot be empty".to_string()));
    }
    if name.chars().count() > MAX_NAME_LEN {
        return Err(Error::Validation(format!(
            "Device name longer than {} characters",
            MAX_NAME_LEN
        )));
    }
    Ok(name.to_string())
}

/// Owns the device document lifecycle: pairing, ownership, field updates.
pub struct DeviceRegistry {
    store: Arc<dyn DeviceStore>,
}

impl DeviceRegistry {
    pub fn new(store: Arc<dyn DeviceStore>) -> Self {
        Self { store }
    }

    /// Binds `device_id` to `owner_id`.
    ///
    /// The first caller creates the device and receives the plaintext pairing
    /// token. The same owner calling again gets an idempotent success with no
    /// token and no mutation. Anyone else gets `OwnershipConflict`.
    pub async fn register(&self, request: RegisterRequest) -> Result<Registration> {
        validate_device_id(&request.device_id)?;
        let name = match request.name.as_deref() {
            Some(name) => validate_name(name)?,
            None => DEFAULT_DEVICE_NAME.to_string(),
        };

        let token = pairing::generate();
        let token_hash = pairing::hash(&token);
        let now = self.store.server_time().await?;

        let upserted = self
            .store
            .atomic_upsert(&request.device_id, &mut |current| match current {
                Some(_) => Mutation::Keep,
                None => Mutation::Put(Device::new(
                    request.device_id.clone(),
                    name.clone(),
                    request.device_type,
                    request.owner_id.clone(),
                    token_hash.clone(),
                    now,
                )),
            })
            .await?;

        match upserted {
            Upserted::Written(device) => {
                info!(
                    device_id = %device.id,
                    owner = %device.owner_id,
                    device_type = %device.device_type,
                    "Device registered"
                );
                Ok(Registration {
                    device,
                    pairing_token: Some(token),
                })
            }
            Upserted::Unchanged(Some(existing)) if existing.owner_id == request.owner_id => {
                debug!(device_id = %existing.id, "Device already registered to caller");
                Ok(Registration {
                    device: existing,
                    pairing_token: None,
                })
            }
            Upserted::Unchanged(Some(existing)) => {
                warn!(
                    device_id = %existing.id,
                    "Registration rejected: device owned by another user"
                );
                Err(Error::OwnershipConflict {
                    device_id: existing.id,
                    owner: existing.owner_id,
                })
            }
            Upserted::Unchanged(None) => Err(Error::StoreUnavailable(format!(
                "store declined to create device {}",
                request.device_id
            ))),
        }
    }

    /// Loads the device and checks the pairing token against its stored hash.
    pub async fn authenticate_device(&self, device_id: &str, token: &str) -> Result<Device> {
        let device = self
            .store
            .get(device_id)
            .await?
            .ok_or_else(|| Error::DeviceNotFound(device_id.to_string()))?;

        if !pairing::matches(token, &device.pairing_token_hash) {
            warn!(device_id = %device_id, "Pairing token rejected");
            return Err(Error::Unauthenticated("Invalid pairing token".to_string()));
        }
        Ok(device)
    }

    /// Fails closed: an absent device and a wrong token both yield `false`.
    pub async fn verify_pairing(&self, device_id: &str, token: &str) -> Result<bool> {
        match self.authenticate_device(device_id, token).await {
            Ok(_) => Ok(true),
            Err(Error::DeviceNotFound(_)) | Err(Error::Unauthenticated(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Last-writer-wins on the cached reading; `last_seen` comes from the store clock.
    ///
    /// Only device types that report telemetry carry the cached reading; anything
    /// else is rejected with `Validation` before the record is touched.
    pub async fn apply_telemetry(
        &self,
        device_id: &str,
        temperature: f64,
        humidity: f64,
        status: DeviceStatus,
    ) -> Result<()> {
        let device = self
            .store
            .get(device_id)
            .await?
            .ok_or_else(|| Error::DeviceNotFound(device_id.to_string()))?;
        if !device.device_type.reports_telemetry() {
            warn!(
                device_id = %device_id,
                device_type = %device.device_type,
                "Telemetry rejected for device type without sensor fields"
            );
            return Err(Error::Validation(format!(
                "Device {} is a {} and does not report telemetry",
                device_id, device.device_type
            )));
        }

        let patch = DevicePatch {
            status: Some(status),
            last_temperature: Some(temperature),
            last_humidity: Some(humidity),
            touch_last_seen: true,
            ..Default::default()
        };
        self.write_existing(device_id, patch).await
    }

    pub async fn set_status(&self, device_id: &str, status: DeviceStatus) -> Result<()> {
        let patch = DevicePatch {
            status: Some(status),
            touch_last_seen: true,
            ..Default::default()
        };
        self.write_existing(device_id, patch).await
    }

    /// The device, provided `caller` owns it.
    pub async fn owned_device(&self, device_id: &str, caller: &str) -> Result<Device> {
        let device = self
            .store
            .get(device_id)
            .await?
            .ok_or_else(|| Error::DeviceNotFound(device_id.to_string()))?;
        if device.owner_id != caller {
            return Err(Error::Unauthorized(format!(
                "Device {} belongs to another user",
                device_id
            )));
        }
        Ok(device)
    }

    pub async fn rename(&self, device_id: &str, caller: &str, new_name: &str) -> Result<String> {
        let new_name = validate_name(new_name)?;
        self.owned_device(device_id, caller).await?;
        self.write_existing(
            device_id,
            DevicePatch {
                name: Some(new_name.clone()),
                ..Default::default()
            },
        )
        .await?;
        info!(device_id = %device_id, "Device renamed");
        Ok(new_name)
    }

    pub async fn delete(&self, device_id: &str, caller: &str) -> Result<()> {
        self.owned_device(device_id, caller).await?;
        if !self.store.delete(device_id).await? {
            return Err(Error::DeviceNotFound(device_id.to_string()));
        }
        info!(device_id = %device_id, "Device deleted with its readings");
        Ok(())
    }

    pub async fn list_by_owner(&self, caller: &str) -> Result<Vec<Device>> {
        self.store.list_by_owner(caller).await
    }

    pub async fn get(&self, device_id: &str) -> Result<Option<Device>> {
        self.store.get(device_id).await
    }

    pub async fn server_time(&self) -> Result<DateTime<Utc>> {
        self.store.server_time().await
    }

    async fn write_existing(&self, device_id: &str, patch: DevicePatch) -> Result<()> {
        if self.store.write(device_id, patch).await? {
            Ok(())
        } else {
            Err(Error::DeviceNotFound(device_id.to_string()))
        }
    }
}
