//! Binding of a delegate instance to one backend device.

use std::sync::Arc;
use std::time::Duration;

use devrelay_core::{Failure, Value};

use crate::backend::{validate_device_name, DeviceBackend};

/// A validated device name plus the backend that hosts it.
#[derive(Clone)]
pub struct BackendLink {
    backend: Arc<dyn DeviceBackend>,
    device: String,
}

impl std::fmt::Debug for BackendLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendLink")
            .field("backend", &self.backend.endpoint())
            .field("device", &self.device)
            .finish()
    }
}

impl BackendLink {
    /// # Errors
    ///
    /// Returns `API_WrongDeviceNameSyntax` for malformed device names.
    pub fn new(backend: Arc<dyn DeviceBackend>, device: &str) -> Result<Self, Failure> {
        validate_device_name(device)?;
        Ok(Self {
            backend,
            device: device.to_string(),
        })
    }

    #[must_use]
    pub fn device(&self) -> &str {
        &self.device
    }

    pub async fn ping(&self) -> Result<Duration, Failure> {
        self.backend.ping(&self.device).await
    }

    pub async fn command(&self, command: &str, args: Vec<Value>) -> Result<Value, Failure> {
        self.backend.invoke(&self.device, command, args).await
    }

    pub async fn read(&self, attribute: &str) -> Result<Value, Failure> {
        self.backend.read_attribute(&self.device, attribute).await
    }

    pub async fn write(&self, attribute: &str, value: Value) -> Result<(), Failure> {
        self.backend.write_attribute(&self.device, attribute, value).await
    }
}
