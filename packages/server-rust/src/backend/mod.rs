//! Device backend seam used by the delegates.
//!
//! The relay never talks to hardware directly: every delegate forwards to a
//! [`DeviceBackend`] chosen once at startup from the configured endpoint.

pub mod memory;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use devrelay_core::{Failure, Value};

pub use memory::MemoryBackend;

/// A control-system backend that hosts named devices.
///
/// Device names have the form `domain/family/member`. All failures are
/// reported as [`Failure`] chains so they reach the client unchanged.
#[async_trait]
pub trait DeviceBackend: Send + Sync {
    /// The endpoint this backend was created from.
    fn endpoint(&self) -> &str;

    /// Round-trip check against a device.
    async fn ping(&self, device: &str) -> Result<Duration, Failure>;

    /// Executes a device command.
    async fn invoke(&self, device: &str, command: &str, args: Vec<Value>) -> Result<Value, Failure>;

    async fn read_attribute(&self, device: &str, attribute: &str) -> Result<Value, Failure>;

    async fn write_attribute(&self, device: &str, attribute: &str, value: Value) -> Result<(), Failure>;
}

/// Opens the backend named by `endpoint`.
///
/// # Errors
///
/// Returns an error for unsupported endpoint schemes.
pub fn connect(endpoint: &str) -> anyhow::Result<Arc<dyn DeviceBackend>> {
    if endpoint.starts_with(memory::SCHEME) {
        return Ok(Arc::new(MemoryBackend::new(endpoint)));
    }
    anyhow::bail!("unsupported backend endpoint '{endpoint}' (expected {}<name>)", memory::SCHEME)
}

/// Splits and validates a `domain/family/member` device name.
///
/// # Errors
///
/// Returns `API_WrongDeviceNameSyntax` when the name does not have exactly
/// three non-empty parts.
pub fn validate_device_name(name: &str) -> Result<(), Failure> {
    let parts: Vec<&str> = name.split('/').collect();
    if parts.len() == 3 && parts.iter().all(|p| !p.is_empty()) {
        Ok(())
    } else {
        Err(Failure::new(
            "API_WrongDeviceNameSyntax",
            format!("device name '{name}' is not of the form domain/family/member"),
        )
        .with_origin(name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connect_accepts_memory_scheme() {
        let backend = connect("memory://lab").unwrap();
        assert_eq!(backend.endpoint(), "memory://lab");
    }

    #[test]
    fn connect_rejects_other_schemes() {
        let err = connect("tango://db:10000").err().unwrap();
        assert!(err.to_string().contains("unsupported backend endpoint"));
    }

    #[test]
    fn device_names_need_three_parts() {
        assert!(validate_device_name("sys/tg_test/1").is_ok());
        assert!(validate_device_name("sys/tg_test").is_err());
        assert!(validate_device_name("sys//1").is_err());
        assert!(validate_device_name("a/b/c/d").is_err());
    }
}
