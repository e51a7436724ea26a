//! In-process device backend for `memory://` endpoints.
//!
//! Devices spring into existence on first access with a fixed set of scalar
//! attributes and a small command set, enough to drive the relay end to end
//! without a control system.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use devrelay_core::{Failure, Value};
use tracing::debug;

use super::{validate_device_name, DeviceBackend};

/// Endpoint scheme served by [`MemoryBackend`].
pub const SCHEME: &str = "memory://";

const STATE_ON: &str = "ON";
const STATE_OFF: &str = "OFF";

#[derive(Debug, Clone)]
struct MemoryDevice {
    state: &'static str,
    attributes: BTreeMap<String, Value>,
}

impl MemoryDevice {
    fn new() -> Self {
        let attributes = [
            ("double_scalar", Value::Double(0.0)),
            ("long_scalar", Value::Long(0)),
            ("string_scalar", Value::String(String::new())),
            ("boolean_scalar", Value::Bool(false)),
        ]
        .into_iter()
        .map(|(name, value)| (name.to_string(), value))
        .collect();
        Self {
            state: STATE_ON,
            attributes,
        }
    }

    fn status(&self) -> String {
        format!("The device is in {} state.", self.state)
    }
}

/// Backend whose devices live in process memory.
#[derive(Debug)]
pub struct MemoryBackend {
    endpoint: String,
    devices: DashMap<String, MemoryDevice>,
}

impl MemoryBackend {
    #[must_use]
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            devices: DashMap::new(),
        }
    }

    /// Number of devices touched so far.
    #[must_use]
    pub fn device_count(&self) -> usize {
        self.devices.len()
    }

    fn with_device<T>(
        &self,
        device: &str,
        f: impl FnOnce(&mut MemoryDevice) -> Result<T, Failure>,
    ) -> Result<T, Failure> {
        validate_device_name(device)?;
        let mut entry = self
            .devices
            .entry(device.to_string())
            .or_insert_with(|| {
                debug!(device, "memory device created");
                MemoryDevice::new()
            });
        f(entry.value_mut())
    }
}

fn sleep_duration(device: &str, args: &[Value]) -> Result<Duration, Failure> {
    let millis = match args.first().map(Value::resolved) {
        Some(Value::Short(v)) => u64::try_from(*v).ok(),
        Some(Value::Int(v)) => u64::try_from(*v).ok(),
        Some(Value::Long(v)) => u64::try_from(*v).ok(),
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        Some(Value::Double(v)) if *v >= 0.0 && v.is_finite() => Some(*v as u64),
        _ => None,
    };
    millis.map(Duration::from_millis).ok_or_else(|| {
        Failure::new("API_IncompatibleCmdArgumentType", "Sleep expects a non-negative duration in ms")
            .with_origin(device)
    })
}

#[async_trait]
impl DeviceBackend for MemoryBackend {
    fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn ping(&self, device: &str) -> Result<Duration, Failure> {
        let start = Instant::now();
        self.with_device(device, |_| Ok(()))?;
        Ok(start.elapsed())
    }

    async fn invoke(&self, device: &str, command: &str, args: Vec<Value>) -> Result<Value, Failure> {
        // Sleep must not hold the device entry across the await.
        if command == "Sleep" {
            let pause = self.with_device(device, |_| sleep_duration(device, &args))?;
            tokio::time::sleep(pause).await;
            return Ok(Value::Null);
        }

        self.with_device(device, |dev| match command {
            "State" => Ok(Value::String(dev.state.to_string())),
            "Status" => Ok(Value::String(dev.status())),
            "On" => {
                dev.state = STATE_ON;
                Ok(Value::Null)
            }
            "Off" => {
                dev.state = STATE_OFF;
                Ok(Value::Null)
            }
            "Init" => {
                *dev = MemoryDevice::new();
                Ok(Value::Null)
            }
            "Echo" => Ok(args.into_iter().next().unwrap_or(Value::Null)),
            "Fail" => Err(Failure::new("API_CommandFailed", "command Fail always fails")
                .with_description("requested failure for client error handling")
                .with_origin(device)
                .caused_by(
                    Failure::new("API_DeviceFailure", "simulated hardware fault")
                        .with_origin(format!("{device}/Fail")),
                )),
            other => Err(Failure::new(
                "API_CommandNotFound",
                format!("command {other} not found"),
            )
            .with_origin(device)),
        })
    }

    async fn read_attribute(&self, device: &str, attribute: &str) -> Result<Value, Failure> {
        self.with_device(device, |dev| match attribute {
            "State" => Ok(Value::String(dev.state.to_string())),
            "Status" => Ok(Value::String(dev.status())),
            name => dev.attributes.get(name).cloned().ok_or_else(|| {
                Failure::new("API_AttrNotFound", format!("attribute {name} not found"))
                    .with_origin(device)
            }),
        })
    }

    async fn write_attribute(&self, device: &str, attribute: &str, value: Value) -> Result<(), Failure> {
        self.with_device(device, |dev| {
            let Some(current) = dev.attributes.get_mut(attribute) else {
                let kind = if matches!(attribute, "State" | "Status") {
                    "API_AttrNotWritable"
                } else {
                    "API_AttrNotFound"
                };
                return Err(Failure::new(kind, format!("cannot write attribute {attribute}"))
                    .with_origin(device));
            };
            if current.type_tag() != value.type_tag() {
                return Err(Failure::new(
                    "API_IncompatibleAttrDataType",
                    format!(
                        "attribute {attribute} holds {}, got {}",
                        current.type_tag(),
                        value.type_tag()
                    ),
                )
                .with_origin(device));
            }
            *current = value;
            Ok(())
        })
    }
}
