//! `DeviceProxy`: remote handle to one backend device.

use std::sync::Arc;

use devrelay_core::{Failure, Value};

use super::link::BackendLink;
use crate::service::catalog::{ActionBuilder, ActionContext};

pub const ACTION: &str = "DeviceProxy";

#[derive(Debug)]
pub struct DeviceProxy {
    link: BackendLink,
}

impl DeviceProxy {
    /// # Errors
    ///
    /// Returns `API_WrongDeviceNameSyntax` for malformed device names.
    pub fn connect(ctx: &ActionContext, device: &str) -> Result<Self, Failure> {
        Ok(Self {
            link: BackendLink::new(Arc::clone(&ctx.backend), device)?,
        })
    }

    async fn ping_micros(&self) -> Result<i64, Failure> {
        let elapsed = self.link.ping().await?;
        Ok(i64::try_from(elapsed.as_micros()).unwrap_or(i64::MAX))
    }
}

/// Constructor and method table for `DeviceProxy`.
#[must_use]
pub fn action() -> ActionBuilder<DeviceProxy> {
    ActionBuilder::new(ACTION)
        .constructor(|ctx: &ActionContext, (device,): (String,)| DeviceProxy::connect(ctx, &device))
        .method("name", |d: Arc<DeviceProxy>, (): ()| async move {
            Ok::<_, Failure>(d.link.device().to_string())
        })
        .method("ping", |d: Arc<DeviceProxy>, (): ()| async move { d.ping_micros().await })
        .method("state", |d: Arc<DeviceProxy>, (): ()| async move {
            d.link.command("State", Vec::new()).await
        })
        .method("status", |d: Arc<DeviceProxy>, (): ()| async move {
            d.link.command("Status", Vec::new()).await
        })
        .method("command_inout", |d: Arc<DeviceProxy>, (cmd,): (String,)| async move {
            d.link.command(&cmd, Vec::new()).await
        })
        .method("command_inout", |d: Arc<DeviceProxy>, (cmd, arg): (String, f64)| async move {
            d.link.command(&cmd, vec![Value::Double(arg)]).await
        })
        .method("command_inout", |d: Arc<DeviceProxy>, (cmd, arg): (String, String)| async move {
            d.link.command(&cmd, vec![Value::String(arg)]).await
        })
        .method("command_inout", |d: Arc<DeviceProxy>, (cmd, args): (String, Vec<Value>)| async move {
            d.link.command(&cmd, args).await
        })
        .method("read_attribute", |d: Arc<DeviceProxy>, (attr,): (String,)| async move {
            d.link.read(&attr).await
        })
        .method("write_attribute", |d: Arc<DeviceProxy>, (attr, v): (String, f64)| async move {
            d.link.write(&attr, Value::Double(v)).await
        })
        .method("write_attribute", |d: Arc<DeviceProxy>, (attr, v): (String, i64)| async move {
            d.link.write(&attr, Value::Long(v)).await
        })
        .method("write_attribute", |d: Arc<DeviceProxy>, (attr, v): (String, String)| async move {
            d.link.write(&attr, Value::String(v)).await
        })
        .method("write_attribute", |d: Arc<DeviceProxy>, (attr, v): (String, bool)| async move {
            d.link.write(&attr, Value::Bool(v)).await
        })
        .asynchronous("command_inout_asynch", |d: Arc<DeviceProxy>, (cmd,): (String,)| async move {
            d.link.command(&cmd, Vec::new()).await
        })
        .asynchronous(
            "command_inout_asynch",
            |d: Arc<DeviceProxy>, (cmd, arg): (String, f64)| async move {
                d.link.command(&cmd, vec![Value::Double(arg)]).await
            },
        )
}
