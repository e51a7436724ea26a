//! `AttributeProxy`: remote handle to one attribute of a backend device.

use std::sync::Arc;

use devrelay_core::{Failure, Value};

use super::link::BackendLink;
use crate::service::catalog::{ActionBuilder, ActionContext};

pub const ACTION: &str = "AttributeProxy";

#[derive(Debug)]
pub struct AttributeProxy {
    link: BackendLink,
    attribute: String,
}

impl AttributeProxy {
    /// Opens `domain/family/member/attribute`.
    ///
    /// # Errors
    ///
    /// Returns `API_WrongAttributeNameSyntax` when the name has no attribute part,
    /// or `API_WrongDeviceNameSyntax` for a malformed device part.
    pub fn from_full_name(ctx: &ActionContext, full_name: &str) -> Result<Self, Failure> {
        let Some((device, attribute)) = full_name.rsplit_once('/') else {
            return Err(wrong_name(full_name));
        };
        Self::open(ctx, device, attribute)
    }

    /// # Errors
    ///
    /// As for [`from_full_name`](Self::from_full_name).
    pub fn open(ctx: &ActionContext, device: &str, attribute: &str) -> Result<Self, Failure> {
        if attribute.is_empty() {
            return Err(wrong_name(&format!("{device}/")));
        }
        Ok(Self {
            link: BackendLink::new(Arc::clone(&ctx.backend), device)?,
            attribute: attribute.to_string(),
        })
    }

    fn full_name(&self) -> String {
        format!("{}/{}", self.link.device(), self.attribute)
    }

    async fn read(&self) -> Result<Value, Failure> {
        self.link.read(&self.attribute).await
    }

    async fn write(&self, value: Value) -> Result<(), Failure> {
        self.link.write(&self.attribute, value).await
    }
}

fn wrong_name(name: &str) -> Failure {
    Failure::new(
        "API_WrongAttributeNameSyntax",
        format!("attribute name '{name}' is not of the form domain/family/member/attribute"),
    )
    .with_origin(name)
}

/// Constructor and method table for `AttributeProxy`.
#[must_use]
pub fn action() -> ActionBuilder<AttributeProxy> {
    ActionBuilder::new(ACTION)
        .constructor(|ctx: &ActionContext, (name,): (String,)| AttributeProxy::from_full_name(ctx, &name))
        .constructor(|ctx: &ActionContext, (device, attribute): (String, String)| {
            AttributeProxy::open(ctx, &device, &attribute)
        })
        .method("name", |a: Arc<AttributeProxy>, (): ()| async move {
            Ok::<_, Failure>(a.full_name())
        })
        .method("read", |a: Arc<AttributeProxy>, (): ()| async move { a.read().await })
        .method("write", |a: Arc<AttributeProxy>, (v,): (f64,)| async move {
            a.write(Value::Double(v)).await
        })
        .method("write", |a: Arc<AttributeProxy>, (v,): (i64,)| async move {
            a.write(Value::Long(v)).await
        })
        .method("write", |a: Arc<AttributeProxy>, (v,): (String,)| async move {
            a.write(Value::String(v)).await
        })
        .method("write", |a: Arc<AttributeProxy>, (v,): (bool,)| async move {
            a.write(Value::Bool(v)).await
        })
        .asynchronous("read_asynch", |a: Arc<AttributeProxy>, (): ()| async move { a.read().await })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;
    use crate::service::config::RelayConfig;

    fn ctx() -> ActionContext {
        ActionContext {
            config: Arc::new(RelayConfig::default()),
            backend: Arc::new(MemoryBackend::new("memory://test")),
        }
    }

    #[test]
    fn full_name_splits_at_last_slash() {
        let proxy = AttributeProxy::from_full_name(&ctx(), "sys/tg_test/1/double_scalar").unwrap();
        assert_eq!(proxy.link.device(), "sys/tg_test/1");
        assert_eq!(proxy.attribute, "double_scalar");
        assert_eq!(proxy.full_name(), "sys/tg_test/1/double_scalar");
    }

    #[test]
    fn missing_attribute_part_is_rejected() {
        let err = AttributeProxy::from_full_name(&ctx(), "sys/tg_test/1/").unwrap_err();
        assert_eq!(err.kind, "API_WrongAttributeNameSyntax");
        let err = AttributeProxy::from_full_name(&ctx(), "sys/tg_test").unwrap_err();
        assert_eq!(err.kind, "API_WrongDeviceNameSyntax");
    }

    #[tokio::test]
    async fn write_then_read_through_backend() {
        let proxy = AttributeProxy::open(&ctx(), "sys/tg_test/1", "long_scalar").unwrap();
        proxy.write(Value::Long(12)).await.unwrap();
        assert_eq!(proxy.read().await.unwrap(), Value::Long(12));
    }
}
