//! Delegates exposed as relay actions.

pub mod attribute;
pub mod device;
pub mod link;

pub use attribute::AttributeProxy;
pub use device::DeviceProxy;
pub use link::BackendLink;

use crate::service::catalog::ActionCatalog;

/// The catalog of every built-in action.
///
/// # Errors
///
/// Fails if an action declares a duplicate signature.
pub fn default_catalog() -> anyhow::Result<ActionCatalog> {
    let mut catalog = ActionCatalog::new();
    catalog.register(device::action())?;
    catalog.register(attribute::action())?;
    Ok(catalog)
}
