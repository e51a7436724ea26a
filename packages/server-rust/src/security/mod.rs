//! Authentication gate: the only path from an unauthenticated session to an
//! authenticated one.
//!
//! With security disabled a login succeeds iff `login == password`. With
//! security enabled the credentials are checked by the identity resolver
//! chosen at startup. Every failure reports the same message, so a client
//! cannot tell an unknown login from a wrong password.

pub mod identity;

use std::sync::Arc;

use devrelay_core::Value;
use tracing::{debug, info};

pub use identity::{EqualityResolver, IdentityResolver, IdentityResolvers, StaticUserResolver, User};

use crate::service::config::RelayConfig;
use crate::service::operation::{RelayError, AUTHENTICATION_FAILED, SESSION_NOT_AUTHENTICATED};
use crate::session::Session;

/// Decides whether sessions may authenticate and whether they have.
pub struct SecurityGate {
    resolver: Option<Arc<dyn IdentityResolver>>,
}

impl std::fmt::Debug for SecurityGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecurityGate")
            .field("resolver", &self.resolver.as_ref().map(|r| r.name()))
            .finish()
    }
}

impl SecurityGate {
    /// Builds the gate, resolving the identity resolver once.
    ///
    /// # Errors
    ///
    /// Fails when security is enabled and the configured resolver cannot be built.
    pub fn new(config: &RelayConfig, resolvers: &IdentityResolvers) -> anyhow::Result<Self> {
        let resolver = if config.security_enabled {
            let resolver = resolvers.build(config)?;
            info!(resolver = resolver.name(), "security enabled");
            Some(resolver)
        } else {
            info!("security disabled, logins are accepted when login equals password");
            None
        };
        Ok(Self { resolver })
    }

    /// Validates `[login, password]` and marks the session authenticated.
    ///
    /// A failed attempt leaves an already authenticated session authenticated.
    ///
    /// # Errors
    ///
    /// `NotAuthenticated` with a uniform message on any failure.
    pub async fn authenticate(&self, session: &Session, class_param: &[Value]) -> Result<(), RelayError> {
        let failed = RelayError::NotAuthenticated {
            reason: AUTHENTICATION_FAILED,
        };
        let [login, password] = class_param else {
            return Err(failed);
        };
        let (Some(login), Some(password)) = (login.as_str(), password.as_str()) else {
            return Err(failed);
        };

        let accepted = match &self.resolver {
            None => identity::constant_time_eq(login, password),
            Some(resolver) => match resolver.resolve_by_credentials(login, password).await {
                Ok(user) => user.is_some(),
                Err(err) => {
                    debug!(resolver = resolver.name(), error = %err, "identity resolver failed");
                    false
                }
            },
        };

        if !accepted {
            debug!(session = %session.id(), "authentication rejected");
            return Err(failed);
        }
        session.mark_authenticated(login);
        info!(session = %session.id(), login, "session authenticated");
        Ok(())
    }

    /// # Errors
    ///
    /// `NotAuthenticated` when the session has not authenticated.
    pub fn require_authenticated(&self, session: &Session) -> Result<(), RelayError> {
        if session.is_authenticated() {
            Ok(())
        } else {
            Err(RelayError::NotAuthenticated {
                reason: SESSION_NOT_AUTHENTICATED,
            })
        }
    }
}
