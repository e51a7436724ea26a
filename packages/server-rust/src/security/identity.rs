//! Identity resolvers consulted when security is enabled.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

use crate::service::config::{RelayConfig, UserRecord};

/// A resolved user identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct User {
    pub id: String,
    pub login: String,
    pub display_name: String,
    pub groups: Vec<String>,
}

impl User {
    fn from_login(login: &str) -> Self {
        Self {
            id: login.to_string(),
            login: login.to_string(),
            display_name: login.to_string(),
            groups: Vec::new(),
        }
    }
}

/// Pluggable source of user identities.
#[async_trait]
pub trait IdentityResolver: Send + Sync {
    fn name(&self) -> &'static str;

    async fn resolve_by_id(&self, id: &str) -> anyhow::Result<Option<User>>;

    /// Returns the user when `login` and `password` match.
    async fn resolve_by_credentials(&self, login: &str, password: &str) -> anyhow::Result<Option<User>>;

    /// True when `password` is valid for the user with id `principal`.
    async fn validate_credential(&self, principal: &str, password: &str) -> anyhow::Result<bool>;
}

/// Constant-time string equality.
pub(crate) fn constant_time_eq(a: &str, b: &str) -> bool {
    a.as_bytes().ct_eq(b.as_bytes()).into()
}

// ---------------------------------------------------------------------------
// EqualityResolver
// ---------------------------------------------------------------------------

/// Accepts any login whose password equals the login itself.
#[derive(Debug, Default)]
pub struct EqualityResolver;

#[async_trait]
impl IdentityResolver for EqualityResolver {
    fn name(&self) -> &'static str {
        "equality"
    }

    async fn resolve_by_id(&self, id: &str) -> anyhow::Result<Option<User>> {
        Ok((!id.is_empty()).then(|| User::from_login(id)))
    }

    async fn resolve_by_credentials(&self, login: &str, password: &str) -> anyhow::Result<Option<User>> {
        Ok(constant_time_eq(login, password).then(|| User::from_login(login)))
    }

    async fn validate_credential(&self, principal: &str, password: &str) -> anyhow::Result<bool> {
        Ok(constant_time_eq(principal, password))
    }
}

// ---------------------------------------------------------------------------
// StaticUserResolver
// ---------------------------------------------------------------------------

/// Resolves users from the configured table of SHA-256 password digests.
#[derive(Debug)]
pub struct StaticUserResolver {
    by_login: HashMap<String, UserRecord>,
}

impl StaticUserResolver {
    /// # Errors
    ///
    /// Fails on duplicate logins or digests that are not 32 bytes of hex.
    pub fn new(users: &[UserRecord]) -> anyhow::Result<Self> {
        let mut by_login = HashMap::with_capacity(users.len());
        for user in users {
            let digest = hex::decode(&user.password_sha256)
                .map_err(|e| anyhow::anyhow!("user {}: invalid password digest: {e}", user.login))?;
            if digest.len() != 32 {
                anyhow::bail!("user {}: password digest must be 32 bytes", user.login);
            }
            if by_login.insert(user.login.clone(), user.clone()).is_some() {
                anyhow::bail!("duplicate user login {}", user.login);
            }
        }
        Ok(Self { by_login })
    }

    fn to_user(record: &UserRecord) -> User {
        User {
            id: record.id.clone(),
            login: record.login.clone(),
            display_name: record
                .display_name
                .clone()
                .unwrap_or_else(|| record.login.clone()),
            groups: record.groups.clone(),
        }
    }

    fn matches(record: Option<&UserRecord>, password: &str) -> bool {
        let presented = Sha256::digest(password.as_bytes());
        // Unknown users are compared against zeros so both paths hash and compare.
        let stored = record
            .and_then(|r| hex::decode(&r.password_sha256).ok())
            .unwrap_or_else(|| vec![0; 32]);
        let equal: bool = presented.as_slice().ct_eq(stored.as_slice()).into();
        equal && record.is_some()
    }
}

#[async_trait]
impl IdentityResolver for StaticUserResolver {
    fn name(&self) -> &'static str {
        "static"
    }

    async fn resolve_by_id(&self, id: &str) -> anyhow::Result<Option<User>> {
        Ok(self
            .by_login
            .values()
            .find(|r| r.id == id)
            .map(Self::to_user))
    }

    async fn resolve_by_credentials(&self, login: &str, password: &str) -> anyhow::Result<Option<User>> {
        let record = self.by_login.get(login);
        Ok(Self::matches(record, password)
            .then(|| record.map(Self::to_user))
            .flatten())
    }

    async fn validate_credential(&self, principal: &str, password: &str) -> anyhow::Result<bool> {
        let record = self.by_login.values().find(|r| r.id == principal);
        Ok(Self::matches(record, password))
    }
}

// ---------------------------------------------------------------------------
// IdentityResolvers
// ---------------------------------------------------------------------------

type ResolverFactory = fn(&RelayConfig) -> anyhow::Result<Arc<dyn IdentityResolver>>;

fn equality_resolver(_config: &RelayConfig) -> anyhow::Result<Arc<dyn IdentityResolver>> {
    Ok(Arc::new(EqualityResolver))
}

fn static_resolver(config: &RelayConfig) -> anyhow::Result<Arc<dyn IdentityResolver>> {
    Ok(Arc::new(StaticUserResolver::new(&config.users)?))
}

/// Named resolver factories, consulted once at startup.
pub struct IdentityResolvers {
    factories: HashMap<&'static str, ResolverFactory>,
}

impl Default for IdentityResolvers {
    fn default() -> Self {
        Self::builtin()
    }
}

impl IdentityResolvers {
    /// The `equality` and `static` resolvers.
    #[must_use]
    pub fn builtin() -> Self {
        let mut factories: HashMap<&'static str, ResolverFactory> = HashMap::new();
        factories.insert("equality", equality_resolver);
        factories.insert("static", static_resolver);
        Self { factories }
    }

    pub fn register(&mut self, name: &'static str, factory: ResolverFactory) {
        self.factories.insert(name, factory);
    }

    /// Builds the resolver named by `config.identity_resolver`.
    ///
    /// # Errors
    ///
    /// Fails for unknown names or when the factory rejects the configuration.
    pub fn build(&self, config: &RelayConfig) -> anyhow::Result<Arc<dyn IdentityResolver>> {
        let name = config.identity_resolver.as_str();
        let Some(factory) = self.factories.get(name) else {
            let mut known: Vec<&str> = self.factories.keys().copied().collect();
            known.sort_unstable();
            anyhow::bail!(
                "unknown identity resolver '{name}' (known: {})",
                known.join(", ")
            );
        };
        factory(config)
    }
}
