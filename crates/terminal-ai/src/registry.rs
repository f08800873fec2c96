//! Provider identities, dispatch policies and BYOK routing.
//!
//! A [`ProviderRegistry`] is built once at startup (see
//! [`ProviderConfigFile::to_registry`](crate::config::ProviderConfigFile::to_registry))
//! and borrowed immutably for the duration of a dispatch. Mutations go
//! through `&mut self` methods, so a dispatch can never observe a
//! half-applied change. Hosts that dispatch from several tasks share it via
//! [`SharedRegistry`] and dispatch against a [`snapshot`](SharedRegistry::snapshot).

use crate::AGGREGATOR_PROVIDER;
use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};
use thiserror::Error;

// ── Identity & policy ──────────────────────────────────────────────

/// Where and how to reach a provider.
#[derive(Clone, PartialEq, Eq)]
pub struct ProviderIdentity {
    pub name: String,
    pub endpoint: String,
    pub model: String,
    /// API key. Empty means the provider is unusable and will be skipped.
    pub credential: String,
}

impl ProviderIdentity {
    pub fn new(
        name: impl Into<String>,
        endpoint: impl Into<String>,
        model: impl Into<String>,
        credential: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            endpoint: endpoint.into(),
            model: model.into(),
            credential: credential.into(),
        }
    }

    pub fn has_credential(&self) -> bool {
        !self.credential.is_empty()
    }
}

impl std::fmt::Debug for ProviderIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderIdentity")
            .field("name", &self.name)
            .field("endpoint", &self.endpoint)
            .field("model", &self.model)
            .field(
                "credential",
                &if self.has_credential() { "<set>" } else { "<empty>" },
            )
            .finish()
    }
}

/// Upstream routing preferences sent to the aggregator in BYOK mode.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ByokRoute {
    /// Upstream vendor names in preference order, sent verbatim.
    pub order: Vec<String>,
    /// Model slug per [normalized](normalize_provider_key) upstream name.
    /// A missing entry means the aggregator's default model.
    pub model_overrides: BTreeMap<String, String>,
    /// Whether the aggregator may use its shared credentials when every
    /// listed upstream fails.
    pub allow_fallback_to_shared: bool,
}

impl ByokRoute {
    /// Model slug override for an upstream, looked up by normalized name.
    pub fn model_for(&self, upstream: &str) -> Option<&str> {
        self.model_overrides
            .get(&normalize_provider_key(upstream))
            .map(String::as_str)
    }

    fn contains(&self, upstream: &str) -> bool {
        self.order.iter().any(|p| p == upstream)
    }
}

/// Persisted BYOK configuration of the aggregator.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum ByokState {
    #[default]
    Unconfigured,
    /// Configured but switched off; the route is kept for re-enabling.
    Disabled(ByokRoute),
    Enabled(ByokRoute),
}

impl ByokState {
    pub fn route(&self) -> Option<&ByokRoute> {
        match self {
            ByokState::Unconfigured => None,
            ByokState::Disabled(route) | ByokState::Enabled(route) => Some(route),
        }
    }

    fn route_mut(&mut self) -> Option<&mut ByokRoute> {
        match self {
            ByokState::Unconfigured => None,
            ByokState::Disabled(route) | ByokState::Enabled(route) => Some(route),
        }
    }

    pub fn is_enabled(&self) -> bool {
        matches!(self, ByokState::Enabled(_))
    }
}

/// How a request to a given provider is routed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoutingMode {
    /// Plain model/messages/stream payload.
    Direct,
    /// Aggregator payload carrying an ordered upstream list.
    AggregatedWithOrder(ByokRoute),
}

/// Dispatch policy for one provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderPolicy {
    /// Lower is tried first.
    pub priority: i32,
    pub enabled: bool,
    /// Retries in addition to the first attempt.
    pub max_retries: u32,
    pub byok: ByokState,
}

impl Default for ProviderPolicy {
    fn default() -> Self {
        Self {
            priority: 1,
            enabled: true,
            max_retries: 2,
            byok: ByokState::Unconfigured,
        }
    }
}

impl ProviderPolicy {
    pub fn with_priority(priority: i32) -> Self {
        Self {
            priority,
            ..Default::default()
        }
    }

    pub fn max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    pub fn byok(mut self, state: ByokState) -> Self {
        self.byok = state;
        self
    }
}

// ── Errors ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("provider '{0}' not found")]
    UnknownProvider(String),
    #[error("aggregator provider '{AGGREGATOR_PROVIDER}' is not configured")]
    NoAggregator,
    #[error("BYOK not configured. Enable it first: terminal-ai provider byok enable")]
    ByokNotConfigured,
    #[error("BYOK provider '{0}' already exists")]
    UpstreamExists(String),
    #[error("BYOK provider '{0}' not found. Add it first: terminal-ai provider byok add {0} <model>")]
    UpstreamMissing(String),
}

// ── Registry ───────────────────────────────────────────────────────

/// Provider identities and policies keyed by provider name.
#[derive(Debug, Clone, Default)]
pub struct ProviderRegistry {
    identities: BTreeMap<String, ProviderIdentity>,
    policies: BTreeMap<String, ProviderPolicy>,
    default_provider: Option<String>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a provider.
    pub fn upsert(&mut self, identity: ProviderIdentity, policy: ProviderPolicy) {
        let name = identity.name.clone();
        self.identities.insert(name.clone(), identity);
        self.policies.insert(name, policy);
    }

    /// Builder-style [`upsert`](Self::upsert).
    pub fn with_provider(mut self, identity: ProviderIdentity, policy: ProviderPolicy) -> Self {
        self.upsert(identity, policy);
        self
    }

    pub fn contains(&self, name: &str) -> bool {
        self.policies.contains_key(name)
    }

    pub fn identity(&self, name: &str) -> Option<&ProviderIdentity> {
        self.identities.get(name)
    }

    pub fn policy(&self, name: &str) -> Option<&ProviderPolicy> {
        self.policies.get(name)
    }

    /// All configured provider names, alphabetically.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.policies.keys().map(String::as_str)
    }

    /// Enabled providers sorted by ascending priority.
    ///
    /// Equal priorities keep alphabetical order, so repeated resolutions of
    /// the same policy set always agree.
    pub fn resolve_order(&self) -> Vec<String> {
        let mut enabled: Vec<(&String, i32)> = self
            .policies
            .iter()
            .filter(|(_, policy)| policy.enabled)
            .map(|(name, policy)| (name, policy.priority))
            .collect();
        enabled.sort_by_key(|(_, priority)| *priority);
        enabled.into_iter().map(|(name, _)| name.clone()).collect()
    }

    /// Routing for a request to `name`. Only the aggregator with an enabled
    /// BYOK policy routes with an upstream order.
    pub fn routing_for(&self, name: &str) -> RoutingMode {
        if name != AGGREGATOR_PROVIDER {
            return RoutingMode::Direct;
        }
        match self.policies.get(name).map(|p| &p.byok) {
            Some(ByokState::Enabled(route)) => RoutingMode::AggregatedWithOrder(route.clone()),
            _ => RoutingMode::Direct,
        }
    }

    /// The configured default provider, falling back to the first provider
    /// in resolved order.
    pub fn default_provider(&self) -> Option<&str> {
        match &self.default_provider {
            Some(name) => Some(name.as_str()),
            None => self
                .resolve_order()
                .first()
                .and_then(|first| self.policies.get_key_value(first))
                .map(|(name, _)| name.as_str()),
        }
    }

    pub fn set_default_provider(&mut self, name: &str) -> Result<(), RegistryError> {
        self.require(name)?;
        self.default_provider = Some(name.to_string());
        Ok(())
    }

    pub fn set_enabled(&mut self, name: &str, enabled: bool) -> Result<(), RegistryError> {
        self.policy_mut(name)?.enabled = enabled;
        Ok(())
    }

    pub fn set_priority(&mut self, name: &str, priority: i32) -> Result<(), RegistryError> {
        self.policy_mut(name)?.priority = priority;
        Ok(())
    }

    pub fn set_max_retries(&mut self, name: &str, retries: u32) -> Result<(), RegistryError> {
        self.policy_mut(name)?.max_retries = retries;
        Ok(())
    }

    fn require(&self, name: &str) -> Result<(), RegistryError> {
        if self.contains(name) {
            Ok(())
        } else {
            Err(RegistryError::UnknownProvider(name.to_string()))
        }
    }

    fn policy_mut(&mut self, name: &str) -> Result<&mut ProviderPolicy, RegistryError> {
        self.policies
            .get_mut(name)
            .ok_or_else(|| RegistryError::UnknownProvider(name.to_string()))
    }

    // ── BYOK ───────────────────────────────────────────────────────

    /// BYOK state of the aggregator.
    pub fn byok(&self) -> Result<&ByokState, RegistryError> {
        self.policies
            .get(AGGREGATOR_PROVIDER)
            .map(|p| &p.byok)
            .ok_or(RegistryError::NoAggregator)
    }

    fn byok_mut(&mut self) -> Result<&mut ByokState, RegistryError> {
        self.policies
            .get_mut(AGGREGATOR_PROVIDER)
            .map(|p| &mut p.byok)
            .ok_or(RegistryError::NoAggregator)
    }

    fn byok_route_mut(&mut self) -> Result<&mut ByokRoute, RegistryError> {
        self.byok_mut()?
            .route_mut()
            .ok_or(RegistryError::ByokNotConfigured)
    }

    /// Switch BYOK routing on or off. Enabling an unconfigured aggregator
    /// starts with an empty upstream list and fallback-to-shared allowed.
    pub fn set_byok_enabled(&mut self, enabled: bool) -> Result<(), RegistryError> {
        let state = self.byok_mut()?;
        let route = match std::mem::take(state) {
            ByokState::Unconfigured => ByokRoute {
                allow_fallback_to_shared: true,
                ..Default::default()
            },
            ByokState::Disabled(route) | ByokState::Enabled(route) => route,
        };
        *state = if enabled {
            ByokState::Enabled(route)
        } else {
            ByokState::Disabled(route)
        };
        Ok(())
    }

    /// Append an upstream with its model slug.
    pub fn add_byok_upstream(&mut self, upstream: &str, model: &str) -> Result<(), RegistryError> {
        let route = self.byok_route_mut()?;
        if route.contains(upstream) {
            return Err(RegistryError::UpstreamExists(upstream.to_string()));
        }
        route.order.push(upstream.to_string());
        route
            .model_overrides
            .insert(normalize_provider_key(upstream), model.to_string());
        Ok(())
    }

    /// Remove an upstream and its model override.
    pub fn remove_byok_upstream(&mut self, upstream: &str) -> Result<(), RegistryError> {
        let route = self.byok_route_mut()?;
        if !route.contains(upstream) {
            return Err(RegistryError::UpstreamMissing(upstream.to_string()));
        }
        route.order.retain(|p| p != upstream);
        route.model_overrides.remove(&normalize_provider_key(upstream));
        Ok(())
    }

    /// Replace the upstream order. Every name must already be listed.
    pub fn set_byok_order(&mut self, order: &[String]) -> Result<(), RegistryError> {
        let route = self.byok_route_mut()?;
        if let Some(missing) = order.iter().find(|name| !route.contains(name)) {
            return Err(RegistryError::UpstreamMissing(missing.clone()));
        }
        route.order = order.to_vec();
        Ok(())
    }

    pub fn set_byok_model(&mut self, upstream: &str, model: &str) -> Result<(), RegistryError> {
        let route = self.byok_route_mut()?;
        if !route.contains(upstream) {
            return Err(RegistryError::UpstreamMissing(upstream.to_string()));
        }
        route
            .model_overrides
            .insert(normalize_provider_key(upstream), model.to_string());
        Ok(())
    }

    pub fn set_byok_fallback(&mut self, allow: bool) -> Result<(), RegistryError> {
        self.byok_route_mut()?.allow_fallback_to_shared = allow;
        Ok(())
    }
}

/// Normalize an upstream vendor name into a model-override key:
/// lowercase, spaces and hyphens become `_`, anything else outside
/// `[a-z0-9_]` is dropped.
pub fn normalize_provider_key(name: &str) -> String {
    name.to_lowercase()
        .chars()
        .map(|c| if c == ' ' || c == '-' { '_' } else { c })
        .filter(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || *c == '_')
        .collect()
}

// ── Sharing ────────────────────────────────────────────────────────

/// A registry shared between concurrent dispatchers.
///
/// Readers take a [`snapshot`](Self::snapshot) at the start of a dispatch;
/// writers go through [`update`](Self::update).
#[derive(Clone, Default)]
pub struct SharedRegistry(Arc<RwLock<ProviderRegistry>>);

impl SharedRegistry {
    pub fn new(registry: ProviderRegistry) -> Self {
        Self(Arc::new(RwLock::new(registry)))
    }

    pub fn snapshot(&self) -> ProviderRegistry {
        self.0.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn update<T>(&self, f: impl FnOnce(&mut ProviderRegistry) -> T) -> T {
        let mut guard = self.0.write().unwrap_or_else(|e| e.into_inner());
        f(&mut guard)
    }
}
