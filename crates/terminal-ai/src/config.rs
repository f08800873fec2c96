//! Provider configuration file and environment resolution.
//!
//! Policies live in `~/.config/terminal-ai/providers.json`. Identities are
//! never persisted: endpoints, models and credentials are read from the
//! environment each time the registry is built, with an optional `gopass`
//! lookup for secrets.

use crate::api::retry::RetryPolicy;
use crate::registry::{
    ByokRoute, ByokState, ProviderIdentity, ProviderPolicy, ProviderRegistry,
};
use crate::{AGGREGATOR_PROVIDER, default_endpoint, default_model};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;
use tracing::{debug, warn};

const CONFIG_DIR: &str = "terminal-ai";
const PROVIDERS_FILE: &str = "providers.json";
const GOPASS_PREFIX: &str = "gopass:";

/// `~/.config/terminal-ai/providers.json`.
pub fn providers_path() -> Result<PathBuf, String> {
    let home = dirs::home_dir().ok_or_else(|| "failed to locate home directory".to_string())?;
    Ok(home.join(".config").join(CONFIG_DIR).join(PROVIDERS_FILE))
}

/// Whether replies stream by default. Only `STREAMING=false` turns it off.
pub fn streaming_default(env: &dyn SecretSource) -> bool {
    env.var("STREAMING").as_deref() != Some("false")
}

// ── File format ────────────────────────────────────────────────────

/// Upstream routing stored on the aggregator's entry.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ByokConfigEntry {
    pub enabled: bool,
    pub provider_order: Vec<String>,
    pub allow_fallback_to_shared: bool,
    /// Normalized upstream name to model slug.
    pub models: BTreeMap<String, String>,
}

impl From<&ByokConfigEntry> for ByokState {
    fn from(entry: &ByokConfigEntry) -> Self {
        let route = ByokRoute {
            order: entry.provider_order.clone(),
            model_overrides: entry.models.clone(),
            allow_fallback_to_shared: entry.allow_fallback_to_shared,
        };
        if entry.enabled {
            ByokState::Enabled(route)
        } else {
            ByokState::Disabled(route)
        }
    }
}

impl ByokConfigEntry {
    fn from_state(state: &ByokState) -> Option<Self> {
        let route = state.route()?;
        Some(Self {
            enabled: state.is_enabled(),
            provider_order: route.order.clone(),
            allow_fallback_to_shared: route.allow_fallback_to_shared,
            models: route.model_overrides.clone(),
        })
    }
}

/// One provider's persisted policy and where to find its identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderEntry {
    pub priority: i32,
    pub enabled: bool,
    pub max_retries: u32,
    pub gopass_key: String,
    pub env_key: String,
    pub endpoint_key: String,
    pub model_key: String,
    pub byok: bool,
    pub description: String,
    /// Fallback endpoint when `endpoint_key` is unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    /// Fallback model when `model_key` is unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub byok_config: Option<ByokConfigEntry>,
}

impl Default for ProviderEntry {
    fn default() -> Self {
        let policy = ProviderPolicy::default();
        Self {
            priority: policy.priority,
            enabled: policy.enabled,
            max_retries: policy.max_retries,
            gopass_key: String::new(),
            env_key: String::new(),
            endpoint_key: String::new(),
            model_key: String::new(),
            byok: false,
            description: String::new(),
            endpoint: None,
            model: None,
            byok_config: None,
        }
    }
}

impl ProviderEntry {
    /// An entry with the conventional `<NAME>_API_KEY` style variable names.
    pub fn for_provider(name: &str, priority: i32) -> Self {
        let upper = name.to_uppercase();
        Self {
            priority,
            gopass_key: format!("{CONFIG_DIR}/{name}_api_key"),
            env_key: format!("{upper}_API_KEY"),
            endpoint_key: format!("{upper}_ENDPOINT"),
            model_key: format!("{upper}_MODEL"),
            ..Default::default()
        }
    }

    fn policy(&self) -> ProviderPolicy {
        ProviderPolicy {
            priority: self.priority,
            enabled: self.enabled,
            max_retries: self.max_retries,
            byok: self
                .byok_config
                .as_ref()
                .map(ByokState::from)
                .unwrap_or_default(),
        }
    }

    fn key_or_default(key: &str, name: &str, suffix: &str) -> String {
        if key.is_empty() {
            format!("{}_{suffix}", name.to_uppercase())
        } else {
            key.to_string()
        }
    }
}

/// The contents of `providers.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderConfigFile {
    pub default_provider: String,
    pub fallback_enabled: bool,
    /// Kept for compatibility with existing files; per-provider
    /// `max_retries` is what bounds retries.
    pub retry_attempts: u32,
    pub retry_delay_ms: u64,
    pub providers: BTreeMap<String, ProviderEntry>,
}

impl Default for ProviderConfigFile {
    fn default() -> Self {
        let providers = [("openrouter", 1), ("gemini", 2), ("groq", 3)]
            .into_iter()
            .map(|(name, priority)| (name.to_string(), ProviderEntry::for_provider(name, priority)))
            .collect();
        Self {
            default_provider: AGGREGATOR_PROVIDER.to_string(),
            fallback_enabled: true,
            retry_attempts: 3,
            retry_delay_ms: 1000,
            providers,
        }
    }
}

impl ProviderConfigFile {
    /// Read the file at `path`, writing the default configuration first if
    /// it does not exist.
    pub fn load_or_create(path: &Path) -> Result<Self, String> {
        if !path.exists() {
            let file = Self::default();
            file.save(path)?;
            debug!("Wrote default provider config to {}", path.display());
            return Ok(file);
        }
        Self::load(path)
    }

    pub fn load(path: &Path) -> Result<Self, String> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| format!("failed to read {}: {e}", path.display()))?;
        serde_json::from_str(&text).map_err(|e| format!("failed to parse {}: {e}", path.display()))
    }

    /// Pretty-print to `path` via a temp file and rename.
    pub fn save(&self, path: &Path) -> Result<(), String> {
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)
                .map_err(|e| format!("failed to create {}: {e}", dir.display()))?;
        }
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| format!("failed to serialize provider config: {e}"))?;
        let tmp_path = path.with_extension("json.tmp");
        std::fs::write(&tmp_path, json)
            .map_err(|e| format!("failed to write {}: {e}", tmp_path.display()))?;
        std::fs::rename(&tmp_path, path)
            .map_err(|e| format!("failed to rename {}: {e}", tmp_path.display()))
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::fixed(Duration::from_millis(self.retry_delay_ms))
    }

    /// Build a registry, resolving identities from `env`.
    pub fn to_registry(&self, env: &dyn SecretSource) -> ProviderRegistry {
        let mut registry = ProviderRegistry::new();
        for (name, entry) in &self.providers {
            let identity = resolve_identity(name, entry, env);
            if !identity.has_credential() {
                debug!("{name}: no credential resolved");
            }
            registry.upsert(identity, entry.policy());
        }
        if !self.default_provider.is_empty()
            && let Err(e) = registry.set_default_provider(&self.default_provider)
        {
            warn!("Ignoring default provider: {e}");
        }
        registry
    }

    /// Write the registry's policies back into the file. Providers that are
    /// new to the file get conventional variable names and their current
    /// endpoint and model persisted as fallbacks.
    pub fn absorb(&mut self, registry: &ProviderRegistry) {
        for name in registry.names() {
            let (Some(identity), Some(policy)) = (registry.identity(name), registry.policy(name))
            else {
                continue;
            };
            let entry = self.providers.entry(name.to_string()).or_insert_with(|| {
                let mut entry = ProviderEntry::for_provider(name, policy.priority);
                entry.byok = true;
                entry.description = "Custom provider".to_string();
                entry.endpoint = Some(identity.endpoint.clone()).filter(|e| !e.is_empty());
                entry.model = Some(identity.model.clone()).filter(|m| !m.is_empty());
                entry
            });
            entry.priority = policy.priority;
            entry.enabled = policy.enabled;
            entry.max_retries = policy.max_retries;
            entry.byok_config = ByokConfigEntry::from_state(&policy.byok);
        }
        if let Some(default) = registry.default_provider() {
            self.default_provider = default.to_string();
        }
    }
}

fn resolve_identity(name: &str, entry: &ProviderEntry, env: &dyn SecretSource) -> ProviderIdentity {
    let env_key = ProviderEntry::key_or_default(&entry.env_key, name, "API_KEY");
    let endpoint_key = ProviderEntry::key_or_default(&entry.endpoint_key, name, "ENDPOINT");
    let model_key = ProviderEntry::key_or_default(&entry.model_key, name, "MODEL");

    let endpoint = env
        .var(&endpoint_key)
        .filter(|v| !v.is_empty())
        .or_else(|| entry.endpoint.clone())
        .or_else(|| default_endpoint(name).map(str::to_string))
        .unwrap_or_default();
    let model = env
        .var(&model_key)
        .filter(|v| !v.is_empty())
        .or_else(|| entry.model.clone())
        .or_else(|| default_model(name).map(str::to_string))
        .unwrap_or_default();
    let credential = resolve_secret(env, &env_key, &entry.gopass_key);

    ProviderIdentity::new(name, endpoint, model, credential)
}

// ── Secrets ────────────────────────────────────────────────────────

/// Where environment values and `gopass` secrets come from.
pub trait SecretSource {
    fn var(&self, key: &str) -> Option<String>;

    /// Look up a secret in the password store.
    fn gopass(&self, path: &str) -> Option<String>;

    /// `USE_GOPASS=true` enables the per-provider `gopass_key` fallback.
    fn use_gopass(&self) -> bool {
        self.var("USE_GOPASS").as_deref() == Some("true")
    }
}

/// Resolve a credential. A plain value wins; a `gopass:<path>` value is
/// looked up; otherwise `gopass_key` is tried when enabled. Any failure
/// yields an empty credential.
pub fn resolve_secret(env: &dyn SecretSource, env_key: &str, gopass_key: &str) -> String {
    let value = env.var(env_key).unwrap_or_default();
    if let Some(path) = value.strip_prefix(GOPASS_PREFIX) {
        if let Some(secret) = env.gopass(path) {
            return secret;
        }
    } else if !value.is_empty() {
        return value;
    }

    if env.use_gopass()
        && !gopass_key.is_empty()
        && let Some(secret) = env.gopass(gopass_key)
    {
        return secret;
    }
    String::new()
}

/// The real process environment and the `gopass` binary.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessEnv;

impl ProcessEnv {
    pub fn from_env() -> Self {
        Self
    }
}

impl SecretSource for ProcessEnv {
    fn var(&self, key: &str) -> Option<String> {
        std::env::var(key).ok()
    }

    fn gopass(&self, path: &str) -> Option<String> {
        let output = match Command::new("gopass").args(["show", path]).output() {
            Ok(output) => output,
            Err(e) => {
                debug!("gopass unavailable: {e}");
                return None;
            }
        };
        if !output.status.success() {
            debug!("gopass show {path} exited with {}", output.status);
            return None;
        }
        let secret = String::from_utf8_lossy(&output.stdout).trim().to_string();
        Some(secret).filter(|s| !s.is_empty())
    }
}

/// A fixed set of variables and secrets.
#[derive(Debug, Clone, Default)]
pub struct StaticEnv {
    vars: HashMap<String, String>,
    secrets: HashMap<String, String>,
}

impl StaticEnv {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_var(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.vars.insert(key.into(), value.into());
        self
    }

    pub fn with_secret(mut self, path: impl Into<String>, value: impl Into<String>) -> Self {
        self.secrets.insert(path.into(), value.into());
        self
    }
}

impl SecretSource for StaticEnv {
    fn var(&self, key: &str) -> Option<String> {
        self.vars.get(key).cloned()
    }

    fn gopass(&self, path: &str) -> Option<String> {
        self.secrets.get(path).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::RoutingMode;
    use crate::{GEMINI_URL, OPENROUTER_URL};

    #[test]
    fn default_file_matches_stock_providers() {
        let file = ProviderConfigFile::default();
        assert_eq!(file.default_provider, "openrouter");
        assert!(file.fallback_enabled);
        assert_eq!(file.retry_delay_ms, 1000);
        let groq = &file.providers["groq"];
        assert_eq!(groq.priority, 3);
        assert_eq!(groq.max_retries, 2);
        assert_eq!(groq.env_key, "GROQ_API_KEY");
        assert_eq!(groq.gopass_key, "terminal-ai/groq_api_key");
    }

    #[test]
    fn load_or_create_writes_default_then_reads_it_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("providers.json");

        let created = ProviderConfigFile::load_or_create(&path).unwrap();
        assert!(path.exists());
        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.contains("\n  \"default_provider\""));
        assert!(!text.contains("byok_config"));

        let loaded = ProviderConfigFile::load_or_create(&path).unwrap();
        assert_eq!(created, loaded);
    }

    #[test]
    fn partial_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("providers.json");
        std::fs::write(
            &path,
            r#"{"providers": {"custom": {"priority": 0, "unknown_field": 1}}}"#,
        )
        .unwrap();
        let file = ProviderConfigFile::load(&path).unwrap();
        let custom = &file.providers["custom"];
        assert_eq!(custom.priority, 0);
        assert!(custom.enabled);
        assert_eq!(custom.max_retries, 2);
        assert_eq!(file.retry_delay_ms, 1000);
    }

    #[test]
    fn malformed_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("providers.json");
        std::fs::write(&path, "{not json").unwrap();
        let err = ProviderConfigFile::load(&path).unwrap_err();
        assert!(err.starts_with("failed to parse"));
    }

    #[test]
    fn registry_uses_env_then_builtin_defaults() {
        let env = StaticEnv::new()
            .with_var("OPENROUTER_API_KEY", "sk-or")
            .with_var("GEMINI_API_KEY", "g-key")
            .with_var("GEMINI_MODEL", "gemini-2.5-pro");
        let registry = ProviderConfigFile::default().to_registry(&env);

        let openrouter = registry.identity("openrouter").unwrap();
        assert_eq!(openrouter.endpoint, OPENROUTER_URL);
        assert_eq!(openrouter.credential, "sk-or");

        let gemini = registry.identity("gemini").unwrap();
        assert_eq!(gemini.endpoint, GEMINI_URL);
        assert_eq!(gemini.model, "gemini-2.5-pro");

        assert!(!registry.identity("groq").unwrap().has_credential());
        assert_eq!(registry.default_provider(), Some("openrouter"));
        assert_eq!(registry.resolve_order(), vec!["openrouter", "gemini", "groq"]);
    }

    #[test]
    fn gopass_prefix_and_fallback() {
        let env = StaticEnv::new()
            .with_var("OPENROUTER_API_KEY", "gopass:personal/openrouter")
            .with_secret("personal/openrouter", "from-store");
        assert_eq!(resolve_secret(&env, "OPENROUTER_API_KEY", ""), "from-store");

        // Fallback key only consulted with USE_GOPASS=true.
        let env = StaticEnv::new().with_secret("terminal-ai/groq_api_key", "groq-secret");
        assert_eq!(resolve_secret(&env, "GROQ_API_KEY", "terminal-ai/groq_api_key"), "");
        let env = env.with_var("USE_GOPASS", "true");
        assert_eq!(
            resolve_secret(&env, "GROQ_API_KEY", "terminal-ai/groq_api_key"),
            "groq-secret"
        );
    }

    #[test]
    fn failed_gopass_lookup_yields_empty_credential() {
        let env = StaticEnv::new().with_var("GROQ_API_KEY", "gopass:missing/path");
        assert_eq!(resolve_secret(&env, "GROQ_API_KEY", ""), "");
    }

    #[test]
    fn streaming_only_disabled_by_explicit_false() {
        assert!(streaming_default(&StaticEnv::new()));
        assert!(streaming_default(&StaticEnv::new().with_var("STREAMING", "0")));
        assert!(!streaming_default(&StaticEnv::new().with_var("STREAMING", "false")));
    }

    #[test]
    fn byok_config_becomes_routing_mode() {
        let mut file = ProviderConfigFile::default();
        file.providers.get_mut("openrouter").unwrap().byok_config = Some(ByokConfigEntry {
            enabled: true,
            provider_order: vec!["Cerebras".into(), "Groq".into()],
            allow_fallback_to_shared: false,
            models: BTreeMap::from([("cerebras".into(), "cerebras/llama-3.1-8b".into())]),
        });
        let registry = file.to_registry(&StaticEnv::new());
        let RoutingMode::AggregatedWithOrder(route) = registry.routing_for("openrouter") else {
            panic!("expected BYOK routing");
        };
        assert_eq!(route.order, vec!["Cerebras", "Groq"]);
        assert_eq!(route.model_for("Cerebras"), Some("cerebras/llama-3.1-8b"));
        assert!(!route.allow_fallback_to_shared);
    }

    #[test]
    fn absorb_persists_policy_changes_and_new_providers() {
        let mut file = ProviderConfigFile::default();
        let mut registry = file.to_registry(&StaticEnv::new());
        registry.set_priority("groq", 0).unwrap();
        registry.set_enabled("gemini", false).unwrap();
        registry.set_byok_enabled(true).unwrap();
        registry.upsert(
            ProviderIdentity::new("local", "http://localhost:8080/v1/chat/completions", "qwen", ""),
            ProviderPolicy::with_priority(5),
        );
        registry.set_default_provider("groq").unwrap();

        file.absorb(&registry);

        assert_eq!(file.providers["groq"].priority, 0);
        assert!(!file.providers["gemini"].enabled);
        let byok = file.providers["openrouter"].byok_config.as_ref().unwrap();
        assert!(byok.enabled && byok.allow_fallback_to_shared);
        let local = &file.providers["local"];
        assert_eq!(local.env_key, "LOCAL_API_KEY");
        assert_eq!(local.model.as_deref(), Some("qwen"));
        assert_eq!(file.default_provider, "groq");

        // The stored fallbacks feed the next registry build.
        let rebuilt = file.to_registry(&StaticEnv::new());
        assert_eq!(
            rebuilt.identity("local").unwrap().endpoint,
            "http://localhost:8080/v1/chat/completions"
        );
    }
}
