//! Gateway configuration.
//!
//! The service loads a YAML file into [`GatewayConfig`] at startup and
//! validates it before the pipeline is built; the core only ever sees a
//! validated config.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use url::Url;

use crate::detection::DetectionConfig;
use crate::dispatch::DispatchConfig;
use crate::error::GatewayError;
use crate::filter::FilterConfig;
use crate::memory::AugmentOptions;
use crate::pricing::PricingTable;
use crate::providers::split_model;
use crate::routing::accounts::Account;
use crate::routing::router::RouteOptions;
use crate::routing::rules::Rule;

fn default_bind_addr() -> String {
    "0.0.0.0:8080".to_string()
}
fn default_api_key_header() -> String {
    "x-api-key".to_string()
}
fn default_budget_http_status() -> u16 {
    402
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
    /// Shared-secret inbound key. When set, requests without it are refused
    /// fail-closed.
    pub api_key: Option<String>,
    #[serde(default = "default_api_key_header")]
    pub api_key_header: String,
    /// Status returned on strict budget exhaustion (402 or 503).
    #[serde(default = "default_budget_http_status")]
    pub budget_http_status: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            bind_addr: default_bind_addr(),
            api_key: None,
            api_key_header: default_api_key_header(),
            budget_http_status: default_budget_http_status(),
        }
    }
}

fn default_embedding_model() -> String {
    "text-embedding-3-small".to_string()
}
fn default_embedding_dimensions() -> usize {
    1536
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingConfig {
    pub base_url: Url,
    #[serde(default)]
    pub api_key: String,
    #[serde(default)]
    pub api_key_env: Option<String>,
    #[serde(default = "default_embedding_model")]
    pub model: String,
    #[serde(default = "default_embedding_dimensions")]
    pub dimensions: usize,
}

impl EmbeddingConfig {
    pub fn resolved_api_key(&self) -> String {
        if !self.api_key.is_empty() {
            return self.api_key.clone();
        }
        self.api_key_env
            .as_deref()
            .and_then(|var| std::env::var(var).ok())
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    pub enabled: bool,
    #[serde(flatten)]
    pub augment: AugmentOptions,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub server: ServerConfig,
    pub accounts: Vec<Account>,
    pub rules: Vec<Rule>,
    pub routing: RouteOptions,
    pub pricing: PricingTable,
    pub detection: DetectionConfig,
    pub memory: MemoryConfig,
    pub embedding: Option<EmbeddingConfig>,
    pub dispatch: DispatchConfig,
    pub filter: FilterConfig,
    pub transcript_dir: Option<PathBuf>,
}

impl GatewayConfig {
    pub fn from_yaml_str(yaml: &str) -> Result<Self, GatewayError> {
        let config: GatewayConfig = serde_yaml::from_str(yaml)
            .map_err(|e| GatewayError::InvalidRequest(format!("config parse error: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self, GatewayError> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            GatewayError::InvalidRequest(format!("cannot read config {}: {e}", path.display()))
        })?;
        Self::from_yaml_str(&raw)
    }

    /// Startup validation; the pipeline assumes these all hold.
    pub fn validate(&self) -> Result<(), GatewayError> {
        let invalid = |msg: String| Err(GatewayError::InvalidRequest(msg));

        if self.accounts.is_empty() {
            return invalid("config declares no accounts".to_string());
        }
        let mut account_ids = HashSet::new();
        for account in &self.accounts {
            if !account_ids.insert(account.id.as_str()) {
                return invalid(format!("duplicate account id '{}'", account.id));
            }
            if let Some(model) = &account.default_model {
                split_model(model).map_err(|e| {
                    GatewayError::InvalidRequest(format!(
                        "account '{}' default_model: {e}",
                        account.id
                    ))
                })?;
            }
            if let Some(budget) = account.budget_monthly_usd
                && budget < 0.0
            {
                return invalid(format!("account '{}' has a negative budget", account.id));
            }
        }

        if self.rules.is_empty() {
            return invalid("config declares no rules".to_string());
        }
        let defaults: Vec<&Rule> = self.rules.iter().filter(|r| r.conditions.default).collect();
        if defaults.len() != 1 {
            return invalid(format!(
                "exactly one rule must set default: true (found {})",
                defaults.len()
            ));
        }

        let mut rule_names = HashSet::new();
        for rule in &self.rules {
            if !rule_names.insert(rule.name.as_str()) {
                return invalid(format!("duplicate rule name '{}'", rule.name));
            }
            if !account_ids.contains(rule.account.as_str()) {
                return invalid(format!(
                    "rule '{}' targets unknown account '{}'",
                    rule.name, rule.account
                ));
            }
            if let Some(fallback) = &rule.fallback
                && !account_ids.contains(fallback.as_str())
            {
                return invalid(format!(
                    "rule '{}' names unknown fallback account '{fallback}'",
                    rule.name
                ));
            }
            if let Some(model) = &rule.model {
                split_model(model).map_err(|e| {
                    GatewayError::InvalidRequest(format!("rule '{}' model: {e}", rule.name))
                })?;
            }
        }

        // The default route must actually be servable.
        let default_rule = defaults[0];
        let default_account = self
            .accounts
            .iter()
            .find(|a| a.id == default_rule.account)
            .expect("checked above");
        if !default_account.enabled {
            return invalid(format!(
                "default rule '{}' targets disabled account '{}'",
                default_rule.name, default_account.id
            ));
        }

        if let Some(screen_account) = &self.detection.llm_account
            && !account_ids.contains(screen_account.as_str())
        {
            return invalid(format!(
                "detection.llm_account names unknown account '{screen_account}'"
            ));
        }

        if self.memory.enabled && self.embedding.is_none() {
            return invalid("memory augmentation is enabled but no embedding service is configured".to_string());
        }

        match self.server.budget_http_status {
            402 | 503 => {}
            other => {
                return invalid(format!(
                    "server.budget_http_status must be 402 or 503, not {other}"
                ));
            }
        }

        Ok(())
    }
}
