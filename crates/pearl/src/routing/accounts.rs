//! Backend account registry.
//!
//! Accounts are created once at startup from config and shared across all
//! requests. The registry is read-heavy; the only mutations are the usage
//! counter (updated by the usage recorder), the `last_used_at` stamp, and
//! the month rollover that resets the counter when the calendar month
//! changes.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use url::Url;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    Anthropic,
    Openai,
    Ollama,
}

impl Provider {
    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::Anthropic => "anthropic",
            Provider::Openai => "openai",
            Provider::Ollama => "ollama",
        }
    }

    pub fn parse(s: &str) -> Option<Provider> {
        match s {
            "anthropic" => Some(Provider::Anthropic),
            "openai" => Some(Provider::Openai),
            "ollama" => Some(Provider::Ollama),
            _ => None,
        }
    }
}

impl std::fmt::Display for Provider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthKind {
    #[default]
    #[serde(rename = "api_key", alias = "apikey")]
    ApiKey,
    Oauth,
}

fn default_enabled() -> bool {
    true
}

/// A configured backend account.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    pub id: String,
    pub provider: Provider,
    #[serde(default)]
    pub auth: AuthKind,
    /// API key or OAuth token. May be empty for local providers.
    #[serde(default)]
    pub credential: String,
    /// Environment variable to read the credential from when `credential`
    /// is empty.
    #[serde(default)]
    pub credential_env: Option<String>,
    #[serde(default)]
    pub base_url: Option<Url>,
    /// Model used when neither the rule nor the request names one.
    #[serde(default)]
    pub default_model: Option<String>,
    #[serde(default)]
    pub budget_monthly_usd: Option<f64>,
    #[serde(default)]
    pub usage_current_month_usd: f64,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub last_used_at: Option<DateTime<Utc>>,
}

impl Account {
    /// Resolve the credential, consulting `credential_env` when needed.
    pub fn resolved_credential(&self) -> String {
        if !self.credential.is_empty() {
            return self.credential.clone();
        }
        self.credential_env
            .as_deref()
            .and_then(|var| std::env::var(var).ok())
            .unwrap_or_default()
    }

    pub fn over_budget(&self) -> bool {
        match self.budget_monthly_usd {
            Some(budget) => self.usage_current_month_usd >= budget,
            None => false,
        }
    }

    pub fn budget_ratio(&self) -> Option<f64> {
        self.budget_monthly_usd
            .filter(|b| *b > 0.0)
            .map(|b| self.usage_current_month_usd / b)
    }
}

struct AccountState {
    account: Account,
    /// "%Y-%m" key of the month the usage counter belongs to.
    month: String,
}

fn month_key(now: DateTime<Utc>) -> String {
    now.format("%Y-%m").to_string()
}

/// Process-wide account store.
pub struct AccountRegistry {
    inner: RwLock<HashMap<String, AccountState>>,
}

impl AccountRegistry {
    pub fn new(accounts: Vec<Account>) -> Self {
        let month = month_key(Utc::now());
        let inner = accounts
            .into_iter()
            .map(|a| {
                (
                    a.id.clone(),
                    AccountState {
                        account: a,
                        month: month.clone(),
                    },
                )
            })
            .collect();
        AccountRegistry {
            inner: RwLock::new(inner),
        }
    }

    /// Snapshot of one account, with the month rollover applied.
    pub fn get(&self, id: &str) -> Option<Account> {
        self.rollover(id);
        self.inner.read().get(id).map(|s| s.account.clone())
    }

    pub fn ids(&self) -> Vec<String> {
        self.inner.read().keys().cloned().collect()
    }

    pub fn snapshot(&self) -> Vec<Account> {
        self.inner.read().values().map(|s| s.account.clone()).collect()
    }

    /// Add `cost_usd` to the account's monthly usage counter.
    pub fn add_usage(&self, id: &str, cost_usd: f64) {
        self.rollover(id);
        if let Some(state) = self.inner.write().get_mut(id) {
            state.account.usage_current_month_usd += cost_usd;
        }
    }

    pub fn mark_used(&self, id: &str) {
        if let Some(state) = self.inner.write().get_mut(id) {
            state.account.last_used_at = Some(Utc::now());
        }
    }

    pub fn set_enabled(&self, id: &str, enabled: bool) {
        if let Some(state) = self.inner.write().get_mut(id) {
            state.account.enabled = enabled;
        }
    }

    fn rollover(&self, id: &str) {
        let current = month_key(Utc::now());
        let mut inner = self.inner.write();
        if let Some(state) = inner.get_mut(id)
            && state.month != current
        {
            state.month = current;
            state.account.usage_current_month_usd = 0.0;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn account(id: &str, budget: Option<f64>, usage: f64) -> Account {
        Account {
            id: id.to_string(),
            provider: Provider::Anthropic,
            auth: AuthKind::ApiKey,
            credential: "sk-test".to_string(),
            credential_env: None,
            base_url: None,
            default_model: Some("anthropic/claude-sonnet-4".to_string()),
            budget_monthly_usd: budget,
            usage_current_month_usd: usage,
            enabled: true,
            last_used_at: None,
        }
    }

    #[test]
    fn usage_accumulates() {
        let registry = AccountRegistry::new(vec![account("a", Some(100.0), 0.0)]);
        registry.add_usage("a", 1.5);
        registry.add_usage("a", 2.5);
        let snap = registry.get("a").unwrap();
        assert!((snap.usage_current_month_usd - 4.0).abs() < 1e-9);
    }

    #[test]
    fn over_budget_detection() {
        assert!(account("a", Some(100.0), 110.0).over_budget());
        assert!(!account("a", Some(100.0), 99.0).over_budget());
        assert!(!account("a", None, 1e9).over_budget());
    }

    #[test]
    fn budget_ratio() {
        let a = account("a", Some(100.0), 85.0);
        assert!(a.budget_ratio().unwrap() > 0.8);
        assert!(account("a", None, 85.0).budget_ratio().is_none());
    }

    #[test]
    fn mark_used_stamps_account() {
        let registry = AccountRegistry::new(vec![account("a", None, 0.0)]);
        assert!(registry.get("a").unwrap().last_used_at.is_none());
        registry.mark_used("a");
        assert!(registry.get("a").unwrap().last_used_at.is_some());
    }

    #[test]
    fn config_account_deserializes_with_defaults() {
        let yaml = r#"
id: claude-main
provider: anthropic
credential_env: ANTHROPIC_API_KEY
budget_monthly_usd: 250
"#;
        let a: Account = serde_yaml::from_str(yaml).unwrap();
        assert!(a.enabled);
        assert_eq!(a.auth, AuthKind::ApiKey);
        assert_eq!(a.usage_current_month_usd, 0.0);
        assert_eq!(a.budget_monthly_usd, Some(250.0));
    }
}
