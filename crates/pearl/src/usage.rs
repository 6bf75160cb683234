//! Usage recording and cost accounting.
//!
//! A record is written exactly when a terminal chunk with usage was
//! delivered to the caller; the recorder also applies the cost to the
//! serving account's monthly counter. The log is append-only.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

use crate::chat::Usage;
use crate::pricing::PricingTable;
use crate::routing::accounts::{AccountRegistry, Provider};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageRecord {
    pub id: String,
    pub account_id: String,
    pub agent_id: Option<String>,
    pub provider: Provider,
    pub model: String,
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
    pub cost_usd: f64,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

pub struct UsageRecorder {
    pricing: PricingTable,
    registry: Arc<AccountRegistry>,
    records: RwLock<Vec<UsageRecord>>,
}

impl UsageRecorder {
    pub fn new(pricing: PricingTable, registry: Arc<AccountRegistry>) -> Self {
        UsageRecorder {
            pricing,
            registry,
            records: RwLock::new(Vec::new()),
        }
    }

    /// Append one record and charge the account.
    pub fn record(
        &self,
        account_id: &str,
        provider: Provider,
        model: &str,
        usage: &Usage,
        agent_id: Option<&str>,
        metadata: HashMap<String, String>,
    ) -> UsageRecord {
        let cost_usd = self.pricing.cost(provider, model, usage);
        let record = UsageRecord {
            id: Uuid::new_v4().to_string(),
            account_id: account_id.to_string(),
            agent_id: agent_id.map(str::to_string),
            provider,
            model: model.to_string(),
            prompt_tokens: usage.input_tokens,
            completion_tokens: usage.output_tokens,
            total_tokens: usage.total(),
            cost_usd,
            timestamp: Utc::now(),
            metadata,
        };

        self.registry.add_usage(account_id, cost_usd);
        self.records.write().push(record.clone());
        record
    }

    pub fn records(&self) -> Vec<UsageRecord> {
        self.records.read().clone()
    }

    pub fn records_for_account(&self, account_id: &str) -> Vec<UsageRecord> {
        self.records
            .read()
            .iter()
            .filter(|r| r.account_id == account_id)
            .cloned()
            .collect()
    }

    pub fn total_cost_for_account(&self, account_id: &str) -> f64 {
        self.records
            .read()
            .iter()
            .filter(|r| r.account_id == account_id)
            .map(|r| r.cost_usd)
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::routing::accounts::{Account, AuthKind};

    fn registry() -> Arc<AccountRegistry> {
        Arc::new(AccountRegistry::new(vec![Account {
            id: "a".to_string(),
            provider: Provider::Anthropic,
            auth: AuthKind::ApiKey,
            credential: "k".to_string(),
            credential_env: None,
            base_url: None,
            default_model: None,
            budget_monthly_usd: Some(100.0),
            usage_current_month_usd: 0.0,
            enabled: true,
            last_used_at: None,
        }]))
    }

    fn pricing() -> PricingTable {
        serde_yaml::from_str(
            r#"
anthropic:
  claude-sonnet-4: { input: 0.003, output: 0.015 }
"#,
        )
        .unwrap()
    }

    #[test]
    fn record_charges_account() {
        let registry = registry();
        let recorder = UsageRecorder::new(pricing(), registry.clone());

        let usage = Usage {
            input_tokens: 1000,
            output_tokens: 2000,
        };
        let record = recorder.record(
            "a",
            Provider::Anthropic,
            "claude-sonnet-4",
            &usage,
            Some("agent-1"),
            HashMap::new(),
        );

        assert!((record.cost_usd - 0.033).abs() < 1e-9);
        assert_eq!(record.total_tokens, 3000);
        let account = registry.get("a").unwrap();
        assert!((account.usage_current_month_usd - 0.033).abs() < 1e-9);
    }

    #[test]
    fn monthly_counter_equals_sum_of_records() {
        let registry = registry();
        let recorder = UsageRecorder::new(pricing(), registry.clone());
        let usage = Usage {
            input_tokens: 500,
            output_tokens: 500,
        };
        for _ in 0..5 {
            recorder.record(
                "a",
                Provider::Anthropic,
                "claude-sonnet-4",
                &usage,
                None,
                HashMap::new(),
            );
        }

        let total: f64 = recorder.total_cost_for_account("a");
        let account = registry.get("a").unwrap();
        assert!((account.usage_current_month_usd - total).abs() < 1e-9);
        assert_eq!(recorder.records_for_account("a").len(), 5);
    }
}
