//! Account routing: rule evaluation plus budget enforcement.

use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::chat::RequestMetadata;
use crate::classify::Classification;
use crate::error::GatewayError;
use crate::routing::accounts::{Account, AccountRegistry};
use crate::routing::rules::RuleEngine;

/// Budget behaviour, from config.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct RouteOptions {
    /// Check monthly budgets before selecting an account.
    pub respect_budget: bool,
    /// Fail instead of serving from an over-budget account with no fallback.
    pub strict: bool,
}

impl Default for RouteOptions {
    fn default() -> Self {
        RouteOptions {
            respect_budget: true,
            strict: false,
        }
    }
}

/// Outcome of a routing decision.
#[derive(Debug, Clone)]
pub struct RoutingResult {
    pub account: Account,
    /// Fully qualified model (`<provider>/<name>`).
    pub model: String,
    /// Name of the rule that decided the route (synthetic `fallback-default`
    /// when no configured rule matched).
    pub rule: String,
    /// Fallback account id declared by the rule, for the dispatch layer.
    pub fallback: Option<String>,
    pub reason: String,
    pub warning: Option<String>,
}

pub struct AccountRouter {
    engine: RuleEngine,
    registry: Arc<AccountRegistry>,
    options: RouteOptions,
}

impl AccountRouter {
    pub fn new(engine: RuleEngine, registry: Arc<AccountRegistry>, options: RouteOptions) -> Self {
        AccountRouter {
            engine,
            registry,
            options,
        }
    }

    pub fn registry(&self) -> &Arc<AccountRegistry> {
        &self.registry
    }

    pub fn engine(&self) -> &RuleEngine {
        &self.engine
    }

    /// Pick the account and model for a classified request.
    pub fn route(
        &self,
        classification: &Classification,
        metadata: &RequestMetadata,
        requested_model: &str,
    ) -> Result<RoutingResult, GatewayError> {
        let (rule_name, account_id, rule_model, fallback) =
            match self.engine.find_matching(classification, metadata) {
                Some(rule) => (
                    rule.name.clone(),
                    rule.account.clone(),
                    rule.model.clone(),
                    rule.fallback.clone(),
                ),
                // Unreachable with a validated ruleset; still route somewhere
                // deterministic rather than failing the request.
                None => {
                    let default = self.engine.default_rule().ok_or_else(|| {
                        GatewayError::Internal("ruleset has no default rule".to_string())
                    })?;
                    (
                        "fallback-default".to_string(),
                        default.account.clone(),
                        default.model.clone(),
                        default.fallback.clone(),
                    )
                }
            };

        let account = self.registry.get(&account_id).ok_or_else(|| {
            GatewayError::Internal(format!("rule '{rule_name}' targets unknown account '{account_id}'"))
        })?;
        if !account.enabled {
            return self.reroute_disabled(&rule_name, &account, fallback, rule_model, requested_model);
        }

        let mut reason = format!("matched rule '{rule_name}'");
        let mut warning = None;
        let mut chosen = account;

        if self.options.respect_budget && chosen.over_budget() {
            let fallback_account = fallback
                .as_deref()
                .and_then(|id| self.registry.get(id))
                .filter(|a| a.enabled && !a.over_budget());

            match fallback_account {
                Some(fb) => {
                    debug!(
                        "account '{}' over budget, routing to fallback '{}'",
                        chosen.id, fb.id
                    );
                    reason = "primary over budget".to_string();
                    chosen = fb;
                }
                None if self.options.strict => {
                    return Err(GatewayError::BudgetExhausted(format!(
                        "account '{}' exceeded its monthly budget",
                        chosen.id
                    )));
                }
                None => {
                    warn!("account '{}' over budget, no usable fallback", chosen.id);
                    warning = Some("over budget".to_string());
                }
            }
        }

        if warning.is_none()
            && let Some(ratio) = chosen.budget_ratio()
            && ratio > 0.80
            && ratio < 1.0
        {
            warning = Some("approaching budget".to_string());
        }

        let model = resolve_model(&chosen, rule_model.as_deref(), requested_model)?;
        self.registry.mark_used(&chosen.id);

        Ok(RoutingResult {
            account: chosen,
            model,
            rule: rule_name,
            fallback,
            reason,
            warning,
        })
    }

    /// The account the dispatcher should fail over to, if the routing result
    /// named one and it is still usable.
    pub fn fallback_account(&self, result: &RoutingResult) -> Option<Account> {
        let id = result.fallback.as_deref()?;
        if id == result.account.id {
            return None;
        }
        self.registry
            .get(id)
            .filter(|a| a.enabled && !(self.options.respect_budget && a.over_budget()))
    }

    fn reroute_disabled(
        &self,
        rule_name: &str,
        primary: &Account,
        fallback: Option<String>,
        rule_model: Option<String>,
        requested_model: &str,
    ) -> Result<RoutingResult, GatewayError> {
        let fb = fallback
            .as_deref()
            .and_then(|id| self.registry.get(id))
            .filter(|a| a.enabled)
            .ok_or_else(|| {
                GatewayError::Internal(format!(
                    "rule '{rule_name}' targets disabled account '{}' and has no enabled fallback",
                    primary.id
                ))
            })?;
        let model = resolve_model(&fb, rule_model.as_deref(), requested_model)?;
        self.registry.mark_used(&fb.id);
        Ok(RoutingResult {
            account: fb,
            model,
            rule: rule_name.to_string(),
            fallback: None,
            reason: "primary disabled".to_string(),
            warning: None,
        })
    }
}

/// Model resolution order: rule override, then a provider-qualified request
/// model, then the account default.
pub(crate) fn resolve_model(
    account: &Account,
    rule_model: Option<&str>,
    requested: &str,
) -> Result<String, GatewayError> {
    if let Some(model) = rule_model {
        return Ok(model.to_string());
    }
    if requested.contains('/') {
        return Ok(requested.to_string());
    }
    account
        .default_model
        .clone()
        .ok_or_else(|| {
            GatewayError::InvalidRequest(format!(
                "no model for account '{}': request a '<provider>/<model>' or configure a default",
                account.id
            ))
        })
}
