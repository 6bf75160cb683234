//! Model pricing table.
//!
//! Prices are USD per 1000 tokens, configured per provider and model. A `*`
//! model entry is the provider's wildcard, used for local or unknown models
//! (typically zero).

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::chat::Usage;
use crate::routing::accounts::Provider;

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct ModelPrice {
    /// USD per 1k prompt tokens.
    pub input: f64,
    /// USD per 1k completion tokens.
    pub output: f64,
}

impl ModelPrice {
    pub fn cost(&self, usage: &Usage) -> f64 {
        usage.input_tokens as f64 * self.input / 1000.0
            + usage.output_tokens as f64 * self.output / 1000.0
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PricingTable {
    providers: HashMap<String, HashMap<String, ModelPrice>>,
}

impl PricingTable {
    pub fn new(providers: HashMap<String, HashMap<String, ModelPrice>>) -> Self {
        PricingTable { providers }
    }

    /// Exact model entry, falling back to the provider's `*` wildcard.
    pub fn price_for(&self, provider: Provider, model: &str) -> Option<ModelPrice> {
        let models = self.providers.get(provider.as_str())?;
        models
            .get(model)
            .or_else(|| models.get("*"))
            .copied()
    }

    /// Cost of one exchange; unpriced models are treated as free.
    pub fn cost(&self, provider: Provider, model: &str, usage: &Usage) -> f64 {
        self.price_for(provider, model)
            .map(|p| p.cost(usage))
            .unwrap_or(0.0)
    }
}
