//! Emergency bypass tokens.
//!
//! A live bypass token lets a request through the detector unconditionally.
//! Tokens are configured with an expiry, a use ceiling and an optional user
//! allowlist; every accepted use is counted and logged.

use chrono::{DateTime, Utc};
use log::warn;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BypassToken {
    pub token: String,
    pub valid_until: DateTime<Utc>,
    pub max_uses: u32,
    /// Empty means any user may present the token.
    #[serde(default)]
    pub allowed_users: Vec<String>,
}

pub struct BypassRegistry {
    tokens: Vec<BypassToken>,
    uses: Mutex<HashMap<String, u32>>,
}

impl BypassRegistry {
    pub fn new(tokens: Vec<BypassToken>) -> Self {
        BypassRegistry {
            tokens,
            uses: Mutex::new(HashMap::new()),
        }
    }

    /// Accept `presented` for `user` if a live token matches. Counts the use.
    pub fn try_use(&self, presented: &str, user: Option<&str>) -> bool {
        self.try_use_at(presented, user, Utc::now())
    }

    fn try_use_at(&self, presented: &str, user: Option<&str>, now: DateTime<Utc>) -> bool {
        let Some(token) = self.tokens.iter().find(|t| t.token == presented) else {
            return false;
        };
        if now > token.valid_until {
            return false;
        }
        if !token.allowed_users.is_empty() {
            match user {
                Some(u) if token.allowed_users.iter().any(|a| a == u) => {}
                _ => return false,
            }
        }

        let mut uses = self.uses.lock();
        let count = uses.entry(token.token.clone()).or_insert(0);
        if *count >= token.max_uses {
            return false;
        }
        *count += 1;
        warn!(
            "emergency bypass token used ({} of {}) by {}",
            count,
            token.max_uses,
            user.unwrap_or("<anonymous>")
        );
        true
    }

    pub fn uses_of(&self, token: &str) -> u32 {
        self.uses.lock().get(token).copied().unwrap_or(0)
    }
}
