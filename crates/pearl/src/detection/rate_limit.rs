//! Per-user analysis rate limiting.
//!
//! Sliding window: a user's attempt counter resets once the window since
//! their first counted attempt has passed. Hitting the attempt ceiling bans
//! the user for a configured duration; banned users are blocked outright by
//! the detector regardless of message content. `check_and_count` is the
//! single place counters are mutated.

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

fn default_window() -> u64 {
    60
}
fn default_max_attempts() -> u32 {
    10
}
fn default_ban_duration() -> u64 {
    300
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    #[serde(default = "default_window")]
    pub window_seconds: u64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_ban_duration")]
    pub ban_duration_seconds: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        RateLimitConfig {
            window_seconds: default_window(),
            max_attempts: default_max_attempts(),
            ban_duration_seconds: default_ban_duration(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RateLimitState {
    pub attempts: u32,
    pub first_attempt: DateTime<Utc>,
    pub last_attempt: DateTime<Utc>,
    pub banned: bool,
    pub ban_expiry: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLimitVerdict {
    Counted,
    Banned,
}

/// Process-wide per-user counters. Entries idle for more than 24 h are
/// removed by `sweep`, which the service runs on an interval.
pub struct RateLimitStore {
    config: RateLimitConfig,
    users: Mutex<HashMap<String, RateLimitState>>,
}

impl RateLimitStore {
    pub fn new(config: RateLimitConfig) -> Self {
        RateLimitStore {
            config,
            users: Mutex::new(HashMap::new()),
        }
    }

    /// Count one analysis attempt for `user` and report whether they are
    /// currently banned.
    pub fn check_and_count(&self, user: &str) -> RateLimitVerdict {
        self.check_and_count_at(user, Utc::now())
    }

    fn check_and_count_at(&self, user: &str, now: DateTime<Utc>) -> RateLimitVerdict {
        let window = Duration::seconds(self.config.window_seconds as i64);
        let mut users = self.users.lock();
        let state = users.entry(user.to_string()).or_insert_with(|| RateLimitState {
            attempts: 0,
            first_attempt: now,
            last_attempt: now,
            banned: false,
            ban_expiry: None,
        });

        if state.banned {
            match state.ban_expiry {
                Some(expiry) if now < expiry => {
                    state.last_attempt = now;
                    return RateLimitVerdict::Banned;
                }
                _ => {
                    state.banned = false;
                    state.ban_expiry = None;
                    state.attempts = 0;
                    state.first_attempt = now;
                }
            }
        }

        if now - state.first_attempt > window {
            state.attempts = 0;
            state.first_attempt = now;
        }

        state.attempts += 1;
        state.last_attempt = now;

        if state.attempts > self.config.max_attempts {
            state.banned = true;
            state.ban_expiry =
                Some(now + Duration::seconds(self.config.ban_duration_seconds as i64));
            return RateLimitVerdict::Banned;
        }
        if state.attempts == self.config.max_attempts {
            // Ceiling reached: this analysis still runs, the next one is
            // rejected until the ban expires.
            state.banned = true;
            state.ban_expiry =
                Some(now + Duration::seconds(self.config.ban_duration_seconds as i64));
        }
        RateLimitVerdict::Counted
    }

    /// Drop entries whose last activity is older than `max_age_hours`.
    pub fn sweep(&self, max_age_hours: i64) {
        let cutoff = Utc::now() - Duration::hours(max_age_hours);
        self.users.lock().retain(|_, s| s.last_attempt >= cutoff);
    }

    pub fn state_of(&self, user: &str) -> Option<RateLimitState> {
        self.users.lock().get(user).cloned()
    }

    pub fn len(&self) -> usize {
        self.users.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.users.lock().is_empty()
    }
}
