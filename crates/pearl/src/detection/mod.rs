//! Prompt-injection screening.
//!
//! The detector runs its enabled strategies in a fixed order (regex,
//! heuristics, optional LLM screening), merges their partial results, applies
//! per-user rate limiting and context escalation, then maps the final
//! severity to an action from config. Analysis happens before any memory is
//! retrieved or any backend is called.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

pub mod bypass;
pub mod detector;
pub mod heuristics;
pub mod llm;
pub mod patterns;
pub mod rate_limit;

pub use bypass::{BypassRegistry, BypassToken};
pub use detector::InjectionDetector;
pub use llm::{LlmScreen, LlmVerdict};
pub use rate_limit::{RateLimitConfig, RateLimitStore};

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
    Safe,
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn escalate(self) -> Severity {
        match self {
            Severity::Safe => Severity::Low,
            Severity::Low => Severity::Medium,
            Severity::Medium => Severity::High,
            _ => Severity::Critical,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Safe => "SAFE",
            Severity::Low => "LOW",
            Severity::Medium => "MEDIUM",
            Severity::High => "HIGH",
            Severity::Critical => "CRITICAL",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DetectionAction {
    Allow,
    Log,
    Warn,
    Block,
}

/// Threat categories the strategies can report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThreatCategory {
    InstructionOverride,
    RoleManipulation,
    SystemImpersonation,
    SecretExtraction,
    DangerousCommand,
    UrgencyManipulation,
    AuthorityImpersonation,
    ContextHijacking,
    TokenSmuggling,
    SafetyBypass,
    // heuristic findings
    Repetition,
    ExcessiveCaps,
    Homoglyph,
    Encoding,
    // administrative
    RateLimit,
}

impl ThreatCategory {
    /// Default severity a match in this category carries before escalation.
    pub fn default_severity(&self) -> Severity {
        match self {
            ThreatCategory::SystemImpersonation
            | ThreatCategory::SecretExtraction
            | ThreatCategory::DangerousCommand
            | ThreatCategory::RateLimit => Severity::Critical,
            ThreatCategory::InstructionOverride
            | ThreatCategory::AuthorityImpersonation
            | ThreatCategory::ContextHijacking
            | ThreatCategory::SafetyBypass => Severity::High,
            ThreatCategory::RoleManipulation
            | ThreatCategory::UrgencyManipulation
            | ThreatCategory::TokenSmuggling => Severity::Medium,
            ThreatCategory::Repetition
            | ThreatCategory::ExcessiveCaps
            | ThreatCategory::Homoglyph
            | ThreatCategory::Encoding => Severity::Low,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ThreatCategory::InstructionOverride => "instruction_override",
            ThreatCategory::RoleManipulation => "role_manipulation",
            ThreatCategory::SystemImpersonation => "system_impersonation",
            ThreatCategory::SecretExtraction => "secret_extraction",
            ThreatCategory::DangerousCommand => "dangerous_command",
            ThreatCategory::UrgencyManipulation => "urgency_manipulation",
            ThreatCategory::AuthorityImpersonation => "authority_impersonation",
            ThreatCategory::ContextHijacking => "context_hijacking",
            ThreatCategory::TokenSmuggling => "token_smuggling",
            ThreatCategory::SafetyBypass => "safety_bypass",
            ThreatCategory::Repetition => "repetition",
            ThreatCategory::ExcessiveCaps => "excessive_caps",
            ThreatCategory::Homoglyph => "homoglyph",
            ThreatCategory::Encoding => "encoding",
            ThreatCategory::RateLimit => "rate_limit",
        }
    }
}

/// One suspicious finding.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Threat {
    pub category: ThreatCategory,
    /// Short excerpt of the matched text (may be empty for heuristics).
    pub matched: String,
    pub confidence: f32,
}

/// Final decision for one analyzed message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectionResult {
    pub severity: Severity,
    pub action: DetectionAction,
    pub threats: Vec<Threat>,
    pub confidence: f32,
    pub reasoning: String,
    pub context_factors: Vec<String>,
}

impl DetectionResult {
    pub fn safe(reasoning: impl Into<String>) -> Self {
        DetectionResult {
            severity: Severity::Safe,
            action: DetectionAction::Allow,
            threats: Vec::new(),
            confidence: 0.0,
            reasoning: reasoning.into(),
            context_factors: Vec::new(),
        }
    }

    pub fn is_blocking(&self) -> bool {
        self.action == DetectionAction::Block
    }
}

/// Caller-side security context fed into the detector.
#[derive(Debug, Clone, Default)]
pub struct SecurityContext {
    pub user_id: Option<String>,
    pub is_admin: bool,
    /// Accumulated risk for this user, `0.0..=1.0`.
    pub risk_score: f32,
    /// Recent user messages of the same session, oldest first.
    pub session_history: Vec<String>,
    pub emergency_bypass: Option<String>,
}

/// Partial result produced by one strategy.
#[derive(Debug, Clone, Default)]
pub struct StrategyResult {
    pub threats: Vec<Threat>,
    pub confidence: f32,
}

impl StrategyResult {
    pub fn severity(&self) -> Severity {
        self.threats
            .iter()
            .map(|t| t.category.default_severity())
            .max()
            .unwrap_or(Severity::Safe)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StrategyKind {
    Regex,
    Heuristic,
    Llm,
}

fn default_strategies() -> Vec<StrategyKind> {
    vec![StrategyKind::Regex, StrategyKind::Heuristic]
}

fn default_action_map() -> HashMap<Severity, DetectionAction> {
    HashMap::from([
        (Severity::Safe, DetectionAction::Allow),
        (Severity::Low, DetectionAction::Log),
        (Severity::Medium, DetectionAction::Warn),
        (Severity::High, DetectionAction::Block),
        (Severity::Critical, DetectionAction::Block),
    ])
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectionConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_strategies")]
    pub strategies: Vec<StrategyKind>,
    /// severity -> action; unspecified severities use the defaults.
    #[serde(default = "default_action_map")]
    pub actions: HashMap<Severity, DetectionAction>,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub bypass_tokens: Vec<BypassToken>,
    /// Account serving the `llm` strategy's screening calls.
    #[serde(default)]
    pub llm_account: Option<String>,
    /// Treat strategy failures as SAFE instead of blocking.
    #[serde(default)]
    pub fail_open: bool,
}

impl Default for DetectionConfig {
    fn default() -> Self {
        DetectionConfig {
            enabled: true,
            strategies: default_strategies(),
            actions: default_action_map(),
            rate_limit: RateLimitConfig::default(),
            bypass_tokens: Vec::new(),
            llm_account: None,
            fail_open: false,
        }
    }
}

impl DetectionConfig {
    pub fn action_for(&self, severity: Severity) -> DetectionAction {
        self.actions
            .get(&severity)
            .copied()
            .unwrap_or_else(|| match severity {
                Severity::Safe => DetectionAction::Allow,
                Severity::Low => DetectionAction::Log,
                Severity::Medium => DetectionAction::Warn,
                _ => DetectionAction::Block,
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn severity_ordering_and_escalation() {
        assert!(Severity::Critical > Severity::High);
        assert!(Severity::Safe < Severity::Low);
        assert_eq!(Severity::Medium.escalate(), Severity::High);
        assert_eq!(Severity::Critical.escalate(), Severity::Critical);
    }

    #[test]
    fn default_action_map_matches_policy() {
        let config = DetectionConfig::default();
        assert_eq!(config.action_for(Severity::Safe), DetectionAction::Allow);
        assert_eq!(config.action_for(Severity::Low), DetectionAction::Log);
        assert_eq!(config.action_for(Severity::Medium), DetectionAction::Warn);
        assert_eq!(config.action_for(Severity::High), DetectionAction::Block);
        assert_eq!(config.action_for(Severity::Critical), DetectionAction::Block);
    }

    #[test]
    fn category_default_severities() {
        assert_eq!(
            ThreatCategory::SecretExtraction.default_severity(),
            Severity::Critical
        );
        assert_eq!(
            ThreatCategory::InstructionOverride.default_severity(),
            Severity::High
        );
        assert_eq!(
            ThreatCategory::RoleManipulation.default_severity(),
            Severity::Medium
        );
    }

    #[test]
    fn config_overrides_single_action() {
        let yaml = r#"
actions:
  HIGH: warn
"#;
        let config: DetectionConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.action_for(Severity::High), DetectionAction::Warn);
        // unspecified severities keep their defaults
        assert_eq!(config.action_for(Severity::Critical), DetectionAction::Block);
    }
}
