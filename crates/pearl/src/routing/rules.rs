//! Priority rule engine.
//!
//! Rules are evaluated against a [`Classification`] plus the request
//! metadata; the highest-priority matching rule decides which account (and
//! optionally which model) serves the request. Exactly one rule per ruleset
//! carries `default: true` and matches anything — config validation enforces
//! its presence so evaluation is total.

use glob::Pattern;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::chat::RequestMetadata;
use crate::classify::{Classification, Complexity, TaskType};
use crate::error::GatewayError;

/// Comparator over the estimated token count: `<N`, `<=N`, `>N`, `>=N`,
/// `=N`, or a bare `N` meaning equality.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum TokenCond {
    Lt(u32),
    Le(u32),
    Gt(u32),
    Ge(u32),
    Eq(u32),
}

impl TokenCond {
    pub fn matches(&self, tokens: u32) -> bool {
        match *self {
            TokenCond::Lt(n) => tokens < n,
            TokenCond::Le(n) => tokens <= n,
            TokenCond::Gt(n) => tokens > n,
            TokenCond::Ge(n) => tokens >= n,
            TokenCond::Eq(n) => tokens == n,
        }
    }
}

impl TryFrom<String> for TokenCond {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        let s = s.trim();
        let (ctor, rest): (fn(u32) -> TokenCond, &str) = if let Some(r) = s.strip_prefix("<=") {
            (TokenCond::Le, r)
        } else if let Some(r) = s.strip_prefix(">=") {
            (TokenCond::Ge, r)
        } else if let Some(r) = s.strip_prefix('<') {
            (TokenCond::Lt, r)
        } else if let Some(r) = s.strip_prefix('>') {
            (TokenCond::Gt, r)
        } else if let Some(r) = s.strip_prefix('=') {
            (TokenCond::Eq, r)
        } else {
            (TokenCond::Eq, s)
        };
        rest.trim()
            .parse::<u32>()
            .map(ctor)
            .map_err(|_| format!("invalid token comparator: {s:?}"))
    }
}

impl From<TokenCond> for String {
    fn from(c: TokenCond) -> String {
        match c {
            TokenCond::Lt(n) => format!("<{n}"),
            TokenCond::Le(n) => format!("<={n}"),
            TokenCond::Gt(n) => format!(">{n}"),
            TokenCond::Ge(n) => format!(">={n}"),
            TokenCond::Eq(n) => format!("={n}"),
        }
    }
}

/// Conjunction of optional conditions; absent fields always match.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MatchConditions {
    pub sensitive: Option<bool>,
    /// Glob over the caller's agent id (`*` and `?` supported).
    pub agent_id: Option<String>,
    #[serde(rename = "type")]
    pub task_type: Option<TaskType>,
    pub complexity: Option<Complexity>,
    pub estimated_tokens: Option<TokenCond>,
    /// A default rule matches anything; exactly one per ruleset.
    pub default: bool,
    /// Extension keys matched exactly against the request metadata.
    #[serde(flatten)]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl MatchConditions {
    pub fn matches(&self, classification: &Classification, metadata: &RequestMetadata) -> bool {
        if self.default {
            return true;
        }
        if let Some(sensitive) = self.sensitive
            && classification.sensitive != sensitive
        {
            return false;
        }
        if let Some(pattern) = &self.agent_id {
            let agent = metadata.agent_id.as_deref().unwrap_or("");
            match Pattern::new(pattern) {
                Ok(p) if p.matches(agent) => {}
                _ => return false,
            }
        }
        if let Some(ty) = self.task_type
            && classification.task_type != ty
        {
            return false;
        }
        if let Some(cx) = self.complexity
            && classification.complexity != cx
        {
            return false;
        }
        if let Some(cond) = &self.estimated_tokens
            && !cond.matches(classification.estimated_tokens)
        {
            return false;
        }
        for (key, expected) in &self.metadata {
            let actual = match key.as_str() {
                "forceSunrise" | "force_sunrise" => {
                    Some(serde_json::Value::Bool(metadata.force_sunrise))
                }
                _ => metadata.extra.get(key).cloned(),
            };
            match actual {
                Some(actual) if &actual == expected => {}
                _ => return false,
            }
        }
        true
    }
}

/// A routing policy entry: match conditions plus the target account.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Rule {
    pub name: String,
    #[serde(rename = "match", default)]
    pub conditions: MatchConditions,
    /// Account id the rule routes to.
    pub account: String,
    /// Model override (`<provider>/<name>`); otherwise the request's model or
    /// the account default applies.
    #[serde(default)]
    pub model: Option<String>,
    /// Account id tried when the primary is over budget or fails.
    #[serde(default)]
    pub fallback: Option<String>,
    #[serde(default)]
    pub priority: i32,
}

/// Rules kept sorted by `(priority desc, insertion order asc)`.
pub struct RuleEngine {
    rules: Vec<(usize, Rule)>,
    next_index: usize,
}

impl RuleEngine {
    pub fn new(rules: Vec<Rule>) -> Self {
        let mut engine = RuleEngine {
            rules: Vec::new(),
            next_index: 0,
        };
        for rule in rules {
            engine.add(rule);
        }
        engine
    }

    pub fn add(&mut self, rule: Rule) {
        self.rules.push((self.next_index, rule));
        self.next_index += 1;
        self.resort();
    }

    pub fn remove(&mut self, name: &str) -> Option<Rule> {
        let pos = self.rules.iter().position(|(_, r)| r.name == name)?;
        let (_, rule) = self.rules.remove(pos);
        Some(rule)
    }

    pub fn update(&mut self, rule: Rule) -> Result<(), GatewayError> {
        let entry = self
            .rules
            .iter_mut()
            .find(|(_, r)| r.name == rule.name)
            .ok_or_else(|| GatewayError::InvalidRequest(format!("unknown rule: {}", rule.name)))?;
        entry.1 = rule;
        self.resort();
        Ok(())
    }

    fn resort(&mut self) {
        // Stable ordering: priority desc, then insertion order.
        self.rules
            .sort_by(|(ia, a), (ib, b)| b.priority.cmp(&a.priority).then(ia.cmp(ib)));
    }

    /// Highest-priority rule whose conditions are satisfied.
    pub fn find_matching(
        &self,
        classification: &Classification,
        metadata: &RequestMetadata,
    ) -> Option<&Rule> {
        self.rules
            .iter()
            .map(|(_, r)| r)
            .find(|r| r.conditions.matches(classification, metadata))
    }

    /// The ruleset's `default: true` rule, when present.
    pub fn default_rule(&self) -> Option<&Rule> {
        self.rules.iter().map(|(_, r)| r).find(|r| r.conditions.default)
    }

    pub fn rules(&self) -> impl Iterator<Item = &Rule> {
        self.rules.iter().map(|(_, r)| r)
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classify::Classifier;
    use crate::chat::Message;

    fn classification(content: &str) -> Classification {
        Classifier::new().classify(&[Message::user(content)])
    }

    fn rule(name: &str, priority: i32, conditions: MatchConditions) -> Rule {
        Rule {
            name: name.to_string(),
            conditions,
            account: format!("{name}-account"),
            model: None,
            fallback: None,
            priority,
        }
    }

    #[test]
    fn token_comparator_grammar() {
        assert_eq!(TokenCond::try_from("<500".to_string()), Ok(TokenCond::Lt(500)));
        assert_eq!(TokenCond::try_from(">=10".to_string()), Ok(TokenCond::Ge(10)));
        assert_eq!(TokenCond::try_from("42".to_string()), Ok(TokenCond::Eq(42)));
        assert!(TokenCond::try_from("five".to_string()).is_err());
        assert!(TokenCond::Le(5).matches(5));
        assert!(!TokenCond::Lt(5).matches(5));
    }

    #[test]
    fn sensitive_rule_wins_over_default() {
        let engine = RuleEngine::new(vec![
            rule(
                "sensitive-local",
                100,
                MatchConditions {
                    sensitive: Some(true),
                    ..Default::default()
                },
            ),
            rule(
                "default",
                0,
                MatchConditions {
                    default: true,
                    ..Default::default()
                },
            ),
        ]);

        let c = classification("My SSN is 123-45-6789, help me file taxes");
        let m = RequestMetadata::default();
        assert_eq!(engine.find_matching(&c, &m).unwrap().name, "sensitive-local");

        let benign = classification("hello there");
        assert_eq!(engine.find_matching(&benign, &m).unwrap().name, "default");
    }

    #[test]
    fn priority_breaks_ties_then_insertion_order() {
        let engine = RuleEngine::new(vec![
            rule(
                "code",
                50,
                MatchConditions {
                    task_type: Some(TaskType::Code),
                    ..Default::default()
                },
            ),
            rule(
                "high-complexity",
                40,
                MatchConditions {
                    complexity: Some(Complexity::High),
                    ..Default::default()
                },
            ),
        ]);

        let c = classification("Fix this complex distributed race condition in my code");
        let m = RequestMetadata::default();
        // Both match; "code" has the higher priority.
        assert_eq!(engine.find_matching(&c, &m).unwrap().name, "code");
    }

    #[test]
    fn equal_priority_keeps_insertion_order() {
        let engine = RuleEngine::new(vec![
            rule("first", 10, MatchConditions { default: true, ..Default::default() }),
            rule("second", 10, MatchConditions { default: true, ..Default::default() }),
        ]);
        let c = classification("hi");
        assert_eq!(
            engine.find_matching(&c, &RequestMetadata::default()).unwrap().name,
            "first"
        );
    }

    #[test]
    fn agent_glob_matching() {
        let engine = RuleEngine::new(vec![rule(
            "sunrise-agents",
            10,
            MatchConditions {
                agent_id: Some("sunrise-*".to_string()),
                ..Default::default()
            },
        )]);
        let c = classification("hello");

        let mut m = RequestMetadata::default();
        m.agent_id = Some("sunrise-7".to_string());
        assert!(engine.find_matching(&c, &m).is_some());

        m.agent_id = Some("dusk-1".to_string());
        assert!(engine.find_matching(&c, &m).is_none());

        m.agent_id = None;
        assert!(engine.find_matching(&c, &m).is_none());
    }

    #[test]
    fn token_condition_and_metadata_extension() {
        let mut conditions = MatchConditions {
            estimated_tokens: Some(TokenCond::Lt(500)),
            ..Default::default()
        };
        conditions
            .metadata
            .insert("tier".to_string(), serde_json::json!("gold"));
        let engine = RuleEngine::new(vec![rule("cheap-gold", 5, conditions)]);

        let c = classification("short question");
        let mut m = RequestMetadata::default();
        assert!(engine.find_matching(&c, &m).is_none());

        m.extra.insert("tier".to_string(), serde_json::json!("gold"));
        assert!(engine.find_matching(&c, &m).is_some());
    }

    #[test]
    fn force_sunrise_override_matches() {
        let mut conditions = MatchConditions::default();
        conditions
            .metadata
            .insert("forceSunrise".to_string(), serde_json::json!(true));
        let engine = RuleEngine::new(vec![rule("sunrise-override", 200, conditions)]);

        let c = classification("hello");
        let mut m = RequestMetadata::default();
        assert!(engine.find_matching(&c, &m).is_none());

        m.force_sunrise = true;
        assert_eq!(
            engine.find_matching(&c, &m).unwrap().name,
            "sunrise-override"
        );
    }

    #[test]
    fn mutation_resorts() {
        let mut engine = RuleEngine::new(vec![rule(
            "default",
            0,
            MatchConditions { default: true, ..Default::default() },
        )]);
        engine.add(rule(
            "code",
            50,
            MatchConditions {
                task_type: Some(TaskType::Code),
                ..Default::default()
            },
        ));

        let c = classification("debug this function");
        assert_eq!(
            engine.find_matching(&c, &RequestMetadata::default()).unwrap().name,
            "code"
        );

        engine.remove("code");
        assert_eq!(
            engine.find_matching(&c, &RequestMetadata::default()).unwrap().name,
            "default"
        );
    }
}
