//! Request classification.
//!
//! Derives a [`Classification`] from the latest user message. Pure and
//! CPU-bound; never calls out, so the router can run it on every request
//! without a suspension point.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::chat::{Message, Role};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Complexity {
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskType {
    General,
    Code,
    Creative,
    Analysis,
    Chat,
}

/// Structured summary of an inbound request, consumed by the rule engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Classification {
    pub complexity: Complexity,
    #[serde(rename = "type")]
    pub task_type: TaskType,
    pub sensitive: bool,
    pub estimated_tokens: u32,
    pub requires_tools: bool,
}

impl Classification {
    fn trivial() -> Self {
        Classification {
            complexity: Complexity::Low,
            task_type: TaskType::General,
            sensitive: false,
            estimated_tokens: 0,
            requires_tools: false,
        }
    }
}

static SSN_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\b\d{3}-\d{2}-\d{4}\b").unwrap());
static CARD_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b\d{4}[\s-]?\d{4}[\s-]?\d{4}[\s-]?\d{4}\b").unwrap());

const CREDENTIAL_KEYWORDS: &[&str] = &["api_key", "token", "secret", "credential", "password"];
const HEALTH_KEYWORDS: &[&str] = &[
    "diagnosis",
    "prescription",
    "medication",
    "symptom",
    "medical",
    "doctor",
    "patient",
];

const CODE_KEYWORDS: &[&str] = &[
    "code",
    "function",
    "bug",
    "compile",
    "debug",
    "refactor",
    "implement",
    "script",
    "api",
    "error",
    "stack trace",
    "regex",
    "sql",
    "algorithm",
];
const CREATIVE_KEYWORDS: &[&str] = &[
    "write a story",
    "poem",
    "creative",
    "fiction",
    "lyrics",
    "brainstorm",
    "imagine",
    "novel",
    "screenplay",
];
const ANALYSIS_KEYWORDS: &[&str] = &[
    "analyze",
    "analyse",
    "compare",
    "evaluate",
    "pros and cons",
    "tradeoff",
    "trade-off",
    "summarize",
    "summarise",
    "assess",
    "review",
];

static GREETING_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^\s*(hi|hello|hey|good (morning|afternoon|evening)|how are you|what's up)\b")
        .unwrap()
});

const TECHNICAL_TERMS: &[&str] = &[
    "algorithm",
    "architecture",
    "async",
    "concurrency",
    "database",
    "encryption",
    "kubernetes",
    "latency",
    "microservice",
    "optimization",
    "protocol",
    "recursion",
    "thread",
    "throughput",
    "compiler",
];

/// Terms that force high complexity on their own.
const ADVANCED_TERMS: &[&str] = &[
    "distributed system",
    "race condition",
    "consensus algorithm",
    "byzantine",
    "eventual consistency",
    "formal verification",
];

const COMPLEX_HINTS: &[&str] = &["complex", "complicated", "advanced", "in depth", "detailed"];
const SIMPLE_HINTS: &[&str] = &["simple", "quick", "briefly", "short"];

static QUESTION_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\b(what|why|how|when|where|which|who)\b").unwrap());

pub struct Classifier;

impl Classifier {
    pub fn new() -> Self {
        Classifier
    }

    /// Classify the latest user message in `messages`.
    pub fn classify(&self, messages: &[Message]) -> Classification {
        let content = messages
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .map(|m| m.content.as_str())
            .unwrap_or("");
        let trimmed = content.trim();
        if trimmed.is_empty() {
            return Classification::trivial();
        }
        let lower = trimmed.to_lowercase();

        let sensitive = detect_sensitive(trimmed, &lower);
        let task_type = detect_type(trimmed, &lower);
        let complexity = detect_complexity(trimmed, &lower, task_type);
        let estimated_tokens = estimate_tokens(trimmed, complexity);

        Classification {
            complexity,
            task_type,
            sensitive,
            estimated_tokens,
            // Tool detection is a rules-level concern; the field is kept so
            // rules can match on it once a detector exists.
            requires_tools: false,
        }
    }
}

impl Default for Classifier {
    fn default() -> Self {
        Self::new()
    }
}

fn detect_sensitive(content: &str, lower: &str) -> bool {
    SSN_RE.is_match(content)
        || CARD_RE.is_match(content)
        || CREDENTIAL_KEYWORDS.iter().any(|k| lower.contains(k))
        || HEALTH_KEYWORDS.iter().any(|k| lower.contains(k))
}

fn keyword_hits(lower: &str, keywords: &[&str]) -> usize {
    keywords.iter().filter(|k| lower.contains(*k)).count()
}

fn match_confidence(hits: usize) -> f32 {
    (0.3 * hits as f32).min(1.0)
}

fn detect_type(content: &str, lower: &str) -> TaskType {
    // First non-empty keyword match wins, in a fixed precedence order.
    let candidates = [
        (TaskType::Code, keyword_hits(lower, CODE_KEYWORDS)),
        (TaskType::Creative, keyword_hits(lower, CREATIVE_KEYWORDS)),
        (TaskType::Analysis, keyword_hits(lower, ANALYSIS_KEYWORDS)),
    ];
    for (ty, hits) in candidates {
        if hits > 0 && match_confidence(hits) > 0.0 {
            return ty;
        }
    }
    if GREETING_RE.is_match(content) {
        return TaskType::Chat;
    }
    TaskType::General
}

fn detect_complexity(content: &str, lower: &str, task_type: TaskType) -> Complexity {
    let length = content.chars().count();
    let word_count = content.split_whitespace().count();
    let technical = keyword_hits(lower, TECHNICAL_TERMS);
    let questions = QUESTION_RE.find_iter(content).count();

    if ADVANCED_TERMS.iter().any(|t| lower.contains(t)) {
        return Complexity::High;
    }

    let mut complexity = if length < 50 && technical == 0 {
        Complexity::Low
    } else if length > 300 || word_count > 60 || technical >= 2 {
        Complexity::High
    } else if questions >= 3 {
        Complexity::High
    } else {
        Complexity::Medium
    };

    if complexity == Complexity::Low
        && matches!(
            task_type,
            TaskType::Code | TaskType::Creative | TaskType::Analysis
        )
    {
        complexity = Complexity::Medium;
    }

    if COMPLEX_HINTS.iter().any(|h| lower.contains(h)) {
        complexity = bump_up(complexity);
    } else if SIMPLE_HINTS.iter().any(|h| lower.contains(h)) {
        complexity = bump_down(complexity);
    }

    complexity
}

fn bump_up(c: Complexity) -> Complexity {
    match c {
        Complexity::Low => Complexity::Medium,
        _ => Complexity::High,
    }
}

fn bump_down(c: Complexity) -> Complexity {
    match c {
        Complexity::High => Complexity::Medium,
        _ => Complexity::Low,
    }
}

fn estimate_tokens(content: &str, complexity: Complexity) -> u32 {
    let length = content.chars().count() as f64;
    let words = content.split_whitespace().count() as f64;
    let by_chars = (length / 3.5).ceil() as u32;
    let by_words = (words * 1.5).ceil() as u32;
    let estimate = by_chars.max(by_words);
    if complexity == Complexity::High {
        estimate.max(501)
    } else {
        estimate
    }
}
