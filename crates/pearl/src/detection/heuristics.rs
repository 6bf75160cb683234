//! Heuristic screening strategy.
//!
//! Four normalized scores over the raw text: word repetition, shouting
//! (caps + exclamations), homoglyph substitution, and encoded payloads.
//! Base64 runs are decoded and the plaintext fed back through the regex
//! strategy so encoded injections surface with their real category.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use once_cell::sync::Lazy;
use regex::Regex;

use super::patterns;
use super::{Severity, StrategyResult, Threat, ThreatCategory};

const REPETITION_TRIGGER: f32 = 0.6;
const CAPS_TRIGGER: f32 = 0.7;
const HOMOGLYPH_TRIGGER: f32 = 0.5;
const ENCODING_TRIGGER: f32 = 0.6;

static BASE64_RUN: Lazy<Regex> = Lazy::new(|| Regex::new(r"[A-Za-z0-9+/]{24,}={0,2}").unwrap());
static URL_ENCODED: Lazy<Regex> = Lazy::new(|| Regex::new(r"%[0-9a-fA-F]{2}").unwrap());
static HTML_ENTITY: Lazy<Regex> = Lazy::new(|| Regex::new(r"&#x?[0-9a-fA-F]{2,6};").unwrap());

/// Fraction of repeated words, 0 when the message is too short to judge.
fn repetition_score(message: &str) -> f32 {
    let words: Vec<String> = message
        .split_whitespace()
        .map(|w| w.to_lowercase())
        .collect();
    if words.len() < 8 {
        return 0.0;
    }
    let unique: std::collections::HashSet<&str> = words.iter().map(|s| s.as_str()).collect();
    (words.len() - unique.len()) as f32 / words.len() as f32
}

/// Uppercase ratio plus a capped exclamation bonus.
fn caps_score(message: &str) -> f32 {
    let letters: Vec<char> = message.chars().filter(|c| c.is_alphabetic()).collect();
    if letters.len() < 12 {
        return 0.0;
    }
    let upper = letters.iter().filter(|c| c.is_uppercase()).count();
    let exclamations = message.chars().filter(|c| *c == '!').count();
    upper as f32 / letters.len() as f32 + (exclamations as f32 / 5.0).min(0.3)
}

fn is_homoglyph(c: char) -> bool {
    // Cyrillic and Greek letters that pass for latin, plus fullwidth forms.
    matches!(c,
        'а' | 'е' | 'о' | 'р' | 'с' | 'х' | 'у' | 'і' | 'ѕ' | 'А' | 'В' | 'Е' | 'К' | 'М'
        | 'Н' | 'О' | 'Р' | 'С' | 'Т' | 'Х'
        | 'α' | 'β' | 'ε' | 'ο' | 'ρ' | 'τ' | 'υ' | 'Α' | 'Β' | 'Ε' | 'Ζ' | 'Η' | 'Ι'
        | 'Κ' | 'Μ' | 'Ν' | 'Ο' | 'Ρ' | 'Τ' | 'Υ' | 'Χ')
        || ('\u{ff01}'..='\u{ff5e}').contains(&c)
}

/// Look-alike density. Only meaningful for mixed-script text: a message with
/// no ASCII letters at all is simply not written in latin script.
fn homoglyph_score(message: &str) -> f32 {
    let chars: Vec<char> = message.chars().filter(|c| !c.is_whitespace()).collect();
    if chars.is_empty() || !message.chars().any(|c| c.is_ascii_alphabetic()) {
        return 0.0;
    }
    let lookalikes = chars.iter().filter(|c| is_homoglyph(**c)).count();
    lookalikes as f32 / chars.len() as f32
}

struct EncodingScan {
    score: f32,
    decoded_threats: Vec<Threat>,
}

/// Base64/URL/HTML-entity density; decoded base64 plaintext goes back
/// through the regex strategy.
fn encoding_scan(message: &str) -> EncodingScan {
    let len = message.chars().count().max(1);
    let mut score: f32 = 0.0;
    let mut decoded_threats = Vec::new();

    for run in BASE64_RUN.find_iter(message) {
        score = score.max(0.4);
        if let Ok(bytes) = BASE64.decode(run.as_str())
            && let Ok(text) = String::from_utf8(bytes)
        {
            let inner = patterns::scan(&text);
            if !inner.threats.is_empty() {
                score = 0.9;
                decoded_threats.extend(inner.threats);
            }
        }
    }

    let url_density = URL_ENCODED.find_iter(message).count() as f32 * 3.0 / len as f32;
    let entity_density = HTML_ENTITY.find_iter(message).count() as f32 * 5.0 / len as f32;
    score = score.max(url_density.min(1.0)).max(entity_density.min(1.0));

    EncodingScan {
        score: score.min(1.0),
        decoded_threats,
    }
}

/// Run all heuristics over one message.
pub fn scan(message: &str) -> StrategyResult {
    let mut result = StrategyResult::default();

    let repetition = repetition_score(message);
    if repetition > REPETITION_TRIGGER {
        result.threats.push(Threat {
            category: ThreatCategory::Repetition,
            matched: String::new(),
            confidence: repetition,
        });
    }

    let caps = caps_score(message);
    if caps > CAPS_TRIGGER {
        result.threats.push(Threat {
            category: ThreatCategory::ExcessiveCaps,
            matched: String::new(),
            confidence: caps.min(1.0),
        });
    }

    let homoglyphs = homoglyph_score(message);
    if homoglyphs > HOMOGLYPH_TRIGGER {
        result.threats.push(Threat {
            category: ThreatCategory::Homoglyph,
            matched: String::new(),
            confidence: homoglyphs,
        });
    }

    let encoding = encoding_scan(message);
    if encoding.score > ENCODING_TRIGGER {
        result.threats.push(Threat {
            category: ThreatCategory::Encoding,
            matched: String::new(),
            confidence: encoding.score,
        });
        result.threats.extend(encoding.decoded_threats);
    }

    result.confidence = result
        .threats
        .iter()
        .map(|t| t.confidence)
        .fold(0.0, f32::max);
    result
}

/// Severity mapping specific to heuristic findings.
pub fn severity_of(result: &StrategyResult) -> Severity {
    // Threats that came back from decoded payloads keep their own category
    // severity; pure heuristic signals grade on confidence and count.
    let decoded_severity = result
        .threats
        .iter()
        .filter(|t| {
            !matches!(
                t.category,
                ThreatCategory::Repetition
                    | ThreatCategory::ExcessiveCaps
                    | ThreatCategory::Homoglyph
                    | ThreatCategory::Encoding
            )
        })
        .map(|t| t.category.default_severity())
        .max()
        .unwrap_or(Severity::Safe);

    let count = result.threats.len();
    let graded = if result.confidence > 0.8 || count >= 3 {
        Severity::High
    } else if result.confidence > 0.6 || count >= 2 {
        Severity::Medium
    } else if result.confidence > 0.3 || count >= 1 {
        Severity::Low
    } else {
        Severity::Safe
    };
    decoded_severity.max(graded)
}
