//! Regex screening strategy.
//!
//! Ten pattern categories, each with English, Korean, Japanese and Chinese
//! variants. Every match contributes a confidence score; the strategy result
//! carries the per-category threats and the maximum confidence seen.

use once_cell::sync::Lazy;
use regex::Regex;

use super::{StrategyResult, Threat, ThreatCategory};

struct CategoryPatterns {
    category: ThreatCategory,
    patterns: Vec<Regex>,
}

fn build(category: ThreatCategory, sources: &[&str]) -> CategoryPatterns {
    CategoryPatterns {
        category,
        patterns: sources
            .iter()
            .map(|s| Regex::new(s).expect("invalid built-in detection pattern"))
            .collect(),
    }
}

static CATEGORIES: Lazy<Vec<CategoryPatterns>> = Lazy::new(|| {
    vec![
        build(
            ThreatCategory::InstructionOverride,
            &[
                r"(?i)\b(ignore|disregard|forget)\s+(all\s+|any\s+|your\s+)?(previous|prior|above|earlier|original)\s+(instructions?|prompts?|rules?|directives?)",
                r"(?i)\bforget\s+everything\b",
                r"(?i)\bdo\s+not\s+follow\s+(your|the)\s+(instructions?|rules?)",
                r"(?i)\boverride\s+(your|the|all)\s+(instructions?|rules?|settings)",
                // ko
                r"이전\s*(지시|명령|규칙).{0,6}(무시|잊)",
                r"지시(사항)?를?\s*무시",
                // ja
                r"(これまでの|以前の|上記の)?指示を無視",
                r"指示を忘れて",
                // zh
                r"忽略(之前|上面|所有|先前)的?(指令|指示|规则)",
                r"无视(指令|规则)",
            ],
        ),
        build(
            ThreatCategory::RoleManipulation,
            &[
                r"(?i)\byou\s+are\s+now\s+(a|an|the|my)\b",
                r"(?i)\bpretend\s+(to\s+be|you\s+are|you're)\b",
                r"(?i)\bact\s+as\s+(if\s+you|a|an|my)\b",
                r"(?i)\bfrom\s+now\s+on\s+you\s+(are|will|must)\b",
                r"(?i)\bstop\s+being\s+an?\s+(ai|assistant)\b",
                // ko
                r"(이제부터|지금부터)\s*너는",
                r"역할을?\s*(바꿔|바꾸)",
                // ja
                r"あなたは(今から|これから)",
                r"(役割|ロール)を(変え|演じ)",
                // zh
                r"你现在是",
                r"(扮演|假装你是)",
            ],
        ),
        build(
            ThreatCategory::SystemImpersonation,
            &[
                r"(?i)^\s*\[?system\]?\s*:",
                r"(?i)<\|?(system|im_start|endoftext)\|?>",
                r"(?i)#{1,4}\s*system\s+(prompt|message)",
                r"(?i)\bnew\s+system\s+(prompt|message)\s*:",
                // ko
                r"시스템\s*(프롬프트|메시지)\s*:",
                // ja
                r"システム(プロンプト|メッセージ)\s*[:：]",
                // zh
                r"系统(提示|消息)\s*[:：]",
            ],
        ),
        build(
            ThreatCategory::SecretExtraction,
            &[
                r"(?i)\b(show|reveal|print|repeat|tell|give)\s+(me\s+)?(your|the)\s+(system\s+prompt|initial\s+instructions?|hidden\s+instructions?|api[_\s-]?keys?|secrets?|credentials?|passwords?)",
                r"(?i)\bwhat\s+(is|are|were)\s+your\s+(system\s+prompt|initial\s+)?instructions?\b",
                r"(?i)\boutput\s+(your|the)\s+(prompt|instructions?)\s+(verbatim|above)",
                // ko
                r"(시스템\s*프롬프트|비밀번호|API\s*키).{0,6}(알려|보여|말해)",
                // ja
                r"(APIキー|シークレット|パスワード|システムプロンプト)を(教えて|見せて|出力)",
                // zh
                r"(告诉我|显示|输出).{0,8}(密钥|系统提示|秘密|密码)",
            ],
        ),
        build(
            ThreatCategory::DangerousCommand,
            &[
                r"(?i)\brm\s+-[rf]{1,2}\s+[/~]",
                r"(?i)\bdrop\s+table\b",
                r"(?i)\bformat\s+c:",
                r"(?i)\bcurl\s+[^\s]+\s*\|\s*(ba|z)?sh\b",
                r":\(\)\s*\{.*\}\s*;\s*:",
                r"(?i)\bdel\s+/[fsq]\s+",
                r"(?i)\bmkfs\.\w+\s+/dev/",
            ],
        ),
        build(
            ThreatCategory::UrgencyManipulation,
            &[
                r"(?i)\b(urgent|emergency|immediately|right\s+now)\b.{0,60}\b(or\s+else|before\s+it'?s\s+too\s+late|lives?\s+(are\s+)?(at\s+stake|depend))",
                r"(?i)\bthis\s+is\s+(an\s+emergency|urgent|life\s+or\s+death)\b",
                r"(?i)\byou\s+must\s+(comply|answer|obey)\s+(now|immediately)\b",
                // ko
                r"긴급.{0,10}(즉시|당장)",
                // ja
                r"緊急.{0,10}(今すぐ|直ちに)",
                // zh
                r"紧急.{0,10}(立即|马上)",
            ],
        ),
        build(
            ThreatCategory::AuthorityImpersonation,
            &[
                r"(?i)\bi\s+am\s+(your|the)\s+(developer|creator|administrator|admin|owner|operator)\b",
                r"(?i)\bas\s+your\s+(developer|creator|admin(istrator)?)\b",
                r"(?i)\b(anthropic|openai)\s+(staff|employee|engineer)\s+here\b",
                r"(?i)\bauthorized\s+by\s+(the\s+)?(system|developers?|administrators?)\b",
                // ko
                r"나는\s*너의?\s*(개발자|관리자)",
                // ja
                r"私はあなたの(開発者|管理者)",
                // zh
                r"我是你的(开发者|管理员|创造者)",
            ],
        ),
        build(
            ThreatCategory::ContextHijacking,
            &[
                r"(?i)\bend\s+of\s+(conversation|context|document|transcript)\b",
                r"(?i)-{3,}\s*(new\s+)?(conversation|session|instructions?)\s*(start|begin)?",
                r"(?i)\bthe\s+(conversation|chat|messages?)\s+above\s+(was|were|is)\s+(a\s+test|fake|simulated)",
                r"(?i)\bnew\s+instructions?\s+follow\b",
                r"(?i)\[/?(INST|SYS)\]",
            ],
        ),
        build(
            ThreatCategory::TokenSmuggling,
            &[
                r"[\u{200b}\u{200c}\u{200d}\u{2060}\u{feff}]",
                r"(?i)\bb\W?a\W?s\W?e\W?6\W?4\b",
                r"(&#x?[0-9a-fA-F]{2,6};){3,}",
                r"(\\u[0-9a-fA-F]{4}){3,}",
                r"(%[0-9a-fA-F]{2}){6,}",
            ],
        ),
        build(
            ThreatCategory::SafetyBypass,
            &[
                r"(?i)\b(DAN|do\s+anything\s+now)\b",
                r"(?i)\bjail\s?break",
                r"(?i)\bdeveloper\s+mode\b",
                r"(?i)\bwithout\s+(any\s+)?(restrictions?|filters?|limitations?|censorship)\b",
                r"(?i)\bhypothetical(ly)?\b.{0,40}\bno\s+(rules|restrictions|limits)\b",
                // ko
                r"제한\s*없이",
                // ja
                r"制限(なし|を解除)",
                // zh
                r"(不受|没有|解除)限制",
            ],
        ),
    ]
});

const CRITICAL_BONUS: f32 = 0.15;

/// Confidence for one regex match, following the scoring rules: 0.7 base,
/// +0.2 when the match spans the whole trimmed message, +0.15 for critical
/// categories, -0.1 for a short match inside a long message.
fn match_confidence(
    category: ThreatCategory,
    match_len: usize,
    message_len: usize,
    whole_message: bool,
) -> f32 {
    let mut confidence: f32 = 0.7;
    if whole_message {
        confidence += 0.2;
    }
    if category.default_severity() == super::Severity::Critical {
        confidence += CRITICAL_BONUS;
    }
    if match_len < 10 && message_len > 100 {
        confidence -= 0.1;
    }
    confidence.clamp(0.0, 1.0)
}

fn excerpt(s: &str) -> String {
    const MAX: usize = 80;
    if s.chars().count() <= MAX {
        s.to_string()
    } else {
        s.chars().take(MAX).collect()
    }
}

/// Run the regex strategy over one message.
pub fn scan(message: &str) -> StrategyResult {
    let trimmed = message.trim();
    if trimmed.is_empty() {
        return StrategyResult::default();
    }
    let message_len = trimmed.chars().count();

    let mut result = StrategyResult::default();
    for entry in CATEGORIES.iter() {
        let mut best: Option<Threat> = None;
        for pattern in &entry.patterns {
            if let Some(m) = pattern.find(trimmed) {
                let match_len = m.as_str().chars().count();
                let confidence = match_confidence(
                    entry.category,
                    match_len,
                    message_len,
                    m.as_str().trim() == trimmed,
                );
                if best.as_ref().map(|b| confidence > b.confidence).unwrap_or(true) {
                    best = Some(Threat {
                        category: entry.category,
                        matched: excerpt(m.as_str()),
                        confidence,
                    });
                }
            }
        }
        if let Some(threat) = best {
            result.confidence = result.confidence.max(threat.confidence);
            result.threats.push(threat);
        }
    }
    result
}
