//! Input security: per-model validation rules, string sanitization,
//! adversarial-pattern scoring, and PII anonymization.

use dashmap::DashMap;
use modelforge_core::config::AdversarialSettings;
use modelforge_core::{FeatureValue, ModelId, ModelRecord, Row};
use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::LazyLock;
use tracing::{debug, warn};

// ---------------------------------------------------------------------------
// Validation rules
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldRule {
    pub field: String,
    /// Expected type: number | string | boolean.
    pub field_type: String,
    #[serde(default)]
    pub required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_length: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_length: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pattern: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allowed: Option<Vec<String>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RuleViolation {
    pub field: String,
    pub message: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ValidationVerdict {
    pub valid: bool,
    pub blocked_fields: Vec<String>,
    pub violations: Vec<RuleViolation>,
    /// 0..100, scaled by how much of the input violated rules.
    pub risk_score: u8,
}

#[derive(Default)]
pub struct InputValidator {
    rules: DashMap<ModelId, Vec<FieldRule>>,
}

impl InputValidator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_rules(&self, model_id: ModelId, rules: Vec<FieldRule>) {
        self.rules.insert(model_id, rules);
    }

    pub fn validate(&self, model_id: ModelId, input: &Row) -> ValidationVerdict {
        let Some(rules) = self.rules.get(&model_id) else {
            return ValidationVerdict {
                valid: true,
                blocked_fields: Vec::new(),
                violations: Vec::new(),
                risk_score: 0,
            };
        };

        let mut violations = Vec::new();
        let mut blocked = Vec::new();

        for rule in rules.iter() {
            let value = input.get(&rule.field);
            let Some(value) = value.filter(|v| !v.is_absent()) else {
                if rule.required {
                    violations.push(RuleViolation {
                        field: rule.field.clone(),
                        message: "required field is missing".into(),
                    });
                    blocked.push(rule.field.clone());
                }
                continue;
            };

            let mut field_failed = false;
            match rule.field_type.as_str() {
                "number" => match value.as_number() {
                    Some(n) => {
                        if rule.min.map(|min| n < min).unwrap_or(false)
                            || rule.max.map(|max| n > max).unwrap_or(false)
                        {
                            violations.push(RuleViolation {
                                field: rule.field.clone(),
                                message: format!("{n} is outside the allowed range"),
                            });
                            field_failed = true;
                        }
                    }
                    None => {
                        violations.push(RuleViolation {
                            field: rule.field.clone(),
                            message: "expected a number".into(),
                        });
                        field_failed = true;
                    }
                },
                "boolean" => {
                    if !matches!(value, FeatureValue::Bool(_)) {
                        violations.push(RuleViolation {
                            field: rule.field.clone(),
                            message: "expected a boolean".into(),
                        });
                        field_failed = true;
                    }
                }
                _ => {
                    let text = value.canonical_string();
                    let length = text.chars().count();
                    if rule.min_length.map(|m| length < m).unwrap_or(false)
                        || rule.max_length.map(|m| length > m).unwrap_or(false)
                    {
                        violations.push(RuleViolation {
                            field: rule.field.clone(),
                            message: format!("length {length} is outside the allowed bounds"),
                        });
                        field_failed = true;
                    }
                    if let Some(pattern) = &rule.pattern {
                        if let Ok(regex) = Regex::new(pattern) {
                            if !regex.is_match(&text) {
                                violations.push(RuleViolation {
                                    field: rule.field.clone(),
                                    message: "value does not match the declared pattern".into(),
                                });
                                field_failed = true;
                            }
                        }
                    }
                    if let Some(allowed) = &rule.allowed {
                        if !allowed.contains(&text) {
                            violations.push(RuleViolation {
                                field: rule.field.clone(),
                                message: format!("'{text}' is not an allowed value"),
                            });
                            field_failed = true;
                        }
                    }
                }
            }
            if field_failed {
                blocked.push(rule.field.clone());
            }
        }

        blocked.dedup();
        let risk_score = ((blocked.len() as f64 / rules.len().max(1) as f64) * 100.0)
            .round()
            .min(100.0) as u8;
        ValidationVerdict {
            valid: violations.is_empty(),
            blocked_fields: blocked,
            violations,
            risk_score,
        }
    }
}

// ---------------------------------------------------------------------------
// Sanitization
// ---------------------------------------------------------------------------

static SCRIPT_TAGS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)<script.*?>.*?</script>").expect("script regex"));
static HTML_TAGS: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"<[^>]+>").expect("tag regex"));
static SQL_INJECTION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(\bunion\b.{0,40}\bselect\b|\bdrop\s+table\b|\binsert\s+into\b|\bdelete\s+from\b|--|;\s*shutdown|\bor\b\s+1\s*=\s*1)")
        .expect("sql regex")
});

#[derive(Debug, Clone, Serialize)]
pub struct SanitizeAction {
    pub field: String,
    pub action: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct SanitizedInput {
    pub row: Row,
    pub actions: Vec<SanitizeAction>,
    pub blocked_fields: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct SanitizeOptions {
    pub trim: bool,
    pub lowercase: bool,
}

impl Default for SanitizeOptions {
    fn default() -> Self {
        Self {
            trim: true,
            lowercase: false,
        }
    }
}

fn escape_special(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&#x27;")
}

/// Clean string fields, dropping any field that trips the SQL-injection
/// patterns. Every mutation is reported as an action.
pub fn sanitize_input(input: Row, options: &SanitizeOptions) -> SanitizedInput {
    let mut actions = Vec::new();
    let mut blocked = Vec::new();
    let mut row = Row::new();

    for (field, value) in input {
        let FeatureValue::Text(text) = &value else {
            row.insert(field, value);
            continue;
        };

        if SQL_INJECTION.is_match(text) {
            warn!(field, "sql injection pattern blocked");
            actions.push(SanitizeAction {
                field: field.clone(),
                action: "blocked_sql_injection".into(),
            });
            blocked.push(field);
            continue;
        }

        let mut cleaned = text.clone();
        if SCRIPT_TAGS.is_match(&cleaned) {
            cleaned = SCRIPT_TAGS.replace_all(&cleaned, "").into_owned();
            actions.push(SanitizeAction {
                field: field.clone(),
                action: "stripped_script".into(),
            });
        }
        if HTML_TAGS.is_match(&cleaned) {
            cleaned = HTML_TAGS.replace_all(&cleaned, "").into_owned();
            actions.push(SanitizeAction {
                field: field.clone(),
                action: "stripped_html".into(),
            });
        }
        let escaped = escape_special(&cleaned);
        if escaped != cleaned {
            actions.push(SanitizeAction {
                field: field.clone(),
                action: "escaped_special_characters".into(),
            });
            cleaned = escaped;
        }
        if options.trim {
            let trimmed = cleaned.trim();
            if trimmed.len() != cleaned.len() {
                actions.push(SanitizeAction {
                    field: field.clone(),
                    action: "trimmed".into(),
                });
            }
            cleaned = trimmed.to_string();
        }
        if options.lowercase {
            cleaned = cleaned.to_lowercase();
        }
        row.insert(field, FeatureValue::Text(cleaned));
    }

    debug!(actions = actions.len(), blocked = blocked.len(), "input sanitized");
    SanitizedInput {
        row,
        actions,
        blocked_fields: blocked,
    }
}

// ---------------------------------------------------------------------------
// Adversarial detection
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, Serialize)]
pub struct AdversarialVerdict {
    pub score: f64,
    pub level: RiskLevel,
    pub flagged: bool,
    pub method_scores: Vec<(String, f64)>,
}

pub struct AdversarialDetector {
    settings: AdversarialSettings,
}

impl AdversarialDetector {
    pub fn new(settings: AdversarialSettings) -> Self {
        Self { settings }
    }

    pub fn inspect(&self, record: &ModelRecord, input: &Row) -> AdversarialVerdict {
        if !self.settings.enabled {
            return AdversarialVerdict {
                score: 0.0,
                level: RiskLevel::Low,
                flagged: false,
                method_scores: Vec::new(),
            };
        }

        let mut method_scores = Vec::new();
        for method in &self.settings.methods {
            let score = match method.as_str() {
                "statistical" => statistical_anomaly(input),
                "gradient" => gradient_proxy(input),
                "reconstruction" => reconstruction_check(record, input),
                _ => continue,
            };
            method_scores.push((method.clone(), score));
        }

        let score = if method_scores.is_empty() {
            0.0
        } else {
            method_scores.iter().map(|(_, s)| s).sum::<f64>() / method_scores.len() as f64
        };
        let level = if score > 0.8 {
            RiskLevel::High
        } else if score >= 0.5 {
            RiskLevel::Medium
        } else {
            RiskLevel::Low
        };
        let flagged = score >= self.settings.threshold;
        if flagged {
            warn!(score, "adversarial input flagged");
        }
        AdversarialVerdict {
            score,
            level,
            flagged,
            method_scores,
        }
    }
}

fn statistical_anomaly(input: &Row) -> f64 {
    let mut signals = 0usize;
    let mut checks = 0usize;
    for value in input.values() {
        match value {
            FeatureValue::Number(n) => {
                checks += 2;
                if n.abs() > 1e9 {
                    signals += 1;
                }
                // Unusually precise decimals are a perturbation tell.
                let text = format!("{n}");
                if text.split('.').nth(1).map(|d| d.len() > 10).unwrap_or(false) {
                    signals += 1;
                }
            }
            FeatureValue::Text(s) => {
                checks += 2;
                if s.len() > 10_000 {
                    signals += 1;
                }
                if longest_run(s) > 50 {
                    signals += 1;
                }
            }
            _ => {}
        }
    }
    if checks == 0 {
        0.0
    } else {
        signals as f64 / checks as f64
    }
}

fn longest_run(s: &str) -> usize {
    let mut best = 0usize;
    let mut run = 0usize;
    let mut previous = None;
    for c in s.chars() {
        if Some(c) == previous {
            run += 1;
        } else {
            run = 1;
            previous = Some(c);
        }
        best = best.max(run);
    }
    best
}

/// Cheap stand-in for gradient magnitude: spread between adjacent sorted
/// numeric values, normalized by the overall spread. Adversarial inputs
/// tend to concentrate unusual jumps.
fn gradient_proxy(input: &Row) -> f64 {
    let mut values: Vec<f64> = input
        .values()
        .filter_map(|v| v.as_number())
        .filter(|n| n.is_finite())
        .collect();
    if values.len() < 2 {
        return 0.0;
    }
    values.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let spread = (values[values.len() - 1] - values[0]).abs();
    if spread < f64::EPSILON {
        return 0.0;
    }
    let max_jump = values
        .windows(2)
        .map(|w| (w[1] - w[0]).abs())
        .fold(0.0, f64::max);
    (max_jump / spread - 1.0 / (values.len() - 1) as f64).clamp(0.0, 1.0)
}

/// Plausibility via expected-feature presence: inputs missing most of the
/// declared features, or padded with extras, score higher.
fn reconstruction_check(record: &ModelRecord, input: &Row) -> f64 {
    let expected = record.config.features.len().max(1);
    let present = record
        .config
        .features
        .iter()
        .filter(|f| input.get(f.as_str()).map(|v| !v.is_absent()).unwrap_or(false))
        .count();
    let extras = input
        .keys()
        .filter(|k| {
            !record.config.features.iter().any(|f| f == *k)
                && record.config.target.as_deref() != Some(k.as_str())
        })
        .count();
    let missing_ratio = 1.0 - present as f64 / expected as f64;
    let extra_ratio = extras as f64 / expected as f64;
    (0.7 * missing_ratio + 0.3 * extra_ratio).clamp(0.0, 1.0)
}

// ---------------------------------------------------------------------------
// Anonymization
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PrivacyLevel {
    Basic,
    Enhanced,
    Strict,
}

static EMAIL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[\w.+-]+@[\w-]+\.[\w.]+").expect("email regex"));
static PHONE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\+?\d[\d\s().-]{7,}\d").expect("phone regex"));
static GOVERNMENT_ID: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b\d{3}-\d{2}-\d{4}\b").expect("gov id regex"));
static PAYMENT_CARD: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b(?:\d[ -]*?){13,16}\b").expect("card regex"));

const NAME_FIELDS: &[&str] = &[
    "name",
    "first_name",
    "last_name",
    "full_name",
    "surname",
    "given_name",
];

fn hash_value(text: &str) -> String {
    let digest = Sha256::digest(text.as_bytes());
    digest
        .iter()
        .take(8)
        .map(|b| format!("{b:02x}"))
        .collect()
}

fn partial_mask(text: &str) -> String {
    let visible = text.chars().count().min(4) / 2;
    let head: String = text.chars().take(visible).collect();
    format!("{head}{}", "*".repeat(text.chars().count().saturating_sub(visible)))
}

fn redact(text: &str, level: PrivacyLevel, generic: &str) -> String {
    match level {
        PrivacyLevel::Basic => partial_mask(text),
        PrivacyLevel::Enhanced => generic.to_string(),
        PrivacyLevel::Strict => format!("h:{}", hash_value(text)),
    }
}

/// Replace sensitive values by field-name and value-pattern heuristics.
pub fn anonymize_input(input: Row, level: PrivacyLevel) -> (Row, Vec<String>) {
    let mut anonymized_fields = Vec::new();
    let mut out = Row::new();

    for (field, value) in input {
        let FeatureValue::Text(text) = &value else {
            out.insert(field, value);
            continue;
        };

        let lowered = field.to_lowercase();
        let by_name = NAME_FIELDS.iter().any(|n| lowered.contains(n));

        let replaced = if EMAIL.is_match(text) {
            Some(redact(text, level, "[email]"))
        } else if GOVERNMENT_ID.is_match(text) {
            Some(redact(text, level, "[government-id]"))
        } else if PAYMENT_CARD.is_match(text) {
            Some(redact(text, level, "[payment-card]"))
        } else if PHONE.is_match(text) {
            Some(redact(text, level, "[phone]"))
        } else if by_name {
            Some(redact(text, level, "[name]"))
        } else {
            None
        };

        match replaced {
            Some(clean) => {
                anonymized_fields.push(field.clone());
                out.insert(field, FeatureValue::Text(clean));
            }
            None => {
                out.insert(field, value);
            }
        }
    }
    (out, anonymized_fields)
}
