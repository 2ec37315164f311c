//! Parses the declarative `WEBHOOK_RULES` rule set and evaluates it against
//! a [`ParsedEmail`] to produce an ordered fan-out target list.
//!
//! The router is pure: the same email and rule set always produce the same
//! decision. Matchers are precompiled once at construction so evaluation
//! never pays regex-compile cost per message.

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::model::ParsedEmail;

/// Priority applied to a rule that doesn't specify one.
pub const DEFAULT_RULE_PRIORITY: i64 = 999;
/// Priority applied to the synthesized target built from `WEBHOOK_URL` when
/// no rule matches.
pub const DEFAULT_TARGET_PRIORITY: i64 = 9999;

/// One resolved fan-out target.
#[derive(Debug, Clone, Serialize)]
pub struct RouteTarget {
    pub webhook: String,
    #[serde(rename = "ruleName")]
    pub rule_name: String,
    pub priority: i64,
}

/// A raw condition matcher, either an inline string/bool or the `header`
/// object form `{name, value}`.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum RawCondition {
    Header { name: String, value: String },
    Scalar(Value),
}

/// One rule as it appears in `WEBHOOK_RULES` JSON, before matcher
/// compilation.
#[derive(Debug, Clone, Deserialize)]
struct RawRule {
    name: Option<String>,
    #[serde(default)]
    conditions: std::collections::BTreeMap<String, RawCondition>,
    webhook: String,
    priority: Option<i64>,
    #[serde(rename = "stopProcessing", default)]
    stop_processing: bool,
}

/// The container shapes `WEBHOOK_RULES` may take: a bare array, or an
/// object wrapping one under `rules`.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum RawRulesDocument {
    List(Vec<RawRule>),
    Wrapped { rules: Vec<RawRule> },
}

/// A precompiled condition matcher.
#[derive(Debug, Clone)]
enum Matcher {
    Exact(String),
    Wildcard(Regex),
    Regex(Regex),
}

impl Matcher {
    /// Compiles a matcher spec: `*` wildcards become an anchored
    /// case-insensitive regex; `/pattern/flags` compiles the literal regex
    /// (a lone `/` is not a valid wrapper and falls through to exact-match,
    /// per the preserved open question); everything else is exact,
    /// case-insensitive string equality.
    fn compile(spec: &str) -> Matcher {
        if spec.contains('*') {
            let escaped = regex::escape(spec);
            let pattern = format!("(?i)^{}$", escaped.replace("\\*", ".*"));
            match Regex::new(&pattern) {
                Ok(re) => return Matcher::Wildcard(re),
                Err(_) => return Matcher::Exact(spec.to_string()),
            }
        }
        if let Some((pattern, flags)) = parse_regex_literal(spec) {
            let mut full_pattern = String::new();
            if flags.contains('i') {
                full_pattern.push_str("(?i)");
            }
            full_pattern.push_str(pattern);
            if let Ok(re) = Regex::new(&full_pattern) {
                return Matcher::Regex(re);
            }
            // Compile failure: condition evaluates false but doesn't abort
            // the rest of the rule. An unmatchable pattern achieves that.
            return Matcher::Regex(Regex::new("$.^").unwrap());
        }
        Matcher::Exact(spec.to_string())
    }

    fn matches(&self, value: &str) -> bool {
        match self {
            Matcher::Exact(expected) => expected.eq_ignore_ascii_case(value),
            Matcher::Wildcard(re) => re.is_match(value),
            Matcher::Regex(re) => re.is_match(value),
        }
    }
}

/// Splits a `/pattern/flags` literal. Returns `None` for a bare `/` or any
/// string that isn't wrapped in a matching pair of slashes, so that a
/// single `/` in a condition value is treated as an exact match rather than
/// an unterminated regex.
fn parse_regex_literal(spec: &str) -> Option<(&str, &str)> {
    if !spec.starts_with('/') || spec.len() < 2 {
        return None;
    }
    let rest = &spec[1..];
    let close = rest.rfind('/')?;
    let pattern = &rest[..close];
    let flags = &rest[close + 1..];
    Some((pattern, flags))
}

#[derive(Debug, Clone)]
enum Field {
    From,
    To,
    Cc,
    Subject,
    HasAttachments,
    Header(String),
    DotPath(String),
}

#[derive(Debug, Clone)]
struct CompiledCondition {
    field: Field,
    matcher: Matcher,
}

#[derive(Debug, Clone)]
struct CompiledRule {
    name: String,
    conditions: Vec<CompiledCondition>,
    webhook: String,
    priority: i64,
    stop_processing: bool,
}

impl CompiledRule {
    fn matches(&self, email: &ParsedEmail, email_json: &Value) -> bool {
        self.conditions
            .iter()
            .all(|c| condition_matches(c, email, email_json))
    }
}

fn condition_matches(condition: &CompiledCondition, email: &ParsedEmail, email_json: &Value) -> bool {
    match &condition.field {
        Field::From => values_for_address(&email.from).iter().any(|v| condition.matcher.matches(v)),
        Field::To => values_for_address(&email.to).iter().any(|v| condition.matcher.matches(v)),
        Field::Cc => values_for_address(&email.cc).iter().any(|v| condition.matcher.matches(v)),
        Field::Subject => condition.matcher.matches(&email.subject),
        Field::HasAttachments => {
            let value = if email.has_attachments() { "true" } else { "false" };
            condition.matcher.matches(value)
        }
        Field::Header(name) => email
            .headers
            .get_all(name)
            .iter()
            .any(|v| condition.matcher.matches(v)),
        Field::DotPath(path) => match dot_path_lookup(email_json, path) {
            Some(Value::Array(items)) => items
                .iter()
                .any(|v| condition.matcher.matches(&value_to_string(v))),
            Some(v) => condition.matcher.matches(&value_to_string(&v)),
            None => false,
        },
    }
}

fn values_for_address(list: &crate::model::AddressList) -> Vec<String> {
    list.value.iter().map(|a| a.address.clone()).collect()
}

fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn dot_path_lookup(root: &Value, path: &str) -> Option<Value> {
    let mut current = root;
    for part in path.split('.') {
        current = current.get(part)?;
    }
    Some(current.clone())
}

/// Parses a raw condition value into the (field, matcher) pair. The
/// `header` field uses the `{name, value}` object form; everything else
/// accepts a plain string/bool/number matcher spec.
fn compile_condition(key: &str, raw: RawCondition) -> CompiledCondition {
    match (key, raw) {
        ("header", RawCondition::Header { name, value }) => CompiledCondition {
            field: Field::Header(name),
            matcher: Matcher::compile(&value),
        },
        ("from", RawCondition::Scalar(v)) => CompiledCondition {
            field: Field::From,
            matcher: Matcher::compile(&value_to_string(&v)),
        },
        ("to", RawCondition::Scalar(v)) => CompiledCondition {
            field: Field::To,
            matcher: Matcher::compile(&value_to_string(&v)),
        },
        ("cc", RawCondition::Scalar(v)) => CompiledCondition {
            field: Field::Cc,
            matcher: Matcher::compile(&value_to_string(&v)),
        },
        ("subject", RawCondition::Scalar(v)) => CompiledCondition {
            field: Field::Subject,
            matcher: Matcher::compile(&value_to_string(&v)),
        },
        ("hasAttachments", RawCondition::Scalar(v)) => CompiledCondition {
            field: Field::HasAttachments,
            matcher: Matcher::compile(&value_to_string(&v)),
        },
        (other, RawCondition::Scalar(v)) => CompiledCondition {
            field: Field::DotPath(other.to_string()),
            matcher: Matcher::compile(&value_to_string(&v)),
        },
        (other, RawCondition::Header { name, value }) => {
            // A `{name,value}` shape used on a non-`header` key: treat as a
            // dot-path lookup of the literal object, matched against `value`.
            let _ = name;
            CompiledCondition {
                field: Field::DotPath(other.to_string()),
                matcher: Matcher::compile(&value),
            }
        }
    }
}

/// Evaluates `WEBHOOK_RULES` against parsed emails and falls back to the
/// default `WEBHOOK_URL` target when nothing matches.
pub struct WebhookRouter {
    rules: Vec<CompiledRule>,
    default_webhook: Option<String>,
    allow_insecure_http: bool,
}

impl WebhookRouter {
    /// Builds a router from the raw `WEBHOOK_RULES` JSON (if any) and the
    /// fallback `WEBHOOK_URL`. Malformed JSON yields an empty rule list
    /// rather than a construction error — the router still falls back to
    /// the default.
    pub fn new(rules_raw: Option<&str>, default_webhook: Option<String>, allow_insecure_http: bool) -> Self {
        let mut rules = parse_rules(rules_raw);
        rules.sort_by(|a, b| a.priority.cmp(&b.priority));
        WebhookRouter {
            rules,
            default_webhook,
            allow_insecure_http,
        }
    }

    /// Evaluates every rule in priority order, collecting matches and
    /// stopping at the first match flagged `stopProcessing`. Falls back to
    /// the default target when nothing matched. URLs with scheme `http`
    /// are dropped unless insecure HTTP is allowed.
    pub fn route(&self, email: &ParsedEmail) -> Vec<RouteTarget> {
        let email_json = serde_json::to_value(email).unwrap_or(Value::Null);
        let mut targets = Vec::new();

        for rule in &self.rules {
            if rule.matches(email, &email_json) {
                if self.accept_url(&rule.webhook) {
                    targets.push(RouteTarget {
                        webhook: rule.webhook.clone(),
                        rule_name: rule.name.clone(),
                        priority: rule.priority,
                    });
                }
                if rule.stop_processing {
                    break;
                }
            }
        }

        if targets.is_empty() {
            if let Some(default) = &self.default_webhook {
                if self.accept_url(default) {
                    targets.push(RouteTarget {
                        webhook: default.clone(),
                        rule_name: "default".to_string(),
                        priority: DEFAULT_TARGET_PRIORITY,
                    });
                }
            }
        }

        targets
    }

    fn accept_url(&self, url: &str) -> bool {
        if self.allow_insecure_http {
            return true;
        }
        !url.trim_start().to_lowercase().starts_with("http://")
    }
}

fn parse_rules(raw: Option<&str>) -> Vec<CompiledRule> {
    let Some(raw) = raw else {
        return Vec::new();
    };
    let doc: RawRulesDocument = match serde_json::from_str(raw) {
        Ok(doc) => doc,
        Err(_) => return Vec::new(),
    };
    let raw_rules = match doc {
        RawRulesDocument::List(rules) => rules,
        RawRulesDocument::Wrapped { rules } => rules,
    };

    raw_rules
        .into_iter()
        .map(|r| CompiledRule {
            name: r.name.unwrap_or_else(|| "unnamed".to_string()),
            conditions: r
                .conditions
                .into_iter()
                .map(|(k, v)| compile_condition(&k, v))
                .collect(),
            webhook: r.webhook,
            priority: r.priority.unwrap_or(DEFAULT_RULE_PRIORITY),
            stop_processing: r.stop_processing,
        })
        .collect()
}
