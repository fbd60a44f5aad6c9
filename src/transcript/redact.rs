//! Secret redaction rules
//!
//! An ordered list of [`RedactionRule`]s, each a regex plus a strategy for what
//! to replace. Rules run in order over the whole input, so a later rule sees the
//! output of the earlier ones (e.g. a token inside a clone URL is masked by the
//! token rule before the URL rule masks the remaining userinfo).
//!
//! ```text
//! "export ANTHROPIC_API_KEY=sk-ant-api03-xxxx…"
//!        │ anthropic_api_key  (Whole)
//!        ▼
//! "export ANTHROPIC_API_KEY=[REDACTED]"
//!        │ secret_assignment  (SecretGroup: value already masked, skipped)
//!        ▼
//! "export ANTHROPIC_API_KEY=[REDACTED]"
//! ```

use lazy_static::lazy_static;
use regex::{Captures, Regex};

use crate::metrics::REDACTIONS;

/// Replacement for every redacted span
pub const REDACTION_MARKER: &str = "[REDACTED]";

/// Name of the capture group masked by [`Strategy::SecretGroup`]
const SECRET_GROUP: &str = "secret";

/// How a rule rewrites a match
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    /// Replace the entire match
    Whole,
    /// Replace only the `secret` capture group, keeping the rest of the match
    /// (key names, URL schemes, `Bearer ` prefixes)
    SecretGroup,
}

/// One named pattern
#[derive(Debug, Clone)]
pub struct RedactionRule {
    pub name: &'static str,
    pub pattern: Regex,
    pub strategy: Strategy,
}

impl RedactionRule {
    /// Build a rule from a pattern that is known to be valid
    fn builtin(name: &'static str, pattern: &str, strategy: Strategy) -> Self {
        Self {
            name,
            pattern: Regex::new(pattern).expect("built-in redaction pattern must compile"),
            strategy,
        }
    }

    /// Apply this rule, returning the rewritten text and how many spans changed
    pub fn apply(&self, input: &str) -> (String, usize) {
        let mut hits = 0usize;
        let output = self.pattern.replace_all(input, |caps: &Captures<'_>| {
            let whole = caps.get(0).map(|m| m.as_str()).unwrap_or_default();
            match self.strategy {
                Strategy::Whole => {
                    hits += 1;
                    REDACTION_MARKER.to_string()
                }
                Strategy::SecretGroup => match caps.name(SECRET_GROUP) {
                    Some(secret) if secret.as_str() != REDACTION_MARKER => {
                        hits += 1;
                        let base = caps.get(0).map(|m| m.start()).unwrap_or_default();
                        let start = secret.start() - base;
                        let end = secret.end() - base;
                        format!("{}{}{}", &whole[..start], REDACTION_MARKER, &whole[end..])
                    }
                    _ => whole.to_string(),
                },
            }
        });
        (output.into_owned(), hits)
    }
}

/// Ordered rule set
#[derive(Debug, Clone)]
pub struct Redactor {
    rules: Vec<RedactionRule>,
}

impl Redactor {
    pub fn new(rules: Vec<RedactionRule>) -> Self {
        Self { rules }
    }

    /// Built-in rules covering provider keys, tokens, credential URLs and
    /// secret-looking environment assignments
    pub fn builtin() -> Self {
        use Strategy::*;
        Self::new(vec![
            RedactionRule::builtin(
                "private_key_block",
                r"-----BEGIN [A-Z ]*PRIVATE KEY-----[\s\S]*?-----END [A-Z ]*PRIVATE KEY-----",
                Whole,
            ),
            RedactionRule::builtin("anthropic_api_key", r"sk-ant-[A-Za-z0-9_\-]{20,}", Whole),
            RedactionRule::builtin("openai_api_key", r"sk-(?:proj-)?[A-Za-z0-9_\-]{20,}", Whole),
            RedactionRule::builtin("google_api_key", r"AIza[0-9A-Za-z_\-]{35}", Whole),
            RedactionRule::builtin("github_token", r"gh[pousr]_[A-Za-z0-9]{36,}", Whole),
            RedactionRule::builtin("github_pat", r"github_pat_[A-Za-z0-9_]{22,}", Whole),
            RedactionRule::builtin("gitlab_token", r"glpat-[A-Za-z0-9_\-]{20,}", Whole),
            RedactionRule::builtin("slack_token", r"xox[abposr]-[A-Za-z0-9\-]{10,}", Whole),
            RedactionRule::builtin("aws_access_key", r"\b(?:AKIA|ASIA)[0-9A-Z]{16}\b", Whole),
            RedactionRule::builtin(
                "bearer_token",
                r"(?i:bearer)\s+(?P<secret>[A-Za-z0-9._~+/\-]{16,}=*)",
                SecretGroup,
            ),
            RedactionRule::builtin(
                "credential_url",
                r"[A-Za-z][A-Za-z0-9+.\-]*://(?P<secret>[^\s/@]+)@",
                SecretGroup,
            ),
            RedactionRule::builtin(
                "secret_assignment",
                r#"\b[A-Z0-9_]*(?:API_KEY|APIKEY|TOKEN|SECRET|PASSWORD|PASSWD|CREDENTIALS?|PRIVATE_KEY|ACCESS_KEY)[A-Z0-9_]*\s*=\s*(?P<secret>"[^"\n]*"|'[^'\n]*'|[^\s"']+)"#,
                SecretGroup,
            ),
        ])
    }

    pub fn rules(&self) -> &[RedactionRule] {
        &self.rules
    }

    /// Redact `input`, counting hits per rule in the metrics registry
    pub fn redact(&self, input: &str) -> String {
        let mut text = input.to_string();
        for rule in &self.rules {
            let (next, hits) = rule.apply(&text);
            if hits > 0 {
                REDACTIONS.with_label_values(&[rule.name]).inc_by(hits as u64);
                text = next;
            }
        }
        text
    }
}

impl Default for Redactor {
    fn default() -> Self {
        Self::builtin()
    }
}

lazy_static! {
    static ref DEFAULT_REDACTOR: Redactor = Redactor::builtin();
}

/// Redact with the built-in rule set
pub fn redact(input: &str) -> String {
    DEFAULT_REDACTOR.redact(input)
}
