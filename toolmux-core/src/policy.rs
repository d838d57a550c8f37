//! Allow/deny policies over the qualified tool namespace.
//!
//! Rules are pattern strings: an exact name, a prefix like `fs:*`, or a
//! general glob with `*` and `?`. They compile to a tagged [`Pattern`] so
//! specificity comparison is explicit and testable rather than string
//! dispatch. Evaluation is closed-world: nothing is permitted unless an
//! allow rule matches, and a deny match at least as specific as the best
//! allow match wins.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Allow/deny pattern sets.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyRules {
    /// Patterns that grant access.
    pub allow: Vec<String>,
    /// Exceptions carved out of the allow set.
    #[serde(default)]
    pub deny: Vec<String>,
}

/// A named rule set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Policy {
    /// Stable identity.
    pub uuid: Uuid,
    /// Unique name.
    pub name: String,
    /// Optional description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// The rule sets.
    pub rules: PolicyRules,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last update time.
    pub updated_at: DateTime<Utc>,
}

impl Policy {
    /// A policy with a stable name-derived uuid, stamped now.
    pub fn new(name: impl Into<String>, description: Option<String>, rules: PolicyRules) -> Self {
        let name = name.into();
        let now = Utc::now();
        Self {
            uuid: Uuid::new_v5(&Uuid::NAMESPACE_OID, name.as_bytes()),
            name,
            description,
            rules,
            created_at: now,
            updated_at: now,
        }
    }

    /// Evaluate this policy against a qualified name.
    pub fn evaluate(&self, qualified_name: &str) -> Decision {
        CompiledPolicy::compile(&self.rules).evaluate(qualified_name)
    }
}

/// The outcome of a policy evaluation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// The call may proceed.
    Permit,
    /// The call is rejected.
    Deny {
        /// Why, naming the deciding rule.
        reason: String,
    },
}

impl Decision {
    /// Whether this decision permits the call.
    pub fn is_permit(&self) -> bool {
        matches!(self, Decision::Permit)
    }
}

/// One compiled rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Pattern {
    /// Matches the name exactly; maximally specific.
    Exact(String),
    /// Matches any name with this literal prefix (`fs:*`).
    Prefix(String),
    /// General glob with `*` (any run) and `?` (any single char).
    Glob(String),
}

impl Pattern {
    /// Classify a raw rule string.
    pub fn parse(raw: &str) -> Self {
        if !raw.contains(['*', '?']) {
            return Pattern::Exact(raw.to_string());
        }
        if let Some(prefix) = raw.strip_suffix('*') {
            if !prefix.contains(['*', '?']) {
                return Pattern::Prefix(prefix.to_string());
            }
        }
        Pattern::Glob(raw.to_string())
    }

    /// Whether the pattern matches a qualified name.
    pub fn matches(&self, name: &str) -> bool {
        match self {
            Pattern::Exact(p) => p == name,
            Pattern::Prefix(p) => name.starts_with(p.as_str()),
            Pattern::Glob(p) => glob_match(p, name),
        }
    }

    /// Literal-prefix length used for tie-breaking; exact matches rank
    /// above every wildcard pattern.
    pub fn specificity(&self) -> usize {
        match self {
            Pattern::Exact(_) => usize::MAX,
            Pattern::Prefix(p) => p.chars().count(),
            Pattern::Glob(p) => p.chars().take_while(|c| !matches!(c, '*' | '?')).count(),
        }
    }

    /// The original rule text, for deny reasons.
    fn source(&self) -> String {
        match self {
            Pattern::Exact(p) => p.clone(),
            Pattern::Prefix(p) => format!("{p}*"),
            Pattern::Glob(p) => p.clone(),
        }
    }
}

/// Iterative glob matcher for `*` and `?` with single-star backtracking.
fn glob_match(pattern: &str, text: &str) -> bool {
    let p: Vec<char> = pattern.chars().collect();
    let t: Vec<char> = text.chars().collect();
    let (mut pi, mut ti) = (0usize, 0usize);
    let mut star: Option<(usize, usize)> = None;

    while ti < t.len() {
        if pi < p.len() && (p[pi] == '?' || p[pi] == t[ti]) {
            pi += 1;
            ti += 1;
        } else if pi < p.len() && p[pi] == '*' {
            star = Some((pi, ti));
            pi += 1;
        } else if let Some((star_pi, star_ti)) = star {
            // Give the last star one more character and retry.
            pi = star_pi + 1;
            ti = star_ti + 1;
            star = Some((star_pi, star_ti + 1));
        } else {
            return false;
        }
    }
    while pi < p.len() && p[pi] == '*' {
        pi += 1;
    }
    pi == p.len()
}

/// A policy's rules, compiled once for repeated evaluation.
#[derive(Debug, Clone)]
pub struct CompiledPolicy {
    allow: Vec<Pattern>,
    deny: Vec<Pattern>,
}

impl CompiledPolicy {
    /// Compile both rule sets.
    pub fn compile(rules: &PolicyRules) -> Self {
        Self {
            allow: rules.allow.iter().map(|r| Pattern::parse(r)).collect(),
            deny: rules.deny.iter().map(|r| Pattern::parse(r)).collect(),
        }
    }

    /// Evaluate a qualified name.
    ///
    /// Resolution order: collect all matches on both sides, then compare
    /// the most specific of each. A deny at least as specific as the best
    /// allow denies; otherwise any allow match permits; no allow match
    /// denies by default.
    pub fn evaluate(&self, qualified_name: &str) -> Decision {
        let best_allow = best_match(&self.allow, qualified_name);
        let best_deny = best_match(&self.deny, qualified_name);

        match (best_deny, best_allow) {
            (Some((deny_spec, deny_pat)), Some((allow_spec, _))) if deny_spec >= allow_spec => {
                Decision::Deny {
                    reason: format!("deny rule {:?} overrides", deny_pat.source()),
                }
            }
            (_, Some(_)) => Decision::Permit,
            (Some((_, deny_pat)), None) => Decision::Deny {
                reason: format!("matched deny rule {:?}", deny_pat.source()),
            },
            (None, None) => Decision::Deny {
                reason: format!("no allow rule matches {qualified_name:?}"),
            },
        }
    }
}

fn best_match<'a>(patterns: &'a [Pattern], name: &str) -> Option<(usize, &'a Pattern)> {
    patterns
        .iter()
        .filter(|p| p.matches(name))
        .map(|p| (p.specificity(), p))
        .max_by_key(|(spec, _)| *spec)
}

/// Discovery and handshake operations are never policy-gated.
pub fn is_discovery_exempt(method: &str) -> bool {
    matches!(
        method,
        "initialize"
            | "notifications/initialized"
            | "ping"
            | "tools/list"
            | "resources/list"
            | "prompts/list"
    )
}

/// A named subset of the aggregated namespace.
///
/// A grouping convenience for configuration and display, not an
/// authorization primitive; converting one into allow rules is explicit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSet {
    /// Stable identity.
    pub uuid: Uuid,
    /// Unique name.
    pub name: String,
    /// Optional description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Qualified tool names, in display order.
    pub tools: Vec<String>,
}

impl ToolSet {
    /// A tool set with a stable name-derived uuid.
    pub fn new(name: impl Into<String>, tools: Vec<String>) -> Self {
        let name = name.into();
        Self {
            uuid: Uuid::new_v5(&Uuid::NAMESPACE_OID, name.as_bytes()),
            name,
            description: None,
            tools,
        }
    }

    /// Exact-match allow rules covering this set.
    pub fn to_allow_rules(&self) -> Vec<String> {
        self.tools.clone()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(allow: &[&str], deny: &[&str]) -> CompiledPolicy {
        CompiledPolicy::compile(&PolicyRules {
            allow: allow.iter().map(|s| s.to_string()).collect(),
            deny: deny.iter().map(|s| s.to_string()).collect(),
        })
    }

    // ── Pattern parsing ──────────────────────────────────────────────────

    #[test]
    fn test_parse_exact() {
        assert_eq!(
            Pattern::parse("fs:delete"),
            Pattern::Exact("fs:delete".to_string())
        );
    }

    #[test]
    fn test_parse_prefix() {
        assert_eq!(Pattern::parse("fs:*"), Pattern::Prefix("fs:".to_string()));
        assert_eq!(Pattern::parse("*"), Pattern::Prefix(String::new()));
    }

    #[test]
    fn test_parse_glob() {
        assert_eq!(
            Pattern::parse("fs:read_?"),
            Pattern::Glob("fs:read_?".to_string())
        );
        assert_eq!(
            Pattern::parse("*:delete"),
            Pattern::Glob("*:delete".to_string())
        );
    }

    // ── Glob matching ────────────────────────────────────────────────────

    #[test]
    fn test_glob_star_runs() {
        assert!(glob_match("fs:*", "fs:read"));
        assert!(glob_match("*:read", "fs:read"));
        assert!(glob_match("fs:*:meta", "fs:read:meta"));
        assert!(!glob_match("fs:*:meta", "fs:read"));
    }

    #[test]
    fn test_glob_question_mark() {
        assert!(glob_match("fs:read_?", "fs:read_1"));
        assert!(!glob_match("fs:read_?", "fs:read_12"));
        assert!(!glob_match("fs:read_?", "fs:read_"));
    }

    #[test]
    fn test_glob_trailing_stars() {
        assert!(glob_match("fs:read**", "fs:read"));
        assert!(glob_match("**", ""));
    }

    // ── Specificity ──────────────────────────────────────────────────────

    #[test]
    fn test_specificity_ordering() {
        let exact = Pattern::parse("fs:delete");
        let prefix = Pattern::parse("fs:*");
        let glob = Pattern::parse("fs:d*e");
        assert!(exact.specificity() > prefix.specificity());
        assert!(glob.specificity() > prefix.specificity());
        assert_eq!(prefix.specificity(), 3);
        assert_eq!(glob.specificity(), 4);
    }

    // ── Evaluation ───────────────────────────────────────────────────────

    #[test]
    fn test_allow_star_deny_exact() {
        let p = policy(&["fs:*"], &["fs:delete"]);
        assert!(!p.evaluate("fs:delete").is_permit());
        assert!(p.evaluate("fs:read").is_permit());
        assert!(!p.evaluate("net:get").is_permit(), "closed world");
    }

    #[test]
    fn test_default_deny_reason_names_the_tool() {
        let p = policy(&["fs:*"], &[]);
        match p.evaluate("net:get") {
            Decision::Deny { reason } => assert!(reason.contains("net:get")),
            Decision::Permit => panic!("expected deny"),
        }
    }

    #[test]
    fn test_more_specific_allow_beats_broad_deny() {
        // The exact allow outranks the prefix deny.
        let p = policy(&["fs:delete"], &["fs:*"]);
        assert!(p.evaluate("fs:delete").is_permit());
        assert!(!p.evaluate("fs:read").is_permit());
    }

    #[test]
    fn test_equal_specificity_goes_to_deny() {
        let p = policy(&["fs:delete"], &["fs:delete"]);
        assert!(!p.evaluate("fs:delete").is_permit());

        let p = policy(&["fs:*"], &["fs:*"]);
        assert!(!p.evaluate("fs:read").is_permit());
    }

    #[test]
    fn test_deny_without_allow_is_deny() {
        let p = policy(&[], &["fs:*"]);
        match p.evaluate("fs:read") {
            Decision::Deny { reason } => assert!(reason.contains("fs:")),
            Decision::Permit => panic!("expected deny"),
        }
    }

    #[test]
    fn test_empty_rules_deny_everything() {
        let p = policy(&[], &[]);
        assert!(!p.evaluate("anything").is_permit());
    }

    #[test]
    fn test_best_allow_considered_not_first() {
        // A broad allow and a narrow allow both match; the narrow one is
        // what the deny has to beat.
        let p = policy(&["*", "fs:delete"], &["fs:*"]);
        assert!(p.evaluate("fs:delete").is_permit());
        assert!(!p.evaluate("fs:read").is_permit());
    }

    #[test]
    fn test_policy_record_evaluate() {
        let policy = Policy::new(
            "default",
            None,
            PolicyRules {
                allow: vec!["fs:*".to_string()],
                deny: vec!["fs:delete".to_string()],
            },
        );
        assert!(policy.evaluate("fs:read").is_permit());
        assert!(!policy.evaluate("fs:delete").is_permit());
        assert_eq!(policy.created_at, policy.updated_at);
    }

    #[test]
    fn test_policy_uuid_stable_by_name() {
        let a = Policy::new("default", None, PolicyRules { allow: vec![], deny: vec![] });
        let b = Policy::new("default", None, PolicyRules { allow: vec![], deny: vec![] });
        assert_eq!(a.uuid, b.uuid);
    }

    // ── Discovery exemption ──────────────────────────────────────────────

    #[test]
    fn test_discovery_never_gated() {
        assert!(is_discovery_exempt("tools/list"));
        assert!(is_discovery_exempt("initialize"));
        assert!(is_discovery_exempt("ping"));
        assert!(!is_discovery_exempt("tools/call"));
        assert!(!is_discovery_exempt("resources/read"));
    }

    // ── Tool sets ────────────────────────────────────────────────────────

    #[test]
    fn test_tool_set_to_allow_rules() {
        let set = ToolSet::new(
            "reads",
            vec!["fs:read".to_string(), "net:get".to_string()],
        );
        let p = CompiledPolicy::compile(&PolicyRules {
            allow: set.to_allow_rules(),
            deny: vec![],
        });
        assert!(p.evaluate("fs:read").is_permit());
        assert!(!p.evaluate("fs:write").is_permit());
    }
}
