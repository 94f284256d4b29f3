//! Policy snapshot and request matching

use super::pattern::{normalize_path, PathPattern};
use crate::error::Result;
use crate::types::EndpointProtection;
use chrono::{DateTime, Utc};
use std::cmp::Ordering;
use std::fmt;

/// Outcome of matching a request against the snapshot
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    /// No authentication needed
    Public,
    /// Subject must hold the permission code
    RequiresPermission(String),
    /// Protected rule without a permission code: any authenticated subject
    Authenticated,
    /// Nothing in the snapshot covers the request
    NoRuleMatched,
}

/// HTTP method selector of a rule
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MethodMatcher {
    Any,
    Exact(String),
}

impl MethodMatcher {
    pub fn parse(raw: &str) -> Self {
        let method = raw.trim();
        if method.is_empty() || method == "*" {
            MethodMatcher::Any
        } else {
            MethodMatcher::Exact(method.to_ascii_uppercase())
        }
    }

    pub fn matches(&self, method: &str) -> bool {
        match self {
            MethodMatcher::Any => true,
            MethodMatcher::Exact(expected) => expected.eq_ignore_ascii_case(method.trim()),
        }
    }

    fn rank(&self) -> u8 {
        match self {
            MethodMatcher::Exact(_) => 0,
            MethodMatcher::Any => 1,
        }
    }
}

impl fmt::Display for MethodMatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MethodMatcher::Any => f.write_str("*"),
            MethodMatcher::Exact(method) => f.write_str(method),
        }
    }
}

/// Rule with its pattern compiled
#[derive(Debug, Clone)]
pub struct CompiledRule {
    rule: EndpointProtection,
    pattern: PathPattern,
    method: MethodMatcher,
    position: usize,
}

impl CompiledRule {
    /// Compile a rule; `position` is its index in the source payload
    pub fn compile(rule: EndpointProtection, position: usize) -> Result<Self> {
        let pattern = PathPattern::parse(&rule.pattern)?;
        let method = MethodMatcher::parse(&rule.method);

        Ok(Self {
            rule,
            pattern,
            method,
            position,
        })
    }

    pub fn matches(&self, method: &str, path: &str) -> bool {
        self.method.matches(method) && self.pattern.matches(path)
    }

    pub fn verdict(&self) -> Verdict {
        if self.rule.is_public {
            return Verdict::Public;
        }

        match self.rule.permission() {
            Some(code) => Verdict::RequiresPermission(code.to_string()),
            None => Verdict::Authenticated,
        }
    }

    pub fn rule(&self) -> &EndpointProtection {
        &self.rule
    }

    pub fn pattern(&self) -> &PathPattern {
        &self.pattern
    }

    pub fn method(&self) -> &MethodMatcher {
        &self.method
    }

    /// Total evaluation order: first element wins
    ///
    /// priority desc, more literal segments, fewer `**`, fewer single wildcards,
    /// longer pattern, exact method before `*`, pattern text, rule id, then content
    /// so that only byte-identical duplicates fall back to their source position.
    fn precedence(&self, other: &Self) -> Ordering {
        other
            .rule
            .priority
            .cmp(&self.rule.priority)
            .then_with(|| {
                other
                    .pattern
                    .literal_segments()
                    .cmp(&self.pattern.literal_segments())
            })
            .then_with(|| {
                self.pattern
                    .multi_wildcards()
                    .cmp(&other.pattern.multi_wildcards())
            })
            .then_with(|| {
                self.pattern
                    .single_wildcards()
                    .cmp(&other.pattern.single_wildcards())
            })
            .then_with(|| other.pattern.as_str().len().cmp(&self.pattern.as_str().len()))
            .then_with(|| self.method.rank().cmp(&other.method.rank()))
            .then_with(|| self.pattern.as_str().cmp(other.pattern.as_str()))
            .then_with(|| self.method.to_string().cmp(&other.method.to_string()))
            .then_with(|| self.rule.id.cmp(&other.rule.id))
            // restrictive rules first among otherwise identical entries
            .then_with(|| self.rule.is_public.cmp(&other.rule.is_public))
            .then_with(|| self.rule.permission().cmp(&other.rule.permission()))
            .then_with(|| self.position.cmp(&other.position))
    }
}

/// Immutable, ordered view of the enforced rules
#[derive(Debug)]
pub struct PolicySnapshot {
    version: u64,
    rules: Vec<CompiledRule>,
    loaded_at: Option<DateTime<Utc>>,
}

impl PolicySnapshot {
    /// Snapshot served before the first successful sync
    pub fn empty() -> Self {
        Self {
            version: 0,
            rules: Vec::new(),
            loaded_at: None,
        }
    }

    /// Filter, compile and order a rule list
    ///
    /// A single uncompilable pattern fails the whole build.
    pub fn build(version: u64, rules: Vec<EndpointProtection>) -> Result<Self> {
        let mut compiled = rules
            .into_iter()
            .filter(EndpointProtection::is_enforced)
            .enumerate()
            .map(|(position, rule)| CompiledRule::compile(rule, position))
            .collect::<Result<Vec<_>>>()?;

        compiled.sort_by(CompiledRule::precedence);

        Ok(Self {
            version,
            rules: compiled,
            loaded_at: Some(Utc::now()),
        })
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn loaded_at(&self) -> Option<DateTime<Utc>> {
        self.loaded_at
    }

    /// Rules in evaluation order
    pub fn rules(&self) -> impl Iterator<Item = &CompiledRule> {
        self.rules.iter()
    }

    /// Winning rule for the request, if any
    ///
    /// The path is normalized first; a path that cannot be normalized matches nothing.
    pub fn match_rule(&self, method: &str, path: &str) -> Option<&CompiledRule> {
        let path = normalize_path(path)?;
        self.rules.iter().find(|rule| rule.matches(method, &path))
    }

    pub fn match_request(&self, method: &str, path: &str) -> Verdict {
        self.match_rule(method, path)
            .map(CompiledRule::verdict)
            .unwrap_or(Verdict::NoRuleMatched)
    }
}

impl Default for PolicySnapshot {
    fn default() -> Self {
        Self::empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(rules: Vec<EndpointProtection>) -> PolicySnapshot {
        PolicySnapshot::build(1, rules).unwrap()
    }

    #[test]
    fn test_method_matcher() {
        assert!(MethodMatcher::parse("get").matches("GET"));
        assert!(MethodMatcher::parse("GET").matches("get"));
        assert!(!MethodMatcher::parse("GET").matches("POST"));
        assert!(MethodMatcher::parse("*").matches("DELETE"));
        assert!(MethodMatcher::parse("").matches("PATCH"));
    }

    #[test]
    fn test_verdicts() {
        let snap = snapshot(vec![
            EndpointProtection::public("/auth/**", "*"),
            EndpointProtection::protected("/api/orders/**", "GET", "order:read"),
            EndpointProtection::authenticated("/api/profile", "*"),
        ]);

        assert_eq!(snap.match_request("POST", "/auth/login"), Verdict::Public);
        assert_eq!(
            snap.match_request("GET", "/api/orders/42"),
            Verdict::RequiresPermission("order:read".into())
        );
        assert_eq!(snap.match_request("GET", "/api/profile"), Verdict::Authenticated);
        assert_eq!(snap.match_request("POST", "/api/orders/42"), Verdict::NoRuleMatched);
        assert_eq!(snap.match_request("GET", "/unknown"), Verdict::NoRuleMatched);
    }

    #[test]
    fn test_priority_wins_over_specificity() {
        let snap = snapshot(vec![
            EndpointProtection::protected("/api/orders/42", "GET", "order:special"),
            EndpointProtection::public("/api/**", "*").with_priority(100),
        ]);

        assert_eq!(snap.match_request("GET", "/api/orders/42"), Verdict::Public);
    }

    #[test]
    fn test_specificity_breaks_priority_ties() {
        let snap = snapshot(vec![
            EndpointProtection::protected("/api/**", "*", "api:any"),
            EndpointProtection::protected("/api/orders/*", "*", "order:one"),
            EndpointProtection::protected("/api/orders/**", "*", "order:any"),
        ]);

        assert_eq!(
            snap.match_request("GET", "/api/orders/7"),
            Verdict::RequiresPermission("order:one".into())
        );
        assert_eq!(
            snap.match_request("GET", "/api/orders/7/items"),
            Verdict::RequiresPermission("order:any".into())
        );
        assert_eq!(
            snap.match_request("GET", "/api/invoices"),
            Verdict::RequiresPermission("api:any".into())
        );
    }

    #[test]
    fn test_exact_method_beats_wildcard_method() {
        let snap = snapshot(vec![
            EndpointProtection::protected("/api/orders/**", "*", "order:any"),
            EndpointProtection::protected("/api/orders/**", "DELETE", "order:delete"),
        ]);

        assert_eq!(
            snap.match_request("DELETE", "/api/orders/1"),
            Verdict::RequiresPermission("order:delete".into())
        );
        assert_eq!(
            snap.match_request("GET", "/api/orders/1"),
            Verdict::RequiresPermission("order:any".into())
        );
    }

    #[test]
    fn test_inactive_and_deleted_rules_are_dropped() {
        let snap = snapshot(vec![
            EndpointProtection::public("/api/**", "*").with_priority(10).inactive(),
            EndpointProtection::public("/api/**", "*").with_priority(10).mark_deleted(),
            EndpointProtection::protected("/api/**", "*", "api:any"),
        ]);

        assert_eq!(snap.len(), 1);
        assert_eq!(
            snap.match_request("GET", "/api/x"),
            Verdict::RequiresPermission("api:any".into())
        );
    }

    #[test]
    fn test_identical_rules_prefer_restrictive() {
        let forward = snapshot(vec![
            EndpointProtection::public("/api/x", "GET"),
            EndpointProtection::protected("/api/x", "GET", "x:read"),
        ]);
        let reverse = snapshot(vec![
            EndpointProtection::protected("/api/x", "GET", "x:read"),
            EndpointProtection::public("/api/x", "GET"),
        ]);

        assert_eq!(forward.match_request("GET", "/api/x"), reverse.match_request("GET", "/api/x"));
        assert_eq!(
            forward.match_request("GET", "/api/x"),
            Verdict::RequiresPermission("x:read".into())
        );
    }

    #[test]
    fn test_invalid_pattern_fails_build() {
        let result = PolicySnapshot::build(
            2,
            vec![
                EndpointProtection::public("/auth/**", "*"),
                EndpointProtection::protected("no-leading-slash", "*", "x"),
            ],
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_invalid_pattern_on_inactive_rule_is_ignored() {
        let result = PolicySnapshot::build(
            2,
            vec![EndpointProtection::protected("broken", "*", "x").inactive()],
        );
        assert!(result.is_ok());
    }

    #[test]
    fn test_empty_snapshot() {
        let snap = PolicySnapshot::empty();
        assert_eq!(snap.version(), 0);
        assert!(snap.is_empty());
        assert!(snap.loaded_at().is_none());
        assert_eq!(snap.match_request("GET", "/"), Verdict::NoRuleMatched);
    }

    #[test]
    fn test_dot_segments_cannot_reach_protected_rules_through_public_ones() {
        let snap = snapshot(vec![
            EndpointProtection::public("/auth/**", "*").with_priority(100),
            EndpointProtection::protected("/api/orders/**", "GET", "order:read").with_priority(10),
        ]);

        assert_eq!(
            snap.match_request("GET", "/auth/../api/orders/123"),
            Verdict::RequiresPermission("order:read".into())
        );
        assert_eq!(
            snap.match_request("GET", "/auth/%2e%2e/api/orders/123"),
            Verdict::RequiresPermission("order:read".into())
        );
        assert_eq!(
            snap.match_request("GET", "/auth/..%2fapi/orders/123"),
            Verdict::NoRuleMatched
        );
        assert_eq!(snap.match_request("GET", "/auth/./login"), Verdict::Public);
    }
}
