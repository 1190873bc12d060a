//! Least-privilege resource scope.
//!
//! Resource identifiers are `/`-separated segments, e.g.
//! `org:acme/projects/apollo/read`. Patterns match segment by segment:
//!
//! | Segment | Matches |
//! |---------|---------|
//! | `apollo` | exactly `apollo` |
//! | `*`, `report-*.pdf`, `v?`, `[ab]x` | one segment, glob syntax |
//! | `**` | zero or more whole segments |
//!
//! Evaluation order is fixed:
//!
//! 1. Deny patterns. Any match denies, whatever the allow list says.
//! 2. Allow patterns. The most specific match (most literal characters, then
//!    highest level) is the grant; the requested level must not exceed it.
//! 3. Nothing matched: deny. An empty allow list denies everything.

use crate::delegation::Delegation;
use crate::error::{Error, ReasonCode, Result, Verdict};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use tracing::debug;

/// Permission level. Ordered: `Read < Write < Admin`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccessLevel {
    Read,
    Write,
    Admin,
}

impl AccessLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            AccessLevel::Read => "read",
            AccessLevel::Write => "write",
            AccessLevel::Admin => "admin",
        }
    }
}

impl fmt::Display for AccessLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AccessLevel {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "read" => Ok(AccessLevel::Read),
            "write" => Ok(AccessLevel::Write),
            "admin" => Ok(AccessLevel::Admin),
            _ => Err(Error::InvalidAccessLevel(s.to_string())),
        }
    }
}

/// Allow or deny.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Polarity {
    Allow,
    Deny,
}

#[derive(Debug, Clone)]
enum Segment {
    Literal(String),
    Glob(glob::Pattern),
    Recursive,
}

impl Segment {
    fn parse(raw: &str, pattern: &str) -> Result<Self> {
        if raw.is_empty() {
            return Err(Error::InvalidPattern(format!(
                "empty segment in '{}'",
                pattern
            )));
        }
        if raw == "**" {
            return Ok(Segment::Recursive);
        }
        if raw.contains(['*', '?', '[']) {
            let glob = glob::Pattern::new(raw)
                .map_err(|e| Error::InvalidPattern(format!("'{}': {}", pattern, e)))?;
            return Ok(Segment::Glob(glob));
        }
        Ok(Segment::Literal(raw.to_string()))
    }

    fn matches(&self, segment: &str) -> bool {
        match self {
            Segment::Literal(lit) => lit == segment,
            Segment::Glob(glob) => glob.matches(segment),
            Segment::Recursive => true,
        }
    }

    fn literal_chars(&self) -> usize {
        match self {
            Segment::Literal(lit) => lit.chars().count(),
            Segment::Glob(glob) => glob
                .as_str()
                .chars()
                .filter(|c| !matches!(c, '*' | '?' | '[' | ']' | '!'))
                .count(),
            Segment::Recursive => 0,
        }
    }
}

fn match_segments(pattern: &[Segment], resource: &[&str]) -> bool {
    match pattern.split_first() {
        None => resource.is_empty(),
        Some((Segment::Recursive, rest)) => {
            (0..=resource.len()).any(|skip| match_segments(rest, &resource[skip..]))
        }
        Some((segment, rest)) => match resource.split_first() {
            Some((head, tail)) => segment.matches(head) && match_segments(rest, tail),
            None => false,
        },
    }
}

/// A compiled scope rule.
#[derive(Debug, Clone)]
pub struct ResourcePattern {
    raw: String,
    segments: Vec<Segment>,
    level: AccessLevel,
    polarity: Polarity,
    specificity: usize,
}

impl ResourcePattern {
    fn compile(pattern: &str, level: AccessLevel, polarity: Polarity) -> Result<Self> {
        if pattern.is_empty() {
            return Err(Error::InvalidPattern("empty pattern".into()));
        }
        let segments = pattern
            .split('/')
            .map(|s| Segment::parse(s, pattern))
            .collect::<Result<Vec<_>>>()?;
        let specificity = segments.iter().map(Segment::literal_chars).sum();
        Ok(Self {
            raw: pattern.to_string(),
            segments,
            level,
            polarity,
            specificity,
        })
    }

    /// Grant `level` on resources matching `pattern`.
    pub fn allow(pattern: &str, level: AccessLevel) -> Result<Self> {
        Self::compile(pattern, level, Polarity::Allow)
    }

    /// Deny every level on resources matching `pattern`.
    pub fn deny(pattern: &str) -> Result<Self> {
        Self::compile(pattern, AccessLevel::Read, Polarity::Deny)
    }

    /// Deny requests at `level` and above, e.g. `deny_at(p, Write)` keeps
    /// reads possible.
    pub fn deny_at(pattern: &str, level: AccessLevel) -> Result<Self> {
        Self::compile(pattern, level, Polarity::Deny)
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn level(&self) -> AccessLevel {
        self.level
    }

    pub fn polarity(&self) -> Polarity {
        self.polarity
    }

    pub fn specificity(&self) -> usize {
        self.specificity
    }

    pub fn matches(&self, resource: &str) -> bool {
        let parts: Vec<&str> = resource.split('/').collect();
        match_segments(&self.segments, &parts)
    }
}

/// Deny-first scope evaluator.
#[derive(Debug, Clone, Default)]
pub struct ResourceConstraintEngine {
    allowed: Vec<ResourcePattern>,
    denied: Vec<ResourcePattern>,
}

impl ResourceConstraintEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Engine for a delegation's scope plus deployment-wide denials.
    pub fn for_delegation(delegation: &Delegation, global_denies: &[ResourcePattern]) -> Result<Self> {
        let mut engine = Self::new();
        engine.denied.extend(global_denies.iter().cloned());
        for pattern in delegation.deny() {
            engine.add_denied(pattern)?;
        }
        for pattern in delegation.allow() {
            engine.add_allowed(pattern, delegation.level())?;
        }
        Ok(engine)
    }

    pub fn add_allowed(&mut self, pattern: &str, level: AccessLevel) -> Result<()> {
        self.allowed.push(ResourcePattern::allow(pattern, level)?);
        Ok(())
    }

    pub fn add_denied(&mut self, pattern: &str) -> Result<()> {
        self.denied.push(ResourcePattern::deny(pattern)?);
        Ok(())
    }

    pub fn add_denied_at(&mut self, pattern: &str, level: AccessLevel) -> Result<()> {
        self.denied.push(ResourcePattern::deny_at(pattern, level)?);
        Ok(())
    }

    pub fn add_pattern(&mut self, pattern: ResourcePattern) {
        match pattern.polarity {
            Polarity::Allow => self.allowed.push(pattern),
            Polarity::Deny => self.denied.push(pattern),
        }
    }

    pub fn allowed(&self) -> &[ResourcePattern] {
        &self.allowed
    }

    pub fn denied(&self) -> &[ResourcePattern] {
        &self.denied
    }

    /// Decide whether `requested` access to `resource` is in scope.
    ///
    /// Returns the granted level of the winning allow pattern.
    pub fn is_authorized(&self, resource: &str, requested: AccessLevel) -> Verdict<AccessLevel> {
        if resource.is_empty() || resource.split('/').any(str::is_empty) {
            debug!(resource, "Malformed resource identifier");
            return Err(ReasonCode::ResourceDenied);
        }

        if let Some(deny) = self
            .denied
            .iter()
            .find(|d| requested >= d.level && d.matches(resource))
        {
            debug!(resource, pattern = %deny.raw, "Resource matched deny pattern");
            return Err(ReasonCode::ResourceDenied);
        }

        let best = self
            .allowed
            .iter()
            .filter(|a| a.matches(resource))
            .max_by(|a, b| {
                a.specificity
                    .cmp(&b.specificity)
                    .then(a.level.cmp(&b.level))
            });

        match best {
            Some(grant) if requested <= grant.level => Ok(grant.level),
            Some(grant) => {
                debug!(
                    resource,
                    pattern = %grant.raw,
                    granted = %grant.level,
                    requested = %requested,
                    "Requested level exceeds grant"
                );
                Err(ReasonCode::ResourceDenied)
            }
            None => {
                debug!(resource, "No allow pattern matched");
                Err(ReasonCode::ResourceDenied)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_access_level_ordering() {
        assert!(AccessLevel::Read < AccessLevel::Write);
        assert!(AccessLevel::Write < AccessLevel::Admin);
        assert_eq!("ADMIN".parse::<AccessLevel>().unwrap(), AccessLevel::Admin);
        assert!("owner".parse::<AccessLevel>().is_err());
    }

    #[test]
    fn test_empty_allow_list_denies() {
        let engine = ResourceConstraintEngine::new();
        assert_eq!(
            engine.is_authorized("org:acme/docs/read", AccessLevel::Read),
            Err(ReasonCode::ResourceDenied)
        );
    }

    #[test]
    fn test_deny_overrides_allow() {
        let mut engine = ResourceConstraintEngine::new();
        engine.add_allowed("org:acme/*/read", AccessLevel::Read).unwrap();
        engine.add_denied("org:acme/secrets/*").unwrap();

        assert_eq!(
            engine.is_authorized("org:acme/secrets/read", AccessLevel::Read),
            Err(ReasonCode::ResourceDenied)
        );
        assert_eq!(
            engine.is_authorized("org:acme/docs/read", AccessLevel::Read),
            Ok(AccessLevel::Read)
        );
    }

    #[test]
    fn test_single_star_matches_one_segment() {
        let p = ResourcePattern::allow("org:acme/*/read", AccessLevel::Read).unwrap();
        assert!(p.matches("org:acme/docs/read"));
        assert!(!p.matches("org:acme/docs/deep/read"));
        assert!(!p.matches("org:acme/read"));
    }

    #[test]
    fn test_double_star_matches_many_segments() {
        let p = ResourcePattern::allow("org:acme/**/read", AccessLevel::Read).unwrap();
        assert!(p.matches("org:acme/read"));
        assert!(p.matches("org:acme/a/read"));
        assert!(p.matches("org:acme/a/b/c/read"));
        assert!(!p.matches("org:other/a/read"));
    }

    #[test]
    fn test_glob_within_segment() {
        let p = ResourcePattern::allow("files/report-*.pdf", AccessLevel::Read).unwrap();
        assert!(p.matches("files/report-2024.pdf"));
        assert!(!p.matches("files/report-2024.txt"));
    }

    #[test]
    fn test_requested_level_must_not_exceed_grant() {
        let mut engine = ResourceConstraintEngine::new();
        engine.add_allowed("db/customers", AccessLevel::Write).unwrap();

        assert_eq!(
            engine.is_authorized("db/customers", AccessLevel::Read),
            Ok(AccessLevel::Write)
        );
        assert_eq!(
            engine.is_authorized("db/customers", AccessLevel::Admin),
            Err(ReasonCode::ResourceDenied)
        );
    }

    #[test]
    fn test_most_specific_allow_wins() {
        let mut engine = ResourceConstraintEngine::new();
        engine.add_allowed("db/**", AccessLevel::Admin).unwrap();
        engine.add_allowed("db/payroll", AccessLevel::Read).unwrap();

        assert_eq!(
            engine.is_authorized("db/payroll", AccessLevel::Write),
            Err(ReasonCode::ResourceDenied)
        );
        assert_eq!(
            engine.is_authorized("db/inventory", AccessLevel::Write),
            Ok(AccessLevel::Admin)
        );
    }

    #[test]
    fn test_level_scoped_deny() {
        let mut engine = ResourceConstraintEngine::new();
        engine.add_allowed("repo/**", AccessLevel::Admin).unwrap();
        engine.add_denied_at("repo/main", AccessLevel::Write).unwrap();

        assert!(engine.is_authorized("repo/main", AccessLevel::Read).is_ok());
        assert_eq!(
            engine.is_authorized("repo/main", AccessLevel::Write),
            Err(ReasonCode::ResourceDenied)
        );
    }

    #[test]
    fn test_invalid_patterns_rejected() {
        assert!(ResourcePattern::allow("", AccessLevel::Read).is_err());
        assert!(ResourcePattern::allow("a//b", AccessLevel::Read).is_err());
        assert!(ResourcePattern::allow("a/[b", AccessLevel::Read).is_err());
    }

    #[test]
    fn test_malformed_resource_denied() {
        let mut engine = ResourceConstraintEngine::new();
        engine.add_allowed("**", AccessLevel::Admin).unwrap();
        assert!(engine.is_authorized("", AccessLevel::Read).is_err());
        assert!(engine.is_authorized("a//b", AccessLevel::Read).is_err());
        assert!(engine.is_authorized("a/b", AccessLevel::Read).is_ok());
    }
}
