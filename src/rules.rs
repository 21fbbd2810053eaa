//! Override rules.
//!
//! Three independent tables decide whether a query is answered locally:
//! exact names, name suffixes and regular expressions. They are consulted in
//! that order and the first table with a hit wins, so an exact entry can
//! carve one name out of a broader suffix or pattern rule.
//!
//! Within the suffix and pattern tables the first rule in config order wins.

use std::fmt;
use std::net::Ipv4Addr;

use regex::Regex;
use rustc_hash::FxHashMap;
use serde::de::{MapAccess, Visitor};
use serde::{Deserialize, Deserializer};
use tracing::warn;

use crate::error::Error;

/// Where a matched name should point.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    /// A fixed IPv4 address.
    Addr(Ipv4Addr),
    /// This host's outward-facing LAN address.
    SelfAddr,
}

impl Target {
    /// Config spelling of [`Target::SelfAddr`].
    pub const SELF: &'static str = "self";

    fn parse(rule: &str, target: &str) -> Result<Self, Error> {
        if target == Self::SELF {
            return Ok(Self::SelfAddr);
        }
        target
            .parse()
            .map(Self::Addr)
            .map_err(|_| Error::InvalidTarget {
                rule: rule.to_string(),
                target: target.to_string(),
            })
    }

    /// The address to put in the answer record.
    pub fn resolve(self, self_ip: Ipv4Addr) -> Ipv4Addr {
        match self {
            Self::Addr(ip) => ip,
            Self::SelfAddr => self_ip,
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Addr(ip) => ip.fmt(f),
            Self::SelfAddr => f.write_str(Self::SELF),
        }
    }
}

/// Rule tables as written in the config file, in declaration order.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RawRules {
    #[serde(deserialize_with = "ordered_table")]
    pub exact: Vec<(String, String)>,
    #[serde(deserialize_with = "ordered_table")]
    pub suffix: Vec<(String, String)>,
    #[serde(deserialize_with = "ordered_table")]
    pub pattern: Vec<(String, String)>,
}

/// Deserialize a `key = "value"` table without losing key order.
fn ordered_table<'de, D>(deserializer: D) -> Result<Vec<(String, String)>, D::Error>
where
    D: Deserializer<'de>,
{
    struct TableVisitor;

    impl<'de> Visitor<'de> for TableVisitor {
        type Value = Vec<(String, String)>;

        fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str("a table of name = \"target\" entries")
        }

        fn visit_map<A>(self, mut map: A) -> Result<Self::Value, A::Error>
        where
            A: MapAccess<'de>,
        {
            let mut entries = Vec::with_capacity(map.size_hint().unwrap_or(0));
            while let Some(entry) = map.next_entry::<String, String>()? {
                entries.push(entry);
            }
            Ok(entries)
        }
    }

    deserializer.deserialize_map(TableVisitor)
}

/// Outcome of checking one name against the rules offline (`sdns --test`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleCheck {
    /// `NAME -> TARGET`, `NAME -> self (IP)` or `NAME -> no match`.
    pub line: String,
    pub matched: bool,
}

/// Compiled, immutable rule set.
#[derive(Debug, Default)]
pub struct RuleSet {
    exact: FxHashMap<String, Target>,
    suffix: Vec<(String, Target)>,
    pattern: Vec<(Regex, Target)>,
}

impl RuleSet {
    /// Validate targets and compile patterns.
    ///
    /// Fails on the first pattern that is not a valid regex or the first
    /// target that is neither an IPv4 address nor `self`.
    pub fn compile(raw: RawRules) -> Result<Self, Error> {
        let mut exact = FxHashMap::default();
        for (name, target) in &raw.exact {
            let target = Target::parse(name, target)?;
            exact.entry(normalize(name).to_string()).or_insert(target);
        }

        let suffix = raw
            .suffix
            .iter()
            .map(|(suffix, target)| Ok((suffix.clone(), Target::parse(suffix, target)?)))
            .collect::<Result<Vec<_>, Error>>()?;

        let pattern = raw
            .pattern
            .iter()
            .map(|(source, target)| {
                let re = Regex::new(source).map_err(|source_err| Error::InvalidPattern {
                    pattern: source.clone(),
                    source: source_err,
                })?;
                Ok((re, Target::parse(source, target)?))
            })
            .collect::<Result<Vec<_>, Error>>()?;

        let rules = Self {
            exact,
            suffix,
            pattern,
        };
        rules.warn_overlapping_suffixes();

        Ok(rules)
    }

    /// Find the override target for a query name.
    ///
    /// A single trailing root dot is ignored, so `host.lan.` and `host.lan`
    /// behave the same.
    pub fn lookup(&self, name: &str) -> Option<&Target> {
        let name = normalize(name);

        self.match_exact(name)
            .or_else(|| self.match_suffix(name))
            .or_else(|| self.match_pattern(name))
    }

    pub fn match_exact(&self, name: &str) -> Option<&Target> {
        self.exact.get(name)
    }

    /// Plain string suffix comparison: `example.com` also matches
    /// `badexample.com`.
    pub fn match_suffix(&self, name: &str) -> Option<&Target> {
        self.suffix
            .iter()
            .find(|(suffix, _)| name.ends_with(suffix.as_str()))
            .map(|(_, target)| target)
    }

    /// Unanchored regex search; anchors must be part of the pattern.
    pub fn match_pattern(&self, name: &str) -> Option<&Target> {
        self.pattern
            .iter()
            .find(|(re, _)| re.is_match(name))
            .map(|(_, target)| target)
    }

    /// Describe where `name` points, with `self` shown next to `self_ip`.
    pub fn check(&self, name: &str, self_ip: Ipv4Addr) -> RuleCheck {
        let (line, matched) = match self.lookup(name) {
            Some(Target::SelfAddr) => (format!("{name} -> self ({self_ip})"), true),
            Some(target) => (format!("{name} -> {target}"), true),
            None => (format!("{name} -> no match"), false),
        };

        RuleCheck { line, matched }
    }

    /// Total number of rules across all tables.
    pub fn len(&self) -> usize {
        self.exact.len() + self.suffix.len() + self.pattern.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn warn_overlapping_suffixes(&self) {
        for (i, (first, _)) in self.suffix.iter().enumerate() {
            for (second, _) in &self.suffix[i + 1..] {
                if first.ends_with(second.as_str()) || second.ends_with(first.as_str()) {
                    warn!(
                        first = %first,
                        second = %second,
                        "overlapping suffix rules, the first declared wins"
                    );
                }
            }
        }
    }
}

fn normalize(name: &str) -> &str {
    name.strip_suffix('.').unwrap_or(name)
}
