//! Destination classification rules.
//!
//! A ruleset is an ordered list of (pattern, action) pairs evaluated
//! first-match-wins. The final rule must be the `*` catch-all; rulesets
//! without it are rejected at load time. Domain destinations are matched
//! literally and never resolved, so an address rule cannot leak a DNS query
//! before the dispatch decision.

use std::collections::HashMap;
use std::net::IpAddr;
use std::path::Path;
use std::str::FromStr;

use ipnet::IpNet;

use crate::error::{Error, Result};
use crate::socks::Address;

/// What to do with a classified destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Tunnel through the upstream server
    Proxy,
    /// Connect from this endpoint directly
    Direct,
    /// Refuse the connection
    Block,
}

impl FromStr for Action {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "proxy" => Ok(Action::Proxy),
            "direct" => Ok(Action::Direct),
            "block" => Ok(Action::Block),
            other => Err(Error::config(format!("unknown rule action: {:?}", other))),
        }
    }
}

/// A destination pattern.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Matcher {
    /// Bytewise domain equality, case-insensitive
    Exact(String),
    /// `*.example.com`: matches `example.com` and anything below it
    Suffix(String),
    /// A single IP literal
    Addr(IpAddr),
    /// A CIDR block; only IP destinations can match
    Net(IpNet),
    /// The `*` catch-all
    Any,
}

impl Matcher {
    fn parse(pattern: &str) -> Result<Self> {
        if pattern == "*" {
            return Ok(Matcher::Any);
        }
        if let Some(suffix) = pattern.strip_prefix("*.") {
            if suffix.is_empty() {
                return Err(Error::config("empty domain suffix pattern"));
            }
            return Ok(Matcher::Suffix(suffix.to_ascii_lowercase()));
        }
        if let Ok(ip) = pattern.parse::<IpAddr>() {
            return Ok(Matcher::Addr(ip));
        }
        if pattern.contains('/') {
            let net = pattern
                .parse::<IpNet>()
                .map_err(|e| Error::config(format!("bad CIDR pattern {:?}: {}", pattern, e)))?;
            return Ok(Matcher::Net(net));
        }
        if pattern.is_empty() {
            return Err(Error::config("empty rule pattern"));
        }
        Ok(Matcher::Exact(pattern.to_ascii_lowercase()))
    }

    fn matches(&self, address: &Address) -> bool {
        match self {
            Matcher::Any => true,
            Matcher::Exact(domain) => match address.domain() {
                Some(d) => d.eq_ignore_ascii_case(domain),
                None => false,
            },
            Matcher::Suffix(suffix) => match address.domain() {
                Some(d) => {
                    let d = d.to_ascii_lowercase();
                    d == *suffix || d.ends_with(&format!(".{}", suffix))
                }
                None => false,
            },
            Matcher::Addr(ip) => address.ip() == Some(*ip),
            Matcher::Net(net) => match address.ip() {
                Some(ip) => net.contains(&ip),
                None => false,
            },
        }
    }

    /// Ordering class used when rules come from an unordered map.
    fn specificity(&self) -> u8 {
        match self {
            Matcher::Exact(_) => 0,
            Matcher::Suffix(_) => 1,
            Matcher::Addr(_) => 2,
            Matcher::Net(_) => 3,
            Matcher::Any => 4,
        }
    }
}

/// An immutable, validated ruleset.
#[derive(Debug, Clone)]
pub struct Rules {
    rules: Vec<(Matcher, Action)>,
}

impl Rules {
    fn new(rules: Vec<(Matcher, Action)>) -> Result<Self> {
        match rules.last() {
            Some((Matcher::Any, _)) => Ok(Rules { rules }),
            _ => Err(Error::config("ruleset must end with a terminal `*` rule")),
        }
    }

    /// The implicit ruleset when none is configured: tunnel everything.
    pub fn proxy_all() -> Self {
        Rules {
            rules: vec![(Matcher::Any, Action::Proxy)],
        }
    }

    /// Load rules from a file with one `pattern action` per line.
    /// `#` starts a comment; blank lines are ignored; source order is kept.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            Error::config(format!(
                "cannot read rule file {}: {}",
                path.as_ref().display(),
                e
            ))
        })?;
        Self::from_lines(&content)
    }

    pub(crate) fn from_lines(content: &str) -> Result<Self> {
        let mut rules = Vec::new();
        for (lineno, line) in content.lines().enumerate() {
            let line = match line.find('#') {
                Some(pos) => &line[..pos],
                None => line,
            }
            .trim();
            if line.is_empty() {
                continue;
            }
            let mut parts = line.split_whitespace();
            let pattern = parts.next().unwrap_or_default();
            let action = parts.next().ok_or_else(|| {
                Error::config(format!("rule line {} has no action", lineno + 1))
            })?;
            if parts.next().is_some() {
                return Err(Error::config(format!(
                    "rule line {} has trailing tokens",
                    lineno + 1
                )));
            }
            rules.push((Matcher::parse(pattern)?, action.parse()?));
        }
        Self::new(rules)
    }

    /// Build rules from an inline pattern→action map.
    ///
    /// TOML tables carry no order, so entries are sorted by matcher
    /// specificity (exact, suffix, IP, CIDR, `*`) and alphabetically within
    /// a class, keeping classification deterministic.
    pub fn from_map(map: &HashMap<String, String>) -> Result<Self> {
        let mut entries: Vec<(&String, &String)> = map.iter().collect();
        entries.sort();

        let mut rules = Vec::with_capacity(entries.len());
        for (pattern, action) in entries {
            rules.push((Matcher::parse(pattern)?, action.parse()?));
        }
        rules.sort_by_key(|(m, _)| m.specificity());
        Self::new(rules)
    }

    /// Classify a destination. Pure: the same address always yields the
    /// same action for a given ruleset.
    pub fn classify(&self, address: &Address) -> Action {
        for (matcher, action) in &self.rules {
            if matcher.matches(address) {
                return *action;
            }
        }
        // Construction guarantees the terminal `*` rule exists.
        Action::Block
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn domain(name: &str, port: u16) -> Address {
        Address::Domain(name.into(), port)
    }

    fn ip(addr: &str) -> Address {
        Address::Ip(addr.parse().unwrap())
    }

    #[test]
    fn test_terminal_rule_required() {
        assert!(Rules::from_lines("example.com direct\n").is_err());
        assert!(Rules::from_lines("example.com direct\n* proxy\n").is_ok());
        assert!(Rules::from_lines("").is_err());
    }

    #[test]
    fn test_exact_match_is_case_insensitive() {
        let rules = Rules::from_lines("Example.COM block\n* direct\n").unwrap();
        assert_eq!(rules.classify(&domain("example.com", 80)), Action::Block);
        assert_eq!(rules.classify(&domain("EXAMPLE.com", 80)), Action::Block);
        assert_eq!(rules.classify(&domain("sub.example.com", 80)), Action::Direct);
    }

    #[test]
    fn test_suffix_match() {
        let rules = Rules::from_lines("*.ads.example block\n* direct\n").unwrap();
        assert_eq!(rules.classify(&domain("tracker.ads.example", 443)), Action::Block);
        assert_eq!(rules.classify(&domain("ads.example", 443)), Action::Block);
        assert_eq!(rules.classify(&domain("fads.example", 443)), Action::Direct);
        assert_eq!(rules.classify(&ip("10.1.2.3:443")), Action::Direct);
    }

    #[test]
    fn test_cidr_only_matches_ip_literals() {
        let rules = Rules::from_lines("10.0.0.0/8 direct\n* proxy\n").unwrap();
        assert_eq!(rules.classify(&ip("10.1.2.3:80")), Action::Direct);
        assert_eq!(rules.classify(&ip("11.1.2.3:80")), Action::Proxy);
        // Domains are never resolved for matching.
        assert_eq!(rules.classify(&domain("ten.example", 80)), Action::Proxy);
    }

    #[test]
    fn test_ip_literal_match() {
        let rules = Rules::from_lines("192.168.1.1 block\n* direct\n").unwrap();
        assert_eq!(rules.classify(&ip("192.168.1.1:22")), Action::Block);
        assert_eq!(rules.classify(&ip("192.168.1.2:22")), Action::Direct);
    }

    #[test]
    fn test_first_match_wins() {
        let rules =
            Rules::from_lines("a.example proxy\n*.example block\n* direct\n").unwrap();
        assert_eq!(rules.classify(&domain("a.example", 80)), Action::Proxy);
        assert_eq!(rules.classify(&domain("b.example", 80)), Action::Block);
    }

    #[test]
    fn test_comments_and_blank_lines() {
        let rules = Rules::from_lines(
            "# blocked trackers\n\
             *.ads.example block  # inline comment\n\
             \n\
             * proxy\n",
        )
        .unwrap();
        assert_eq!(rules.classify(&domain("x.ads.example", 80)), Action::Block);
    }

    #[test]
    fn test_map_ordering_puts_catch_all_last() {
        let map: HashMap<String, String> = [
            ("*".to_string(), "proxy".to_string()),
            ("*.internal.example".to_string(), "direct".to_string()),
            ("10.0.0.0/8".to_string(), "direct".to_string()),
            ("blocked.example".to_string(), "block".to_string()),
        ]
        .into_iter()
        .collect();
        let rules = Rules::from_map(&map).unwrap();

        assert_eq!(rules.classify(&domain("blocked.example", 80)), Action::Block);
        assert_eq!(rules.classify(&domain("a.internal.example", 80)), Action::Direct);
        assert_eq!(rules.classify(&ip("10.9.9.9:80")), Action::Direct);
        assert_eq!(rules.classify(&domain("other.example", 80)), Action::Proxy);
    }

    #[test]
    fn test_map_without_catch_all_rejected() {
        let map: HashMap<String, String> =
            [("example.com".to_string(), "direct".to_string())]
                .into_iter()
                .collect();
        assert!(Rules::from_map(&map).is_err());
    }

    #[test]
    fn test_classification_is_pure() {
        let rules = Rules::from_lines("*.ads.example block\n* direct\n").unwrap();
        let addr = domain("spy.ads.example", 443);
        let first = rules.classify(&addr);
        for _ in 0..10 {
            assert_eq!(rules.classify(&addr), first);
        }
    }

    #[test]
    fn test_unknown_action_rejected() {
        assert!(Rules::from_lines("example.com tunnel\n* proxy\n").is_err());
    }
}
