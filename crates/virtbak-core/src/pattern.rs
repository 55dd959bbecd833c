//! Host pattern matching for backup groups.
//!
//! A pattern is a bare domain name (exact match), `r:<regex>` (anchored at
//! the start of the name), or `g:<group>` (reserved, never matches). A
//! leading `!` inverts any of the above into an exclusion. The final set is
//! the union of non-negated matches minus the union of negated matches.

use std::collections::BTreeSet;

use regex::Regex;

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PatternMatch {
    pub matches: bool,
    pub exclude: bool,
}

/// Strip a leading `!`, reporting whether the pattern is an exclusion.
pub fn split_exclusion(pattern: &str) -> (bool, &str) {
    match pattern.strip_prefix('!') {
        Some(rest) => (true, rest),
        None => (false, pattern),
    }
}

/// Check one domain name against one pattern.
pub fn is_domain_matching_with(domain_name: &str, pattern: &str) -> Result<PatternMatch> {
    let (exclude, pattern) = split_exclusion(pattern);

    let matches = if let Some(regex) = pattern.strip_prefix("r:") {
        compile_anchored(regex)?.is_match(domain_name)
    } else if pattern.strip_prefix("g:").is_some() {
        // reserved for groups of groups
        false
    } else {
        pattern == domain_name
    };

    Ok(PatternMatch { matches, exclude })
}

/// Filter a set of domain names through a list of patterns.
pub fn domains_matching_with_patterns<'a, I>(domains: I, patterns: &[String]) -> Result<BTreeSet<String>>
where
    I: IntoIterator<Item = &'a str>,
{
    let domains: Vec<&str> = domains.into_iter().collect();
    let mut include = BTreeSet::new();
    let mut exclude = BTreeSet::new();

    for pattern in patterns {
        for domain in &domains {
            let comparison = is_domain_matching_with(domain, pattern)?;
            if !comparison.matches {
                continue;
            }
            if comparison.exclude {
                exclude.insert(domain.to_string());
            } else {
                include.insert(domain.to_string());
            }
        }
    }

    Ok(&include - &exclude)
}

/// Regexes in patterns match from the start of the name, like the original
/// configuration format.
fn compile_anchored(pattern: &str) -> Result<Regex> {
    Regex::new(&format!("^(?:{pattern})"))
        .map_err(|e| Error::InvalidConfig(format!("bad host regex {pattern:?}: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn to_patterns(patterns: &[&str]) -> Vec<String> {
        patterns.iter().map(|p| p.to_string()).collect()
    }

    #[test]
    fn test_exact_name() {
        let m = is_domain_matching_with("matching", "matching").unwrap();
        assert!(m.matches);
        assert!(!m.exclude);
    }

    #[test]
    fn test_regex_pattern() {
        let m = is_domain_matching_with("matching2", r"r:^matching\d?$").unwrap();
        assert!(m.matches);
        assert!(!is_domain_matching_with("vm-10", r"r:^matching\d?$").unwrap().matches);
    }

    #[test]
    fn test_exclusion_pattern() {
        let m = is_domain_matching_with("matching2", "!matching2").unwrap();
        assert!(m.matches);
        assert!(m.exclude);
    }

    #[test]
    fn test_group_pattern_matches_nothing() {
        assert!(!is_domain_matching_with("prod", "g:prod").unwrap().matches);
    }

    #[test]
    fn test_domains_matching_with_patterns() {
        let domains = ["a", "b", "vm-10", "matching", "matching2"];
        let patterns = to_patterns(&[r"r:^matching\d?$", "!matching2", "nonexisting"]);
        let include = domains_matching_with_patterns(domains, &patterns).unwrap();
        assert_eq!(include.into_iter().collect::<Vec<_>>(), vec!["matching"]);
    }

    #[test]
    fn test_bad_regex_is_reported() {
        assert!(matches!(
            is_domain_matching_with("a", "r:["),
            Err(Error::InvalidConfig(_))
        ));
    }
}
