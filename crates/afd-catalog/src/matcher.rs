//! Wildcard file-name matching.
//!
//! `*` matches any run of bytes, `?` exactly one byte, everything else is
//! literal. A leading `!` negates the pattern. Matching is greedy with
//! backtracking to the most recent `*`, so it never recurses.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchResult {
    Match,
    NoMatch,
    /// A `!` pattern whose body matched: the name is excluded
    Excluded,
}

fn split_negation(pattern: &str) -> (bool, &[u8]) {
    match pattern.strip_prefix('!') {
        Some(rest) => (true, rest.as_bytes()),
        None => (false, pattern.as_bytes()),
    }
}

fn wildcard(p: &[u8], s: &[u8]) -> bool {
    let (mut pi, mut si) = (0usize, 0usize);
    let mut star: Option<usize> = None;
    let mut resume = 0usize;

    while si < s.len() {
        if pi < p.len() && p[pi] == b'*' {
            star = Some(pi);
            resume = si;
            pi += 1;
        } else if pi < p.len() && (p[pi] == b'?' || p[pi] == s[si]) {
            pi += 1;
            si += 1;
        } else if let Some(sp) = star {
            // Let the last `*` swallow one more byte and retry
            pi = sp + 1;
            resume += 1;
            si = resume;
        } else {
            return false;
        }
    }
    while pi < p.len() && p[pi] == b'*' {
        pi += 1;
    }
    pi == p.len()
}

/// Three-way match used when walking a mask list
pub fn pmatch(pattern: &str, name: &str) -> MatchResult {
    let (negated, body) = split_negation(pattern);
    match (wildcard(body, name.as_bytes()), negated) {
        (true, false) => MatchResult::Match,
        (true, true) => MatchResult::Excluded,
        (false, _) => MatchResult::NoMatch,
    }
}

/// True when `name` matches `pattern`, inverted for `!` patterns
pub fn matches(pattern: &str, name: &str) -> bool {
    let (negated, body) = split_negation(pattern);
    wildcard(body, name.as_bytes()) != negated
}

/// A named, ordered list of masks
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FileGroup {
    pub name: String,
    pub masks: Vec<String>,
}

impl FileGroup {
    pub fn new(name: impl Into<String>, masks: Vec<String>) -> Self {
        Self {
            name: name.into(),
            masks,
        }
    }

    /// Walk the masks in order: the first positive hit takes the file, the
    /// first exclusion hit rejects it for this group
    pub fn accepts(&self, name: &str) -> bool {
        for mask in &self.masks {
            match pmatch(mask, name) {
                MatchResult::Match => return true,
                MatchResult::Excluded => return false,
                MatchResult::NoMatch => {}
            }
        }
        false
    }
}

/// Index of the first group that accepts `name`. No groups, or only empty
/// ones, match nothing.
pub fn first_matching_group(groups: &[FileGroup], name: &str) -> Option<usize> {
    groups.iter().position(|g| g.accepts(name))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_literal_and_wildcards() {
        assert!(matches("a.bin", "a.bin"));
        assert!(!matches("a.bin", "b.bin"));
        assert!(matches("*.bin", "a.bin"));
        assert!(matches("*", ""));
        assert!(matches("a?c", "abc"));
        assert!(!matches("a?c", "ac"));
        assert!(matches("*a*b*", "xxaxxbxx"));
        assert!(!matches("*a*b", "xxaxxbxxc"));
    }

    #[test]
    fn test_empty_pattern_matches_only_empty_name() {
        assert!(matches("", ""));
        assert!(!matches("", "a"));
    }

    #[test]
    fn test_question_after_star_needs_characters() {
        assert!(matches("*??", "ab"));
        assert!(!matches("*??", "a"));
        assert!(matches("**?", "a"));
        assert!(matches("a*?", "abc"));
    }

    #[test]
    fn test_backtracking() {
        assert!(matches("*ab", "aab"));
        assert!(matches("a*a*a", "aaaa"));
        assert!(matches("*.tar.gz", "x.tar.tar.gz"));
        assert!(!matches("*.tar.gz", "x.tar.gzz"));
    }

    #[test]
    fn test_negation() {
        assert!(!matches("!*.tmp", "a.tmp"));
        assert!(matches("!*.tmp", "a.bin"));
        assert_eq!(pmatch("!*.tmp", "a.tmp"), MatchResult::Excluded);
        assert_eq!(pmatch("!*.tmp", "a.bin"), MatchResult::NoMatch);
        assert_eq!(pmatch("*.bin", "a.bin"), MatchResult::Match);
    }

    #[test]
    fn test_groups() {
        let groups = vec![
            FileGroup::new("empty", vec![]),
            FileGroup::new("bins", vec!["!secret*".into(), "*.bin".into()]),
            FileGroup::new("all", vec!["*".into()]),
        ];
        assert_eq!(first_matching_group(&groups, "a.bin"), Some(1));
        assert_eq!(first_matching_group(&groups, "secret.bin"), Some(2));
        assert_eq!(first_matching_group(&[], "a.bin"), None);
        assert_eq!(first_matching_group(&groups[..1], "a.bin"), None);
    }
}
