//! Root-anchored glob patterns.
//!
//! Patterns are translated once into anchored regular expressions:
//! - `**` spans any number of segments (`**/` may also match nothing)
//! - `*` spans characters within one segment
//! - `?` is exactly one non-separator character
//! - `[...]` is a character class, `[!...]` its negation
//! - `\x` matches `x` literally
//!
//! A pattern that cannot be compiled is a configuration error, never a
//! per-file finding.

use regex::Regex;

use crate::core::error::GuardError;
use crate::core::paths::normalize_repo_path;

#[derive(Debug, Clone)]
pub struct Matcher {
    pattern: String,
    regex: Regex,
}

impl Matcher {
    pub fn compile(pattern: &str) -> Result<Self, GuardError> {
        let source = translate(pattern)?;
        let regex = Regex::new(&source).map_err(|e| GuardError::GlobError {
            pattern: pattern.to_string(),
            reason: e.to_string(),
        })?;
        Ok(Self {
            pattern: pattern.to_string(),
            regex,
        })
    }

    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    /// Full-path match against the normalized form of `path`.
    pub fn matches(&self, path: &str) -> bool {
        self.regex.is_match(&normalize_repo_path(path))
    }
}

/// An ordered list of compiled patterns.
#[derive(Debug, Clone, Default)]
pub struct PatternSet {
    matchers: Vec<Matcher>,
}

impl PatternSet {
    pub fn compile<S: AsRef<str>>(patterns: &[S]) -> Result<Self, GuardError> {
        let matchers = patterns
            .iter()
            .map(|p| Matcher::compile(p.as_ref()))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { matchers })
    }

    pub fn is_empty(&self) -> bool {
        self.matchers.is_empty()
    }

    pub fn len(&self) -> usize {
        self.matchers.len()
    }

    pub fn any_match(&self, path: &str) -> bool {
        self.first_match(path).is_some()
    }

    /// The first pattern (in declaration order) that matches `path`.
    pub fn first_match(&self, path: &str) -> Option<&str> {
        let normalized = normalize_repo_path(path);
        self.matchers
            .iter()
            .find(|m| m.regex.is_match(&normalized))
            .map(|m| m.pattern())
    }

    pub fn patterns(&self) -> Vec<String> {
        self.matchers.iter().map(|m| m.pattern.clone()).collect()
    }
}

fn translate(pattern: &str) -> Result<String, GuardError> {
    let glob_error = |reason: &str| GuardError::GlobError {
        pattern: pattern.to_string(),
        reason: reason.to_string(),
    };

    let mut pat = pattern.trim();
    while let Some(rest) = pat.strip_prefix("./") {
        pat = rest;
    }
    let pat = pat.trim_start_matches('/');
    if pat.is_empty() {
        return Err(glob_error("empty pattern"));
    }

    let chars: Vec<char> = pat.chars().collect();
    let mut out = String::from("^");
    let mut i = 0;
    while i < chars.len() {
        match chars[i] {
            '*' => {
                if chars.get(i + 1) == Some(&'*') {
                    if chars.get(i + 2) == Some(&'/') {
                        out.push_str("(?:.*/)?");
                        i += 3;
                    } else {
                        out.push_str(".*");
                        i += 2;
                    }
                } else {
                    out.push_str("[^/]*");
                    i += 1;
                }
            }
            '?' => {
                out.push_str("[^/]");
                i += 1;
            }
            '[' => {
                let mut j = i + 1;
                let negated = matches!(chars.get(j), Some('!') | Some('^'));
                if negated {
                    j += 1;
                }
                let body_start = j;
                // A leading `]` is part of the class.
                if chars.get(j) == Some(&']') {
                    j += 1;
                }
                while j < chars.len() && chars[j] != ']' {
                    j += 1;
                }
                if j >= chars.len() {
                    return Err(glob_error("unbalanced bracket expression"));
                }
                let body = &chars[body_start..j];
                if body.is_empty() {
                    return Err(glob_error("empty bracket expression"));
                }
                out.push_str(&bracket_class(body, negated));
                i = j + 1;
            }
            '\\' => {
                let Some(next) = chars.get(i + 1) else {
                    return Err(glob_error("trailing escape"));
                };
                out.push_str(&regex::escape(&next.to_string()));
                i += 2;
            }
            c => {
                out.push_str(&regex::escape(&c.to_string()));
                i += 1;
            }
        }
    }
    out.push('$');
    Ok(out)
}

/// Regex class for a glob bracket body. `a-z` is a range, a `-` that cannot
/// start one is literal, and a reversed range matches nothing. Every member is
/// emitted as a hex escape so class operators never reach the regex parser.
fn bracket_class(body: &[char], negated: bool) -> String {
    let hex = |c: char| format!("\\x{{{:X}}}", c as u32);
    let mut members = String::new();
    let mut k = 0;
    while k < body.len() {
        if k + 2 < body.len() && body[k + 1] == '-' {
            let (lo, hi) = (body[k], body[k + 2]);
            if lo <= hi {
                members.push_str(&format!("{}-{}", hex(lo), hex(hi)));
            }
            k += 3;
        } else {
            members.push_str(&hex(body[k]));
            k += 1;
        }
    }
    if negated {
        format!("[^/{members}]")
    } else if members.is_empty() {
        "[^\\x{0}-\\x{10FFFF}]".to_string()
    } else {
        format!("[{members}]")
    }
}
