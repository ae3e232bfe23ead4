//! Glob-style matching over listed artifact names.

use regex::Regex;

use crate::core::ArtifactRef;
use crate::errors::ConfigError;

/// A compiled glob matched against whole bundle names.
///
/// Supported syntax: `*` (any run of characters except `/`), `**` (any run
/// of characters), `?` (one character except `/`), `[abc]`/`[!abc]`
/// classes and `{a,b}` alternation.
#[derive(Debug, Clone)]
pub struct ResultPattern {
    source: String,
    regex: Regex,
}

impl ResultPattern {
    /// Compiles `glob`.
    pub fn new(glob: &str) -> Result<Self, ConfigError> {
        let translated = translate(glob)?;
        let regex = Regex::new(&translated).map_err(|e| ConfigError::Invalid {
            field: "correlator.result_pattern".to_string(),
            message: e.to_string(),
        })?;
        Ok(Self {
            source: glob.to_string(),
            regex,
        })
    }

    /// The glob this pattern was compiled from.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.source
    }

    /// Returns true if `name` matches.
    #[must_use]
    pub fn matches(&self, name: &str) -> bool {
        self.regex.is_match(name)
    }

    /// Keeps the artifacts whose names match, preserving order.
    #[must_use]
    pub fn filter(&self, artifacts: Vec<ArtifactRef>) -> Vec<ArtifactRef> {
        artifacts.into_iter().filter(|a| self.matches(&a.name)).collect()
    }
}

fn invalid(glob: &str, message: &str) -> ConfigError {
    ConfigError::Invalid {
        field: "correlator.result_pattern".to_string(),
        message: format!("{message} in '{glob}'"),
    }
}

fn translate(glob: &str) -> Result<String, ConfigError> {
    let mut out = String::with_capacity(glob.len() * 2 + 2);
    out.push('^');

    let chars: Vec<char> = glob.chars().collect();
    let mut i = 0;
    let mut brace_depth = 0usize;

    while i < chars.len() {
        let c = chars[i];
        match c {
            '*' => {
                if chars.get(i + 1) == Some(&'*') {
                    out.push_str(".*");
                    i += 1;
                } else {
                    out.push_str("[^/]*");
                }
            }
            '?' => out.push_str("[^/]"),
            '[' => {
                let close = chars[i + 1..]
                    .iter()
                    .position(|&ch| ch == ']')
                    .map(|p| p + i + 1)
                    .ok_or_else(|| invalid(glob, "unterminated character class"))?;
                out.push('[');
                let mut j = i + 1;
                if chars.get(j) == Some(&'!') {
                    out.push('^');
                    j += 1;
                }
                for &ch in &chars[j..close] {
                    if ch == '\\' || ch == '[' || ch == '^' {
                        out.push('\\');
                    }
                    out.push(ch);
                }
                out.push(']');
                i = close;
            }
            '{' => {
                brace_depth += 1;
                out.push_str("(?:");
            }
            '}' if brace_depth > 0 => {
                brace_depth -= 1;
                out.push(')');
            }
            ',' if brace_depth > 0 => out.push('|'),
            other => out.push_str(&regex::escape(&other.to_string())),
        }
        i += 1;
    }

    if brace_depth != 0 {
        return Err(invalid(glob, "unbalanced braces"));
    }

    out.push('$');
    Ok(out)
}
