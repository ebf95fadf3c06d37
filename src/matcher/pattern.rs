//! Match patterns.
//!
//! A pattern is a regex or one of the literal kinds (exact, prefix,
//! suffix, contain) which compile down to anchored, escaped regexes so
//! the evaluation path is uniform.

use regex::{Captures, Regex, RegexBuilder};
use serde::Deserialize;

use crate::error::GantryResult;

/// How a pattern string is interpreted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PatternKind {
    #[default]
    Regex,
    Exact,
    Prefix,
    Suffix,
    Contain,
}

/// A compiled pattern
#[derive(Debug, Clone)]
pub struct Pattern {
    raw: String,
    kind: PatternKind,
    re: Regex,
}

impl Pattern {
    /// Compile a pattern of the given kind
    pub fn compile(pattern: &str, kind: PatternKind, icase: bool) -> GantryResult<Pattern> {
        let expr = match kind {
            PatternKind::Regex => pattern.to_string(),
            PatternKind::Exact => format!("^{}$", regex::escape(pattern)),
            PatternKind::Prefix => format!("^{}", regex::escape(pattern)),
            PatternKind::Suffix => format!("{}$", regex::escape(pattern)),
            PatternKind::Contain => regex::escape(pattern),
        };
        let re = RegexBuilder::new(&expr).case_insensitive(icase).build()?;
        Ok(Pattern {
            raw: pattern.to_string(),
            kind,
            re,
        })
    }

    /// Compile a Host pattern: anchored and tolerant of surrounding
    /// whitespace regardless of kind, the way users expect a
    /// `Host example.org` config line to behave.
    pub fn compile_host(pattern: &str, kind: PatternKind, icase: bool) -> GantryResult<Pattern> {
        let inner = match kind {
            PatternKind::Regex => format!("(?:{})", pattern),
            PatternKind::Exact => regex::escape(pattern),
            PatternKind::Prefix => format!("{}.*", regex::escape(pattern)),
            PatternKind::Suffix => format!(".*{}", regex::escape(pattern)),
            PatternKind::Contain => format!(".*{}.*", regex::escape(pattern)),
        };
        let expr = format!("^[ \\t]*{}[ \\t]*$", inner);
        let re = RegexBuilder::new(&expr).case_insensitive(icase).build()?;
        Ok(Pattern {
            raw: pattern.to_string(),
            kind,
            re,
        })
    }

    pub fn is_match(&self, text: &str) -> bool {
        self.re.is_match(text)
    }

    pub fn captures<'t>(&self, text: &'t str) -> Option<Captures<'t>> {
        self.re.captures(text)
    }

    /// The pattern string as written in the configuration
    pub fn raw(&self) -> &str {
        &self.raw
    }

    pub fn kind(&self) -> PatternKind {
        self.kind
    }
}
