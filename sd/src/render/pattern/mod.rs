//! Embedded pattern evaluator
//!
//! The render pipeline treats the evaluator as a capability with a minimal
//! interface: [`evaluate`] turns pattern source into a [`Pattern`], and
//! `Pattern::query_arc` yields the timed events ([`Hap`]s) in an arc of
//! cycle time.

mod fraction;
mod lexer;
mod parser;
#[allow(clippy::module_inception)]
mod pattern;
mod value;

use thiserror::Error;

pub use fraction::Fraction;
pub use pattern::{Hap, Pattern, Span};
pub use value::{Control, EventValue};

/// Function names that mark a source as referencing pattern primitives
pub const KNOWN_PRIMITIVES: [&str; 5] = ["s", "sound", "note", "stack", "silence"];

/// Errors from parsing or evaluating pattern source
#[derive(Debug, Clone, Error, PartialEq)]
pub enum PatternError {
    #[error("unexpected character '{found}' at line {line}, column {column}")]
    UnexpectedChar { found: char, line: u32, column: u32 },

    #[error("unexpected token '{found}' at line {line}, column {column}")]
    UnexpectedToken { found: String, line: u32, column: u32 },

    #[error("unexpected end of input")]
    UnexpectedEof,

    #[error("unknown function '{name}' at line {line}, column {column}")]
    UnknownFunction { name: String, line: u32, column: u32 },

    #[error("invalid atom '{atom}' at line {line}, column {column}")]
    InvalidAtom { atom: String, line: u32, column: u32 },
}

impl PatternError {
    /// Source position, when the error has one
    pub fn position(&self) -> Option<(u32, u32)> {
        match self {
            Self::UnexpectedChar { line, column, .. }
            | Self::UnexpectedToken { line, column, .. }
            | Self::UnknownFunction { line, column, .. }
            | Self::InvalidAtom { line, column, .. } => Some((*line, *column)),
            Self::UnexpectedEof => None,
        }
    }
}

/// Evaluate pattern source into a queryable [`Pattern`]
pub fn evaluate(source: &str) -> Result<Pattern, PatternError> {
    parser::parse_source(source)
}

/// Whether the source mentions any known pattern primitive
pub fn references_primitive(source: &str) -> bool {
    KNOWN_PRIMITIVES.iter().any(|p| {
        source
            .match_indices(p)
            .any(|(i, _)| {
                let before_ok = i == 0
                    || !source[..i]
                        .chars()
                        .next_back()
                        .is_some_and(|c| c.is_ascii_alphanumeric() || c == '_');
                let after = source[i + p.len()..].chars().next();
                let after_ok = !after.is_some_and(|c| c.is_ascii_alphanumeric() || c == '_');
                before_ok && after_ok
            })
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_evaluate_produces_queryable_pattern() {
        let pattern = evaluate("s(\"bd sd\")").unwrap();
        let haps = pattern.query_arc(Fraction::ZERO, Fraction::ONE);
        assert_eq!(haps.len(), 2);
    }

    #[test]
    fn test_error_positions_surface() {
        let err = evaluate("s(\"bd\") ^").unwrap_err();
        assert_eq!(err.position(), Some((1, 9)));

        let err = evaluate("s(\"bd").unwrap_err();
        assert_eq!(err.position(), None);
    }

    #[test]
    fn test_references_primitive() {
        assert!(references_primitive("s(\"bd\")"));
        assert!(references_primitive("stack(note(\"c3\"))"));
        assert!(!references_primitive("sounds_like_nothing"));
        assert!(!references_primitive("40 + 2"));
    }
}
