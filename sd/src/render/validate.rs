//! Pattern validation
//!
//! Ordered checks: size limit, cache probe, loop-construct rejection,
//! syntax parse, primitive warning, evaluation probe. Successful reports
//! are cached by source hash for five minutes.

use std::time::Instant;

use sha2::{Digest, Sha256};
use tracing::debug;

use crate::domain::{ValidationIssue, ValidationReport};
use crate::error::{ErrorCode, JobError};
use crate::store::JobStore;

use super::pattern::{self, Fraction, PatternError};

/// Textual constructs that would never terminate if evaluated
const LOOP_CONSTRUCTS: [&str; 2] = ["while(true)", "for(;;)"];

/// Stable cache key for a pattern source
pub fn source_hash(source: &str) -> String {
    hex::encode(Sha256::digest(source.as_bytes()))
}

/// Validation result plus the error to surface when invalid
pub struct ValidationOutcome {
    pub report: ValidationReport,
    pub error: Option<JobError>,
}

pub struct Validator {
    store: JobStore,
    max_pattern_length: usize,
}

impl Validator {
    pub fn new(store: JobStore, max_pattern_length: usize) -> Self {
        Self {
            store,
            max_pattern_length,
        }
    }

    pub async fn validate(&self, source: &str) -> ValidationOutcome {
        let started = Instant::now();

        // Size limit before anything touches the source
        if source.len() > self.max_pattern_length {
            let message = format!(
                "pattern is {} bytes, limit is {}",
                source.len(),
                self.max_pattern_length
            );
            return ValidationOutcome {
                report: invalid(vec![ValidationIssue::new(&message)], started),
                error: Some(JobError::user(ErrorCode::PatternTooLong, message)),
            };
        }

        // Cache probe; only successful validations are cached
        let hash = source_hash(source);
        if let Ok(Some(mut cached)) = self.store.get_cached_validation(&hash).await {
            debug!(%hash, "validation cache hit");
            cached.validation_time_ms = started.elapsed().as_millis() as u64;
            return ValidationOutcome {
                report: cached,
                error: None,
            };
        }

        // Obvious infinite loops never reach the evaluator
        let squashed: String = source.chars().filter(|c| !c.is_whitespace()).collect();
        for construct in LOOP_CONSTRUCTS {
            if squashed.contains(construct) {
                let message = format!("pattern contains a non-terminating loop construct '{}'", construct);
                return ValidationOutcome {
                    report: invalid(vec![ValidationIssue::new(&message)], started),
                    error: Some(JobError::user(ErrorCode::ValidationError, message)),
                };
            }
        }

        // Syntax parse + evaluation in one step with the embedded evaluator
        let evaluated = match pattern::evaluate(source) {
            Ok(p) => p,
            Err(e) => {
                let issue = match e.position() {
                    Some((line, column)) => ValidationIssue::at(e.to_string(), line, column),
                    None => ValidationIssue::new(e.to_string()),
                };
                let code = match &e {
                    PatternError::UnknownFunction { .. } | PatternError::InvalidAtom { .. } => {
                        ErrorCode::ValidationError
                    }
                    _ => ErrorCode::SyntaxError,
                };
                let mut error = JobError::user(code, e.to_string());
                if let JobError::User(failure) = &mut error {
                    if let Some((line, column)) = e.position() {
                        failure.details = Some(serde_json::json!({"line": line, "column": column}));
                    }
                }
                return ValidationOutcome {
                    report: invalid(vec![issue], started),
                    error: Some(error),
                };
            }
        };

        let mut warnings = Vec::new();
        if !pattern::references_primitive(source) {
            warnings.push("no known pattern primitive referenced".to_string());
        }

        // Evaluation probe: the result must answer a query
        let probe = evaluated.query_arc(Fraction::ZERO, Fraction::ONE);
        if probe.is_empty() {
            warnings.push("pattern produces no events in its first cycle".to_string());
        }

        let report = ValidationReport {
            is_valid: true,
            errors: vec![],
            warnings,
            validation_time_ms: started.elapsed().as_millis() as u64,
        };
        let _ = self.store.put_cached_validation(&hash, &report).await;

        ValidationOutcome {
            report,
            error: None,
        }
    }
}

fn invalid(errors: Vec<ValidationIssue>, started: Instant) -> ValidationReport {
    ValidationReport {
        is_valid: false,
        errors,
        warnings: vec![],
        validation_time_ms: started.elapsed().as_millis() as u64,
    }
}
