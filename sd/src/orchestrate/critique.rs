//! Self-critique pattern
//!
//! Iterative refinement of a single task output: execute, score against
//! weighted quality criteria, and improve with the critique feedback until
//! the overall score clears the threshold or iterations run out.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::JobError;

use super::executor::{ExecutionContext, Executor, ExecutorInput};

/// One scored quality dimension
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QualityCriterion {
    pub name: String,
    pub weight: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub threshold: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub evaluation_prompt: Option<String>,
}

impl QualityCriterion {
    pub fn new(name: impl Into<String>, weight: f64) -> Self {
        Self {
            name: name.into(),
            weight,
            threshold: None,
            evaluation_prompt: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CritiqueConfig {
    pub max_iterations: u32,
    pub quality_criteria: Vec<QualityCriterion>,
    /// Converged once the weighted overall score reaches this
    pub stop_on_quality_threshold: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub improvement_prompt_template: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub evaluation_prompt_template: Option<String>,
}

/// Scores and feedback for one iteration's output
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Evaluation {
    pub overall_score: f64,
    pub criteria_scores: HashMap<String, f64>,
    pub feedback: String,
    pub meets_threshold: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CritiqueIteration {
    pub iteration: u32,
    pub output: String,
    pub evaluation: Evaluation,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CritiqueResult {
    pub iterations: Vec<CritiqueIteration>,
    /// Best-scoring iteration's output
    pub final_output: String,
    pub final_score: f64,
    pub converged: bool,
}

/// Run the self-critique loop over one executor
pub async fn run_self_critique(
    executor: Arc<dyn Executor>,
    ctx: &ExecutionContext,
    task_prompt: &str,
    config: &CritiqueConfig,
) -> Result<CritiqueResult, JobError> {
    let initial = executor.execute(ctx, ExecutorInput::prompt(task_prompt)).await?;
    let mut output = initial.content;

    if config.max_iterations == 0 {
        return Ok(CritiqueResult {
            iterations: Vec::new(),
            final_output: output,
            final_score: 0.0,
            converged: false,
        });
    }

    let mut iterations: Vec<CritiqueIteration> = Vec::new();
    let mut converged = false;

    for iteration in 1..=config.max_iterations {
        let started = Instant::now();

        let evaluation_prompt = build_evaluation_prompt(config, task_prompt, &output);
        let evaluation = match executor.execute(ctx, ExecutorInput::prompt(evaluation_prompt)).await {
            Ok(response) => parse_evaluation(&response.content, &config.quality_criteria, config.stop_on_quality_threshold),
            // An unusable critique scores zero and the loop continues
            Err(e) => {
                debug!(step = %ctx.step_id, error = %e, "critique call failed, scoring zero");
                zero_evaluation(&config.quality_criteria)
            }
        };

        iterations.push(CritiqueIteration {
            iteration,
            output: output.clone(),
            evaluation: evaluation.clone(),
            duration_ms: started.elapsed().as_millis() as u64,
        });

        if evaluation.meets_threshold {
            converged = true;
            break;
        }

        if iteration == config.max_iterations {
            break;
        }

        let improvement_prompt = build_improvement_prompt(config, task_prompt, &output, &evaluation.feedback);
        output = executor
            .execute(ctx, ExecutorInput::prompt(improvement_prompt))
            .await?
            .content;
    }

    // The best iteration wins, regardless of when it happened
    let best = iterations
        .iter()
        .max_by(|a, b| {
            a.evaluation
                .overall_score
                .partial_cmp(&b.evaluation.overall_score)
                .unwrap_or(std::cmp::Ordering::Equal)
        })
        .expect("at least one iteration recorded");
    let final_output = best.output.clone();
    let final_score = best.evaluation.overall_score;

    info!(
        step = %ctx.step_id,
        iterations = iterations.len(),
        final_score,
        converged,
        "self-critique finished"
    );

    Ok(CritiqueResult {
        iterations,
        final_output,
        final_score,
        converged,
    })
}

fn build_evaluation_prompt(config: &CritiqueConfig, task: &str, output: &str) -> String {
    if let Some(template) = &config.evaluation_prompt_template {
        return template
            .replace("{{task}}", task)
            .replace("{{output}}", output);
    }

    let mut prompt = String::from("Evaluate the following output against each criterion.\n\n");
    prompt.push_str(&format!("Task: {}\n\nOutput:\n{}\n\n", task, output));
    prompt.push_str("Score each criterion between 0.0 and 1.0, one per line as 'name: score'.\n");
    for criterion in &config.quality_criteria {
        match &criterion.evaluation_prompt {
            Some(hint) => prompt.push_str(&format!("- {}: {}\n", criterion.name, hint)),
            None => prompt.push_str(&format!("- {}\n", criterion.name)),
        }
    }
    prompt.push_str("\nAfter the scores, write 'FEEDBACK:' followed by concrete improvement suggestions.\n");
    prompt
}

fn build_improvement_prompt(config: &CritiqueConfig, task: &str, output: &str, feedback: &str) -> String {
    if let Some(template) = &config.improvement_prompt_template {
        return template
            .replace("{{task}}", task)
            .replace("{{output}}", output)
            .replace("{{feedback}}", feedback);
    }
    format!(
        "Task: {}\n\nPrevious output:\n{}\n\nCritique feedback:\n{}\n\nProduce an improved version addressing the feedback. Output only the improved version.",
        task, output, feedback
    )
}

fn zero_evaluation(criteria: &[QualityCriterion]) -> Evaluation {
    Evaluation {
        overall_score: 0.0,
        criteria_scores: criteria.iter().map(|c| (c.name.clone(), 0.0)).collect(),
        feedback: String::new(),
        meets_threshold: false,
    }
}

/// Parse per-criterion scores and feedback out of the critique response
///
/// Expects `name: 0.8` lines; anything missing scores zero. The overall
/// score is the weight-normalized sum. A response with no parseable score
/// at all yields an overall of zero.
fn parse_evaluation(response: &str, criteria: &[QualityCriterion], threshold: f64) -> Evaluation {
    let mut criteria_scores = HashMap::new();
    let mut any_parsed = false;

    for criterion in criteria {
        let score = response
            .lines()
            .filter_map(|line| {
                let (name, rest) = line.split_once(':')?;
                let name = name.trim().trim_start_matches('-').trim();
                if !name.eq_ignore_ascii_case(&criterion.name) {
                    return None;
                }
                extract_score(rest)
            })
            .next();
        if let Some(score) = score {
            any_parsed = true;
            criteria_scores.insert(criterion.name.clone(), score.clamp(0.0, 1.0));
        } else {
            criteria_scores.insert(criterion.name.clone(), 0.0);
        }
    }

    let feedback = response
        .split_once("FEEDBACK:")
        .map(|(_, f)| f.trim().to_string())
        .unwrap_or_else(|| response.trim().to_string());

    let overall_score = if any_parsed {
        let total_weight: f64 = criteria.iter().map(|c| c.weight).sum();
        if total_weight > 0.0 {
            criteria
                .iter()
                .map(|c| c.weight * criteria_scores.get(&c.name).copied().unwrap_or(0.0))
                .sum::<f64>()
                / total_weight
        } else {
            0.0
        }
    } else {
        0.0
    };

    Evaluation {
        overall_score,
        criteria_scores,
        feedback,
        meets_threshold: overall_score >= threshold,
    }
}

fn extract_score(text: &str) -> Option<f64> {
    let token = text
        .trim()
        .split_whitespace()
        .next()?
        .trim_matches(|c: char| !c.is_ascii_digit() && c != '.' && c != '-');
    token.parse().ok()
}
