//! Discussion pattern
//!
//! Multi-agent moderated conversation: every round the participants
//! contribute in parallel (each ending with a self-reported agreement score
//! out of 10), a synthesis integrates the contributions, and a consensus
//! score decides whether the discussion has converged.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::JobError;

use super::executor::{ExecutionContext, Executor, ExecutorInput, ExecutorRegistry};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Participant {
    pub agent_ref: String,
    pub role: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub weight: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub perspective: Option<String>,
}

impl Participant {
    pub fn new(agent_ref: impl Into<String>, role: impl Into<String>) -> Self {
        Self {
            agent_ref: agent_ref.into(),
            role: role.into(),
            weight: None,
            perspective: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConsensusStrategy {
    /// Minimum agreement across participants
    Unanimous,
    /// Fraction of participants at agreement >= 6
    Majority,
    /// Weighted mean of agreements
    Weighted,
    /// The facilitator reports the consensus
    Facilitator,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscussionConfig {
    pub max_rounds: u32,
    pub participants: Vec<Participant>,
    pub consensus_strategy: ConsensusStrategy,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub facilitator_agent_ref: Option<String>,
    /// Converged once the round consensus reaches this, in [0, 1]
    pub convergence_threshold: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub contribution_prompt_template: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub synthesis_prompt_template: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Contribution {
    pub participant_id: String,
    pub role: String,
    pub content: String,
    /// Self-reported agreement in [1, 10]; parse failures default to 5
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agreement_score: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscussionRound {
    pub round: u32,
    pub contributions: Vec<Contribution>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub synthesis: Option<String>,
    pub consensus_score: f64,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParticipantSummary {
    pub contributions: u32,
    /// Mean agreement normalized to [0, 1]
    pub agreement_rate: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscussionResult {
    pub rounds: Vec<DiscussionRound>,
    /// The last round's synthesis
    pub final_consensus: Option<String>,
    pub consensus_score: f64,
    pub converged: bool,
    pub participant_summaries: HashMap<String, ParticipantSummary>,
}

/// Run a moderated discussion on `topic`
pub async fn run_discussion(
    registry: &ExecutorRegistry,
    ctx: &ExecutionContext,
    topic: &str,
    config: &DiscussionConfig,
) -> Result<DiscussionResult, JobError> {
    let mut rounds: Vec<DiscussionRound> = Vec::new();
    let mut prior_synthesis: Option<String> = None;
    let mut converged = false;

    for round in 1..=config.max_rounds {
        let started = Instant::now();

        // Contributions run in parallel
        let futures = config.participants.iter().enumerate().map(|(i, participant)| {
            let executor = resolve(registry, &participant.agent_ref);
            let prompt = contribution_prompt(config, topic, participant, prior_synthesis.as_deref());
            let participant_id = format!("{}-{}", participant.agent_ref, i);
            let role = participant.role.clone();
            async move {
                let content = match executor {
                    Some(executor) => match executor.execute(ctx, ExecutorInput::prompt(prompt)).await {
                        Ok(output) => output.content,
                        Err(e) => {
                            debug!(participant = %participant_id, error = %e, "contribution failed");
                            String::new()
                        }
                    },
                    None => String::new(),
                };
                let agreement_score = parse_agreement(&content);
                Contribution {
                    participant_id,
                    role,
                    content,
                    agreement_score: Some(agreement_score),
                }
            }
        });
        let contributions: Vec<Contribution> = join_all(futures).await;

        // Synthesis integrates the round into one coherent output
        let synthesizer_ref = match config.consensus_strategy {
            ConsensusStrategy::Facilitator => config
                .facilitator_agent_ref
                .clone()
                .unwrap_or_else(|| "llm".to_string()),
            _ => config
                .participants
                .first()
                .map(|p| p.agent_ref.clone())
                .unwrap_or_else(|| "llm".to_string()),
        };
        let synthesis = match resolve(registry, &synthesizer_ref) {
            Some(executor) => {
                let prompt = synthesis_prompt(config, topic, &contributions);
                match executor.execute(ctx, ExecutorInput::prompt(prompt)).await {
                    Ok(output) => Some(output.content),
                    Err(e) => {
                        debug!(error = %e, "synthesis failed");
                        None
                    }
                }
            }
            None => None,
        };

        let consensus_score = consensus(config, &contributions, synthesis.as_deref());

        rounds.push(DiscussionRound {
            round,
            contributions,
            synthesis: synthesis.clone(),
            consensus_score,
            duration_ms: started.elapsed().as_millis() as u64,
        });
        prior_synthesis = synthesis;

        debug!(round, consensus_score, "discussion round finished");
        if consensus_score >= config.convergence_threshold {
            converged = true;
            break;
        }
    }

    let consensus_score = rounds.last().map(|r| r.consensus_score).unwrap_or(0.0);
    let final_consensus = rounds.last().and_then(|r| r.synthesis.clone());

    let mut participant_summaries: HashMap<String, ParticipantSummary> = HashMap::new();
    for round in &rounds {
        for contribution in &round.contributions {
            let entry = participant_summaries
                .entry(contribution.participant_id.clone())
                .or_insert(ParticipantSummary {
                    contributions: 0,
                    agreement_rate: 0.0,
                });
            entry.contributions += 1;
            entry.agreement_rate += contribution.agreement_score.unwrap_or(5.0) / 10.0;
        }
    }
    for summary in participant_summaries.values_mut() {
        summary.agreement_rate /= summary.contributions.max(1) as f64;
    }

    info!(
        step = %ctx.step_id,
        rounds = rounds.len(),
        consensus_score,
        converged,
        "discussion finished"
    );

    Ok(DiscussionResult {
        rounds,
        final_consensus,
        consensus_score,
        converged,
        participant_summaries,
    })
}

fn resolve(registry: &ExecutorRegistry, agent_ref: &str) -> Option<Arc<dyn Executor>> {
    registry.get(agent_ref).or_else(|| registry.get("llm"))
}

fn contribution_prompt(
    config: &DiscussionConfig,
    topic: &str,
    participant: &Participant,
    prior_synthesis: Option<&str>,
) -> String {
    if let Some(template) = &config.contribution_prompt_template {
        return template
            .replace("{{topic}}", topic)
            .replace("{{role}}", &participant.role)
            .replace("{{perspective}}", participant.perspective.as_deref().unwrap_or(""))
            .replace("{{synthesis}}", prior_synthesis.unwrap_or(""));
    }

    let mut prompt = format!("Topic under discussion: {}\n\nYour role: {}\n", topic, participant.role);
    if let Some(perspective) = &participant.perspective {
        prompt.push_str(&format!("Your perspective: {}\n", perspective));
    }
    if let Some(synthesis) = prior_synthesis {
        prompt.push_str(&format!("\nThe discussion so far, synthesized:\n{}\n", synthesis));
    }
    prompt.push_str(
        "\nContribute your view. End your contribution with a line 'AGREEMENT: n' where n in 1..10 rates how much you agree with the current direction.\n",
    );
    prompt
}

fn synthesis_prompt(config: &DiscussionConfig, topic: &str, contributions: &[Contribution]) -> String {
    if let Some(template) = &config.synthesis_prompt_template {
        let joined = contributions
            .iter()
            .map(|c| format!("[{}] {}", c.role, c.content))
            .collect::<Vec<_>>()
            .join("\n\n");
        return template.replace("{{topic}}", topic).replace("{{contributions}}", &joined);
    }

    let mut prompt = format!(
        "Integrate the following contributions on '{}' into a single coherent output.\n\n",
        topic
    );
    for contribution in contributions {
        prompt.push_str(&format!("[{}]\n{}\n\n", contribution.role, contribution.content));
    }
    prompt.push_str("End with a line 'CONSENSUS: n' where n in 1..10 rates the overall agreement level.\n");
    prompt
}

/// Self-reported agreement out of a contribution; defaults to 5
fn parse_agreement(content: &str) -> f64 {
    parse_marker_score(content, "AGREEMENT:").unwrap_or(5.0)
}

fn parse_marker_score(content: &str, marker: &str) -> Option<f64> {
    // The marker is ASCII, so a matching prefix is ASCII too and slicing at
    // its byte length is safe
    for line in content.lines().rev() {
        let trimmed = line.trim();
        let Some(prefix) = trimmed.as_bytes().get(..marker.len()) else {
            continue;
        };
        if !prefix.eq_ignore_ascii_case(marker.as_bytes()) {
            continue;
        }
        let token: String = trimmed[marker.len()..]
            .trim_start()
            .chars()
            .take_while(|c| c.is_ascii_digit() || *c == '.')
            .collect();
        if let Ok(score) = token.parse::<f64>() {
            return Some(score.clamp(1.0, 10.0));
        }
        return None;
    }
    None
}

/// Round consensus in [0, 1] per the configured strategy
fn consensus(config: &DiscussionConfig, contributions: &[Contribution], synthesis: Option<&str>) -> f64 {
    if contributions.is_empty() {
        return 0.0;
    }
    let agreements: Vec<f64> = contributions
        .iter()
        .map(|c| c.agreement_score.unwrap_or(5.0))
        .collect();
    let n = agreements.len() as f64;

    match config.consensus_strategy {
        ConsensusStrategy::Unanimous => agreements.iter().cloned().fold(f64::INFINITY, f64::min) / 10.0,
        ConsensusStrategy::Majority => agreements.iter().filter(|a| **a >= 6.0).count() as f64 / n,
        ConsensusStrategy::Weighted => {
            let weighted_sum: f64 = contributions
                .iter()
                .enumerate()
                .map(|(i, c)| {
                    let weight = config.participants.get(i).and_then(|p| p.weight).unwrap_or(1.0);
                    weight * c.agreement_score.unwrap_or(5.0) / 10.0
                })
                .sum();
            weighted_sum / n
        }
        ConsensusStrategy::Facilitator => synthesis
            .and_then(|s| parse_marker_score(s, "CONSENSUS:"))
            .map(|score| score / 10.0)
            .unwrap_or(0.5),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestrate::executor::ExecutorOutput;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Agent whose responses are scripted per call
    struct RoundRobinAgent {
        kind: String,
        responses: Mutex<Vec<String>>,
        calls: AtomicUsize,
    }

    impl RoundRobinAgent {
        fn register(registry: &ExecutorRegistry, kind: &str, responses: Vec<&str>) -> Arc<Self> {
            let agent = Arc::new(Self {
                kind: kind.to_string(),
                responses: Mutex::new(responses.into_iter().rev().map(String::from).collect()),
                calls: AtomicUsize::new(0),
            });
            registry.register(agent.clone());
            agent
        }
    }

    #[async_trait]
    impl Executor for RoundRobinAgent {
        fn kind(&self) -> &str {
            &self.kind
        }

        async fn execute(&self, _ctx: &ExecutionContext, _input: ExecutorInput) -> Result<ExecutorOutput, JobError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let response = self
                .responses
                .lock()
                .unwrap()
                .pop()
                .unwrap_or_else(|| "nothing left to say\nAGREEMENT: 5".to_string());
            Ok(ExecutorOutput::text(response))
        }
    }

    fn ctx() -> ExecutionContext {
        ExecutionContext {
            workflow_execution_id: "wf-exec-1".to_string(),
            step_id: "discussion".to_string(),
            user_id: "u1".to_string(),
            timeout: None,
        }
    }

    #[test]
    fn test_parse_agreement_variants() {
        assert_eq!(parse_agreement("view...\nAGREEMENT: 8"), 8.0);
        assert_eq!(parse_agreement("view...\nagreement: 7"), 7.0);
        assert_eq!(parse_agreement("AGREEMENT: 3.5 with caveats"), 3.5);
        // Out-of-range clamps into 1..10
        assert_eq!(parse_agreement("AGREEMENT: 15"), 10.0);
        assert_eq!(parse_agreement("AGREEMENT: 0.2"), 1.0);
        // Parse failure defaults to 5
        assert_eq!(parse_agreement("no score here"), 5.0);
        assert_eq!(parse_agreement("AGREEMENT: very high"), 5.0);
    }

    fn weighted_config(threshold: f64) -> DiscussionConfig {
        DiscussionConfig {
            max_rounds: 5,
            participants: vec![
                Participant {
                    weight: Some(1.2),
                    ..Participant::new("llm", "producer")
                },
                Participant {
                    weight: Some(1.0),
                    ..Participant::new("llm", "composer")
                },
                Participant {
                    weight: Some(0.8),
                    ..Participant::new("llm", "critic")
                },
            ],
            consensus_strategy: ConsensusStrategy::Weighted,
            facilitator_agent_ref: None,
            convergence_threshold: threshold,
            contribution_prompt_template: None,
            synthesis_prompt_template: None,
        }
    }

    #[test]
    fn test_weighted_consensus_math() {
        let config = weighted_config(0.75);
        let contributions: Vec<Contribution> = [(8.0, "producer"), (6.0, "composer"), (5.0, "critic")]
            .iter()
            .enumerate()
            .map(|(i, (score, role))| Contribution {
                participant_id: format!("llm-{}", i),
                role: role.to_string(),
                content: String::new(),
                agreement_score: Some(*score),
            })
            .collect();

        let score = consensus(&config, &contributions, None);
        // (1.2*0.8 + 1.0*0.6 + 0.8*0.5) / 3
        assert!((score - (1.2 * 0.8 + 1.0 * 0.6 + 0.8 * 0.5) / 3.0).abs() < 1e-9);
        assert!(score < 0.75);
    }

    #[test]
    fn test_consensus_strategies() {
        let contributions: Vec<Contribution> = [9.0, 6.0, 4.0]
            .iter()
            .enumerate()
            .map(|(i, score)| Contribution {
                participant_id: format!("llm-{}", i),
                role: "r".to_string(),
                content: String::new(),
                agreement_score: Some(*score),
            })
            .collect();

        let mut config = weighted_config(0.75);

        config.consensus_strategy = ConsensusStrategy::Unanimous;
        assert!((consensus(&config, &contributions, None) - 0.4).abs() < 1e-9);

        config.consensus_strategy = ConsensusStrategy::Majority;
        assert!((consensus(&config, &contributions, None) - 2.0 / 3.0).abs() < 1e-9);

        config.consensus_strategy = ConsensusStrategy::Facilitator;
        assert!((consensus(&config, &contributions, Some("summary\nCONSENSUS: 8")) - 0.8).abs() < 1e-9);
        // No parseable facilitator score defaults to 0.5
        assert!((consensus(&config, &contributions, Some("summary")) - 0.5).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_two_round_weighted_convergence() {
        let registry = ExecutorRegistry::new();
        // Round 1: contributions (8, 6, 5) + synthesis; round 2: (9, 8, 7) +
        // synthesis
        RoundRobinAgent::register(
            &registry,
            "llm",
            vec![
                "more cowbell\nAGREEMENT: 8",
                "less cowbell\nAGREEMENT: 6",
                "no cowbell\nAGREEMENT: 5",
                "round 1 synthesis",
                "fine, some cowbell\nAGREEMENT: 9",
                "agreed\nAGREEMENT: 8",
                "acceptable\nAGREEMENT: 7",
                "round 2 synthesis",
            ],
        );

        let config = weighted_config(0.75);
        let result = run_discussion(&registry, &ctx(), "how much cowbell", &config)
            .await
            .unwrap();

        assert_eq!(result.rounds.len(), 2);
        assert!(!result.rounds[0].consensus_score.is_nan());
        assert!(result.rounds[0].consensus_score < 0.75);
        assert!((result.rounds[1].consensus_score - (1.2 * 0.9 + 1.0 * 0.8 + 0.8 * 0.7) / 3.0).abs() < 1e-9);
        assert!(result.converged);
        assert_eq!(result.final_consensus.as_deref(), Some("round 2 synthesis"));

        // Summaries: three participants, two contributions each
        assert_eq!(result.participant_summaries.len(), 3);
        let first = &result.participant_summaries["llm-0"];
        assert_eq!(first.contributions, 2);
        assert!((first.agreement_rate - (0.8 + 0.9) / 2.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_max_rounds_without_convergence() {
        let registry = ExecutorRegistry::new();
        RoundRobinAgent::register(&registry, "llm", vec![]);

        let mut config = weighted_config(0.99);
        config.max_rounds = 3;
        let result = run_discussion(&registry, &ctx(), "topic", &config).await.unwrap();

        assert_eq!(result.rounds.len(), 3);
        assert!(!result.converged);
    }

    #[tokio::test]
    async fn test_facilitator_synthesizes() {
        let registry = ExecutorRegistry::new();
        RoundRobinAgent::register(&registry, "llm", vec!["view\nAGREEMENT: 7", "view\nAGREEMENT: 7"]);
        RoundRobinAgent::register(&registry, "moderator", vec!["the group agrees\nCONSENSUS: 9"]);

        let config = DiscussionConfig {
            max_rounds: 3,
            participants: vec![Participant::new("llm", "a"), Participant::new("llm", "b")],
            consensus_strategy: ConsensusStrategy::Facilitator,
            facilitator_agent_ref: Some("moderator".to_string()),
            convergence_threshold: 0.8,
            contribution_prompt_template: None,
            synthesis_prompt_template: None,
        };
        let result = run_discussion(&registry, &ctx(), "topic", &config).await.unwrap();

        assert!(result.converged);
        assert_eq!(result.rounds.len(), 1);
        assert!((result.consensus_score - 0.9).abs() < 1e-9);
        assert_eq!(result.final_consensus.as_deref(), Some("the group agrees\nCONSENSUS: 9"));
    }

    #[tokio::test]
    async fn test_prior_synthesis_feeds_next_round() {
        let registry = ExecutorRegistry::new();
        let agent = RoundRobinAgent::register(
            &registry,
            "llm",
            vec![
                "first\nAGREEMENT: 2",
                "synthesis one",
                "second\nAGREEMENT: 9",
                "synthesis two",
            ],
        );

        let config = DiscussionConfig {
            max_rounds: 2,
            participants: vec![Participant::new("llm", "solo")],
            consensus_strategy: ConsensusStrategy::Unanimous,
            facilitator_agent_ref: None,
            convergence_threshold: 0.85,
            contribution_prompt_template: None,
            synthesis_prompt_template: None,
        };
        let result = run_discussion(&registry, &ctx(), "topic", &config).await.unwrap();

        assert_eq!(result.rounds.len(), 2);
        assert!(result.converged);
        // 1 contribution + 1 synthesis per round
        assert_eq!(agent.calls.load(Ordering::SeqCst), 4);
    }
}
