//! End-to-end tests over the full service wiring
//!
//! The assistant CLI is stood in for by small shell commands; the KV layer
//! is the in-memory implementation; renders run the real pipeline.

use std::sync::Arc;
use std::time::Duration;

use kvstore::MemoryKv;
use studiod::config::Config;
use studiod::domain::{JobStatus, Priority, RenderOptions};
use studiod::events::JobEvent;
use studiod::service::{JobService, SubmitLlmRequest, SubmitRenderRequest, Submission};
use studiod::{ErrorCode, WorkflowDefinition, WorkflowStatus};

fn test_config() -> Config {
    let mut config = Config::default();
    config.kv.url = None;
    config.scheduler.tick_ms = 20;
    config.llm.command = "sh".to_string();
    config.llm.args = vec!["-c".to_string(), "printf hi".to_string()];
    config.llm.max_concurrent = 2;
    config.llm.rate_limit_per_minute = 1_000;
    config.render.max_concurrent = 1;
    config.render.rate_limit_per_minute = 1_000;
    config.render.sample_repo_url = "http://127.0.0.1:1/samples".to_string();
    config.render.sample_cache_dir = std::env::temp_dir().join("studiod-e2e-samples");
    config
}

fn start_service(config: Config) -> Arc<JobService> {
    JobService::start(Arc::new(MemoryKv::new()), config)
}

fn llm_request(prompt: &str, timeout_ms: u64) -> SubmitLlmRequest {
    SubmitLlmRequest {
        prompt: prompt.to_string(),
        system_prompt: None,
        model: None,
        max_tokens: None,
        working_directory: None,
        timeout_ms: Some(timeout_ms),
        priority: None,
        user_id: "u1".to_string(),
    }
}

fn render_request(code: &str, duration: f64, priority: u8) -> SubmitRenderRequest {
    SubmitRenderRequest {
        code: code.to_string(),
        options: RenderOptions::new(duration, 44100, 2),
        priority: Some(Priority::new(priority)),
        user_id: "u1".to_string(),
        request_id: None,
    }
}

/// A pattern heavy enough to hold the render slot for a while
fn heavy_render(duration: f64) -> SubmitRenderRequest {
    SubmitRenderRequest {
        code: "s(\"bd*16 sd*16 hh*16 oh*16\")".to_string(),
        options: RenderOptions::new(duration, 96000, 2),
        priority: Some(Priority::new(0)),
        user_id: "u1".to_string(),
        request_id: None,
    }
}

async fn wait_until_render_active(service: &Arc<JobService>) {
    for _ in 0..500 {
        if service.metrics().await.render_active >= 1 {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("render job never became active");
}

// === Scenario: LLM fast path ===

#[tokio::test]
async fn llm_fast_path_runs_inline() {
    let service = start_service(test_config());

    let submission = service.submit_llm(llm_request("hello", 5_000)).await.unwrap();
    let Submission::Inline { job_id, terminal } = submission else {
        panic!("expected inline fast path under capacity");
    };

    let JobEvent::Terminal { status, result, .. } = terminal else {
        panic!("expected terminal event");
    };
    assert_eq!(status, JobStatus::Completed);
    let result = result.unwrap();
    assert_eq!(result["stdout"], "hi");
    assert_eq!(result["exit_code"], 0);

    // No queue entry was ever observed
    assert_eq!(service.metrics().await.llm_queued, 0);

    let view = service.status(&job_id).await.unwrap().unwrap();
    assert_eq!(view.status, JobStatus::Completed);
    assert_eq!(view.progress, 100);
}

// === Scenario: render queueing behind a running job ===

#[tokio::test]
async fn render_queues_behind_running_job() {
    let service = start_service(test_config());

    let first_service = service.clone();
    let first = tokio::spawn(async move { first_service.submit_render(heavy_render(30.0)).await });
    wait_until_render_active(&service).await;

    let submission = service
        .submit_render(render_request("s(\"bd sd bd sd\")", 4.0, 0))
        .await
        .unwrap();
    let Submission::Accepted {
        job_id,
        status,
        queue_position,
        ..
    } = submission
    else {
        panic!("expected queued submission while the slot is held");
    };
    assert_eq!(status, JobStatus::Queued);
    assert_eq!(queue_position, Some(1));

    // Once the running job completes, the queued one renders to completion
    let mut events = service.subscribe(&job_id).await;
    let mut saw_rendering = false;
    let terminal = loop {
        let event = tokio::time::timeout(Duration::from_secs(120), events.recv())
            .await
            .expect("timed out waiting for events")
            .expect("stream ended without terminal");
        match &event {
            JobEvent::Progress {
                status: JobStatus::Rendering,
                ..
            } => saw_rendering = true,
            JobEvent::Terminal { .. } => break event,
            _ => {}
        }
    };

    assert!(saw_rendering, "job never reported the rendering phase");
    let JobEvent::Terminal { status, result, .. } = terminal else {
        unreachable!()
    };
    assert_eq!(status, JobStatus::Completed);
    let result = result.unwrap();
    assert!(result["metadata"]["file_size"].as_u64().unwrap() > 44);
    assert_eq!(result["metadata"]["duration"], 4.0);

    let _ = first.await.unwrap();
}

// === Scenario: priority jumps the queue, FIFO on ties ===

#[tokio::test]
async fn priority_orders_queue_with_fifo_ties() {
    let service = start_service(test_config());

    let blocker_service = service.clone();
    let blocker = tokio::spawn(async move { blocker_service.submit_render(heavy_render(90.0)).await });
    wait_until_render_active(&service).await;

    // Distinguishable enqueue timestamps so the FIFO tie-break is stable
    let a = service
        .submit_render(render_request("s(\"bd\")", 1.0, 0))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(5)).await;
    let b = service
        .submit_render(render_request("s(\"sd\")", 1.0, 0))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(5)).await;
    let c = service
        .submit_render(render_request("s(\"hh\")", 1.0, 50))
        .await
        .unwrap();

    let (Submission::Accepted { queue_position: pos_a, .. },
         Submission::Accepted { queue_position: pos_b, .. },
         Submission::Accepted { queue_position: pos_c, .. }) = (&a, &b, &c)
    else {
        panic!("all three should queue behind the running job");
    };
    assert_eq!(*pos_a, Some(1));
    assert_eq!(*pos_b, Some(2));
    // C outranks both queued jobs
    assert_eq!(*pos_c, Some(1));

    // Positions after the priority insert: C, A, B
    assert_eq!(service.status(a.job_id()).await.unwrap().unwrap().status, JobStatus::Queued);
    let view_c = service.status(c.job_id()).await.unwrap().unwrap();
    assert_eq!(view_c.queue_position, Some(1));

    // Cancel everything to wind the test down quickly, the running job
    // included (found via the listing, since its submission is still
    // blocked on the inline render). Cancellation of the running job is
    // cooperative, so retry until it takes.
    for id in [a.job_id(), b.job_id(), c.job_id()] {
        service.cancel(id).await.unwrap();
    }
    for _ in 0..200 {
        let page = service.list("u1", None, 1, 10).await.unwrap();
        let mut live = 0;
        for item in page.items {
            if !item.status.is_terminal() {
                live += 1;
                let _ = service.cancel(&item.id).await;
            }
        }
        if live == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    let _ = blocker.await.unwrap();
}

// === Scenario: render timeout releases the slot ===

#[tokio::test]
async fn render_timeout_fails_and_releases_slot() {
    let mut config = test_config();
    config.render.render_timeout_ms = 50;
    let service = start_service(config);

    let submission = service.submit_render(heavy_render(120.0)).await.unwrap();
    let Submission::Inline { terminal, .. } = submission else {
        panic!("expected inline execution");
    };
    let JobEvent::Terminal { status, error, .. } = terminal else {
        panic!("expected terminal event");
    };
    assert_eq!(status, JobStatus::Failed);
    assert_eq!(error.unwrap().code, ErrorCode::TimeoutError);

    // The concurrency slot is free again: a tiny job proceeds
    let follow_up = service
        .submit_render(SubmitRenderRequest {
            code: "note(\"c3\")".to_string(),
            options: RenderOptions::new(0.5, 22050, 1),
            priority: None,
            user_id: "u1".to_string(),
            request_id: None,
        })
        .await
        .unwrap();
    let Submission::Inline { terminal, .. } = follow_up else {
        panic!("slot was not released");
    };
    let JobEvent::Terminal { status, .. } = terminal else {
        panic!("expected terminal event");
    };
    assert_eq!(status, JobStatus::Completed);
}

// === Queue capacity ===

#[tokio::test]
async fn queue_full_rejects_without_creating_state() {
    let mut config = test_config();
    config.render.max_queue_size = 1;
    let service = start_service(config);

    let blocker_service = service.clone();
    let _blocker = tokio::spawn(async move { blocker_service.submit_render(heavy_render(90.0)).await });
    wait_until_render_active(&service).await;

    let queued = service
        .submit_render(render_request("s(\"bd\")", 1.0, 0))
        .await
        .unwrap();
    assert!(matches!(queued, Submission::Accepted { .. }));

    let err = service
        .submit_render(render_request("s(\"sd\")", 1.0, 0))
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::QueueFull);

    // Only the running and the queued job have records
    let page = service.list("u1", None, 1, 10).await.unwrap();
    assert_eq!(page.total, 2);
}

// === Cancellation ===

#[tokio::test]
async fn cancel_is_idempotent_on_terminal_jobs() {
    let service = start_service(test_config());

    let submission = service.submit_llm(llm_request("hello", 5_000)).await.unwrap();
    let job_id = submission.job_id().clone();

    // Already completed inline: cancel is a no-op
    let outcome = service.cancel(&job_id).await.unwrap();
    assert!(!outcome.cancelled);
    assert!(outcome.reason.is_some());

    let again = service.cancel(&job_id).await.unwrap();
    assert!(!again.cancelled);
}

#[tokio::test]
async fn cancel_queued_job_removes_entry_and_emits_terminal() {
    let service = start_service(test_config());

    let blocker_service = service.clone();
    let _blocker = tokio::spawn(async move { blocker_service.submit_render(heavy_render(90.0)).await });
    wait_until_render_active(&service).await;

    let queued = service
        .submit_render(render_request("s(\"bd\")", 1.0, 0))
        .await
        .unwrap();
    let job_id = queued.job_id().clone();

    let outcome = service.cancel(&job_id).await.unwrap();
    assert!(outcome.cancelled);

    let view = service.status(&job_id).await.unwrap().unwrap();
    assert_eq!(view.status, JobStatus::Cancelled);
    assert_eq!(service.metrics().await.render_queued, 0);

    // The late subscriber still observes exactly one terminal event
    let mut events = service.subscribe(&job_id).await;
    let event = events.recv().await.unwrap();
    assert!(event.is_terminal());
    assert!(events.recv().await.is_none());
}

// === Validation failures surface as terminal failed ===

#[tokio::test]
async fn invalid_pattern_fails_inline_with_position() {
    let service = start_service(test_config());

    let submission = service
        .submit_render(render_request("s(\"bd\" %%", 1.0, 0))
        .await
        .unwrap();
    let Submission::Inline { terminal, .. } = submission else {
        panic!("expected inline execution");
    };
    let JobEvent::Terminal { status, error, .. } = terminal else {
        panic!("expected terminal event");
    };
    assert_eq!(status, JobStatus::Failed);
    let failure = error.unwrap();
    assert_eq!(failure.code, ErrorCode::SyntaxError);
    assert!(failure.details.unwrap().get("line").is_some());
}

#[tokio::test]
async fn over_limit_duration_rejected_at_submission() {
    let service = start_service(test_config());

    let err = service
        .submit_render(render_request("s(\"bd\")", 301.0, 0))
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::ValidationError);

    // At the limit is fine to admit (validated, then rendered)
    let ok = service
        .submit_render(SubmitRenderRequest {
            code: "s(\"bd\")".to_string(),
            options: RenderOptions::new(300.0, 22050, 1),
            priority: None,
            user_id: "u2".to_string(),
            request_id: None,
        })
        .await;
    assert!(ok.is_ok());
}

// === Late subscription after restart-like conditions ===

#[tokio::test]
async fn late_subscriber_gets_synthesized_terminal() {
    let service = start_service(test_config());

    let submission = service.submit_llm(llm_request("hello", 5_000)).await.unwrap();
    let job_id = submission.job_id().clone();

    // Forget the bus snapshot to simulate a restarted event plane; the
    // stored record still yields a terminal event
    service.bus().forget(job_id.as_str());

    let mut events = service.subscribe(&job_id).await;
    let event = events.recv().await.unwrap();
    let JobEvent::Terminal { status, result, .. } = event else {
        panic!("expected synthesized terminal");
    };
    assert_eq!(status, JobStatus::Completed);
    assert_eq!(result.unwrap()["stdout"], "hi");
}

// === LLM timeout ===

#[tokio::test]
async fn llm_timeout_is_terminal_timeout() {
    let mut config = test_config();
    config.llm.command = "sleep".to_string();
    config.llm.args = vec!["30".to_string()];
    let service = start_service(config);

    let submission = service.submit_llm(llm_request("", 200)).await.unwrap();
    let Submission::Inline { terminal, .. } = submission else {
        panic!("expected inline execution");
    };
    let JobEvent::Terminal { status, error, .. } = terminal else {
        panic!("expected terminal event");
    };
    assert_eq!(status, JobStatus::Timeout);
    assert_eq!(error.unwrap().code, ErrorCode::TimeoutError);
}

// === Workflows over the real job layer ===

#[tokio::test]
async fn workflow_runs_steps_through_llm_jobs() {
    let mut config = test_config();
    config.llm.args = vec!["-c".to_string(), "printf step-output".to_string()];
    let service = start_service(config);

    let definition = WorkflowDefinition::new(
        "compose-and-review",
        vec![
            studiod::WorkflowStep::new("compose", "llm", "write a pattern about {{topic}}")
                .with_output("content", "composition"),
            studiod::WorkflowStep::new("review", "llm", "review: {{composition}}").depends_on("compose"),
        ],
    );

    let workflows = service.workflows();
    let state = workflows
        .execute(&definition, "u1", serde_json::json!({"topic": "breakbeats"}))
        .await
        .unwrap();

    assert_eq!(state.status, WorkflowStatus::Completed);
    assert_eq!(state.progress, 100);
    assert_eq!(state.context["composition"], "step-output");
    assert_eq!(state.context["steps"]["review"]["output"], "step-output");
}

#[tokio::test]
async fn workflow_with_cycle_rejected_at_submission() {
    let service = start_service(test_config());
    let definition = WorkflowDefinition::new(
        "broken",
        vec![studiod::WorkflowStep::new("solo", "llm", "x").depends_on("solo")],
    );

    let err = service
        .workflows()
        .submit(&definition, "u1", serde_json::json!({}))
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::ValidationError);
}

// === Listing ===

#[tokio::test]
async fn list_returns_newest_first_with_pagination() {
    let service = start_service(test_config());

    for i in 0..3 {
        service
            .submit_llm(llm_request(&format!("job {}", i), 5_000))
            .await
            .unwrap();
        // Distinguishable created_at timestamps
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    let page = service.list("u1", None, 1, 2).await.unwrap();
    assert_eq!(page.total, 3);
    assert_eq!(page.items.len(), 2);
    assert!(page.items[0].created_at >= page.items[1].created_at);

    let completed = service.list("u1", Some(JobStatus::Completed), 1, 10).await.unwrap();
    assert_eq!(completed.total, 3);

    let none = service.list("someone-else", None, 1, 10).await.unwrap();
    assert_eq!(none.total, 0);
}

#[tokio::test]
async fn self_critique_through_the_job_layer() {
    let mut config = test_config();
    // The stand-in assistant always returns a passing critique
    config.llm.args = vec![
        "-c".to_string(),
        "printf 'clarity: 0.9\\ndepth: 0.8\\nFEEDBACK: solid'".to_string(),
    ];
    let service = start_service(config);

    let critique_config = studiod::CritiqueConfig {
        max_iterations: 3,
        quality_criteria: vec![
            studiod::orchestrate::QualityCriterion::new("clarity", 1.0),
            studiod::orchestrate::QualityCriterion::new("depth", 1.0),
        ],
        stop_on_quality_threshold: 0.8,
        improvement_prompt_template: None,
        evaluation_prompt_template: None,
    };

    let result = service
        .workflows()
        .self_critique("u1", "draft a chord progression", &critique_config)
        .await
        .unwrap();

    assert!(result.converged);
    assert_eq!(result.iterations.len(), 1);
    assert!((result.final_score - 0.85).abs() < 1e-9);
    assert_eq!(result.iterations[0].evaluation.feedback, "solid");
}

// === Rate limiting ===

#[tokio::test]
async fn rate_limit_rejects_over_quota() {
    let mut config = test_config();
    config.llm.rate_limit_per_minute = 2;
    let service = start_service(config);

    service.submit_llm(llm_request("one", 5_000)).await.unwrap();
    service.submit_llm(llm_request("two", 5_000)).await.unwrap();

    let err = service.submit_llm(llm_request("three", 5_000)).await.unwrap_err();
    assert_eq!(err.code(), ErrorCode::RateLimitExceeded);

    // Another user is unaffected
    let mut other = llm_request("fine", 5_000);
    other.user_id = "u2".to_string();
    service.submit_llm(other).await.unwrap();
}
