//! End-to-end deliberation tests over a scripted backend.

mod common;

use std::sync::Arc;
use std::time::Duration;

use tempfile::{tempdir, TempDir};
use uuid::Uuid;

use common::{test_config, ModelReply, ScriptedBackend};
use council::controller::{DeliberationController, DeliberationRequest};
use council::error::{CouncilError, ErrorKind};
use council::events::{DeliberationEvent, EventKind};
use council::store::{ConversationStore, FileStore};
use council::types::Role;
use council::CouncilConfig;

struct Fixture {
    _dir: TempDir,
    backend: Arc<ScriptedBackend>,
    store: Arc<dyn ConversationStore>,
    controller: Arc<DeliberationController>,
    conversation_id: Uuid,
}

async fn fixture(backend: ScriptedBackend, config: CouncilConfig) -> Fixture {
    let dir = tempdir().unwrap();
    let store: Arc<dyn ConversationStore> = Arc::new(FileStore::new(dir.path()).unwrap());
    let conversation = store.create_conversation().await.unwrap();
    let backend = Arc::new(backend);
    let controller = Arc::new(DeliberationController::new(
        backend.clone(),
        store.clone(),
        config,
        None,
    ));
    Fixture {
        _dir: dir,
        backend,
        store,
        controller,
        conversation_id: conversation.id,
    }
}

async fn drain_events(
    handle: &mut council::controller::DeliberationHandle,
) -> Vec<DeliberationEvent> {
    let mut events = Vec::new();
    while let Some(event) = handle.events.recv().await {
        events.push(event);
    }
    events
}

fn event_types(events: &[DeliberationEvent]) -> Vec<&'static str> {
    events.iter().map(|e| e.kind.event_type()).collect()
}

fn index_of(types: &[&'static str], wanted: &str) -> usize {
    types
        .iter()
        .position(|t| *t == wanted)
        .unwrap_or_else(|| panic!("missing event {wanted} in {types:?}"))
}

/// Happy path: one round, good scores, no refinement (S1 + P1).
#[tokio::test]
async fn test_single_round_happy_path() {
    let backend = ScriptedBackend::new();
    for model in ["alpha", "beta", "gamma"] {
        backend.script(model, ModelReply::Text(format!("{model} draft")));
        backend.script(model, ModelReply::RankSeen(vec![4.0, 4.0]));
    }
    backend.script("chairman", ModelReply::Text("final synthesis".to_string()));

    let fx = fixture(backend, test_config(1, true)).await;
    let mut handle = fx.controller.submit(DeliberationRequest {
        conversation_id: fx.conversation_id,
        content: "what is rust?".to_string(),
    });

    let events = drain_events(&mut handle).await;
    let record = handle.result.await.unwrap().unwrap();

    // P1: strict stage ordering.
    let types = event_types(&events);
    let s1_start = index_of(&types, "stage1_start");
    let s1_done = index_of(&types, "stage1_complete");
    let s2_start = index_of(&types, "stage2_round_start");
    let s2_done = index_of(&types, "stage2_complete");
    let s3_start = index_of(&types, "stage3_start");
    let s3_done = index_of(&types, "stage3_complete");
    assert!(s1_start < s1_done);
    assert!(s1_done < s2_start);
    assert!(s2_start < s2_done);
    assert!(s2_done < s3_start);
    assert!(s3_start < s3_done);

    // Exactly one ranking round, no refinement at the last round.
    assert_eq!(
        types.iter().filter(|t| **t == "stage2_round_start").count(),
        1
    );
    assert!(!types.contains(&"stage2_refinement_start"));

    // Stage-3 tokens reassemble the synthesis.
    let synthesis: String = events
        .iter()
        .filter_map(|e| match &e.kind {
            EventKind::Stage3Token { delta } => Some(delta.as_str()),
            _ => None,
        })
        .collect();
    assert_eq!(synthesis.trim(), "final synthesis");

    assert_eq!(record.drafts.len(), 3);
    assert!(record.drafts.iter().all(|d| d.succeeded()));
    assert_eq!(record.rounds.len(), 1);
    assert!(!record.rounds[0].refinement_triggered);
    assert_eq!(record.rounds[0].aggregate.len(), 3);
    assert_eq!(record.synthesis.as_ref().unwrap().content, "final synthesis");
    assert!(!record.cancelled);

    // Trace landed on the assistant message.
    let conversation = fx.store.get(&fx.conversation_id).await.unwrap();
    assert_eq!(conversation.messages.len(), 2);
    assert_eq!(conversation.messages[1].role, Role::Assistant);
    assert!(conversation.messages[1].deliberation.is_some());

    // Every completed call reported its timing to the tracker.
    let timings = fx.controller.tracker().for_request(&handle.request_id.to_string());
    assert!(timings.iter().any(|(model, _)| model == "chairman"));
    assert!(timings.len() >= 7); // 3 drafts + 3 rankings + synthesis
}

/// P3 + P4: every ranker sees exactly N-1 responses, never its own,
/// and the label bijection is shared within the round.
#[tokio::test]
async fn test_anonymization_self_exclusion_and_consistency() {
    let backend = ScriptedBackend::new();
    for model in ["alpha", "beta", "gamma"] {
        backend.script(model, ModelReply::Text(format!("unique-{model}-draft")));
        backend.script(model, ModelReply::RankSeen(vec![4.0, 4.0]));
    }
    backend.script("chairman", ModelReply::Text("done".to_string()));

    let fx = fixture(backend, test_config(1, true)).await;
    fx.controller
        .run_blocking(DeliberationRequest {
            conversation_id: fx.conversation_id,
            content: "q".to_string(),
        })
        .await
        .unwrap();

    let ranking_calls = fx.backend.ranking_calls();
    assert_eq!(ranking_calls.len(), 3);

    let mut label_contents: Vec<(char, String)> = Vec::new();
    for call in &ranking_calls {
        let prompt = &call.messages[1].content;

        // Self-exclusion: the ranker's own draft never appears.
        assert!(
            !prompt.contains(&format!("unique-{}-draft", call.model)),
            "{} saw its own draft",
            call.model
        );

        // Exactly N-1 labeled responses.
        let mut seen = 0;
        for line in prompt.lines() {
            if let Some(rest) = line.strip_prefix("Response ") {
                if let Some(label) = rest.strip_suffix(':').and_then(|s| s.chars().next()) {
                    seen += 1;
                    // Capture the content line following the label.
                    let content = prompt
                        .split(&format!("Response {label}:\n"))
                        .nth(1)
                        .unwrap()
                        .lines()
                        .next()
                        .unwrap()
                        .to_string();
                    label_contents.push((label, content));
                }
            }
        }
        assert_eq!(seen, 2, "{} saw {} responses", call.model, seen);
    }

    // P4: a label maps to one content across all rankers in the round.
    for (label, content) in &label_contents {
        for (other_label, other_content) in &label_contents {
            if label == other_label {
                assert_eq!(content, other_content, "label {label} mapped to two drafts");
            }
        }
    }
}

/// S2: low round-1 scores trigger one refinement sub-round; round 2
/// ranks the refined drafts and stops.
#[tokio::test]
async fn test_refinement_triggers_once() {
    let backend = ScriptedBackend::new();
    for model in ["alpha", "beta", "gamma"] {
        backend.script(model, ModelReply::Text(format!("{model} draft")));
        backend.script(model, ModelReply::RankSeen(vec![1.0, 1.0])); // round 1: poor
        backend.script(model, ModelReply::Text(format!("{model} improved")));
        backend.script(model, ModelReply::RankSeen(vec![4.0, 4.0])); // round 2: good
    }
    backend.script("chairman", ModelReply::Text("synthesis".to_string()));

    let fx = fixture(backend, test_config(2, true)).await;
    let mut handle = fx.controller.submit(DeliberationRequest {
        conversation_id: fx.conversation_id,
        content: "q".to_string(),
    });
    let events = drain_events(&mut handle).await;
    let record = handle.result.await.unwrap().unwrap();

    let types = event_types(&events);
    assert_eq!(
        types.iter().filter(|t| **t == "stage2_round_start").count(),
        2
    );
    assert_eq!(
        types
            .iter()
            .filter(|t| **t == "stage2_refinement_start")
            .count(),
        1
    );

    assert_eq!(record.rounds.len(), 2);
    assert!(record.rounds[0].refinement_triggered);
    assert_eq!(record.rounds[0].refinements.len(), 3);
    assert!(!record.rounds[1].refinement_triggered);

    // Round 2 ranked the refined drafts, not the originals.
    let round2_prompts: Vec<String> = fx
        .backend
        .ranking_calls()
        .iter()
        .skip(3)
        .map(|c| c.messages[1].content.clone())
        .collect();
    assert_eq!(round2_prompts.len(), 3);
    assert!(round2_prompts.iter().all(|p| p.contains("improved")));
}

/// S3: one draft failure is absorbed; the request continues with two
/// models and the trace records the failure.
#[tokio::test]
async fn test_partial_stage1_failure_continues() {
    let backend = ScriptedBackend::new();
    backend.script("alpha", ModelReply::Text("alpha draft".to_string()));
    backend.script("beta", ModelReply::Text("beta draft".to_string()));
    backend.script("gamma", ModelReply::FailTimeout);
    backend.script("alpha", ModelReply::RankSeen(vec![4.0]));
    backend.script("beta", ModelReply::RankSeen(vec![4.0]));
    backend.script("chairman", ModelReply::Text("synthesis".to_string()));

    let fx = fixture(backend, test_config(1, true)).await;
    let record = fx
        .controller
        .run_blocking(DeliberationRequest {
            conversation_id: fx.conversation_id,
            content: "q".to_string(),
        })
        .await
        .unwrap();

    let gamma = record.drafts.iter().find(|d| d.model == "gamma").unwrap();
    assert!(!gamma.succeeded());
    assert_eq!(gamma.error.as_ref().unwrap().kind, ErrorKind::Timeout);
    assert_eq!(record.surviving_models().len(), 2);

    // Rankers saw exactly one peer each.
    for call in fx.backend.ranking_calls() {
        let labels = call
            .messages[1]
            .content
            .lines()
            .filter(|l| l.starts_with("Response ") && l.ends_with(':'))
            .count();
        assert_eq!(labels, 1);
    }
    assert_eq!(record.rounds[0].aggregate.len(), 2);
}

/// S4: two failures leave one survivor; the request dies with a single
/// terminating error event.
#[tokio::test]
async fn test_insufficient_council() {
    let backend = ScriptedBackend::new();
    backend.script("alpha", ModelReply::Text("alpha draft".to_string()));
    backend.script("beta", ModelReply::FailTimeout);
    backend.script("gamma", ModelReply::FailTimeout);

    let fx = fixture(backend, test_config(1, true)).await;
    let mut handle = fx.controller.submit(DeliberationRequest {
        conversation_id: fx.conversation_id,
        content: "q".to_string(),
    });
    let events = drain_events(&mut handle).await;
    let result = handle.result.await.unwrap();

    assert!(matches!(
        result,
        Err(CouncilError::InsufficientCouncil { succeeded: 1, .. })
    ));

    let errors: Vec<_> = events
        .iter()
        .filter(|e| matches!(e.kind, EventKind::Error { .. }))
        .collect();
    assert_eq!(errors.len(), 1);
    match &errors[0].kind {
        EventKind::Error { kind, .. } => assert_eq!(*kind, ErrorKind::InsufficientCouncil),
        _ => unreachable!(),
    }
    // The error event terminates the stream.
    assert_eq!(events.last().unwrap().kind.event_type(), "error");
}

/// P2: stage-1 wall clock tracks the slowest model, not the sum.
#[tokio::test(start_paused = true)]
async fn test_stage1_fan_out_is_parallel() {
    let backend = ScriptedBackend::new();
    for model in ["alpha", "beta", "gamma"] {
        backend.script(
            model,
            ModelReply::Delayed(format!("{model} draft"), Duration::from_millis(200)),
        );
        backend.script(model, ModelReply::RankSeen(vec![4.0, 4.0]));
    }
    backend.script("chairman", ModelReply::Text("synthesis".to_string()));

    let fx = fixture(backend, test_config(1, true)).await;
    let started = tokio::time::Instant::now();
    fx.controller
        .run_blocking(DeliberationRequest {
            conversation_id: fx.conversation_id,
            content: "q".to_string(),
        })
        .await
        .unwrap();
    let elapsed = started.elapsed();

    // Three 200ms drafts in parallel: max, not sum.
    assert!(
        elapsed < Duration::from_millis(450),
        "stage 1 took {elapsed:?}, fan-out looks sequential"
    );
}

/// P11: cancellation stops the token flow and closes the stream
/// within bounded time.
#[tokio::test]
async fn test_cancellation_terminates_stream() {
    let backend = ScriptedBackend::new();
    for model in ["alpha", "beta", "gamma"] {
        backend.script(model, ModelReply::Hang);
    }

    let fx = fixture(backend, test_config(1, true)).await;
    let mut handle = fx.controller.submit(DeliberationRequest {
        conversation_id: fx.conversation_id,
        content: "q".to_string(),
    });

    let cancel = handle.cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();
    });

    let events = tokio::time::timeout(Duration::from_secs(2), drain_events(&mut handle))
        .await
        .expect("stream did not terminate within 2s of cancellation");

    let types = event_types(&events);
    assert!(!types.contains(&"stage1_complete"));
    assert!(!types.contains(&"stage1_token"));
    assert_eq!(*types.last().unwrap(), "error");

    let result = handle.result.await.unwrap();
    assert!(matches!(result, Err(CouncilError::Cancelled)));

    // The trace was recorded with the cancelled tag.
    let conversation = fx.store.get(&fx.conversation_id).await.unwrap();
    let record = conversation.messages[1].deliberation.as_ref().unwrap();
    assert!(record.cancelled);
}

/// Cross-review disabled: poor scores never trigger refinement.
#[tokio::test]
async fn test_cross_review_disabled_skips_refinement() {
    let backend = ScriptedBackend::new();
    for model in ["alpha", "beta", "gamma"] {
        backend.script(model, ModelReply::Text(format!("{model} draft")));
        backend.script(model, ModelReply::RankSeen(vec![1.0, 1.0]));
    }
    backend.script("chairman", ModelReply::Text("synthesis".to_string()));

    let fx = fixture(backend, test_config(2, false)).await;
    let record = fx
        .controller
        .run_blocking(DeliberationRequest {
            conversation_id: fx.conversation_id,
            content: "q".to_string(),
        })
        .await
        .unwrap();

    // Early stop after round 1.
    assert_eq!(record.rounds.len(), 1);
    assert!(!record.rounds[0].refinement_triggered);
}
