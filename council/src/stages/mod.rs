//! Stage execution: parallel drafting, peer ranking rounds, and
//! chairman synthesis.
//!
//! Each stage fans its model calls out as concurrent tasks and joins
//! them all before the stage boundary event is emitted. Single-model
//! failures are absorbed into the trace; only the partial-failure
//! policies here can fail a whole stage.

pub mod prompts;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use futures::StreamExt;
use tokio::time::{timeout_at, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::anonymize::{seed_from_request, LabelMap};
use crate::client::{ChatBackend, ChatMessage, ChatOptions, ModelOutput, StreamChunk};
use crate::config::{DeliberationConfig, EndpointResolver};
use crate::error::{CouncilError, CouncilResult};
use crate::events::{EventKind, EventSender};
use crate::metrics::{ModelTimer, ModelTiming, TokenTracker};
use crate::ranking::{
    aggregate_rankings, min_mean_score, parse_ranking, AggregateScore, ParseWarning, RankEntry,
};
use crate::types::{
    DraftRecord, ModelFailure, RankedPeer, RankingRecord, RankingRound, RefinementRecord,
    SynthesisRecord,
};

/// Per-call budget for drafting, ranking, and refinement.
pub const STAGE_DRAFT_TIMEOUT: Duration = Duration::from_secs(120);
/// Synthesis gets a larger budget: its inputs are the whole trace.
pub const STAGE_SYNTHESIS_TIMEOUT: Duration = Duration::from_secs(300);

/// The request dies below this many usable drafts or rankings.
const MIN_SURVIVORS: usize = 2;

/// Stage-2 output: the full round trace plus the contents each model
/// currently holds (refined where refinement ran).
pub struct Stage2Output {
    pub rounds: Vec<RankingRound>,
    pub final_contents: HashMap<String, String>,
}

impl Stage2Output {
    /// Aggregate from the last completed round.
    pub fn final_aggregate(&self) -> &[AggregateScore] {
        self.rounds
            .last()
            .map(|r| r.aggregate.as_slice())
            .unwrap_or(&[])
    }
}

/// Whether a refinement sub-round runs after ranking round `round`.
/// Never runs at the last round.
pub fn refinement_due(
    round: u32,
    total_rounds: u32,
    enable_cross_review: bool,
    min_score: Option<f32>,
    threshold: f32,
) -> bool {
    round < total_rounds
        && enable_cross_review
        && min_score.is_some_and(|score| score < threshold)
}

/// Executes the three deliberation stages for one request.
pub struct StageRunner {
    backend: Arc<dyn ChatBackend>,
    resolver: EndpointResolver,
    council: Vec<String>,
    chairman: String,
    deliberation: DeliberationConfig,
    events: EventSender,
    cancel: CancellationToken,
    request_id: Uuid,
    tracker: Arc<TokenTracker>,
}

impl StageRunner {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        backend: Arc<dyn ChatBackend>,
        resolver: EndpointResolver,
        council: Vec<String>,
        chairman: String,
        deliberation: DeliberationConfig,
        events: EventSender,
        cancel: CancellationToken,
        request_id: Uuid,
        tracker: Arc<TokenTracker>,
    ) -> Self {
        Self {
            backend,
            resolver,
            council,
            chairman,
            deliberation,
            events,
            cancel,
            request_id,
            tracker,
        }
    }

    /// Stage 1: fan the conversation out to every council model.
    /// Continues with the successes as long as at least two models
    /// produced a draft.
    pub async fn run_stage1(&self, messages: &[ChatMessage]) -> CouncilResult<Vec<DraftRecord>> {
        self.events
            .emit(EventKind::Stage1Start {
                models: self.council.clone(),
            })
            .await;

        let tasks = self.council.iter().map(|model| {
            let model = model.clone();
            let messages = messages.to_vec();
            async move {
                let result = self
                    .stream_call(&model, messages, STAGE_DRAFT_TIMEOUT, |delta, tps| {
                        EventKind::Stage1Token {
                            model: model.clone(),
                            delta,
                            tps,
                        }
                    })
                    .await;
                self.events
                    .emit(EventKind::Stage1ModelComplete {
                        model: model.clone(),
                        ok: result.is_ok(),
                    })
                    .await;
                (model, result)
            }
        });
        let results = join_all(tasks).await;

        if self.cancel.is_cancelled() {
            return Err(CouncilError::Cancelled);
        }

        let mut drafts = Vec::with_capacity(results.len());
        for (model, result) in results {
            match result {
                Ok((output, timing)) => {
                    debug!(model = %model, tokens = timing.content_tokens, "draft complete");
                    drafts.push(DraftRecord {
                        model,
                        content: output.content,
                        thinking: output.thinking,
                        timing: Some(timing),
                        error: None,
                    });
                }
                Err(e) => {
                    warn!(model = %model, "draft failed: {}", e);
                    drafts.push(DraftRecord {
                        model,
                        content: String::new(),
                        thinking: None,
                        timing: None,
                        error: Some(failure(&e)),
                    });
                }
            }
        }

        let succeeded = drafts.iter().filter(|d| d.succeeded()).count();
        self.events
            .emit(EventKind::Stage1Complete {
                succeeded,
                failed: drafts.len() - succeeded,
            })
            .await;

        if succeeded < MIN_SURVIVORS {
            return Err(CouncilError::InsufficientCouncil {
                succeeded,
                requested: drafts.len(),
            });
        }
        Ok(drafts)
    }

    /// Stage 2: up to `rounds` rounds of anonymized peer ranking, with
    /// refinement sub-rounds while quality stays under the threshold.
    pub async fn run_stage2(
        &self,
        query: &str,
        drafts: &[DraftRecord],
    ) -> CouncilResult<Stage2Output> {
        let participants: Vec<String> = drafts
            .iter()
            .filter(|d| d.succeeded())
            .map(|d| d.model.clone())
            .collect();
        let mut contents: HashMap<String, String> = drafts
            .iter()
            .filter(|d| d.succeeded())
            .map(|d| (d.model.clone(), d.content.clone()))
            .collect();

        let total_rounds = self.deliberation.rounds;
        let mut rounds = Vec::new();
        let mut rounds_run = 0;

        for round in 1..=total_rounds {
            rounds_run = round;
            self.events
                .emit(EventKind::Stage2RoundStart {
                    round,
                    max_rounds: total_rounds,
                })
                .await;

            // One bijection per round, shared by all rankers in it.
            let label_map = LabelMap::assign(
                &participants,
                seed_from_request(&self.request_id) ^ u64::from(round),
            );

            let rankings = self
                .run_ranking_round(query, round, &label_map, &participants, &contents)
                .await?;

            let orderings: Vec<Vec<RankEntry>> = rankings
                .iter()
                .filter(|r| r.error.is_none() && !r.entries.is_empty())
                .map(|r| r.entries.clone())
                .collect();
            if orderings.len() < MIN_SURVIVORS {
                return Err(CouncilError::InsufficientCouncil {
                    succeeded: orderings.len(),
                    requested: participants.len(),
                });
            }

            let label_aggregate = aggregate_rankings(&orderings);
            let aggregate: Vec<AggregateScore> = label_aggregate
                .iter()
                .filter_map(|a| label_map.model_of(a.label).map(|m| a.with_model(m)))
                .collect();

            let triggered = refinement_due(
                round,
                total_rounds,
                self.deliberation.enable_cross_review,
                min_mean_score(&label_aggregate),
                self.deliberation.quality_threshold,
            );

            let ranking_records: Vec<RankingRecord> = rankings
                .into_iter()
                .map(|r| r.into_record(&label_map))
                .collect();

            let refinements = if triggered {
                self.run_refinement(query, round, &label_map, &participants, &mut contents, &ranking_records)
                    .await?
            } else {
                Vec::new()
            };

            self.events
                .emit(EventKind::Stage2RoundComplete {
                    round,
                    next_round_triggered: triggered,
                })
                .await;

            rounds.push(RankingRound {
                round,
                rankings: ranking_records,
                aggregate,
                refinement_triggered: triggered,
                refinements,
            });

            if !triggered {
                break; // early stop
            }
        }

        self.events
            .emit(EventKind::Stage2Complete { rounds_run })
            .await;

        Ok(Stage2Output {
            rounds,
            final_contents: contents,
        })
    }

    /// Stage 3: chairman synthesis over the final drafts with real
    /// identities and aggregate peer scores.
    pub async fn run_stage3(
        &self,
        query: &str,
        contents: &HashMap<String, String>,
        aggregate: &[AggregateScore],
    ) -> CouncilResult<SynthesisRecord> {
        // Present drafts in aggregate order, then any unranked leftovers.
        let mut drafts: Vec<(String, String)> = Vec::new();
        for score in aggregate {
            if let Some(content) = contents.get(&score.model) {
                drafts.push((score.model.clone(), content.clone()));
            }
        }
        let mut leftovers: Vec<&String> = contents
            .keys()
            .filter(|m| !drafts.iter().any(|(d, _)| d == *m))
            .collect();
        leftovers.sort();
        for model in leftovers {
            drafts.push((model.clone(), contents[model].clone()));
        }

        self.events
            .emit(EventKind::Stage3Start {
                model: self.chairman.clone(),
            })
            .await;

        let messages = prompts::synthesis_messages(query, &drafts, aggregate);
        let (output, timing) = self
            .stream_call(
                &self.chairman,
                messages,
                STAGE_SYNTHESIS_TIMEOUT,
                |delta, _tps| EventKind::Stage3Token { delta },
            )
            .await?;

        self.events.emit(EventKind::Stage3Complete).await;

        Ok(SynthesisRecord {
            model: self.chairman.clone(),
            content: output.content,
            thinking: output.thinking,
            timing: Some(timing),
        })
    }

    async fn run_ranking_round(
        &self,
        query: &str,
        round: u32,
        label_map: &LabelMap,
        participants: &[String],
        contents: &HashMap<String, String>,
    ) -> CouncilResult<Vec<RankerOutcome>> {
        let tasks = participants.iter().map(|ranker| {
            let ranker = ranker.clone();
            // Build the anonymized view eagerly so the task owns its prompt.
            let view = label_map.view_for(&ranker, contents);
            let expected = view.len();
            let messages = prompts::ranking_messages(query, &view);
            async move {
                let result = self
                    .stream_call(&ranker, messages, STAGE_DRAFT_TIMEOUT, |delta, _tps| {
                        EventKind::Stage2Token {
                            model: ranker.clone(),
                            round,
                            delta,
                        }
                    })
                    .await;
                self.events
                    .emit(EventKind::Stage2ModelComplete {
                        model: ranker.clone(),
                        round,
                    })
                    .await;
                (ranker, expected, result)
            }
        });
        let results = join_all(tasks).await;

        if self.cancel.is_cancelled() {
            return Err(CouncilError::Cancelled);
        }

        let mut outcomes = Vec::with_capacity(results.len());
        for (ranker, expected, result) in results {
            outcomes.push(match result {
                Ok((output, timing)) => {
                    self.parse_ranker_output(ranker, expected, output, timing, label_map)
                }
                Err(e) => {
                    warn!(ranker = %ranker, round, "ranking failed: {}", e);
                    RankerOutcome {
                        ranker,
                        raw_text: String::new(),
                        entries: Vec::new(),
                        warnings: Vec::new(),
                        timing: None,
                        error: Some(failure(&e)),
                    }
                }
            });
        }
        Ok(outcomes)
    }

    fn parse_ranker_output(
        &self,
        ranker: String,
        expected: usize,
        output: ModelOutput,
        timing: ModelTiming,
        label_map: &LabelMap,
    ) -> RankerOutcome {
        let parsed = parse_ranking(&output.content, expected);
        let mut warnings = parsed.warnings;

        // Self-exclusion: the ranker was shown N-1 labels; anything
        // outside that set (its own label included) is dropped.
        let own_label = label_map.label_of(&ranker);
        let mut entries = Vec::new();
        for entry in parsed.entries {
            let shown = label_map.model_of(entry.label).is_some() && Some(entry.label) != own_label;
            if shown {
                entries.push(entry);
            } else {
                warnings.push(ParseWarning::UnknownLabel { label: entry.label });
            }
        }
        if entries.is_empty() && !warnings.contains(&ParseWarning::Unparseable) {
            warnings.push(ParseWarning::Unparseable);
        }

        RankerOutcome {
            ranker,
            raw_text: output.content,
            entries,
            warnings,
            timing: Some(timing),
            error: None,
        }
    }

    async fn run_refinement(
        &self,
        query: &str,
        round: u32,
        label_map: &LabelMap,
        participants: &[String],
        contents: &mut HashMap<String, String>,
        rankings: &[RankingRecord],
    ) -> CouncilResult<Vec<RefinementRecord>> {
        self.events
            .emit(EventKind::Stage2RefinementStart {
                round,
                models: participants.to_vec(),
            })
            .await;

        let raw_rankings: Vec<String> = rankings
            .iter()
            .filter(|r| r.error.is_none())
            .map(|r| r.raw_text.clone())
            .collect();

        let tasks = participants.iter().map(|model| {
            let model = model.clone();
            let own = contents.get(&model).cloned().unwrap_or_default();
            let feedback = label_map
                .label_of(&model)
                .map(|label| prompts::feedback_for_label(label, &raw_rankings))
                .unwrap_or_default();
            let messages = prompts::refinement_messages(query, &own, &feedback);
            async move {
                let result = self
                    .stream_call(&model, messages, STAGE_DRAFT_TIMEOUT, |delta, _tps| {
                        EventKind::Stage2RefinementToken {
                            model: model.clone(),
                            round,
                            delta,
                        }
                    })
                    .await;
                (model, result)
            }
        });
        let results = join_all(tasks).await;

        if self.cancel.is_cancelled() {
            return Err(CouncilError::Cancelled);
        }

        let mut refinements = Vec::with_capacity(results.len());
        for (model, result) in results {
            match result {
                Ok((output, timing)) if !output.content.is_empty() => {
                    contents.insert(model.clone(), output.content.clone());
                    refinements.push(RefinementRecord {
                        model,
                        content: output.content,
                        thinking: output.thinking,
                        timing: Some(timing),
                        error: None,
                    });
                }
                Ok((_, timing)) => {
                    // Empty refinement: keep the previous content.
                    warn!(model = %model, round, "empty refinement, keeping previous draft");
                    refinements.push(RefinementRecord {
                        model,
                        content: String::new(),
                        thinking: None,
                        timing: Some(timing),
                        error: None,
                    });
                }
                Err(e) => {
                    warn!(model = %model, round, "refinement failed: {}", e);
                    refinements.push(RefinementRecord {
                        model,
                        content: String::new(),
                        thinking: None,
                        timing: None,
                        error: Some(failure(&e)),
                    });
                }
            }
        }
        Ok(refinements)
    }

    /// Drive one streaming call to completion, forwarding content
    /// deltas as events and enforcing the per-call deadline and
    /// request cancellation.
    async fn stream_call(
        &self,
        model: &str,
        messages: Vec<ChatMessage>,
        budget: Duration,
        make_event: impl Fn(String, f64) -> EventKind + Send + Sync,
    ) -> CouncilResult<(ModelOutput, ModelTiming)> {
        let endpoint = self.resolver.resolve(model);
        let options = ChatOptions::with_timeout(budget);
        let deadline = Instant::now() + budget;

        let mut stream = tokio::select! {
            _ = self.cancel.cancelled() => return Err(CouncilError::Cancelled),
            result = self.backend.complete_stream(&endpoint, &messages, &options) => result?,
        };

        let mut timer = ModelTimer::start();
        loop {
            let next = tokio::select! {
                _ = self.cancel.cancelled() => return Err(CouncilError::Cancelled),
                item = timeout_at(deadline, stream.next()) => item,
            };
            let item = match next {
                Ok(item) => item,
                Err(_) => {
                    return Err(CouncilError::Timeout {
                        model: model.to_string(),
                        seconds: budget.as_secs(),
                    })
                }
            };
            match item {
                Some(Ok(StreamChunk::Thinking(_))) => timer.on_thinking(),
                Some(Ok(StreamChunk::Content(delta))) => {
                    timer.on_content(&delta);
                    let tps = timer.current_tps();
                    self.events.emit(make_event(delta, tps)).await;
                }
                Some(Ok(StreamChunk::Done(output))) => {
                    let timing = timer.finish();
                    self.tracker
                        .record(&self.request_id.to_string(), model, timing.clone());
                    return Ok((output, timing));
                }
                Some(Err(e)) => return Err(e),
                None => {
                    return Err(CouncilError::ProtocolError {
                        model: model.to_string(),
                        reason: "stream ended without a terminal chunk".to_string(),
                    })
                }
            }
        }
    }
}

/// Intermediate per-ranker result before de-anonymization.
struct RankerOutcome {
    ranker: String,
    raw_text: String,
    entries: Vec<RankEntry>,
    warnings: Vec<ParseWarning>,
    timing: Option<ModelTiming>,
    error: Option<ModelFailure>,
}

impl RankerOutcome {
    fn into_record(self, label_map: &LabelMap) -> RankingRecord {
        let parsed = self
            .entries
            .iter()
            .filter_map(|e| {
                label_map.model_of(e.label).map(|model| RankedPeer {
                    model: model.to_string(),
                    score: e.score,
                })
            })
            .collect();
        RankingRecord {
            ranker: self.ranker,
            raw_text: self.raw_text,
            parsed,
            warnings: self.warnings,
            timing: self.timing,
            error: self.error,
        }
    }
}

fn failure(error: &CouncilError) -> ModelFailure {
    ModelFailure {
        kind: error.kind(),
        message: error.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_refinement_due_requires_all_conditions() {
        // Below threshold, not last round, cross-review on.
        assert!(refinement_due(1, 2, true, Some(1.0), 1.5));

        // Never at the last round.
        assert!(!refinement_due(2, 2, true, Some(1.0), 1.5));

        // Cross-review disabled.
        assert!(!refinement_due(1, 2, false, Some(1.0), 1.5));

        // Quality at or above threshold.
        assert!(!refinement_due(1, 2, true, Some(1.5), 1.5));
        assert!(!refinement_due(1, 2, true, Some(4.0), 1.5));

        // No scores at all: nothing to judge, no trigger.
        assert!(!refinement_due(1, 2, true, None, 1.5));
    }
}
