use std::collections::HashMap;
use std::sync::Arc;

use futures::future::join_all;
use serde_json::Value;

use super::presence::PresenceTracker;
use super::protocol::{OpenAnswer, ServerEvent};
use super::registry::ConnectionRegistry;
use crate::error::Result;
use crate::evaluator::Evaluator;
use crate::store::{
    ActiveQuestion, AnswerRow, Evaluation, EvaluationMode, EvaluationSource, Store,
};

/// Threshold above which a partial-credit answer counts as correct
const CORRECT_FRACTION_THRESHOLD: f64 = 0.5;

/// Normalizes an evaluator score to [0, 1]. Judges answering on a
/// 0-100 scale are divided down, so 80 and 0.8 award identically.
pub fn normalize_score(score: f64) -> f64 {
    let score = if score > 1.0 { score / 100.0 } else { score };
    score.clamp(0.0, 1.0)
}

/// Histogram key for an answer value: raw text for strings, compact JSON
/// for arrays and everything else.
pub fn answer_key(value: &Value) -> String {
    match value.as_str() {
        Some(s) => s.to_string(),
        None => value.to_string(),
    }
}

/// Shared time-decay formula. A missing start time assumes the full
/// duration was used, so the decay bottoms out instead of over-awarding.
pub fn time_decayed_award(
    points: i64,
    score_fraction: f64,
    started_at: Option<u64>,
    answer_time: u64,
    duration_secs: u64,
) -> i64 {
    let total_ms = duration_secs.max(1) * 1000;
    let started_at = started_at.unwrap_or_else(|| answer_time.saturating_sub(total_ms));
    let elapsed_fraction =
        (answer_time.saturating_sub(started_at) as f64 / total_ms as f64).clamp(0.0, 1.0);
    (points as f64 * score_fraction * (1.0 - elapsed_fraction)).round() as i64
}

/// mcq: full credit on exact value equality, nothing otherwise. Compared as
/// `Value`, not as display text, so `"3"` and `3` stay distinct.
pub fn mcq_fraction(answer: &Value, correct_answer: &Value) -> f64 {
    if answer == correct_answer {
        1.0
    } else {
        0.0
    }
}

fn tokens_of(value: &Value) -> Vec<String> {
    match value {
        Value::Array(items) => items.iter().map(answer_key).collect(),
        Value::Null => Vec::new(),
        other => vec![answer_key(other)],
    }
}

/// redflags: fraction of expected tokens the participant selected
pub fn redflags_fraction(answer: &Value, expected: &Value) -> f64 {
    let expected = tokens_of(expected);
    if expected.is_empty() {
        return 0.0;
    }
    let selected = tokens_of(answer);
    let hits = expected.iter().filter(|t| selected.contains(t)).count();
    hits as f64 / expected.len() as f64
}

struct ScoredAnswer {
    session_id: String,
    answer: Value,
    fraction: f64,
    feedback: String,
    /// Already settled at submission time (open mode), don't award twice
    settled: bool,
    created_at: u64,
}

/// Settlement step: computes the final distribution/correctness for a
/// question across all submitted answers and settles point awards.
pub struct ScoringEngine {
    store: Arc<dyn Store>,
    registry: Arc<ConnectionRegistry>,
    presence: Arc<PresenceTracker>,
    evaluator: Arc<dyn Evaluator>,
}

impl ScoringEngine {
    pub fn new(
        store: Arc<dyn Store>,
        registry: Arc<ConnectionRegistry>,
        presence: Arc<PresenceTracker>,
        evaluator: Arc<dyn Evaluator>,
    ) -> Self {
        Self {
            store,
            registry,
            presence,
            evaluator,
        }
    }

    pub async fn reveal_question(
        &self,
        class_id: &str,
        question_id: &str,
        correct_answer: Value,
        points: i64,
        active: Option<&ActiveQuestion>,
    ) -> Result<()> {
        let answers = self.store.list_answers(class_id, question_id).await?;
        let mode = self.resolve_mode(class_id, question_id, active).await;
        let duration_secs = active.map(|a| a.duration_secs).unwrap_or(30);
        let started_at = active.map(|a| a.started_at);

        tracing::info!(
            class_id = %class_id,
            question_id = %question_id,
            answer_count = answers.len(),
            ?mode,
            "Revealing question"
        );

        let scored = match mode {
            EvaluationMode::Mcq => answers
                .iter()
                .map(|a| ScoredAnswer {
                    session_id: a.session_id.clone(),
                    answer: a.answer.clone(),
                    fraction: mcq_fraction(&a.answer, &correct_answer),
                    feedback: String::new(),
                    settled: false,
                    created_at: a.created_at,
                })
                .collect(),
            EvaluationMode::RedFlags => answers
                .iter()
                .map(|a| ScoredAnswer {
                    session_id: a.session_id.clone(),
                    answer: a.answer.clone(),
                    fraction: redflags_fraction(&a.answer, &correct_answer),
                    feedback: String::new(),
                    settled: false,
                    created_at: a.created_at,
                })
                .collect(),
            EvaluationMode::Open => self.score_open_answers(&answers, active).await,
        };

        let mut distribution: HashMap<String, u64> = HashMap::new();
        for answer in &answers {
            *distribution.entry(answer_key(&answer.answer)).or_default() += 1;
        }

        let mut correct_sessions = Vec::new();
        for entry in &scored {
            let correct = match mode {
                EvaluationMode::Mcq => entry.fraction >= 1.0,
                _ => entry.fraction >= CORRECT_FRACTION_THRESHOLD,
            };
            if correct {
                correct_sessions.push(entry.session_id.clone());
            }

            if entry.settled {
                continue;
            }

            let award = time_decayed_award(
                points,
                entry.fraction,
                started_at,
                entry.created_at,
                duration_secs,
            );
            self.settle_award(class_id, question_id, entry, award, mode)
                .await;
        }

        let open_answers = (mode == EvaluationMode::Open).then(|| {
            scored
                .iter()
                .map(|entry| OpenAnswer {
                    session_id: entry.session_id.clone(),
                    answer: entry.answer.clone(),
                    score: entry.fraction,
                    feedback: entry.feedback.clone(),
                })
                .collect()
        });

        self.registry
            .publish(
                &ServerEvent::QuestionResults {
                    class_id: class_id.to_string(),
                    question_id: question_id.to_string(),
                    distribution,
                    correct_sessions,
                    correct_answer,
                    answers: open_answers,
                },
                Some(class_id),
            )
            .await;
        self.presence.broadcast_participants(class_id).await;

        Ok(())
    }

    /// Mode was resolved at authoring time; the active question carries it
    /// and the persisted challenge record backs the timer-expiry path.
    async fn resolve_mode(
        &self,
        class_id: &str,
        question_id: &str,
        active: Option<&ActiveQuestion>,
    ) -> EvaluationMode {
        if let Some(active) = active {
            return active.mode;
        }
        match self.store.list_challenges(class_id).await {
            Ok(challenges) => challenges
                .iter()
                .rev()
                .find(|c| c.question_id == question_id)
                .map(|c| c.mode)
                .unwrap_or(EvaluationMode::Mcq),
            Err(e) => {
                tracing::warn!(
                    class_id = %class_id,
                    question_id = %question_id,
                    error = %e,
                    "Failed to load challenge record, assuming mcq"
                );
                EvaluationMode::Mcq
            }
        }
    }

    /// Evaluator calls run concurrently; one failing judge call gives that
    /// participant a zero-score fallback entry without blocking the rest.
    async fn score_open_answers(
        &self,
        answers: &[AnswerRow],
        active: Option<&ActiveQuestion>,
    ) -> Vec<ScoredAnswer> {
        let futures = answers.iter().map(|answer| async move {
            if let Some(evaluation) = &answer.evaluation {
                return ScoredAnswer {
                    session_id: answer.session_id.clone(),
                    answer: answer.answer.clone(),
                    fraction: evaluation.score,
                    feedback: evaluation.feedback.clone(),
                    settled: true,
                    created_at: answer.created_at,
                };
            }

            let text = answer.answer.as_str().map(str::to_string).unwrap_or_else(|| answer.answer.to_string());
            let (fraction, feedback) = match active {
                Some(active) => match self.evaluator.evaluate(active, &text).await {
                    Ok(verdict) => (normalize_score(verdict.score), verdict.feedback),
                    Err(e) => {
                        tracing::warn!(
                            session_id = %answer.session_id,
                            question_id = %answer.question_id,
                            error = %e,
                            "Evaluator failed, zero-score fallback"
                        );
                        (0.0, "unavailable".to_string())
                    }
                },
                None => (0.0, "unavailable".to_string()),
            };

            ScoredAnswer {
                session_id: answer.session_id.clone(),
                answer: answer.answer.clone(),
                fraction,
                feedback,
                settled: false,
                created_at: answer.created_at,
            }
        });

        join_all(futures).await
    }

    /// Persists the evaluation on the answer row and applies the award.
    /// Both writes are best-effort: the reveal must finish for everyone
    /// even if one participant's settlement fails.
    async fn settle_award(
        &self,
        class_id: &str,
        question_id: &str,
        entry: &ScoredAnswer,
        award: i64,
        mode: EvaluationMode,
    ) {
        if let Ok(Some(mut row)) = self
            .store
            .get_answer(class_id, &entry.session_id, question_id)
            .await
        {
            row.evaluation = Some(Evaluation {
                score: entry.fraction,
                feedback: entry.feedback.clone(),
                awarded_points: award.max(0),
                source: EvaluationSource::Server,
            });
            if let Err(e) = self.store.upsert_answer(row).await {
                tracing::warn!(
                    class_id = %class_id,
                    session_id = %entry.session_id,
                    error = %e,
                    "Failed to persist evaluation"
                );
            }
        }

        if award > 0 {
            match self
                .store
                .increment_score(class_id, &entry.session_id, award)
                .await
            {
                Ok(score) => {
                    tracing::debug!(
                        class_id = %class_id,
                        session_id = %entry.session_id,
                        award = award,
                        score = score,
                        ?mode,
                        "Points awarded"
                    );
                }
                Err(e) => {
                    tracing::warn!(
                        class_id = %class_id,
                        session_id = %entry.session_id,
                        error = %e,
                        "Failed to apply award"
                    );
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PresenceConfig;
    use crate::evaluator::DisabledEvaluator;
    use crate::store::{now_ms, MemoryStore, Participant};
    use serde_json::json;

    #[test]
    fn test_normalize_percent_and_fraction_agree() {
        assert_eq!(normalize_score(80.0), normalize_score(0.8));
        assert_eq!(normalize_score(150.0), 1.0);
        assert_eq!(normalize_score(-0.2), 0.0);
    }

    #[test]
    fn test_award_example_scenario() {
        // "A" answered correctly 5s into a 30s question worth 100 points
        let award = time_decayed_award(100, 1.0, Some(0), 5_000, 30);
        assert_eq!(award, 83);
    }

    #[test]
    fn test_award_monotonically_non_increasing() {
        let mut last = i64::MAX;
        for elapsed_ms in (0..=30_000).step_by(1_000) {
            let award = time_decayed_award(100, 1.0, Some(0), elapsed_ms, 30);
            assert!(award <= last, "award rose at {}ms", elapsed_ms);
            last = award;
        }
        // At or beyond the deadline nothing is left
        assert_eq!(time_decayed_award(100, 1.0, Some(0), 30_000, 30), 0);
        assert_eq!(time_decayed_award(100, 1.0, Some(0), 45_000, 30), 0);
    }

    #[test]
    fn test_award_without_start_assumes_full_time() {
        assert_eq!(time_decayed_award(100, 1.0, None, 999_999, 30), 0);
    }

    #[test]
    fn test_percent_and_fraction_award_identically() {
        let a = time_decayed_award(100, normalize_score(80.0), Some(0), 10_000, 30);
        let b = time_decayed_award(100, normalize_score(0.8), Some(0), 10_000, 30);
        assert_eq!(a, b);
    }

    #[test]
    fn test_redflags_partial_overlap() {
        let expected = json!(["fever", "rash", "fatigue"]);
        assert_eq!(redflags_fraction(&json!(["fever", "rash"]), &expected), 2.0 / 3.0);
        assert_eq!(redflags_fraction(&json!("fever"), &expected), 1.0 / 3.0);
        assert_eq!(redflags_fraction(&json!(["sweats"]), &expected), 0.0);
        assert_eq!(redflags_fraction(&json!(null), &expected), 0.0);
    }

    #[test]
    fn test_answer_key_shapes() {
        assert_eq!(answer_key(&json!("A")), "A");
        assert_eq!(answer_key(&json!(["a", "b"])), r#"["a","b"]"#);
        assert_eq!(answer_key(&json!(3)), "3");
    }

    #[test]
    fn test_mcq_match_is_type_strict() {
        assert_eq!(mcq_fraction(&json!("A"), &json!("A")), 1.0);
        assert_eq!(mcq_fraction(&json!(3), &json!(3)), 1.0);
        // A numeric answer never matches a string key, even with equal digits
        assert_eq!(mcq_fraction(&json!(3), &json!("3")), 0.0);
        assert_eq!(mcq_fraction(&json!("3"), &json!(3)), 0.0);
        assert_eq!(mcq_fraction(&json!("A"), &json!("B")), 0.0);
    }

    fn engine() -> (ScoringEngine, Arc<MemoryStore>, Arc<ConnectionRegistry>) {
        let store = Arc::new(MemoryStore::new());
        let registry = Arc::new(ConnectionRegistry::new());
        let presence = Arc::new(PresenceTracker::new(
            store.clone(),
            registry.clone(),
            PresenceConfig::default(),
        ));
        let engine = ScoringEngine::new(
            store.clone(),
            registry.clone(),
            presence,
            Arc::new(DisabledEvaluator),
        );
        (engine, store, registry)
    }

    async fn seed_answer(store: &MemoryStore, session_id: &str, value: Value, created_at: u64) {
        store
            .upsert_participant(Participant {
                class_id: "C1".to_string(),
                session_id: session_id.to_string(),
                display_name: session_id.to_string(),
                score: 0,
                connected: true,
                last_seen: now_ms(),
            })
            .await
            .unwrap();
        store
            .upsert_answer(crate::store::AnswerRow {
                class_id: "C1".to_string(),
                session_id: session_id.to_string(),
                question_id: "q1".to_string(),
                answer: value,
                created_at,
                evaluation: None,
            })
            .await
            .unwrap();
    }

    fn mcq_active(started_at: u64) -> ActiveQuestion {
        let def: crate::store::QuestionDef = serde_json::from_str(
            r#"{"id": "q1", "title": "Pick", "mode": "mcq", "correctAnswer": "A", "points": 100}"#,
        )
        .unwrap();
        ActiveQuestion::from_def(&def, started_at)
    }

    #[tokio::test]
    async fn test_mcq_reveal_distribution_sums_to_rows() {
        let (engine, store, registry) = engine();
        let started = now_ms();
        seed_answer(&store, "s1", json!("A"), started + 5_000).await;
        seed_answer(&store, "s2", json!("B"), started + 8_000).await;
        seed_answer(&store, "s3", json!("A"), started + 12_000).await;

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let conn_id = registry.register(tx).await;
        registry.subscribe(conn_id, "C1").await;

        let active = mcq_active(started);
        engine
            .reveal_question("C1", "q1", json!("A"), 100, Some(&active))
            .await
            .unwrap();

        let msg = rx.try_recv().unwrap();
        let event: serde_json::Value = serde_json::from_str(msg.to_str().unwrap()).unwrap();
        assert_eq!(event["type"], "question-results");

        let distribution = event["distribution"].as_object().unwrap();
        let sum: u64 = distribution.values().map(|v| v.as_u64().unwrap()).sum();
        assert_eq!(sum, 3);
        assert_eq!(distribution["A"], 2);
        assert_eq!(distribution["B"], 1);

        let correct: Vec<&str> = event["correctSessions"]
            .as_array()
            .unwrap()
            .iter()
            .map(|v| v.as_str().unwrap())
            .collect();
        assert!(correct.contains(&"s1"));
        assert!(!correct.contains(&"s2"));
        // mcq results never include the raw open-answer list
        assert!(event.get("answers").is_none());
    }

    #[tokio::test]
    async fn test_mcq_reveal_awards_decayed_points() {
        let (engine, store, _registry) = engine();
        let started = now_ms();
        seed_answer(&store, "s1", json!("A"), started + 5_000).await;

        let active = mcq_active(started);
        engine
            .reveal_question("C1", "q1", json!("A"), 100, Some(&active))
            .await
            .unwrap();

        let participant = store.get_participant("C1", "s1").await.unwrap().unwrap();
        assert_eq!(participant.score, 83);

        let row = store.get_answer("C1", "s1", "q1").await.unwrap().unwrap();
        let evaluation = row.evaluation.unwrap();
        assert_eq!(evaluation.awarded_points, 83);
        assert_eq!(evaluation.source, EvaluationSource::Server);
    }

    #[tokio::test]
    async fn test_open_reveal_survives_evaluator_outage() {
        let (engine, store, _registry) = engine();
        let started = now_ms();
        seed_answer(&store, "s1", json!("free text"), started + 2_000).await;

        let def: crate::store::QuestionDef = serde_json::from_str(
            r#"{"id": "q1", "title": "Explain", "mode": "open", "points": 50}"#,
        )
        .unwrap();
        let active = ActiveQuestion::from_def(&def, started);

        // DisabledEvaluator fails every call, participant gets zero fallback
        engine
            .reveal_question("C1", "q1", json!(null), 50, Some(&active))
            .await
            .unwrap();

        let participant = store.get_participant("C1", "s1").await.unwrap().unwrap();
        assert_eq!(participant.score, 0);
        let row = store.get_answer("C1", "s1", "q1").await.unwrap().unwrap();
        assert_eq!(row.evaluation.unwrap().feedback, "unavailable");
    }

    #[tokio::test]
    async fn test_open_reveal_skips_already_settled_answers() {
        let (engine, store, _registry) = engine();
        let started = now_ms();
        seed_answer(&store, "s1", json!("already judged"), started + 2_000).await;

        let mut row = store.get_answer("C1", "s1", "q1").await.unwrap().unwrap();
        row.evaluation = Some(Evaluation {
            score: 0.9,
            feedback: "good".to_string(),
            awarded_points: 42,
            source: EvaluationSource::Server,
        });
        store.upsert_answer(row).await.unwrap();
        store.increment_score("C1", "s1", 42).await.unwrap();

        let def: crate::store::QuestionDef = serde_json::from_str(
            r#"{"id": "q1", "title": "Explain", "mode": "open", "points": 50}"#,
        )
        .unwrap();
        let active = ActiveQuestion::from_def(&def, started);
        engine
            .reveal_question("C1", "q1", json!(null), 50, Some(&active))
            .await
            .unwrap();

        // No double award at reveal
        let participant = store.get_participant("C1", "s1").await.unwrap().unwrap();
        assert_eq!(participant.score, 42);
    }
}
