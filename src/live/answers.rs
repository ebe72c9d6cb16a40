use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;

use super::protocol::{ClientEvaluation, ServerEvent};
use super::registry::ConnectionRegistry;
use super::scoring::{answer_key, normalize_score, time_decayed_award};
use crate::error::Result;
use crate::evaluator::Evaluator;
use crate::store::{
    now_ms, ActiveQuestion, AnswerRow, Evaluation, EvaluationMode, EvaluationSource, Participant,
    Store,
};

/// Records one answer per (class, participant, question), keeps the live
/// aggregate tally fresh and evaluates free-text answers on submission.
pub struct AnswerLedger {
    store: Arc<dyn Store>,
    registry: Arc<ConnectionRegistry>,
    evaluator: Arc<dyn Evaluator>,
}

impl AnswerLedger {
    pub fn new(
        store: Arc<dyn Store>,
        registry: Arc<ConnectionRegistry>,
        evaluator: Arc<dyn Evaluator>,
    ) -> Self {
        Self {
            store,
            registry,
            evaluator,
        }
    }

    /// Upserts the answer (last write wins), broadcasts the submission and
    /// the recomputed tally, and for open questions settles the evaluation
    /// immediately. Returns true when every connected participant of the
    /// class now has an answer for the question, so the caller can
    /// auto-trigger the reveal.
    pub async fn submit_answer(
        &self,
        class_id: &str,
        session_id: &str,
        question_id: &str,
        answer: Value,
        client_evaluation: Option<ClientEvaluation>,
        active: Option<&ActiveQuestion>,
    ) -> Result<bool> {
        let created_at = now_ms();
        let row = AnswerRow {
            class_id: class_id.to_string(),
            session_id: session_id.to_string(),
            question_id: question_id.to_string(),
            answer: answer.clone(),
            created_at,
            evaluation: None,
        };
        self.store.upsert_answer(row).await?;

        tracing::info!(
            class_id = %class_id,
            session_id = %session_id,
            question_id = %question_id,
            "Answer recorded"
        );

        self.registry
            .publish(
                &ServerEvent::AnswersUpdated {
                    class_id: class_id.to_string(),
                    session_id: session_id.to_string(),
                    question_id: question_id.to_string(),
                    answer: answer.clone(),
                },
                Some(class_id),
            )
            .await;
        self.broadcast_tally(class_id, question_id).await;

        let is_open = active
            .map(|a| a.id == question_id && a.mode == EvaluationMode::Open)
            .unwrap_or(false);
        if is_open {
            // Safe to unwrap shape: is_open implies active is Some
            if let Some(active) = active {
                self.evaluate_submission(
                    class_id,
                    session_id,
                    question_id,
                    &answer,
                    client_evaluation,
                    active,
                    created_at,
                )
                .await;
            }
        }

        self.all_connected_answered(class_id, question_id).await
    }

    /// Recomputes the per-distinct-value counts over the full answer set.
    /// O(n) per submission, fine at classroom scale.
    async fn broadcast_tally(&self, class_id: &str, question_id: &str) {
        let answers = match self.store.list_answers(class_id, question_id).await {
            Ok(answers) => answers,
            Err(e) => {
                tracing::warn!(
                    class_id = %class_id,
                    question_id = %question_id,
                    error = %e,
                    "Failed to recompute answer tally"
                );
                return;
            }
        };

        let mut counts: HashMap<String, u64> = HashMap::new();
        for answer in &answers {
            *counts.entry(answer_key(&answer.answer)).or_default() += 1;
        }

        self.registry
            .publish(
                &ServerEvent::AnswersCount {
                    class_id: class_id.to_string(),
                    question_id: question_id.to_string(),
                    total: answers.len() as u64,
                    counts,
                },
                Some(class_id),
            )
            .await;
    }

    /// Open-mode settlement at submission time. A client-supplied
    /// evaluation is trusted; otherwise the external judge is called.
    /// Judge failure is a no-op for this step: no award, no crash.
    #[allow(clippy::too_many_arguments)]
    async fn evaluate_submission(
        &self,
        class_id: &str,
        session_id: &str,
        question_id: &str,
        answer: &Value,
        client_evaluation: Option<ClientEvaluation>,
        active: &ActiveQuestion,
        answered_at: u64,
    ) {
        let (score, feedback, source) = match client_evaluation {
            Some(evaluation) => (
                normalize_score(evaluation.score),
                evaluation.feedback,
                EvaluationSource::Client,
            ),
            None => {
                let text = answer
                    .as_str()
                    .map(str::to_string)
                    .unwrap_or_else(|| answer.to_string());
                match self.evaluator.evaluate(active, &text).await {
                    Ok(verdict) => (
                        normalize_score(verdict.score),
                        verdict.feedback,
                        EvaluationSource::Server,
                    ),
                    Err(e) => {
                        tracing::warn!(
                            class_id = %class_id,
                            session_id = %session_id,
                            question_id = %question_id,
                            error = %e,
                            "Evaluator unavailable, answer left unevaluated"
                        );
                        return;
                    }
                }
            }
        };

        let award = time_decayed_award(
            active.points,
            score,
            Some(active.started_at),
            answered_at,
            active.duration_secs,
        );

        if award > 0 {
            if let Err(e) = self.store.increment_score(class_id, session_id, award).await {
                tracing::warn!(
                    class_id = %class_id,
                    session_id = %session_id,
                    error = %e,
                    "Failed to apply submission award"
                );
            }
        }

        let evaluation = Evaluation {
            score,
            feedback,
            awarded_points: award.max(0),
            source,
        };

        match self.store.get_answer(class_id, session_id, question_id).await {
            Ok(Some(mut row)) => {
                row.evaluation = Some(evaluation.clone());
                if let Err(e) = self.store.upsert_answer(row).await {
                    tracing::warn!(
                        class_id = %class_id,
                        session_id = %session_id,
                        error = %e,
                        "Failed to persist evaluation on answer"
                    );
                }
            }
            Ok(None) => {}
            Err(e) => {
                tracing::warn!(
                    class_id = %class_id,
                    session_id = %session_id,
                    error = %e,
                    "Failed to reload answer for evaluation"
                );
            }
        }

        self.registry
            .publish(
                &ServerEvent::AnswerEvaluated {
                    class_id: class_id.to_string(),
                    session_id: session_id.to_string(),
                    question_id: question_id.to_string(),
                    evaluation,
                },
                Some(class_id),
            )
            .await;
    }

    /// Membership check, not a count comparison: rows left behind by
    /// participants who answered and then dropped must not stand in for
    /// still-connected participants who haven't answered.
    async fn all_connected_answered(&self, class_id: &str, question_id: &str) -> Result<bool> {
        let participants = self.store.list_participants(class_id).await?;
        let connected: Vec<&Participant> =
            participants.iter().filter(|p| p.connected).collect();
        if connected.is_empty() {
            return Ok(false);
        }

        // Cheap short-circuit before the per-participant lookups
        let answered = self.store.count_answers(class_id, question_id).await?;
        if answered < connected.len() as u64 {
            return Ok(false);
        }

        for participant in connected {
            if self
                .store
                .get_answer(class_id, &participant.session_id, question_id)
                .await?
                .is_none()
            {
                return Ok(false);
            }
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::evaluator::DisabledEvaluator;
    use crate::store::{MemoryStore, Participant, QuestionDef};
    use serde_json::json;
    use tokio::sync::mpsc;
    use warp::ws::Message;

    fn ledger() -> (AnswerLedger, Arc<MemoryStore>, Arc<ConnectionRegistry>) {
        let store = Arc::new(MemoryStore::new());
        let registry = Arc::new(ConnectionRegistry::new());
        let ledger = AnswerLedger::new(store.clone(), registry.clone(), Arc::new(DisabledEvaluator));
        (ledger, store, registry)
    }

    async fn join(store: &MemoryStore, class_id: &str, session_id: &str, connected: bool) {
        store
            .upsert_participant(Participant {
                class_id: class_id.to_string(),
                session_id: session_id.to_string(),
                display_name: session_id.to_string(),
                score: 0,
                connected,
                last_seen: now_ms(),
            })
            .await
            .unwrap();
    }

    async fn watch(
        registry: &ConnectionRegistry,
        class_id: &str,
    ) -> mpsc::UnboundedReceiver<Message> {
        let (tx, rx) = mpsc::unbounded_channel();
        let conn_id = registry.register(tx).await;
        registry.subscribe(conn_id, class_id).await;
        rx
    }

    fn events(rx: &mut mpsc::UnboundedReceiver<Message>) -> Vec<serde_json::Value> {
        let mut out = Vec::new();
        while let Ok(msg) = rx.try_recv() {
            out.push(serde_json::from_str(msg.to_str().unwrap()).unwrap());
        }
        out
    }

    #[tokio::test]
    async fn test_submit_broadcasts_submission_then_tally() {
        let (ledger, store, registry) = ledger();
        join(&store, "C1", "s1", true).await;
        join(&store, "C1", "s2", true).await;
        let mut rx = watch(&registry, "C1").await;

        let all = ledger
            .submit_answer("C1", "s1", "q1", json!("A"), None, None)
            .await
            .unwrap();
        assert!(!all);

        let events = events(&mut rx);
        assert_eq!(events[0]["type"], "answers-updated");
        assert_eq!(events[0]["answer"], "A");
        assert_eq!(events[1]["type"], "answers-count");
        assert_eq!(events[1]["total"], 1);
        assert_eq!(events[1]["counts"]["A"], 1);
    }

    #[tokio::test]
    async fn test_resubmission_overwrites_and_retallies() {
        let (ledger, store, registry) = ledger();
        join(&store, "C1", "s1", true).await;
        join(&store, "C1", "s2", true).await;
        let mut rx = watch(&registry, "C1").await;

        ledger
            .submit_answer("C1", "s1", "q1", json!("A"), None, None)
            .await
            .unwrap();
        ledger
            .submit_answer("C1", "s1", "q1", json!("B"), None, None)
            .await
            .unwrap();

        assert_eq!(store.count_answers("C1", "q1").await.unwrap(), 1);
        let last_tally = events(&mut rx)
            .into_iter()
            .filter(|e| e["type"] == "answers-count")
            .next_back()
            .unwrap();
        assert_eq!(last_tally["total"], 1);
        assert_eq!(last_tally["counts"]["B"], 1);
        assert!(last_tally["counts"].get("A").is_none());
    }

    #[tokio::test]
    async fn test_all_connected_answered_triggers_flag() {
        let (ledger, store, _registry) = ledger();
        join(&store, "C1", "s1", true).await;
        join(&store, "C1", "s2", true).await;
        join(&store, "C1", "s3", false).await; // disconnected, not expected

        let all = ledger
            .submit_answer("C1", "s1", "q1", json!("A"), None, None)
            .await
            .unwrap();
        assert!(!all);
        let all = ledger
            .submit_answer("C1", "s2", "q1", json!("B"), None, None)
            .await
            .unwrap();
        assert!(all);
    }

    #[tokio::test]
    async fn test_departed_answer_does_not_cover_for_missing_one() {
        let (ledger, store, _registry) = ledger();
        join(&store, "C1", "p1", true).await;
        join(&store, "C1", "p2", true).await;
        join(&store, "C1", "p3", true).await;

        // p1 answers, then drops; p3 answers. Counts now match (2 rows,
        // 2 connected) but connected p2 still has nothing.
        ledger
            .submit_answer("C1", "p1", "q1", json!("A"), None, None)
            .await
            .unwrap();
        join(&store, "C1", "p1", false).await;
        let all = ledger
            .submit_answer("C1", "p3", "q1", json!("B"), None, None)
            .await
            .unwrap();
        assert!(!all);

        let all = ledger
            .submit_answer("C1", "p2", "q1", json!("C"), None, None)
            .await
            .unwrap();
        assert!(all);
    }

    #[tokio::test]
    async fn test_open_submission_trusts_client_evaluation() {
        let (ledger, store, registry) = ledger();
        join(&store, "C1", "s1", true).await;
        join(&store, "C1", "s2", true).await;
        let mut rx = watch(&registry, "C1").await;

        let def: QuestionDef = serde_json::from_str(
            r#"{"id": "q1", "title": "Explain", "mode": "open", "points": 100, "durationSecs": 30}"#,
        )
        .unwrap();
        let active = ActiveQuestion::from_def(&def, now_ms());

        ledger
            .submit_answer(
                "C1",
                "s1",
                "q1",
                json!("my reasoning"),
                Some(ClientEvaluation {
                    score: 80.0, // percent scale, normalized to 0.8
                    feedback: "well argued".to_string(),
                }),
                Some(&active),
            )
            .await
            .unwrap();

        let row = store.get_answer("C1", "s1", "q1").await.unwrap().unwrap();
        let evaluation = row.evaluation.unwrap();
        assert_eq!(evaluation.score, 0.8);
        assert_eq!(evaluation.source, EvaluationSource::Client);
        assert!(evaluation.awarded_points > 0);

        let participant = store.get_participant("C1", "s1").await.unwrap().unwrap();
        assert_eq!(participant.score, evaluation.awarded_points);

        let types: Vec<String> = events(&mut rx)
            .into_iter()
            .map(|e| e["type"].as_str().unwrap().to_string())
            .collect();
        assert!(types.contains(&"answer-evaluated".to_string()));
    }

    #[tokio::test]
    async fn test_open_submission_evaluator_failure_is_noop() {
        let (ledger, store, _registry) = ledger();
        join(&store, "C1", "s1", true).await;
        join(&store, "C1", "s2", true).await;

        let def: QuestionDef = serde_json::from_str(
            r#"{"id": "q1", "title": "Explain", "mode": "open", "points": 100}"#,
        )
        .unwrap();
        let active = ActiveQuestion::from_def(&def, now_ms());

        // DisabledEvaluator fails; the answer stays, unevaluated, no award
        ledger
            .submit_answer("C1", "s1", "q1", json!("text"), None, Some(&active))
            .await
            .unwrap();

        let row = store.get_answer("C1", "s1", "q1").await.unwrap().unwrap();
        assert!(row.evaluation.is_none());
        let participant = store.get_participant("C1", "s1").await.unwrap().unwrap();
        assert_eq!(participant.score, 0);
    }
}
