use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{mpsc, RwLock};
use tokio::time::sleep;
use warp::ws::Message;

use super::answers::AnswerLedger;
use super::lifecycle::ClassLifecycleManager;
use super::presence::{ParticipantUpdate, PresenceTracker, SaveOutcome};
use super::protocol::{ClientMessage, LaunchedQuestion, Role, ServerEvent};
use super::registry::{ConnId, ConnectionRegistry};
use super::scoring::ScoringEngine;
use crate::config::PresenceConfig;
use crate::error::{QuizError, Result};
use crate::evaluator::Evaluator;
use crate::store::{
    now_ms, ActiveQuestion, Challenge, Class, Participant, QuestionBlock, Store,
};

/// Coordinator for the real-time session engine. Owns the connection
/// registry, presence tracker, answer ledger, scoring engine and class
/// lifecycle, and routes every inbound protocol message to them.
pub struct LiveServer {
    store: Arc<dyn Store>,
    registry: Arc<ConnectionRegistry>,
    presence: Arc<PresenceTracker>,
    ledger: AnswerLedger,
    scoring: ScoringEngine,
    lifecycle: ClassLifecycleManager,
    conn_roles: RwLock<HashMap<ConnId, Role>>,
    /// (connection, class) -> session id, for disconnect notification
    conn_sessions: RwLock<HashMap<(ConnId, String), String>>,
}

impl LiveServer {
    pub fn new(
        store: Arc<dyn Store>,
        evaluator: Arc<dyn Evaluator>,
        presence_config: PresenceConfig,
    ) -> Self {
        let registry = Arc::new(ConnectionRegistry::new());
        let presence = Arc::new(PresenceTracker::new(
            store.clone(),
            registry.clone(),
            presence_config,
        ));
        let ledger = AnswerLedger::new(store.clone(), registry.clone(), evaluator.clone());
        let scoring = ScoringEngine::new(
            store.clone(),
            registry.clone(),
            presence.clone(),
            evaluator,
        );
        let lifecycle =
            ClassLifecycleManager::new(store.clone(), registry.clone(), presence.clone());

        Self {
            store,
            registry,
            presence,
            ledger,
            scoring,
            lifecycle,
            conn_roles: RwLock::new(HashMap::new()),
            conn_sessions: RwLock::new(HashMap::new()),
        }
    }

    pub async fn register_connection(&self, sender: mpsc::UnboundedSender<Message>) -> ConnId {
        self.registry.register(sender).await
    }

    /// Routes one inbound protocol message. Malformed JSON and messages
    /// missing required fields are dropped; only an unauthorized reveal
    /// gets an explicit reply.
    pub async fn handle_message(self: &Arc<Self>, conn_id: ConnId, text: &str) {
        let message = match serde_json::from_str::<ClientMessage>(text) {
            Ok(message) => message,
            Err(e) => {
                tracing::debug!(
                    conn_id = conn_id,
                    error = %e,
                    raw_message = %text,
                    "Dropping malformed message"
                );
                return;
            }
        };

        match message {
            ClientMessage::Subscribe {
                class_id,
                session_id,
                role,
                display_name,
            } => {
                self.handle_subscribe(conn_id, &class_id, session_id, role, display_name)
                    .await;
            }
            ClientMessage::Unsubscribe {
                class_id,
                session_id,
            } => {
                self.handle_unsubscribe(conn_id, &class_id, session_id).await;
            }
            ClientMessage::Ping {
                class_id,
                session_id,
            } => {
                if let Err(e) = self.presence.handle_ping(&class_id, &session_id).await {
                    tracing::warn!(class_id = %class_id, error = %e, "Heartbeat handling failed");
                }
            }
            ClientMessage::Answer {
                class_id,
                session_id,
                question_id,
                answer,
                evaluation,
            } => {
                if let Err(e) = self
                    .submit_answer(&class_id, &session_id, &question_id, answer, evaluation)
                    .await
                {
                    tracing::warn!(
                        class_id = %class_id,
                        session_id = %session_id,
                        error = %e,
                        "Answer submission failed"
                    );
                }
            }
            ClientMessage::Reveal {
                class_id,
                question_id,
                correct_answer,
                points,
            } => {
                if let Err(e) = self.require_teacher(conn_id).await {
                    tracing::warn!(
                        conn_id = conn_id,
                        class_id = %class_id,
                        error = %e,
                        "Reveal attempted by non-teacher connection"
                    );
                    let _ = self
                        .registry
                        .send_to(
                            conn_id,
                            &ServerEvent::Error {
                                error: "forbidden".to_string(),
                            },
                        )
                        .await;
                    return;
                }

                if let Err(e) = self
                    .reveal_question(&class_id, &question_id, correct_answer, points)
                    .await
                {
                    tracing::error!(
                        class_id = %class_id,
                        question_id = %question_id,
                        error = %e,
                        "Reveal failed"
                    );
                }
            }
        }
    }

    async fn require_teacher(&self, conn_id: ConnId) -> Result<()> {
        let roles = self.conn_roles.read().await;
        match roles.get(&conn_id) {
            Some(Role::Teacher) => Ok(()),
            Some(Role::Student) => Err(QuizError::Forbidden("student".to_string())),
            None => Err(QuizError::Forbidden("unsubscribed".to_string())),
        }
    }

    async fn handle_subscribe(
        &self,
        conn_id: ConnId,
        class_id: &str,
        session_id: Option<String>,
        role: Role,
        display_name: Option<String>,
    ) {
        self.registry.subscribe(conn_id, class_id).await;
        {
            let mut roles = self.conn_roles.write().await;
            roles.insert(conn_id, role);
        }

        if role == Role::Student {
            if let Some(session_id) = &session_id {
                {
                    let mut sessions = self.conn_sessions.write().await;
                    sessions.insert((conn_id, class_id.to_string()), session_id.clone());
                }
                if let Err(e) = self
                    .presence
                    .handle_subscribe(class_id, session_id, display_name.as_deref())
                    .await
                {
                    tracing::warn!(
                        class_id = %class_id,
                        session_id = %session_id,
                        error = %e,
                        "Presence subscribe failed"
                    );
                }
            }
        }

        let _ = self
            .registry
            .send_to(
                conn_id,
                &ServerEvent::Subscribed {
                    class_id: class_id.to_string(),
                },
            )
            .await;

        // Late-join catch-up: a student arriving mid-question gets the
        // launch event with only the remaining time. Teachers never do.
        if role == Role::Student {
            if let Some(active) = self.lifecycle.active_question(class_id).await {
                let remaining = active.remaining_secs(now_ms());
                let _ = self
                    .registry
                    .send_to(
                        conn_id,
                        &ServerEvent::QuestionLaunched {
                            class_id: class_id.to_string(),
                            question: LaunchedQuestion::from_active(&active, remaining),
                        },
                    )
                    .await;
            }
        }
    }

    async fn handle_unsubscribe(
        &self,
        conn_id: ConnId,
        class_id: &str,
        session_id: Option<String>,
    ) {
        self.registry.unsubscribe(conn_id, class_id).await;

        let session_id = match session_id {
            Some(session_id) => Some(session_id),
            None => {
                let sessions = self.conn_sessions.read().await;
                sessions.get(&(conn_id, class_id.to_string())).cloned()
            }
        };
        {
            let mut sessions = self.conn_sessions.write().await;
            sessions.remove(&(conn_id, class_id.to_string()));
        }

        if let Some(session_id) = session_id {
            if let Err(e) = self.presence.handle_disconnect(class_id, &session_id).await {
                tracing::warn!(
                    class_id = %class_id,
                    session_id = %session_id,
                    error = %e,
                    "Disconnect handling failed"
                );
            }
        }
    }

    /// Socket close: remove the connection from every class it was
    /// subscribed to and, where a session id is known, best-effort notify
    /// the presence tracker.
    pub async fn handle_connection_closed(&self, conn_id: ConnId) {
        let classes = self.registry.unregister(conn_id).await;
        {
            let mut roles = self.conn_roles.write().await;
            roles.remove(&conn_id);
        }

        for class_id in classes {
            let session_id = {
                let mut sessions = self.conn_sessions.write().await;
                sessions.remove(&(conn_id, class_id.clone()))
            };
            if let Some(session_id) = session_id {
                if let Err(e) = self.presence.handle_disconnect(&class_id, &session_id).await {
                    tracing::warn!(
                        class_id = %class_id,
                        session_id = %session_id,
                        error = %e,
                        "Disconnect handling failed on close"
                    );
                }
            }
        }
        tracing::debug!(conn_id = conn_id, "Connection closed");
    }

    /// Shared by the WebSocket and request/response paths. When the
    /// submission completes the class (every connected participant has
    /// answered) the reveal is triggered automatically.
    pub async fn submit_answer(
        self: &Arc<Self>,
        class_id: &str,
        session_id: &str,
        question_id: &str,
        answer: Value,
        evaluation: Option<super::protocol::ClientEvaluation>,
    ) -> Result<()> {
        let active = self.lifecycle.active_question(class_id).await;
        let all_answered = self
            .ledger
            .submit_answer(
                class_id,
                session_id,
                question_id,
                answer,
                evaluation,
                active.as_ref(),
            )
            .await?;

        if all_answered {
            if let Some(active) = active.filter(|a| a.id == question_id) {
                tracing::info!(
                    class_id = %class_id,
                    question_id = %question_id,
                    "All connected participants answered, revealing"
                );
                self.reveal_question(
                    class_id,
                    question_id,
                    active.correct_answer.clone(),
                    active.points,
                )
                .await?;
            }
        }
        Ok(())
    }

    /// Settlement entry point, idempotent per question: the first of the
    /// teacher command, the all-answered trigger and the expiry timer wins.
    /// The reveal claim is rolled back if scoring fails, so a retry can
    /// still settle the question instead of hitting the revealed guard.
    pub async fn reveal_question(
        &self,
        class_id: &str,
        question_id: &str,
        correct_answer: Value,
        points: i64,
    ) -> Result<()> {
        let active = self
            .lifecycle
            .active_question(class_id)
            .await
            .filter(|a| a.id == question_id);

        if !self.lifecycle.mark_revealed(class_id, question_id).await? {
            tracing::debug!(
                class_id = %class_id,
                question_id = %question_id,
                "Question already revealed, skipping"
            );
            return Ok(());
        }

        if let Err(e) = self
            .scoring
            .reveal_question(class_id, question_id, correct_answer, points, active.as_ref())
            .await
        {
            self.lifecycle
                .unmark_revealed(class_id, question_id, active)
                .await;
            return Err(e);
        }
        Ok(())
    }

    /// Launches the question at the pointer and schedules the expiry
    /// fallback reveal.
    pub async fn launch_next(self: &Arc<Self>, class_id: &str) -> Result<ActiveQuestion> {
        let active = self.lifecycle.launch_next(class_id).await?;
        self.schedule_expiry_reveal(class_id, &active);
        Ok(active)
    }

    pub async fn jump_to(
        self: &Arc<Self>,
        class_id: &str,
        block_index: usize,
        question_index: usize,
    ) -> Result<ActiveQuestion> {
        let active = self.lifecycle.jump_to(class_id, block_index, question_index).await?;
        self.schedule_expiry_reveal(class_id, &active);
        Ok(active)
    }

    fn schedule_expiry_reveal(self: &Arc<Self>, class_id: &str, active: &ActiveQuestion) {
        let server = self.clone();
        let class_id = class_id.to_string();
        let question_id = active.id.clone();
        let correct_answer = active.correct_answer.clone();
        let points = active.points;
        let duration = Duration::from_secs(active.duration_secs);

        tokio::spawn(async move {
            sleep(duration).await;
            // A reveal or reset in the meantime already cleared the question
            let still_active = server
                .lifecycle
                .active_question(&class_id)
                .await
                .map(|a| a.id == question_id)
                .unwrap_or(false);
            if !still_active {
                return;
            }
            tracing::info!(
                class_id = %class_id,
                question_id = %question_id,
                "Question timer expired, revealing"
            );
            if let Err(e) = server
                .reveal_question(&class_id, &question_id, correct_answer, points)
                .await
            {
                tracing::warn!(
                    class_id = %class_id,
                    question_id = %question_id,
                    error = %e,
                    "Expiry reveal failed"
                );
            }
        });
    }

    pub async fn create_class(
        &self,
        name: String,
        teacher_name: String,
        blocks: Vec<QuestionBlock>,
    ) -> Result<Class> {
        self.lifecycle.create_class(name, teacher_name, blocks).await
    }

    pub async fn get_class(&self, class_id: &str) -> Result<Option<Class>> {
        self.store.get_class(class_id).await
    }

    pub async fn next_block(&self, class_id: &str) -> Result<()> {
        self.lifecycle.next_block(class_id).await
    }

    pub async fn finish_class(&self, class_id: &str) -> Result<()> {
        self.lifecycle.finish(class_id).await
    }

    pub async fn reset_class(&self, class_id: &str) -> Result<()> {
        self.lifecycle.reset_class(class_id).await
    }

    pub async fn save_participant(
        &self,
        class_id: &str,
        session_id: &str,
        update: ParticipantUpdate,
    ) -> Result<SaveOutcome> {
        self.presence.save_participant(class_id, session_id, update).await
    }

    pub async fn reset_scores(&self, class_id: &str) -> Result<u64> {
        self.presence.reset_scores(class_id).await
    }

    pub async fn list_participants(&self, class_id: &str) -> Result<Vec<Participant>> {
        self.store.list_participants(class_id).await
    }

    pub async fn list_challenges(&self, class_id: &str) -> Result<Vec<Challenge>> {
        self.store.list_challenges(class_id).await
    }
}
