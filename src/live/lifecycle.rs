use std::collections::HashMap;
use std::sync::Arc;

use rand::Rng;
use tokio::sync::RwLock;

use super::presence::PresenceTracker;
use super::protocol::{LaunchedQuestion, ServerEvent};
use super::registry::ConnectionRegistry;
use crate::error::{QuizError, Result};
use crate::store::{
    now_ms, ActiveQuestion, Challenge, Class, ClassMeta, QuestionBlock, QuestionDef, Store,
};

/// Orchestrates session-level state: the question pointer, asked/revealed
/// bookkeeping and the atomic reset sequence. The active-question cache is
/// explicit state owned here and injected at construction, so tests supply
/// fresh instances per case.
pub struct ClassLifecycleManager {
    store: Arc<dyn Store>,
    registry: Arc<ConnectionRegistry>,
    presence: Arc<PresenceTracker>,
    active_questions: RwLock<HashMap<String, ActiveQuestion>>,
}

impl ClassLifecycleManager {
    pub fn new(
        store: Arc<dyn Store>,
        registry: Arc<ConnectionRegistry>,
        presence: Arc<PresenceTracker>,
    ) -> Self {
        Self {
            store,
            registry,
            presence,
            active_questions: RwLock::new(HashMap::new()),
        }
    }

    /// Generate a short numeric class code
    fn generate_class_code() -> String {
        let mut rng = rand::thread_rng();
        format!("{:06}", rng.gen_range(100000..999999))
    }

    pub async fn create_class(
        &self,
        name: String,
        teacher_name: String,
        blocks: Vec<QuestionBlock>,
    ) -> Result<Class> {
        if name.trim().is_empty() {
            return Err(QuizError::validation("name"));
        }

        let mut class_id = Self::generate_class_code();
        // Regenerate on the unlikely code collision
        while self.store.get_class(&class_id).await?.is_some() {
            class_id = Self::generate_class_code();
        }

        let class = Class {
            id: class_id.clone(),
            name,
            teacher_name,
            active: true,
            meta: ClassMeta {
                blocks,
                ..Default::default()
            },
        };
        self.store.upsert_class(class.clone()).await?;

        tracing::info!(class_id = %class_id, "Class created");
        Ok(class)
    }

    pub async fn active_question(&self, class_id: &str) -> Option<ActiveQuestion> {
        let active = self.active_questions.read().await;
        active.get(class_id).cloned()
    }

    async fn clear_active(&self, class_id: &str, question_id: &str) {
        let mut active = self.active_questions.write().await;
        if active.get(class_id).map(|a| a.id == question_id).unwrap_or(false) {
            active.remove(class_id);
        }
    }

    /// Launches the question at the current pointer and advances past it.
    /// Ready/Revealed -> QuestionActive.
    pub async fn launch_next(&self, class_id: &str) -> Result<ActiveQuestion> {
        let class = self
            .store
            .get_class(class_id)
            .await?
            .ok_or_else(|| QuizError::ClassNotFound(class_id.to_string()))?;
        let mut meta = class.meta;

        if meta.finished {
            return Err(QuizError::ClassFinished(class_id.to_string()));
        }
        if meta.blocks.is_empty() {
            return Err(QuizError::NoBlocks(class_id.to_string()));
        }

        let block = meta
            .blocks
            .get(meta.current_block_index)
            .ok_or(QuizError::InvalidPointer(meta.current_block_index, 0))?;
        let def = block
            .questions
            .get(meta.current_question_index)
            .ok_or_else(|| QuizError::BlockExhausted(class_id.to_string()))?
            .clone();

        meta.current_question_index += 1;
        meta.asked_questions.insert(def.id.clone(), true);

        self.commit_launch(class_id, meta, &def).await
    }

    /// Jump-to-question: any state -> QuestionActive at an explicit pointer,
    /// clearing the finished flag.
    pub async fn jump_to(
        &self,
        class_id: &str,
        block_index: usize,
        question_index: usize,
    ) -> Result<ActiveQuestion> {
        let class = self
            .store
            .get_class(class_id)
            .await?
            .ok_or_else(|| QuizError::ClassNotFound(class_id.to_string()))?;
        let mut meta = class.meta;

        let def = meta
            .blocks
            .get(block_index)
            .and_then(|b| b.questions.get(question_index))
            .ok_or(QuizError::InvalidPointer(block_index, question_index))?
            .clone();

        meta.finished = false;
        meta.current_block_index = block_index;
        meta.current_question_index = question_index + 1;
        meta.asked_questions.insert(def.id.clone(), true);

        self.commit_launch(class_id, meta, &def).await
    }

    /// The authoritative meta write, the audit record and the broadcast.
    /// Only the meta write propagates failure.
    async fn commit_launch(
        &self,
        class_id: &str,
        meta: ClassMeta,
        def: &QuestionDef,
    ) -> Result<ActiveQuestion> {
        self.store.update_class_meta(class_id, meta).await?;

        let started_at = now_ms();
        let active = ActiveQuestion::from_def(def, started_at);

        if let Err(e) = self
            .store
            .insert_challenge(Challenge {
                class_id: class_id.to_string(),
                question_id: active.id.clone(),
                title: active.title.clone(),
                mode: active.mode,
                points: active.points,
                duration_secs: active.duration_secs,
                started_at,
            })
            .await
        {
            tracing::warn!(
                class_id = %class_id,
                question_id = %active.id,
                error = %e,
                "Failed to persist challenge record"
            );
        }

        {
            let mut cache = self.active_questions.write().await;
            cache.insert(class_id.to_string(), active.clone());
        }

        self.registry
            .publish(
                &ServerEvent::QuestionLaunched {
                    class_id: class_id.to_string(),
                    question: LaunchedQuestion::from_active(&active, active.duration_secs),
                },
                Some(class_id),
            )
            .await;

        tracing::info!(
            class_id = %class_id,
            question_id = %active.id,
            ?active.mode,
            "Question launched"
        );
        Ok(active)
    }

    /// Marks the question revealed. Returns false when it was already
    /// settled, so reveal runs at most once regardless of which trigger
    /// fires first (teacher, all-answered, timer expiry).
    pub async fn mark_revealed(&self, class_id: &str, question_id: &str) -> Result<bool> {
        let class = self
            .store
            .get_class(class_id)
            .await?
            .ok_or_else(|| QuizError::ClassNotFound(class_id.to_string()))?;
        let mut meta = class.meta;

        if meta.revealed_questions.get(question_id).copied().unwrap_or(false) {
            return Ok(false);
        }
        meta.revealed_questions.insert(question_id.to_string(), true);
        self.store.update_class_meta(class_id, meta).await?;

        self.clear_active(class_id, question_id).await;
        Ok(true)
    }

    /// Rolls a reveal claim back when settlement fails, restoring the
    /// active-question cache so a retry (including the request/response
    /// fallback) can still settle the question.
    pub async fn unmark_revealed(
        &self,
        class_id: &str,
        question_id: &str,
        active: Option<ActiveQuestion>,
    ) {
        match self.store.get_class(class_id).await {
            Ok(Some(class)) => {
                let mut meta = class.meta;
                if meta.revealed_questions.remove(question_id).is_some() {
                    if let Err(e) = self.store.update_class_meta(class_id, meta).await {
                        tracing::error!(
                            class_id = %class_id,
                            question_id = %question_id,
                            error = %e,
                            "Failed to roll back reveal flag"
                        );
                    }
                }
            }
            Ok(None) => {}
            Err(e) => {
                tracing::error!(
                    class_id = %class_id,
                    question_id = %question_id,
                    error = %e,
                    "Failed to load class for reveal rollback"
                );
            }
        }

        if let Some(active) = active {
            let mut cache = self.active_questions.write().await;
            // Don't displace a question launched in the meantime
            cache.entry(class_id.to_string()).or_insert(active);
        }
    }

    /// BlockExhausted -> Ready for the next block
    pub async fn next_block(&self, class_id: &str) -> Result<()> {
        let class = self
            .store
            .get_class(class_id)
            .await?
            .ok_or_else(|| QuizError::ClassNotFound(class_id.to_string()))?;
        let mut meta = class.meta;

        if meta.current_block_index + 1 >= meta.blocks.len() {
            return Err(QuizError::BlockExhausted(class_id.to_string()));
        }
        meta.current_block_index += 1;
        meta.current_question_index = 0;
        self.store.update_class_meta(class_id, meta).await?;

        tracing::info!(class_id = %class_id, "Advanced to next block");
        Ok(())
    }

    /// Last BlockExhausted -> Finished (terminal until jump or reset)
    pub async fn finish(&self, class_id: &str) -> Result<()> {
        let class = self
            .store
            .get_class(class_id)
            .await?
            .ok_or_else(|| QuizError::ClassNotFound(class_id.to_string()))?;
        let mut meta = class.meta;
        meta.finished = true;
        self.store.update_class_meta(class_id, meta).await?;

        let mut cache = self.active_questions.write().await;
        cache.remove(class_id);

        tracing::info!(class_id = %class_id, "Class finished");
        Ok(())
    }

    /// Atomic reset sequence. Step (a), the meta overwrite, is the only one
    /// whose failure reaches the caller; the purge, score reset and
    /// broadcasts are independently fault-isolated.
    pub async fn reset_class(&self, class_id: &str) -> Result<()> {
        let class = self
            .store
            .get_class(class_id)
            .await?
            .ok_or_else(|| QuizError::ClassNotFound(class_id.to_string()))?;

        // (a) authoritative: overwrite meta with a fresh default structure
        self.store
            .update_class_meta(class_id, class.meta.reset())
            .await?;
        {
            let mut cache = self.active_questions.write().await;
            cache.remove(class_id);
        }

        // (b) best-effort: purge the class's answer rows
        if let Err(e) = self.store.delete_answers(class_id).await {
            tracing::warn!(class_id = %class_id, error = %e, "Answer purge failed during reset");
        }

        // (c) best-effort: zero every participant score
        if let Err(e) = self.store.reset_scores(class_id).await {
            tracing::warn!(class_id = %class_id, error = %e, "Score reset failed during reset");
        }

        // (d) best-effort: notify the class
        self.registry
            .publish(
                &ServerEvent::ClassReset {
                    class_id: class_id.to_string(),
                },
                Some(class_id),
            )
            .await;
        self.presence.broadcast_participants(class_id).await;

        tracing::info!(class_id = %class_id, "Class reset");
        Ok(())
    }
}
