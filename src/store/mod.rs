use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Result;

mod memory;
pub use memory::MemoryStore;

/// Current wall-clock time in epoch milliseconds
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// How an answer is scored, resolved once at authoring time
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EvaluationMode {
    /// Fixed-choice match against a single correct answer
    Mcq,
    /// Set overlap against a list of expected tokens
    RedFlags,
    /// Free text judged by the external evaluator
    Open,
}

fn default_duration() -> u64 {
    30
}

/// One authored question inside a block
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuestionDef {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub options: Vec<String>,
    #[serde(default = "default_duration")]
    pub duration_secs: u64,
    pub mode: EvaluationMode,
    #[serde(default)]
    pub correct_answer: Value,
    #[serde(default)]
    pub points: i64,
    #[serde(default)]
    pub prompt: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuestionBlock {
    #[serde(default)]
    pub title: Option<String>,
    pub questions: Vec<QuestionDef>,
}

/// Session-level bookkeeping owned by the lifecycle manager
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClassMeta {
    pub current_block_index: usize,
    pub current_question_index: usize,
    pub finished: bool,
    #[serde(default)]
    pub asked_questions: HashMap<String, bool>,
    #[serde(default)]
    pub revealed_questions: HashMap<String, bool>,
    #[serde(default)]
    pub blocks: Vec<QuestionBlock>,
}

impl ClassMeta {
    /// Fresh meta keeping the authored blocks but clearing all progress
    pub fn reset(&self) -> Self {
        Self {
            blocks: self.blocks.clone(),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Class {
    pub id: String,
    pub name: String,
    pub teacher_name: String,
    pub active: bool,
    pub meta: ClassMeta,
}

/// A student's presence/score record within a class
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Participant {
    pub class_id: String,
    pub session_id: String,
    pub display_name: String,
    pub score: i64,
    pub connected: bool,
    pub last_seen: u64,
}

/// Field-masked participant update: only the fields present are written,
/// in one store-level operation. Presence bookkeeping goes through this so
/// it can never overwrite a concurrently awarded score; awards themselves
/// use `increment_score`.
#[derive(Debug, Clone, Default)]
pub struct ParticipantPatch {
    pub display_name: Option<String>,
    pub score: Option<i64>,
    pub connected: Option<bool>,
    pub last_seen: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EvaluationSource {
    Client,
    Server,
}

/// Evaluation attached to an answer, score normalized to [0, 1]
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Evaluation {
    pub score: f64,
    pub feedback: String,
    pub awarded_points: i64,
    pub source: EvaluationSource,
}

/// One stored answer, keyed by (class, session, question). Upsert-only.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnswerRow {
    pub class_id: String,
    pub session_id: String,
    pub question_id: String,
    pub answer: Value,
    pub created_at: u64,
    #[serde(default)]
    pub evaluation: Option<Evaluation>,
}

/// Immutable audit record written when a question is launched
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Challenge {
    pub class_id: String,
    pub question_id: String,
    pub title: String,
    pub mode: EvaluationMode,
    pub points: i64,
    pub duration_secs: u64,
    pub started_at: u64,
}

/// The currently launched question, held only in memory per class
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActiveQuestion {
    pub id: String,
    pub title: String,
    pub options: Vec<String>,
    pub duration_secs: u64,
    pub mode: EvaluationMode,
    pub correct_answer: Value,
    pub points: i64,
    pub prompt: Option<String>,
    pub started_at: u64,
}

impl ActiveQuestion {
    pub fn from_def(def: &QuestionDef, started_at: u64) -> Self {
        Self {
            id: def.id.clone(),
            title: def.title.clone(),
            options: def.options.clone(),
            duration_secs: def.duration_secs,
            mode: def.mode,
            correct_answer: def.correct_answer.clone(),
            points: def.points,
            prompt: def.prompt.clone(),
            started_at,
        }
    }

    /// Seconds left at `now`, for late-join catch-up
    pub fn remaining_secs(&self, now: u64) -> u64 {
        let elapsed_secs = now.saturating_sub(self.started_at) / 1000;
        self.duration_secs.saturating_sub(elapsed_secs)
    }
}

/// Persistence seam: per-collection upsert-by-key, lookups, bulk deletes,
/// counts and an atomic score increment so concurrent awards never race.
#[async_trait]
pub trait Store: Send + Sync {
    async fn upsert_class(&self, class: Class) -> Result<()>;
    async fn get_class(&self, class_id: &str) -> Result<Option<Class>>;
    async fn update_class_meta(&self, class_id: &str, meta: ClassMeta) -> Result<()>;

    async fn upsert_participant(&self, participant: Participant) -> Result<()>;
    async fn get_participant(
        &self,
        class_id: &str,
        session_id: &str,
    ) -> Result<Option<Participant>>;
    async fn list_participants(&self, class_id: &str) -> Result<Vec<Participant>>;
    /// Applies only the fields present in the patch, atomically at the
    /// store. Returns false when the participant does not exist.
    async fn update_participant(
        &self,
        class_id: &str,
        session_id: &str,
        patch: ParticipantPatch,
    ) -> Result<bool>;
    /// Atomic increment; the stored score never drops below zero
    async fn increment_score(&self, class_id: &str, session_id: &str, delta: i64) -> Result<i64>;
    /// Bulk-zero every participant score in the class, returns rows touched
    async fn reset_scores(&self, class_id: &str) -> Result<u64>;

    async fn upsert_answer(&self, answer: AnswerRow) -> Result<()>;
    async fn get_answer(
        &self,
        class_id: &str,
        session_id: &str,
        question_id: &str,
    ) -> Result<Option<AnswerRow>>;
    async fn list_answers(&self, class_id: &str, question_id: &str) -> Result<Vec<AnswerRow>>;
    async fn count_answers(&self, class_id: &str, question_id: &str) -> Result<u64>;
    /// Purge every answer row of the class, returns rows removed
    async fn delete_answers(&self, class_id: &str) -> Result<u64>;

    async fn insert_challenge(&self, challenge: Challenge) -> Result<()>;
    async fn list_challenges(&self, class_id: &str) -> Result<Vec<Challenge>>;
}
