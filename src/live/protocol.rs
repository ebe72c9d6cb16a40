use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::store::{ActiveQuestion, Evaluation, EvaluationMode, Participant};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Teacher,
    Student,
}

/// Evaluation supplied by the client alongside an open-mode answer.
/// Trusted over a server-side evaluator call when present.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientEvaluation {
    pub score: f64,
    #[serde(default)]
    pub feedback: String,
}

/// Inbound protocol messages, one JSON text frame each
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ClientMessage {
    #[serde(rename_all = "camelCase")]
    Subscribe {
        class_id: String,
        #[serde(default)]
        session_id: Option<String>,
        role: Role,
        #[serde(default)]
        display_name: Option<String>,
    },

    #[serde(rename_all = "camelCase")]
    Unsubscribe {
        class_id: String,
        #[serde(default)]
        session_id: Option<String>,
    },

    #[serde(rename_all = "camelCase")]
    Ping {
        class_id: String,
        session_id: String,
    },

    #[serde(rename_all = "camelCase")]
    Answer {
        class_id: String,
        session_id: String,
        question_id: String,
        answer: Value,
        #[serde(default)]
        evaluation: Option<ClientEvaluation>,
    },

    /// Teacher-only settlement command
    #[serde(rename_all = "camelCase")]
    Reveal {
        class_id: String,
        question_id: String,
        correct_answer: Value,
        points: i64,
    },
}

/// Student-facing view of a launched question. Carries the *remaining*
/// duration for late joiners and never includes the correct answer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LaunchedQuestion {
    pub id: String,
    pub title: String,
    pub options: Vec<String>,
    pub duration: u64,
    pub mode: EvaluationMode,
    pub points: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
}

impl LaunchedQuestion {
    pub fn from_active(active: &ActiveQuestion, remaining_secs: u64) -> Self {
        Self {
            id: active.id.clone(),
            title: active.title.clone(),
            options: active.options.clone(),
            duration: remaining_secs,
            mode: active.mode,
            points: active.points,
            prompt: active.prompt.clone(),
        }
    }
}

/// Raw per-participant answer included in open-mode results for teacher review
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpenAnswer {
    pub session_id: String,
    pub answer: Value,
    pub score: f64,
    pub feedback: String,
}

/// Outbound broadcast events
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ServerEvent {
    #[serde(rename_all = "camelCase")]
    Subscribed { class_id: String },

    #[serde(rename_all = "camelCase")]
    QuestionLaunched {
        class_id: String,
        question: LaunchedQuestion,
    },

    #[serde(rename_all = "camelCase")]
    AnswersUpdated {
        class_id: String,
        session_id: String,
        question_id: String,
        answer: Value,
    },

    #[serde(rename_all = "camelCase")]
    AnswersCount {
        class_id: String,
        question_id: String,
        total: u64,
        counts: HashMap<String, u64>,
    },

    #[serde(rename_all = "camelCase")]
    QuestionResults {
        class_id: String,
        question_id: String,
        distribution: HashMap<String, u64>,
        correct_sessions: Vec<String>,
        correct_answer: Value,
        #[serde(skip_serializing_if = "Option::is_none")]
        answers: Option<Vec<OpenAnswer>>,
    },

    #[serde(rename_all = "camelCase")]
    ParticipantsUpdated {
        class_id: String,
        participants: Vec<Participant>,
    },

    #[serde(rename_all = "camelCase")]
    ParticipantHeartbeat {
        class_id: String,
        session_id: String,
        last_seen: u64,
    },

    #[serde(rename_all = "camelCase")]
    ParticipantDisconnected {
        class_id: String,
        session_id: String,
    },

    #[serde(rename_all = "camelCase")]
    AnswerEvaluated {
        class_id: String,
        session_id: String,
        question_id: String,
        evaluation: Evaluation,
    },

    #[serde(rename_all = "camelCase")]
    ClassReset { class_id: String },

    Error { error: String },
}
