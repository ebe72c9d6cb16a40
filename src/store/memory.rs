use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{AnswerRow, Challenge, Class, ClassMeta, Participant, ParticipantPatch, Store};
use crate::error::{QuizError, Result};

/// In-memory store backed by RwLock'd maps. Keys mirror the storage keys
/// of the persistent collections so concurrent upserts for different
/// participants stay independent.
#[derive(Default)]
pub struct MemoryStore {
    classes: RwLock<HashMap<String, Class>>,
    participants: RwLock<HashMap<(String, String), Participant>>,
    answers: RwLock<HashMap<(String, String, String), AnswerRow>>,
    challenges: RwLock<Vec<Challenge>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn upsert_class(&self, class: Class) -> Result<()> {
        let mut classes = self.classes.write().await;
        classes.insert(class.id.clone(), class);
        Ok(())
    }

    async fn get_class(&self, class_id: &str) -> Result<Option<Class>> {
        let classes = self.classes.read().await;
        Ok(classes.get(class_id).cloned())
    }

    async fn update_class_meta(&self, class_id: &str, meta: ClassMeta) -> Result<()> {
        let mut classes = self.classes.write().await;
        let class = classes
            .get_mut(class_id)
            .ok_or_else(|| QuizError::ClassNotFound(class_id.to_string()))?;
        class.meta = meta;
        Ok(())
    }

    async fn upsert_participant(&self, participant: Participant) -> Result<()> {
        let mut participants = self.participants.write().await;
        let key = (
            participant.class_id.clone(),
            participant.session_id.clone(),
        );
        participants.insert(key, participant);
        Ok(())
    }

    async fn get_participant(
        &self,
        class_id: &str,
        session_id: &str,
    ) -> Result<Option<Participant>> {
        let participants = self.participants.read().await;
        Ok(participants
            .get(&(class_id.to_string(), session_id.to_string()))
            .cloned())
    }

    async fn list_participants(&self, class_id: &str) -> Result<Vec<Participant>> {
        let participants = self.participants.read().await;
        let mut list: Vec<Participant> = participants
            .values()
            .filter(|p| p.class_id == class_id)
            .cloned()
            .collect();
        list.sort_by(|a, b| a.session_id.cmp(&b.session_id));
        Ok(list)
    }

    async fn update_participant(
        &self,
        class_id: &str,
        session_id: &str,
        patch: ParticipantPatch,
    ) -> Result<bool> {
        let mut participants = self.participants.write().await;
        let participant = match participants
            .get_mut(&(class_id.to_string(), session_id.to_string()))
        {
            Some(p) => p,
            None => return Ok(false),
        };

        if let Some(display_name) = patch.display_name {
            participant.display_name = display_name;
        }
        if let Some(score) = patch.score {
            participant.score = score.max(0);
        }
        if let Some(connected) = patch.connected {
            participant.connected = connected;
        }
        if let Some(last_seen) = patch.last_seen {
            participant.last_seen = last_seen;
        }
        Ok(true)
    }

    async fn increment_score(&self, class_id: &str, session_id: &str, delta: i64) -> Result<i64> {
        let mut participants = self.participants.write().await;
        let participant = participants
            .get_mut(&(class_id.to_string(), session_id.to_string()))
            .ok_or_else(|| {
                QuizError::persistence(format!(
                    "participant {}:{} not found for score increment",
                    class_id, session_id
                ))
            })?;
        participant.score = (participant.score + delta).max(0);
        Ok(participant.score)
    }

    async fn reset_scores(&self, class_id: &str) -> Result<u64> {
        let mut participants = self.participants.write().await;
        let mut touched = 0;
        for participant in participants.values_mut() {
            if participant.class_id == class_id {
                participant.score = 0;
                touched += 1;
            }
        }
        Ok(touched)
    }

    async fn upsert_answer(&self, answer: AnswerRow) -> Result<()> {
        let mut answers = self.answers.write().await;
        let key = (
            answer.class_id.clone(),
            answer.session_id.clone(),
            answer.question_id.clone(),
        );
        answers.insert(key, answer);
        Ok(())
    }

    async fn get_answer(
        &self,
        class_id: &str,
        session_id: &str,
        question_id: &str,
    ) -> Result<Option<AnswerRow>> {
        let answers = self.answers.read().await;
        Ok(answers
            .get(&(
                class_id.to_string(),
                session_id.to_string(),
                question_id.to_string(),
            ))
            .cloned())
    }

    async fn list_answers(&self, class_id: &str, question_id: &str) -> Result<Vec<AnswerRow>> {
        let answers = self.answers.read().await;
        let mut list: Vec<AnswerRow> = answers
            .values()
            .filter(|a| a.class_id == class_id && a.question_id == question_id)
            .cloned()
            .collect();
        list.sort_by(|a, b| a.session_id.cmp(&b.session_id));
        Ok(list)
    }

    async fn count_answers(&self, class_id: &str, question_id: &str) -> Result<u64> {
        let answers = self.answers.read().await;
        Ok(answers
            .values()
            .filter(|a| a.class_id == class_id && a.question_id == question_id)
            .count() as u64)
    }

    async fn delete_answers(&self, class_id: &str) -> Result<u64> {
        let mut answers = self.answers.write().await;
        let before = answers.len();
        answers.retain(|(cid, _, _), _| cid != class_id);
        Ok((before - answers.len()) as u64)
    }

    async fn insert_challenge(&self, challenge: Challenge) -> Result<()> {
        let mut challenges = self.challenges.write().await;
        challenges.push(challenge);
        Ok(())
    }

    async fn list_challenges(&self, class_id: &str) -> Result<Vec<Challenge>> {
        let challenges = self.challenges.read().await;
        Ok(challenges
            .iter()
            .filter(|c| c.class_id == class_id)
            .cloned()
            .collect())
    }
}
