use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::RwLock;

use super::protocol::ServerEvent;
use super::registry::ConnectionRegistry;
use crate::config::PresenceConfig;
use crate::error::Result;
use crate::store::{now_ms, Participant, ParticipantPatch, Store};

/// Outcome of a generic participant update: throttled writes may be skipped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveOutcome {
    Saved,
    Skipped,
}

/// Generic participant update for the request/response surface
#[derive(Debug, Clone, Default)]
pub struct ParticipantUpdate {
    pub display_name: Option<String>,
    pub score: Option<i64>,
    pub score_delta: Option<i64>,
}

impl ParticipantUpdate {
    fn carries_score(&self) -> bool {
        self.score.is_some() || self.score_delta.is_some()
    }
}

/// Maintains participant connect/disconnect state and throttled heartbeat
/// persistence/broadcast. The persist and broadcast windows are tracked in
/// independent maps keyed by `classId:sessionId`, so storage write volume
/// and network chatter are decoupled.
pub struct PresenceTracker {
    store: Arc<dyn Store>,
    registry: Arc<ConnectionRegistry>,
    config: PresenceConfig,
    last_persist: RwLock<HashMap<String, Instant>>,
    last_broadcast: RwLock<HashMap<String, Instant>>,
}

fn throttle_key(class_id: &str, session_id: &str) -> String {
    format!("{}:{}", class_id, session_id)
}

fn default_display_name(session_id: &str) -> String {
    let prefix: String = session_id.chars().take(5).collect();
    format!("Alumno-{}", prefix)
}

impl PresenceTracker {
    pub fn new(
        store: Arc<dyn Store>,
        registry: Arc<ConnectionRegistry>,
        config: PresenceConfig,
    ) -> Self {
        Self {
            store,
            registry,
            config,
            last_persist: RwLock::new(HashMap::new()),
            last_broadcast: RwLock::new(HashMap::new()),
        }
    }

    /// Marks the participant connected and broadcasts the refreshed list.
    /// A missing display name falls back to the stored one, then to the
    /// session-derived default. Existing records are patched, never
    /// re-upserted, so a concurrent award can't be written over.
    pub async fn handle_subscribe(
        &self,
        class_id: &str,
        session_id: &str,
        display_name: Option<&str>,
    ) -> Result<Participant> {
        let existing = self.store.get_participant(class_id, session_id).await?;

        let participant = match existing {
            Some(mut participant) => {
                if let Some(name) = display_name.filter(|n| !n.is_empty()) {
                    participant.display_name = name.to_string();
                }
                participant.connected = true;
                participant.last_seen = now_ms();
                self.store
                    .update_participant(
                        class_id,
                        session_id,
                        ParticipantPatch {
                            display_name: Some(participant.display_name.clone()),
                            connected: Some(true),
                            last_seen: Some(participant.last_seen),
                            ..Default::default()
                        },
                    )
                    .await?;
                participant
            }
            None => {
                let participant = Participant {
                    class_id: class_id.to_string(),
                    session_id: session_id.to_string(),
                    display_name: display_name
                        .filter(|n| !n.is_empty())
                        .map(str::to_string)
                        .unwrap_or_else(|| default_display_name(session_id)),
                    score: 0,
                    connected: true,
                    last_seen: now_ms(),
                };
                self.store.upsert_participant(participant.clone()).await?;
                participant
            }
        };
        self.stamp_persist(class_id, session_id).await;

        tracing::info!(
            class_id = %class_id,
            session_id = %session_id,
            display_name = %participant.display_name,
            "Participant subscribed"
        );

        self.broadcast_participants(class_id).await;
        Ok(participant)
    }

    /// Heartbeat. A participant not currently marked connected forces an
    /// immediate persist and broadcast; otherwise both sides are throttled
    /// by their own window.
    pub async fn handle_ping(&self, class_id: &str, session_id: &str) -> Result<()> {
        let existing = self.store.get_participant(class_id, session_id).await?;
        let connected = existing.as_ref().map(|p| p.connected).unwrap_or(false);

        if !connected {
            // First sight or a silent reconnect
            self.handle_subscribe(class_id, session_id, None).await?;
            self.stamp_broadcast(class_id, session_id).await;
            return Ok(());
        }

        let mut participant = match existing {
            Some(p) => p,
            None => return Ok(()),
        };
        participant.last_seen = now_ms();

        if self
            .window_elapsed(
                &self.last_persist,
                class_id,
                session_id,
                self.config.min_persist_ms,
            )
            .await
        {
            // Heartbeat writes only touch the timestamp
            self.store
                .update_participant(
                    class_id,
                    session_id,
                    ParticipantPatch {
                        last_seen: Some(participant.last_seen),
                        ..Default::default()
                    },
                )
                .await?;
            self.stamp_persist(class_id, session_id).await;
        }

        if self
            .window_elapsed(
                &self.last_broadcast,
                class_id,
                session_id,
                self.config.min_broadcast_ms,
            )
            .await
        {
            self.registry
                .publish(
                    &ServerEvent::ParticipantHeartbeat {
                        class_id: class_id.to_string(),
                        session_id: session_id.to_string(),
                        last_seen: participant.last_seen,
                    },
                    Some(class_id),
                )
                .await;
            self.stamp_broadcast(class_id, session_id).await;
        }

        Ok(())
    }

    /// Generic update path. Updates carrying points are written immediately;
    /// everything else respects the persist throttle and may be skipped.
    pub async fn save_participant(
        &self,
        class_id: &str,
        session_id: &str,
        update: ParticipantUpdate,
    ) -> Result<SaveOutcome> {
        let carries_score = update.carries_score();

        if !carries_score
            && !self
                .window_elapsed(
                    &self.last_persist,
                    class_id,
                    session_id,
                    self.config.min_persist_ms,
                )
                .await
        {
            tracing::debug!(
                class_id = %class_id,
                session_id = %session_id,
                "Participant update skipped by persist throttle"
            );
            return Ok(SaveOutcome::Skipped);
        }

        let patch = ParticipantPatch {
            display_name: update.display_name.clone(),
            score: update.score.map(|s| s.max(0)),
            last_seen: Some(now_ms()),
            ..Default::default()
        };
        let found = self
            .store
            .update_participant(class_id, session_id, patch)
            .await?;
        if !found {
            self.store
                .upsert_participant(Participant {
                    class_id: class_id.to_string(),
                    session_id: session_id.to_string(),
                    display_name: update
                        .display_name
                        .unwrap_or_else(|| default_display_name(session_id)),
                    score: update.score.map(|s| s.max(0)).unwrap_or(0),
                    connected: false,
                    last_seen: now_ms(),
                })
                .await?;
        }

        if let Some(delta) = update.score_delta {
            // Atomic increment at the store layer, never read-modify-write
            self.store.increment_score(class_id, session_id, delta).await?;
        }

        self.stamp_persist(class_id, session_id).await;
        self.broadcast_participants(class_id).await;
        Ok(SaveOutcome::Saved)
    }

    /// Bulk-zero every score in the class and broadcast the refreshed list
    pub async fn reset_scores(&self, class_id: &str) -> Result<u64> {
        let touched = self.store.reset_scores(class_id).await?;
        tracing::info!(class_id = %class_id, touched = touched, "Participant scores reset");
        self.broadcast_participants(class_id).await;
        Ok(touched)
    }

    /// Marks the participant disconnected, notifies the class and clears
    /// the throttle bookkeeping for the key.
    pub async fn handle_disconnect(&self, class_id: &str, session_id: &str) -> Result<()> {
        self.store
            .update_participant(
                class_id,
                session_id,
                ParticipantPatch {
                    connected: Some(false),
                    last_seen: Some(now_ms()),
                    ..Default::default()
                },
            )
            .await?;

        self.registry
            .publish(
                &ServerEvent::ParticipantDisconnected {
                    class_id: class_id.to_string(),
                    session_id: session_id.to_string(),
                },
                Some(class_id),
            )
            .await;
        self.broadcast_participants(class_id).await;

        let key = throttle_key(class_id, session_id);
        self.last_persist.write().await.remove(&key);
        self.last_broadcast.write().await.remove(&key);

        tracing::info!(
            class_id = %class_id,
            session_id = %session_id,
            "Participant disconnected"
        );
        Ok(())
    }

    /// Sends the current participants snapshot to the class. Fire-and-forget:
    /// a listing failure is logged, never propagated.
    pub async fn broadcast_participants(&self, class_id: &str) {
        match self.store.list_participants(class_id).await {
            Ok(participants) => {
                self.registry
                    .publish(
                        &ServerEvent::ParticipantsUpdated {
                            class_id: class_id.to_string(),
                            participants,
                        },
                        Some(class_id),
                    )
                    .await;
            }
            Err(e) => {
                tracing::warn!(
                    class_id = %class_id,
                    error = %e,
                    "Failed to load participants for broadcast"
                );
            }
        }
    }

    async fn window_elapsed(
        &self,
        map: &RwLock<HashMap<String, Instant>>,
        class_id: &str,
        session_id: &str,
        window_ms: u64,
    ) -> bool {
        let stamps = map.read().await;
        match stamps.get(&throttle_key(class_id, session_id)) {
            Some(last) => last.elapsed() >= Duration::from_millis(window_ms),
            None => true,
        }
    }

    async fn stamp_persist(&self, class_id: &str, session_id: &str) {
        let mut stamps = self.last_persist.write().await;
        stamps.insert(throttle_key(class_id, session_id), Instant::now());
    }

    async fn stamp_broadcast(&self, class_id: &str, session_id: &str) {
        let mut stamps = self.last_broadcast.write().await;
        stamps.insert(throttle_key(class_id, session_id), Instant::now());
    }
}
