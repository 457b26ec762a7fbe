//! Notification sink — system chat messages and the room event log.
//!
//! DESIGN
//! ======
//! The coordinator announces lifecycle transitions (joins, departures,
//! host changes, topic reposts) through an append-only sink. Everything
//! here is best-effort by contract: a failed write is logged and
//! swallowed, never allowed to block or roll back a lifecycle
//! transaction. The trait seam exists so tests can record messages
//! without a database.

use async_trait::async_trait;
use sqlx::PgPool;
use tracing::warn;
use uuid::Uuid;

use crate::frame::now_ms;

/// What kind of system line is being appended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SystemKind {
    PlayerJoined,
    PlayerLeft,
    HostChanged,
    TopicRepost,
}

impl SystemKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::PlayerJoined => "player-joined",
            Self::PlayerLeft => "player-left",
            Self::HostChanged => "host-changed",
            Self::TopicRepost => "topic-repost",
        }
    }
}

/// Append-only system message channel.
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Append one system message to a room's chat.
    ///
    /// # Errors
    ///
    /// Returns a database error if the append fails; callers treat this
    /// as best-effort.
    async fn system_message(&self, room_id: &str, kind: SystemKind, body: &str) -> Result<(), sqlx::Error>;
}

/// Postgres-backed sink writing into `chat_messages`.
pub struct ChatNotifier {
    pool: PgPool,
}

impl ChatNotifier {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl Notifier for ChatNotifier {
    async fn system_message(&self, room_id: &str, kind: SystemKind, body: &str) -> Result<(), sqlx::Error> {
        sqlx::query(
            "INSERT INTO chat_messages (id, room_id, kind, author_id, body, ts) VALUES ($1, $2, $3, NULL, $4, $5)",
        )
        .bind(Uuid::new_v4())
        .bind(room_id)
        .bind(kind.as_str())
        .bind(body)
        .bind(now_ms())
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

/// Fire-and-forget system message: spawn, log on failure, move on.
pub fn notify_best_effort(
    notifier: &std::sync::Arc<dyn Notifier>,
    room_id: &str,
    kind: SystemKind,
    body: String,
) {
    let notifier = notifier.clone();
    let room_id = room_id.to_string();
    tokio::spawn(async move {
        if let Err(e) = notifier.system_message(&room_id, kind, &body).await {
            warn!(error = %e, %room_id, kind = kind.as_str(), "system message append failed");
        }
    });
}

/// Fire-and-forget analytics event row.
pub fn record_event(pool: &PgPool, room_id: &str, kind: &'static str, payload: serde_json::Value) {
    let pool = pool.clone();
    let room_id = room_id.to_string();
    tokio::spawn(async move {
        let result = sqlx::query("INSERT INTO room_events (id, room_id, kind, payload, ts) VALUES ($1, $2, $3, $4, $5)")
            .bind(Uuid::new_v4())
            .bind(&room_id)
            .bind(kind)
            .bind(&payload)
            .bind(now_ms())
            .execute(&pool)
            .await;
        if let Err(e) = result {
            warn!(error = %e, %room_id, kind, "event append failed");
        }
    });
}

// =============================================================================
// TEST SUPPORT
// =============================================================================

/// Recording sink for tests: keeps messages in memory.
#[cfg(test)]
pub struct RecordingNotifier {
    pub messages: std::sync::Mutex<Vec<(String, SystemKind, String)>>,
}

#[cfg(test)]
impl RecordingNotifier {
    #[must_use]
    pub fn new() -> Self {
        Self { messages: std::sync::Mutex::new(Vec::new()) }
    }
}

#[cfg(test)]
#[async_trait]
impl Notifier for RecordingNotifier {
    async fn system_message(&self, room_id: &str, kind: SystemKind, body: &str) -> Result<(), sqlx::Error> {
        self.messages
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push((room_id.to_string(), kind, body.to_string()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_strings_are_wire_stable() {
        assert_eq!(SystemKind::PlayerJoined.as_str(), "player-joined");
        assert_eq!(SystemKind::PlayerLeft.as_str(), "player-left");
        assert_eq!(SystemKind::HostChanged.as_str(), "host-changed");
        assert_eq!(SystemKind::TopicRepost.as_str(), "topic-repost");
    }

    #[tokio::test]
    async fn recording_notifier_captures_messages() {
        let sink = RecordingNotifier::new();
        sink.system_message("r1", SystemKind::PlayerLeft, "G1 left the room")
            .await
            .unwrap();
        let messages = sink.messages.lock().unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].1, SystemKind::PlayerLeft);
    }
}
