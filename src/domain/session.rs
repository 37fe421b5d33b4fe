use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

static SESSION_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Locally persisted view of the current session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionDescriptor {
    pub session_id: String,
    pub record_id: String,
    pub user_id: String,
    pub start_time: DateTime<Utc>,
    pub last_user_activity: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_tab_hidden_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_visibility_event: Option<DateTime<Utc>>,
}

impl SessionDescriptor {
    pub fn new(record: &SessionRecord, now: DateTime<Utc>) -> Self {
        Self {
            session_id: record.session_id.clone(),
            record_id: record.id.clone(),
            user_id: record.user_id.clone(),
            start_time: record.start_time,
            last_user_activity: now,
            last_tab_hidden_time: None,
            last_visibility_event: None,
        }
    }

    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        now - self.start_time
    }

    /// Time since the last activity or visibility event, whichever is later.
    pub fn idle_for(&self, now: DateTime<Utc>) -> Duration {
        let last = match self.last_visibility_event {
            Some(visibility) if visibility > self.last_user_activity => visibility,
            _ => self.last_user_activity,
        };
        now - last
    }

    /// Generate a fresh session id. Unique per process and instant.
    pub fn generate_id(user_id: &str, now: DateTime<Utc>) -> String {
        let counter = SESSION_COUNTER.fetch_add(1, Ordering::Relaxed);
        let mut hasher = Sha256::new();
        hasher.update(user_id.as_bytes());
        hasher.update(now.timestamp_nanos_opt().unwrap_or_default().to_le_bytes());
        hasher.update(std::process::id().to_le_bytes());
        hasher.update(counter.to_le_bytes());
        let digest = hex::encode(hasher.finalize());
        format!("session_{}", &digest[..32])
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndReason {
    Logout,
    Inactivity,
    Restarted,
    Stale,
    Expired,
}

/// Remote session record, the server's copy used for analytics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRecord {
    pub id: String,
    pub session_id: String,
    pub user_id: String,
    pub start_time: DateTime<Utc>,
    pub is_active: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_secs: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_reason: Option<EndReason>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewSessionRecord {
    pub session_id: String,
    pub user_id: String,
    pub start_time: DateTime<Utc>,
    pub is_active: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRecordUpdate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_active: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_secs: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_reason: Option<EndReason>,
}

impl SessionRecordUpdate {
    /// Mark a record inactive, with the duration measured from its start.
    pub fn ended(start_time: DateTime<Utc>, now: DateTime<Utc>, reason: EndReason) -> Self {
        Self {
            is_active: Some(false),
            duration_secs: Some((now - start_time).num_seconds().max(0)),
            end_reason: Some(reason),
        }
    }

    pub fn apply(&self, record: &mut SessionRecord) {
        if let Some(active) = self.is_active {
            record.is_active = active;
        }
        if let Some(duration) = self.duration_secs {
            record.duration_secs = Some(duration);
        }
        if let Some(reason) = self.end_reason {
            record.end_reason = Some(reason);
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordFilter {
    pub user_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_active: Option<bool>,
}

impl RecordFilter {
    pub fn for_user(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            ..Default::default()
        }
    }

    pub fn session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn active(mut self, is_active: bool) -> Self {
        self.is_active = Some(is_active);
        self
    }

    pub fn matches(&self, record: &SessionRecord) -> bool {
        record.user_id == self.user_id
            && self
                .session_id
                .as_ref()
                .map_or(true, |id| *id == record.session_id)
            && self.is_active.map_or(true, |active| active == record.is_active)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(now: DateTime<Utc>) -> SessionRecord {
        SessionRecord {
            id: "rec-1".into(),
            session_id: "session_a".into(),
            user_id: "user-1".into(),
            start_time: now,
            is_active: true,
            duration_secs: None,
            end_reason: None,
        }
    }

    #[test]
    fn test_generated_ids_are_unique() {
        let now = Utc::now();
        let a = SessionDescriptor::generate_id("user-1", now);
        let b = SessionDescriptor::generate_id("user-1", now);
        assert_ne!(a, b);
        assert!(a.starts_with("session_"));
        assert_eq!(a.len(), "session_".len() + 32);
    }

    #[test]
    fn test_idle_uses_latest_event() {
        let now = Utc::now();
        let mut descriptor = SessionDescriptor::new(&record(now - Duration::hours(1)), now);
        descriptor.last_user_activity = now - Duration::minutes(40);
        descriptor.last_visibility_event = Some(now - Duration::minutes(10));
        assert_eq!(descriptor.idle_for(now), Duration::minutes(10));

        descriptor.last_visibility_event = Some(now - Duration::minutes(50));
        assert_eq!(descriptor.idle_for(now), Duration::minutes(40));
    }

    #[test]
    fn test_ended_update_computes_duration() {
        let now = Utc::now();
        let update =
            SessionRecordUpdate::ended(now - Duration::seconds(2700), now, EndReason::Restarted);
        assert_eq!(update.is_active, Some(false));
        assert_eq!(update.duration_secs, Some(2700));

        let mut rec = record(now);
        update.apply(&mut rec);
        assert!(!rec.is_active);
        assert_eq!(rec.end_reason, Some(EndReason::Restarted));
    }

    #[test]
    fn test_filter_matching() {
        let now = Utc::now();
        let rec = record(now);
        assert!(RecordFilter::for_user("user-1").matches(&rec));
        assert!(RecordFilter::for_user("user-1").active(true).matches(&rec));
        assert!(!RecordFilter::for_user("user-1").active(false).matches(&rec));
        assert!(!RecordFilter::for_user("user-2").matches(&rec));
        assert!(!RecordFilter::for_user("user-1")
            .session("session_b")
            .matches(&rec));
    }

    #[test]
    fn test_descriptor_json_shape() {
        let now = Utc::now();
        let descriptor = SessionDescriptor::new(&record(now), now);
        let json = serde_json::to_string(&descriptor).unwrap();
        assert!(json.contains("\"sessionId\""));
        assert!(!json.contains("lastTabHiddenTime"));
        let back: SessionDescriptor = serde_json::from_str(&json).unwrap();
        assert_eq!(back, descriptor);
    }
}
