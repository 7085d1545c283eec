//! Session manager: session_id -> conversational state with bounded memory.
//!
//! Sessions are created by `initialize`, touched by every dispatched tool
//! call, and die by explicit termination, idle expiry, or capacity eviction
//! (oldest-by-last_used, 10% batches).

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::config::SessionConfig;
use crate::error::SessionError;
use crate::llm::AnalysisSummary;

/// One protocol session.
#[derive(Debug, Clone, Serialize)]
pub struct Session {
    pub session_id: String,
    pub created_at: DateTime<Utc>,
    pub last_used: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    /// Compact summary of the last successful analysis, used to resolve
    /// referential follow-up questions.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<AnalysisSummary>,
    pub query_count: u64,
}

/// Aggregate stats for operational surfaces.
#[derive(Debug, Clone, Serialize)]
pub struct SessionStats {
    pub count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub oldest: Option<DateTime<Utc>>,
    pub total_queries: u64,
}

pub struct SessionManager {
    config: SessionConfig,
    sessions: Mutex<HashMap<String, Session>>,
}

impl SessionManager {
    pub fn new(config: SessionConfig) -> Self {
        Self {
            config,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Create a session, or return the user's existing live session.
    ///
    /// A user has at most one active session; a fresh `initialize` under the
    /// same user_id resumes it.
    pub fn create(&self, user_id: Option<&str>) -> String {
        let mut sessions = self.sessions.lock().expect("session lock poisoned");
        let now = Utc::now();

        if let Some(user) = user_id
            && let Some(existing) = sessions
                .values_mut()
                .find(|s| s.user_id.as_deref() == Some(user) && !expired(s, self.config.ttl, now))
        {
            bump(existing, now);
            return existing.session_id.clone();
        }

        if sessions.len() >= self.config.cap {
            evict_oldest(&mut sessions, self.config.cap);
        }

        let session_id = Uuid::new_v4().to_string();
        sessions.insert(
            session_id.clone(),
            Session {
                session_id: session_id.clone(),
                created_at: now,
                last_used: now,
                user_id: user_id.map(String::from),
                context: None,
                query_count: 0,
            },
        );
        tracing::debug!(session_id, "session created");
        session_id
    }

    /// Look up a session, removing it if it has idled out.
    pub fn get(&self, session_id: &str) -> Result<Session, SessionError> {
        let mut sessions = self.sessions.lock().expect("session lock poisoned");
        let now = Utc::now();
        match sessions.get(session_id) {
            None => Err(SessionError::NotFound(session_id.to_string())),
            Some(session) if expired(session, self.config.ttl, now) => {
                sessions.remove(session_id);
                Err(SessionError::Expired(session_id.to_string()))
            }
            Some(session) => Ok(session.clone()),
        }
    }

    /// Bump `last_used`; called by every successful tool dispatch.
    pub fn touch(&self, session_id: &str) -> Result<(), SessionError> {
        let mut sessions = self.sessions.lock().expect("session lock poisoned");
        let session = sessions
            .get_mut(session_id)
            .ok_or_else(|| SessionError::NotFound(session_id.to_string()))?;
        bump(session, Utc::now());
        Ok(())
    }

    /// Store the analysis summary for follow-up resolution and count a query.
    pub fn record_query(&self, session_id: &str, summary: Option<AnalysisSummary>) {
        let mut sessions = self.sessions.lock().expect("session lock poisoned");
        if let Some(session) = sessions.get_mut(session_id) {
            session.query_count += 1;
            if summary.is_some() {
                session.context = summary;
            }
        }
    }

    pub fn terminate(&self, session_id: &str) -> Result<(), SessionError> {
        let mut sessions = self.sessions.lock().expect("session lock poisoned");
        sessions
            .remove(session_id)
            .map(|_| ())
            .ok_or_else(|| SessionError::NotFound(session_id.to_string()))
    }

    /// Drop every session past its idle timeout. Run periodically.
    pub fn evict_expired(&self) -> usize {
        let mut sessions = self.sessions.lock().expect("session lock poisoned");
        let now = Utc::now();
        let before = sessions.len();
        sessions.retain(|_, s| !expired(s, self.config.ttl, now));
        before - sessions.len()
    }

    pub fn stats(&self) -> SessionStats {
        let sessions = self.sessions.lock().expect("session lock poisoned");
        SessionStats {
            count: sessions.len(),
            oldest: sessions.values().map(|s| s.created_at).min(),
            total_queries: sessions.values().map(|s| s.query_count).sum(),
        }
    }
}

fn expired(session: &Session, ttl: Duration, now: DateTime<Utc>) -> bool {
    let ttl = TimeDelta::from_std(ttl).unwrap_or(TimeDelta::minutes(30));
    now - session.last_used > ttl
}

/// Strictly increase `last_used`, even under clock stalls.
fn bump(session: &mut Session, now: DateTime<Utc>) {
    session.last_used = if now > session.last_used {
        now
    } else {
        session.last_used + TimeDelta::microseconds(1)
    };
}

/// Remove the oldest-by-last_used 10% (at least one) of sessions.
fn evict_oldest(sessions: &mut HashMap<String, Session>, cap: usize) {
    let batch = (cap / 10).max(1);
    let mut by_age: Vec<(String, DateTime<Utc>)> = sessions
        .values()
        .map(|s| (s.session_id.clone(), s.last_used))
        .collect();
    by_age.sort_by_key(|(_, last_used)| *last_used);
    for (session_id, _) in by_age.into_iter().take(batch) {
        sessions.remove(&session_id);
        tracing::debug!(session_id, "session evicted at capacity");
    }
}

impl std::fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionManager")
            .field("ttl", &self.config.ttl)
            .field("cap", &self.config.cap)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager(ttl: Duration, cap: usize) -> SessionManager {
        SessionManager::new(SessionConfig { ttl, cap })
    }

    #[test]
    fn touch_strictly_increases_last_used() {
        let mgr = manager(Duration::from_secs(60), 10);
        let id = mgr.create(None);
        let before = mgr.get(&id).expect("live").last_used;
        mgr.touch(&id).expect("touch");
        let after = mgr.get(&id).expect("live").last_used;
        assert!(after > before);
    }

    #[test]
    fn expired_sessions_are_reported_and_removed() {
        let mgr = manager(Duration::from_millis(0), 10);
        let id = mgr.create(None);
        std::thread::sleep(Duration::from_millis(5));
        match mgr.get(&id) {
            Err(SessionError::Expired(_)) => {}
            other => panic!("expected Expired, got {other:?}"),
        }
        // Second lookup sees it gone entirely.
        match mgr.get(&id) {
            Err(SessionError::NotFound(_)) => {}
            other => panic!("expected NotFound, got {other:?}"),
        }
    }

    #[test]
    fn same_user_resumes_live_session() {
        let mgr = manager(Duration::from_secs(60), 10);
        let first = mgr.create(Some("analyst"));
        let second = mgr.create(Some("analyst"));
        assert_eq!(first, second);

        let third = mgr.create(Some("someone-else"));
        assert_ne!(first, third);
    }

    #[test]
    fn capacity_evicts_least_recently_used() {
        let mgr = manager(Duration::from_secs(60), 10);
        let ids: Vec<String> = (0..10).map(|_| mgr.create(None)).collect();

        // Touch everything except the first; it becomes the LRU victim.
        for id in &ids[1..] {
            mgr.touch(id).expect("touch");
        }

        let fresh = mgr.create(None);
        assert!(mgr.get(&fresh).is_ok());
        assert!(matches!(mgr.get(&ids[0]), Err(SessionError::NotFound(_))));
        // A recently-touched session under the cap is never evicted.
        assert!(mgr.get(&ids[5]).is_ok());
    }

    #[test]
    fn terminate_removes_session() {
        let mgr = manager(Duration::from_secs(60), 10);
        let id = mgr.create(None);
        mgr.terminate(&id).expect("terminate");
        assert!(matches!(mgr.get(&id), Err(SessionError::NotFound(_))));
        assert!(mgr.terminate(&id).is_err());
    }

    #[test]
    fn stats_aggregate_counts() {
        let mgr = manager(Duration::from_secs(60), 10);
        let a = mgr.create(None);
        let _b = mgr.create(None);
        mgr.record_query(&a, None);
        mgr.record_query(&a, None);

        let stats = mgr.stats();
        assert_eq!(stats.count, 2);
        assert_eq!(stats.total_queries, 2);
        assert!(stats.oldest.is_some());
    }
}
