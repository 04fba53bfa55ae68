use crate::api::RaftError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionOp {
    /// Opens a session for the named client endpoint. The session id is the commit index of the
    /// creating entry.
    CreateSession { endpoint: String },
    HeartbeatSession { session_id: u64 },
    CloseSession { session_id: u64 },
    /// Proposed by the leader. A candidate only expires if its version is unchanged and it's
    /// still expired at the entry's timestamp, so a racing heartbeat wins.
    ExpireSessions { candidates: Vec<(u64, u64)> },
    GenerateThreadId,
    GetSession { session_id: u64 },
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CpSession {
    pub id: u64,
    pub endpoint: String,
    pub creation_time_millis: i64,
    pub expiration_time_millis: i64,
    pub version: u64,
}

impl CpSession {
    pub fn is_expired(&self, now_millis: i64) -> bool {
        self.expiration_time_millis <= now_millis
    }
}

/// Reply to `CreateSession`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionResponse {
    pub session_id: u64,
    pub ttl_millis: i64,
    pub heartbeat_millis: i64,
}

/// SessionRegistry is the replicated session table of one group.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub(crate) struct SessionRegistry {
    sessions: BTreeMap<u64, CpSession>,
    next_thread_id: u64,
}

impl SessionRegistry {
    pub(crate) fn create(&mut self, session_id: u64, endpoint: String, now_millis: i64, ttl_millis: i64) -> &CpSession {
        self.sessions.entry(session_id).or_insert(CpSession {
            id: session_id,
            endpoint,
            creation_time_millis: now_millis,
            expiration_time_millis: now_millis.saturating_add(ttl_millis),
            version: 0,
        })
    }

    /// Extends the session's lease. Fails if the session was closed or expired.
    pub(crate) fn heartbeat(&mut self, session_id: u64, now_millis: i64, ttl_millis: i64) -> Result<(), RaftError> {
        match self.sessions.get_mut(&session_id) {
            Some(session) => {
                session.expiration_time_millis = now_millis.saturating_add(ttl_millis);
                session.version += 1;
                Ok(())
            }
            None => Err(RaftError::SessionExpired { session_id }),
        }
    }

    pub(crate) fn close(&mut self, session_id: u64) -> bool {
        self.sessions.remove(&session_id).is_some()
    }

    pub(crate) fn get(&self, session_id: u64) -> Option<&CpSession> {
        self.sessions.get(&session_id)
    }

    pub(crate) fn contains(&self, session_id: u64) -> bool {
        self.sessions.contains_key(&session_id)
    }

    /// Sessions past their expiration at `now_millis`, with the version they were observed at.
    pub(crate) fn expiration_candidates(&self, now_millis: i64) -> Vec<(u64, u64)> {
        self.sessions
            .values()
            .filter(|session| session.is_expired(now_millis))
            .map(|session| (session.id, session.version))
            .collect()
    }

    /// Removes the candidates that are still expired and unchanged. Returns the removed ids.
    pub(crate) fn expire(&mut self, candidates: &[(u64, u64)], now_millis: i64) -> Vec<u64> {
        let mut expired = Vec::new();
        for (session_id, version) in candidates {
            let still_expired = match self.sessions.get(session_id) {
                Some(session) => session.version == *version && session.is_expired(now_millis),
                None => false,
            };
            if still_expired {
                self.sessions.remove(session_id);
                expired.push(*session_id);
            }
        }

        expired
    }

    pub(crate) fn generate_thread_id(&mut self) -> u64 {
        self.next_thread_id += 1;
        self.next_thread_id
    }
}
