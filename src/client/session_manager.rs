use crate::api::RaftError;
use crate::cp::{CpOp, SessionOp, SessionResponse};
use crate::invocation::{InvocationPolicy, RaftInvocationManager};
use crate::replica::RaftGroupId;
use dashmap::DashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::Mutex;
use tokio::time::Duration;

struct ClientSession {
    id: u64,
    // Number of callers currently relying on the session, e.g. held locks and permits.
    acquire_count: AtomicI64,
}

impl ClientSession {
    fn is_in_use(&self) -> bool {
        self.acquire_count.load(Ordering::SeqCst) > 0
    }
}

type Sessions = Arc<DashMap<RaftGroupId, Arc<ClientSession>>>;

/// ClientSessionManager owns this client's session in each group. Sessions are created on first
/// use, shared by every proxy of the group, and kept alive by a heartbeat task for as long as
/// someone has them acquired.
pub struct ClientSessionManager {
    logger: slog::Logger,
    invocation: Arc<RaftInvocationManager>,
    endpoint_name: String,
    sessions: Sessions,
    thread_ids: DashMap<RaftGroupId, u64>,
    // Serializes session and thread id creation per group, so concurrent first calls create one.
    creation_locks: DashMap<RaftGroupId, Arc<Mutex<()>>>,
}

impl ClientSessionManager {
    pub fn new(logger: slog::Logger, invocation: Arc<RaftInvocationManager>, endpoint_name: String) -> Self {
        ClientSessionManager {
            logger,
            invocation,
            endpoint_name,
            sessions: Arc::new(DashMap::new()),
            thread_ids: DashMap::new(),
            creation_locks: DashMap::new(),
        }
    }

    /// Returns this client's session in `group_id`, creating it if needed, and adds `count`
    /// acquisitions to it. Must be called from within a tokio runtime.
    pub async fn acquire_session(&self, group_id: &RaftGroupId, count: i64) -> Result<u64, RaftError> {
        if let Some(session_id) = self.try_acquire_existing(group_id, count) {
            return Ok(session_id);
        }

        let creation_lock = self.creation_lock(group_id);
        let _guard = creation_lock.lock().await;
        if let Some(session_id) = self.try_acquire_existing(group_id, count) {
            return Ok(session_id);
        }

        // A duplicate created by a retry is never heartbeated, so it just expires.
        let op = CpOp::Session(SessionOp::CreateSession {
            endpoint: self.endpoint_name.clone(),
        });
        let response: SessionResponse = self
            .invocation
            .invoke_cp(group_id, &op, InvocationPolicy::idempotent())
            .await?;

        let session = Arc::new(ClientSession {
            id: response.session_id,
            acquire_count: AtomicI64::new(count),
        });
        self.sessions.insert(group_id.clone(), session.clone());
        slog::info!(self.logger, "Created session {} in {:?}", session.id, group_id);

        let heartbeat_interval = Duration::from_millis(response.heartbeat_millis.max(1) as u64);
        tokio::spawn(heartbeat(
            self.logger.clone(),
            self.invocation.clone(),
            Arc::downgrade(&self.sessions),
            group_id.clone(),
            Arc::downgrade(&session),
            heartbeat_interval,
        ));

        Ok(response.session_id)
    }

    /// Drops `count` acquisitions of `session_id`. A no-op if the session was replaced meanwhile.
    pub fn release_session(&self, group_id: &RaftGroupId, session_id: u64, count: i64) {
        if let Some(session) = self.sessions.get(group_id) {
            if session.id == session_id {
                session.acquire_count.fetch_sub(count, Ordering::SeqCst);
            }
        }
    }

    /// Forgets `session_id` after the group reported it expired. The next acquisition creates a
    /// new session.
    pub fn invalidate_session(&self, group_id: &RaftGroupId, session_id: u64) {
        if self.sessions.remove_if(group_id, |_, s| s.id == session_id).is_some() {
            slog::info!(self.logger, "Invalidated session {} in {:?}", session_id, group_id);
        }
    }

    pub fn session_id(&self, group_id: &RaftGroupId) -> Option<u64> {
        self.sessions.get(group_id).map(|s| s.id)
    }

    pub fn acquire_count(&self, group_id: &RaftGroupId, session_id: u64) -> i64 {
        match self.sessions.get(group_id) {
            Some(session) if session.id == session_id => session.acquire_count.load(Ordering::SeqCst),
            _ => 0,
        }
    }

    /// The lock and semaphore holder id of this client within `group_id`. Generated once by the
    /// group so it is unique across clients.
    pub async fn thread_id(&self, group_id: &RaftGroupId) -> Result<u64, RaftError> {
        if let Some(thread_id) = self.thread_ids.get(group_id) {
            return Ok(*thread_id);
        }

        let creation_lock = self.creation_lock(group_id);
        let _guard = creation_lock.lock().await;
        if let Some(thread_id) = self.thread_ids.get(group_id) {
            return Ok(*thread_id);
        }

        let thread_id: u64 = self
            .invocation
            .invoke_cp(
                group_id,
                &CpOp::Session(SessionOp::GenerateThreadId),
                InvocationPolicy::idempotent(),
            )
            .await?;
        Ok(*self.thread_ids.entry(group_id.clone()).or_insert(thread_id))
    }

    /// Closes every session. Held locks and permits are released by the groups.
    pub async fn shutdown(&self) {
        let sessions: Vec<(RaftGroupId, u64)> = self.sessions.iter().map(|e| (e.key().clone(), e.id)).collect();
        self.sessions.clear();

        for (group_id, session_id) in sessions {
            let op = CpOp::Session(SessionOp::CloseSession { session_id });
            let result: Result<bool, RaftError> = self
                .invocation
                .invoke_cp(&group_id, &op, InvocationPolicy::idempotent())
                .await;
            if let Err(e) = result {
                slog::warn!(self.logger, "Failed to close session {} in {:?}: {}", session_id, group_id, e);
            }
        }
    }

    fn try_acquire_existing(&self, group_id: &RaftGroupId, count: i64) -> Option<u64> {
        self.sessions.get(group_id).map(|session| {
            session.acquire_count.fetch_add(count, Ordering::SeqCst);
            session.id
        })
    }

    fn creation_lock(&self, group_id: &RaftGroupId) -> Arc<Mutex<()>> {
        self.creation_locks
            .entry(group_id.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}

// Runs until the session is dropped from the manager, or the manager itself is dropped.
async fn heartbeat(
    logger: slog::Logger,
    invocation: Arc<RaftInvocationManager>,
    sessions: Weak<DashMap<RaftGroupId, Arc<ClientSession>>>,
    group_id: RaftGroupId,
    session: Weak<ClientSession>,
    interval: Duration,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await;

    loop {
        ticker.tick().await;
        let (session_id, in_use) = match session.upgrade() {
            Some(session) => (session.id, session.is_in_use()),
            None => return,
        };
        if !in_use {
            continue;
        }

        let op = CpOp::Session(SessionOp::HeartbeatSession { session_id });
        let result: Result<(), RaftError> = invocation
            .invoke_cp(&group_id, &op, InvocationPolicy::idempotent())
            .await;
        match result {
            Ok(()) => {}
            Err(RaftError::SessionExpired { .. }) => {
                slog::warn!(logger, "Session {} in {:?} expired", session_id, group_id);
                if let Some(sessions) = sessions.upgrade() {
                    sessions.remove_if(&group_id, |_, s| s.id == session_id);
                }
                return;
            }
            Err(e) => slog::warn!(logger, "Heartbeat of session {} failed: {}", session_id, e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{self, InvocationOptions, InvocationOptionsValidated};
    use crate::replica::RaftEndpoint;
    use crate::transport::{
        InvocationOp, InvocationRequest, InvocationResponse, RaftRequest, RaftResponse, RaftTransport, TransportError,
    };
    use std::sync::atomic::AtomicU64;

    /// Answers session ops the way a group would, counting what it saw.
    #[derive(Default)]
    struct SessionGroup {
        created: AtomicU64,
        heartbeats: AtomicU64,
        thread_ids: AtomicU64,
        expire_on_heartbeat: bool,
    }

    #[async_trait::async_trait]
    impl RaftTransport for SessionGroup {
        async fn send_raft(&self, _target: &RaftEndpoint, _request: RaftRequest) -> Result<RaftResponse, TransportError> {
            Err(TransportError::Unreachable("test".to_string()))
        }

        async fn invoke(
            &self,
            _target: &RaftEndpoint,
            request: InvocationRequest,
        ) -> Result<InvocationResponse, TransportError> {
            let op: CpOp = match request.op {
                InvocationOp::Replicate(bytes) => api::decode(&bytes).unwrap(),
                other => panic!("Unexpected op {:?}", other),
            };

            let reply = match op {
                CpOp::Session(SessionOp::CreateSession { .. }) => {
                    // Slow enough for concurrent callers to pile up.
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    let session_id = self.created.fetch_add(1, Ordering::SeqCst) + 1;
                    api::encode(&SessionResponse {
                        session_id,
                        ttl_millis: 1000,
                        heartbeat_millis: 10,
                    })
                }
                CpOp::Session(SessionOp::HeartbeatSession { session_id }) => {
                    self.heartbeats.fetch_add(1, Ordering::SeqCst);
                    if self.expire_on_heartbeat {
                        Err(RaftError::SessionExpired { session_id })
                    } else {
                        api::encode(&())
                    }
                }
                CpOp::Session(SessionOp::GenerateThreadId) => {
                    api::encode(&(self.thread_ids.fetch_add(1, Ordering::SeqCst) + 1))
                }
                CpOp::Session(SessionOp::CloseSession { .. }) => api::encode(&true),
                other => panic!("Unexpected op {:?}", other),
            };
            Ok(reply)
        }
    }

    fn group() -> RaftGroupId {
        RaftGroupId::new("sessions", 0)
    }

    fn manager(transport: Arc<SessionGroup>) -> Arc<ClientSessionManager> {
        let logger = slog::Logger::root(slog::Discard, slog::o!());
        let options = InvocationOptionsValidated::try_from(InvocationOptions::default()).unwrap();
        let invocation = Arc::new(RaftInvocationManager::new(logger.clone(), transport, options));
        invocation.register_group(group(), vec![RaftEndpoint::new("m1", "127.0.0.1:7001")]);

        Arc::new(ClientSessionManager::new(logger, invocation, "client".to_string()))
    }

    #[tokio::test]
    async fn concurrent_acquires_create_one_session() {
        // -- setup --
        let transport = Arc::new(SessionGroup::default());
        let manager = manager(transport.clone());

        // -- execute --
        let mut handles = Vec::new();
        for _ in 0..5 {
            let manager = manager.clone();
            handles.push(tokio::spawn(async move { manager.acquire_session(&group(), 1).await }));
        }
        let mut session_ids = Vec::new();
        for handle in handles {
            session_ids.push(handle.await.unwrap().unwrap());
        }

        // -- verify --
        assert!(session_ids.iter().all(|id| *id == 1));
        assert_eq!(transport.created.load(Ordering::SeqCst), 1);
        assert_eq!(manager.acquire_count(&group(), 1), 5);
    }

    #[tokio::test]
    async fn invalidated_session_is_replaced() {
        let transport = Arc::new(SessionGroup::default());
        let manager = manager(transport.clone());

        let first = manager.acquire_session(&group(), 1).await.unwrap();
        manager.release_session(&group(), first, 1);
        manager.invalidate_session(&group(), first);
        let second = manager.acquire_session(&group(), 1).await.unwrap();

        assert_ne!(first, second);
        assert_eq!(manager.session_id(&group()), Some(second));
        // Releasing the old id doesn't touch the new session.
        manager.release_session(&group(), first, 1);
        assert_eq!(manager.acquire_count(&group(), second), 1);
    }

    #[tokio::test]
    async fn heartbeats_while_in_use() {
        let transport = Arc::new(SessionGroup::default());
        let manager = manager(transport.clone());

        let session_id = manager.acquire_session(&group(), 1).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert!(transport.heartbeats.load(Ordering::SeqCst) > 0);
        assert_eq!(manager.session_id(&group()), Some(session_id));
    }

    #[tokio::test]
    async fn expired_heartbeat_invalidates_session() {
        let transport = Arc::new(SessionGroup {
            expire_on_heartbeat: true,
            ..SessionGroup::default()
        });
        let manager = manager(transport.clone());

        manager.acquire_session(&group(), 1).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(manager.session_id(&group()), None);
    }

    #[tokio::test]
    async fn thread_id_is_generated_once() {
        let transport = Arc::new(SessionGroup::default());
        let manager = manager(transport.clone());

        let first = manager.thread_id(&group()).await.unwrap();
        let second = manager.thread_id(&group()).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(transport.thread_ids.load(Ordering::SeqCst), 1);
    }
}
