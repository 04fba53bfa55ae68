use cp_raft::{
    ChangeMembershipInput, CpClient, CpClientConfig, CpOp, CpOptions, CpOptionsValidated, CpStateMachine,
    ElectionStateSnapshot, InvocationOp, InvocationOptions, InvocationOptionsValidated, InvocationPolicy,
    InvocationRequest, InvocationUid, LocalNetwork, LockEndpoint, LockOp, MembershipChangeMode, RaftEndpoint,
    RaftError, RaftGroupId, RaftNodeRegistry, RaftNodeRegistryConfig, RaftNodeReport, RaftOptions,
    RaftOptionsValidated, RaftRole, ReplicaId,
};
use slog::Drain;
use std::collections::HashMap;
use std::error::Error;
use std::sync::Arc;
use tokio::time::{Duration, Instant};

#[tokio::test]
async fn election_safety() -> Result<(), Box<dyn Error>> {
    // -- setup --
    let cluster = Cluster::start("election", 5, Knobs::default()).await;
    let mut listeners: Vec<_> = cluster
        .members
        .iter()
        .map(|m| cluster.registry(&m.id).election_listener(&cluster.group_id).unwrap())
        .collect();
    let first_leader = cluster.wait_for_leader(Duration::from_secs(10)).await;

    // -- execute --
    cluster.network.crash(&first_leader.id).await;
    let deadline = Instant::now() + Duration::from_secs(3);
    let mut leaders_by_term: HashMap<u64, Vec<usize>> = HashMap::new();
    while Instant::now() < deadline {
        for (member, listener) in listeners.iter_mut().enumerate() {
            if let ElectionStateSnapshot::Leader { term } = listener.current() {
                let leaders = leaders_by_term.entry(term.as_u64()).or_default();
                if !leaders.contains(&member) {
                    leaders.push(member);
                }
            }
        }
        sleep(Duration::from_millis(10)).await;
    }

    // -- verify --
    for (term, leaders) in leaders_by_term.iter() {
        assert_eq!(leaders.len(), 1, "Term {} had leaders {:?}", term, leaders);
    }
    let second_leader = cluster.wait_for_leader(Duration::from_secs(10)).await;
    assert_ne!(second_leader.id, first_leader.id);

    Ok(())
}

#[tokio::test]
async fn commit_index_is_monotonic_and_logs_match() -> Result<(), Box<dyn Error>> {
    let cluster = Cluster::start("commit", 3, Knobs::default()).await;
    cluster.wait_for_leader(Duration::from_secs(10)).await;
    let client = cluster.client("client-1");
    let counter = client.atomic_long(&cluster.group_id, "counter");

    let mut last_commit: HashMap<ReplicaId, u64> = HashMap::new();
    for i in 1..=20 {
        assert_eq!(counter.increment_and_get().await?, i);
        for report in cluster.reports().await {
            let commit = report.commit_index.as_u64();
            let previous = last_commit.insert(report.local.id.clone(), commit).unwrap_or(0);
            assert!(commit >= previous, "{:?} commit index went back", report.local.id);
            assert!(report.last_applied <= report.commit_index);
        }
    }

    let reports = cluster.wait_for_convergence(Duration::from_secs(5)).await;
    assert!(reports.iter().all(|r| r.last_applied.as_u64() >= 20));

    Ok(())
}

// Scenario: the leader crashes after a lock was granted, and the client's retry of the same
// invocation lands on the new leader.
#[tokio::test]
async fn lock_retry_after_leader_crash_returns_same_fence() -> Result<(), Box<dyn Error>> {
    // -- setup --
    let cluster = Cluster::start("lock-crash", 3, Knobs::default()).await;
    cluster.wait_for_leader(Duration::from_secs(10)).await;
    let client = cluster.client("client-1");
    let group_id = cluster.group_id.clone();

    let session_id = client.sessions().acquire_session(&group_id, 1).await?;
    let thread_id = client.sessions().thread_id(&group_id).await?;
    let op = CpOp::Lock(LockOp::Lock {
        name: "lock".to_string(),
        endpoint: LockEndpoint { session_id, thread_id },
        invocation_uid: InvocationUid::new_random(),
    });
    let fence: u64 = client
        .invocation()
        .invoke_cp(&group_id, &op, InvocationPolicy::idempotent())
        .await?;

    // -- execute --
    let leader = cluster.wait_for_leader(Duration::from_secs(10)).await;
    cluster.network.crash(&leader.id).await;
    let retried: u64 = client
        .invocation()
        .invoke_cp(&group_id, &op, InvocationPolicy::idempotent())
        .await?;

    // -- verify --
    assert_eq!(retried, fence);
    let lock = client.lock(&group_id, "lock");
    let state = lock.ownership_state().await?;
    assert_eq!(state.fence, fence);
    assert_eq!(state.lock_count, 1);
    lock.unlock().await?;
    assert!(!lock.is_locked().await?);

    Ok(())
}

// Scenario: the leader is cut off right after a lock entry is appended, so the entry never
// reaches a majority. The retry of the same invocation on the new leader acquires it once.
#[tokio::test]
async fn lock_retry_after_leader_isolated_before_commit_acquires_once() -> Result<(), Box<dyn Error>> {
    // -- setup --
    let cluster = Cluster::start("lock-isolate", 3, Knobs::default()).await;
    let old_leader = cluster.wait_for_leader(Duration::from_secs(10)).await;
    let client = cluster.client("client-1");
    let group_id = cluster.group_id.clone();

    let session_id = client.sessions().acquire_session(&group_id, 1).await?;
    let thread_id = client.sessions().thread_id(&group_id).await?;
    let op = CpOp::Lock(LockOp::Lock {
        name: "lock".to_string(),
        endpoint: LockEndpoint { session_id, thread_id },
        invocation_uid: InvocationUid::new_random(),
    });
    cluster.wait_for_convergence(Duration::from_secs(5)).await;

    // -- execute --
    cluster.network.isolate(&old_leader.id);
    let old_registry = cluster.registry(&old_leader.id);
    let request = InvocationRequest {
        group_id: group_id.clone(),
        op: InvocationOp::Replicate(cp_raft::encode(&op)?),
    };
    let orphan = tokio::spawn(async move { old_registry.handle_invocation(request).await });
    let orphan_result = tokio::time::timeout(Duration::from_secs(5), orphan).await??;
    assert!(
        matches!(
            orphan_result,
            Err(RaftError::IndeterminateOperationState(_)) | Err(RaftError::NotLeader { .. })
        ),
        "{:?}",
        orphan_result
    );

    let new_leader = cluster
        .wait_for_leader_among(&cluster.others(&old_leader.id), Duration::from_secs(10))
        .await;
    assert_ne!(new_leader.id, old_leader.id);
    let fence: u64 = client
        .invocation()
        .invoke_cp(&group_id, &op, InvocationPolicy::idempotent())
        .await?;
    let retried: u64 = client
        .invocation()
        .invoke_cp(&group_id, &op, InvocationPolicy::idempotent())
        .await?;
    cluster.network.heal(&old_leader.id);

    // -- verify --
    assert!(fence > cp_raft::INVALID_FENCE);
    assert_eq!(retried, fence);
    let state = client.lock(&group_id, "lock").ownership_state().await?;
    assert_eq!(state.fence, fence);
    assert_eq!(state.lock_count, 1);
    assert_eq!(state.session_id, session_id);
    cluster.wait_for_convergence(Duration::from_secs(5)).await;

    Ok(())
}

// Scenario: a blocking lock waits longer than the client's invocation timeout. The wait keeps
// going and the lock goes to the caller that is still waiting for it.
#[tokio::test]
async fn blocking_lock_outlives_invocation_timeout() -> Result<(), Box<dyn Error>> {
    // -- setup --
    let cluster = Cluster::start("lock-long-wait", 3, Knobs::default()).await;
    cluster.wait_for_leader(Duration::from_secs(10)).await;
    let holder = cluster.client("holder");
    let waiter = cluster.client_with_timeout("waiter", Duration::from_millis(500));
    let holder_lock = holder.lock(&cluster.group_id, "lock");
    let waiter_lock = waiter.lock(&cluster.group_id, "lock");
    let fence1 = holder_lock.lock().await?;

    // -- execute --
    let waiting = {
        let waiter_lock = waiter_lock.clone();
        tokio::spawn(async move { waiter_lock.lock().await })
    };
    sleep(Duration::from_millis(1500)).await;
    assert!(!waiting.is_finished());
    holder_lock.unlock().await?;
    let fence2 = tokio::time::timeout(Duration::from_secs(5), waiting).await???;

    // -- verify --
    assert!(fence2 > fence1);
    assert!(waiter_lock.is_locked_by_me().await?);
    assert_eq!(waiter_lock.ownership_state().await?.lock_count, 1);
    waiter_lock.unlock().await?;
    assert!(!waiter_lock.is_locked().await?);

    Ok(())
}

#[tokio::test]
async fn fences_grow_across_owners() -> Result<(), Box<dyn Error>> {
    let cluster = Cluster::start("fence", 3, Knobs::default()).await;
    cluster.wait_for_leader(Duration::from_secs(10)).await;
    let first = cluster.client("client-1");
    let second = cluster.client("client-2");
    let first_lock = first.lock(&cluster.group_id, "lock");
    let second_lock = second.lock(&cluster.group_id, "lock");

    let fence1 = first_lock.lock().await?;
    assert_eq!(first_lock.lock().await?, fence1);
    assert_eq!(second_lock.try_lock(Duration::from_millis(0)).await?, cp_raft::INVALID_FENCE);

    let waiter = tokio::spawn(async move { second_lock.lock().await });
    sleep(Duration::from_millis(200)).await;
    first_lock.unlock().await?;
    assert!(first_lock.is_locked_by_me().await?);
    first_lock.unlock().await?;

    let fence2 = tokio::time::timeout(Duration::from_secs(5), waiter).await??;
    assert!(fence2? > fence1);
    assert!(matches!(
        first_lock.unlock().await,
        Err(RaftError::IllegalMonitorState(_))
    ));

    Ok(())
}

// Scenario: permits are granted to waiters in arrival order.
#[tokio::test]
async fn semaphore_grants_waiters_in_order() -> Result<(), Box<dyn Error>> {
    // -- setup --
    let cluster = Cluster::start("semaphore", 3, Knobs::default()).await;
    cluster.wait_for_leader(Duration::from_secs(10)).await;
    let holder = cluster.client("holder");
    let early = cluster.client("early");
    let late = cluster.client("late");
    let semaphore = holder.semaphore(&cluster.group_id, "permits");
    assert!(semaphore.init(1).await?);
    assert!(!semaphore.init(5).await?);
    semaphore.acquire(1).await?;

    let early_semaphore = early.semaphore(&cluster.group_id, "permits");
    let early_waiter = {
        let semaphore = early_semaphore.clone();
        tokio::spawn(async move { semaphore.acquire(1).await })
    };
    sleep(Duration::from_millis(300)).await;
    let late_semaphore = late.semaphore(&cluster.group_id, "permits");
    let late_waiter = {
        let semaphore = late_semaphore.clone();
        tokio::spawn(async move { semaphore.acquire(1).await })
    };
    sleep(Duration::from_millis(300)).await;

    // -- execute --
    semaphore.release(1).await?;

    // -- verify --
    tokio::time::timeout(Duration::from_secs(5), early_waiter).await???;
    sleep(Duration::from_millis(300)).await;
    assert!(!late_waiter.is_finished());
    assert_eq!(semaphore.available_permits().await?, 0);

    early_semaphore.release(1).await?;
    tokio::time::timeout(Duration::from_secs(5), late_waiter).await???;
    late_semaphore.release(1).await?;
    assert_eq!(semaphore.available_permits().await?, 1);

    Ok(())
}

// Scenario: a membership change based on a stale view is rejected.
#[tokio::test]
async fn stale_membership_change_is_rejected() -> Result<(), Box<dyn Error>> {
    // -- setup --
    let cluster = Cluster::start("membership", 3, Knobs::default()).await;
    cluster.wait_for_leader(Duration::from_secs(10)).await;
    let client = cluster.client("admin");
    let view = client.invocation().query_members(&cluster.group_id).await?;
    assert_eq!(view.members.size(), 3);
    let stale_index = view.members.index();

    let new_member = endpoint(3);
    let registry = cluster.start_member(&new_member);
    let mut members = cluster.members.clone();
    members.push(new_member.clone());
    registry.create_group(cluster.group_id.clone(), members)?;

    // -- execute --
    let added = client
        .invocation()
        .change_membership(
            &cluster.group_id,
            ChangeMembershipInput {
                member: new_member.clone(),
                mode: MembershipChangeMode::Add,
                expected_members_commit_index: stale_index,
            },
        )
        .await?;
    let rejected = client
        .invocation()
        .change_membership(
            &cluster.group_id,
            ChangeMembershipInput {
                member: endpoint(1),
                mode: MembershipChangeMode::Remove,
                expected_members_commit_index: stale_index,
            },
        )
        .await;

    // -- verify --
    assert_eq!(added.members.len(), 4);
    assert_eq!(
        rejected,
        Err(RaftError::MismatchingGroupMembersCommitIndex {
            expected: stale_index,
            actual: added.members_commit_index,
        })
    );
    let duplicate = client
        .invocation()
        .change_membership(
            &cluster.group_id,
            ChangeMembershipInput {
                member: new_member.clone(),
                mode: MembershipChangeMode::Add,
                expected_members_commit_index: added.members_commit_index,
            },
        )
        .await;
    assert_eq!(duplicate, Err(RaftError::MemberAlreadyExists(new_member.clone())));

    // The new member catches up with the group.
    let counter = client.atomic_long(&cluster.group_id, "counter");
    counter.set(7).await?;
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        let report = registry.report(&cluster.group_id).await?;
        if report.last_applied >= added.members_commit_index && report.committed_members.size() == 4 {
            break;
        }
        assert!(Instant::now() < deadline, "New member didn't catch up: {:?}", report);
        sleep(Duration::from_millis(50)).await;
    }

    Ok(())
}

// Scenario: an isolated leader's uncommitted entries are replaced by the new leader's log.
#[tokio::test]
async fn divergent_log_converges_after_heal() -> Result<(), Box<dyn Error>> {
    // -- setup --
    let cluster = Cluster::start("diverge", 3, Knobs::default()).await;
    let old_leader = cluster.wait_for_leader(Duration::from_secs(10)).await;
    let client = cluster.client("client-1");
    let counter = client.atomic_long(&cluster.group_id, "counter");
    counter.set(1).await?;
    cluster.wait_for_convergence(Duration::from_secs(5)).await;

    // -- execute --
    cluster.network.isolate(&old_leader.id);
    let old_registry = cluster.registry(&old_leader.id);
    let group_id = cluster.group_id.clone();
    let orphan = tokio::spawn(async move {
        let op = CpOp::AtomicLong(cp_raft::AtomicLongOp::Set {
            name: "counter".to_string(),
            value: 100,
        });
        old_registry
            .handle_invocation(InvocationRequest {
                group_id,
                op: InvocationOp::Replicate(cp_raft::encode(&op)?),
            })
            .await
    });

    // Without a majority the old leader steps down, leaving the entry uncommitted.
    let orphan_result = tokio::time::timeout(Duration::from_secs(5), orphan).await??;
    assert!(
        matches!(orphan_result, Err(RaftError::IndeterminateOperationState(_))),
        "{:?}",
        orphan_result
    );
    let new_leader = cluster
        .wait_for_leader_among(&cluster.others(&old_leader.id), Duration::from_secs(10))
        .await;
    assert_ne!(new_leader.id, old_leader.id);
    assert_eq!(counter.add_and_get(1).await?, 2);
    cluster.network.heal(&old_leader.id);

    // -- verify --
    let reports = cluster.wait_for_convergence(Duration::from_secs(5)).await;
    assert!(reports.iter().all(|r| r.last_log_term == reports[0].last_log_term));
    assert_eq!(counter.get().await?, 2);

    Ok(())
}

#[tokio::test]
async fn expired_session_releases_lock() -> Result<(), Box<dyn Error>> {
    // -- setup --
    let knobs = Knobs {
        session_ttl: Duration::from_millis(1000),
        session_heartbeat_interval: Duration::from_millis(200),
        ..Knobs::default()
    };
    let cluster = Cluster::start("session-expiry", 3, knobs).await;
    cluster.wait_for_leader(Duration::from_secs(10)).await;
    let crashed = cluster.client("crashed");
    let survivor = cluster.client("survivor");
    let fence1 = crashed.lock(&cluster.group_id, "lock").lock().await?;

    let survivor_lock = survivor.lock(&cluster.group_id, "lock");
    let waiter = {
        let lock = survivor_lock.clone();
        tokio::spawn(async move { lock.lock().await })
    };
    // Let the crashed client heartbeat a few times first.
    sleep(Duration::from_millis(500)).await;
    assert!(!waiter.is_finished());

    // -- execute --
    drop(crashed);

    // -- verify --
    let fence2 = tokio::time::timeout(Duration::from_secs(10), waiter).await???;
    assert!(fence2 > fence1);
    assert!(survivor_lock.is_locked_by_me().await?);

    Ok(())
}

#[tokio::test]
async fn lagging_follower_catches_up_from_snapshot() -> Result<(), Box<dyn Error>> {
    // -- setup --
    let knobs = Knobs {
        snapshot_every: 10,
        ..Knobs::default()
    };
    let cluster = Cluster::start("snapshot", 3, knobs).await;
    let leader = cluster.wait_for_leader(Duration::from_secs(10)).await;
    let lagging = cluster.others(&leader.id)[0].clone();
    let client = cluster.client("client-1");
    let counter = client.atomic_long(&cluster.group_id, "counter");
    let latch = client.count_down_latch(&cluster.group_id, "latch");
    assert!(latch.try_set_count(2).await?);

    // -- execute --
    cluster.network.isolate(&lagging.id);
    for _ in 0..30 {
        counter.increment_and_get().await?;
    }
    latch.count_down().await?;
    cluster.network.heal(&lagging.id);

    // -- verify --
    let reports = cluster.wait_for_convergence(Duration::from_secs(10)).await;
    let lagging_report = reports.iter().find(|r| r.local.id == lagging.id).unwrap();
    assert!(lagging_report.snapshot_index.as_u64() > 0);

    // The restored follower can serve as leader with the same state.
    let current = cluster.wait_for_leader(Duration::from_secs(10)).await;
    cluster.network.crash(&current.id).await;
    assert_eq!(counter.get().await?, 30);
    assert_eq!(latch.count().await?, 1);
    assert_eq!(latch.round().await?, 1);

    Ok(())
}

#[tokio::test]
async fn terminated_group_rejects_operations() -> Result<(), Box<dyn Error>> {
    let cluster = Cluster::start("terminate", 3, Knobs::default()).await;
    cluster.wait_for_leader(Duration::from_secs(10)).await;
    let client = cluster.client("client-1");
    let counter = client.atomic_long(&cluster.group_id, "counter");
    counter.set(3).await?;

    client.invocation().terminate_group(&cluster.group_id).await?;

    assert_eq!(
        counter.get().await,
        Err(RaftError::RaftGroupTerminated {
            group_id: cluster.group_id.clone()
        })
    );

    Ok(())
}

// ------- Simulated cluster -------

#[derive(Clone)]
struct Knobs {
    session_ttl: Duration,
    session_heartbeat_interval: Duration,
    snapshot_every: u64,
}

impl Default for Knobs {
    fn default() -> Self {
        Knobs {
            session_ttl: Duration::from_secs(10),
            session_heartbeat_interval: Duration::from_millis(500),
            snapshot_every: 1000,
        }
    }
}

struct Cluster {
    logger: slog::Logger,
    network: LocalNetwork,
    group_id: RaftGroupId,
    members: Vec<RaftEndpoint>,
    knobs: Knobs,
}

impl Cluster {
    async fn start(name: &str, size: usize, knobs: Knobs) -> Self {
        let cluster = Cluster {
            logger: create_root_logger_for_stdout(name.to_string()),
            network: LocalNetwork::new(),
            group_id: RaftGroupId::new(name, 0),
            members: (0..size).map(endpoint).collect(),
            knobs,
        };

        for member in cluster.members.iter() {
            let registry = cluster.start_member(member);
            registry
                .create_group(cluster.group_id.clone(), cluster.members.clone())
                .unwrap();
        }

        cluster
    }

    fn start_member(&self, member: &RaftEndpoint) -> Arc<RaftNodeRegistry> {
        let cp_options = CpOptionsValidated::try_from(CpOptions {
            session_ttl: Some(self.knobs.session_ttl),
            session_heartbeat_interval: Some(self.knobs.session_heartbeat_interval),
            ..CpOptions::default()
        })
        .unwrap();

        let registry = Arc::new(RaftNodeRegistry::new(RaftNodeRegistryConfig {
            logger: self.logger.clone(),
            local: member.clone(),
            options: raft_options(self.knobs.snapshot_every),
            transport: self.network.transport_for(member.id.clone()),
            state_machine_factory: CpStateMachine::factory(self.logger.clone(), cp_options),
        }));
        self.network.register(registry.clone());
        registry
    }

    fn registry(&self, id: &ReplicaId) -> Arc<RaftNodeRegistry> {
        self.network.member(id).expect("Member isn't running")
    }

    fn others(&self, id: &ReplicaId) -> Vec<RaftEndpoint> {
        self.members.iter().filter(|m| &m.id != id).cloned().collect()
    }

    fn client(&self, name: &str) -> CpClient {
        self.client_with_timeout(name, Duration::from_secs(20))
    }

    fn client_with_timeout(&self, name: &str, invocation_timeout: Duration) -> CpClient {
        let client = CpClient::new(CpClientConfig {
            logger: self.logger.clone(),
            name: name.to_string(),
            transport: self.network.client_transport(),
            options: InvocationOptionsValidated::try_from(InvocationOptions {
                invocation_timeout: Some(invocation_timeout),
                ..InvocationOptions::default()
            })
            .unwrap(),
        });
        client.register_group(self.group_id.clone(), self.members.clone());
        client
    }

    async fn reports(&self) -> Vec<RaftNodeReport> {
        let mut reports = Vec::new();
        for member in self.members.iter() {
            if let Some(registry) = self.network.member(&member.id) {
                if let Ok(report) = registry.report(&self.group_id).await {
                    reports.push(report);
                }
            }
        }
        reports
    }

    async fn wait_for_leader(&self, timeout: Duration) -> RaftEndpoint {
        self.wait_for_leader_among(&self.members, timeout).await
    }

    /// Waits for a leader that a majority of `candidates` agrees on.
    async fn wait_for_leader_among(&self, candidates: &[RaftEndpoint], timeout: Duration) -> RaftEndpoint {
        let deadline = Instant::now() + timeout;
        loop {
            let reports: Vec<_> = self
                .reports()
                .await
                .into_iter()
                .filter(|r| candidates.iter().any(|c| c.id == r.local.id))
                .collect();
            let leader = reports
                .iter()
                .filter(|r| r.role == RaftRole::Leader)
                .max_by_key(|r| r.term.as_u64());
            if let Some(leader) = leader {
                let followers = reports
                    .iter()
                    .filter(|r| r.local.id != leader.local.id && r.term == leader.term)
                    .filter(|r| r.leader.as_ref().map(|l| &l.id) == Some(&leader.local.id))
                    .count();
                if followers + 1 > self.members.len() / 2 {
                    return leader.local.clone();
                }
            }

            assert!(Instant::now() < deadline, "Timeout waiting for leader election");
            sleep(Duration::from_millis(20)).await;
        }
    }

    /// Waits until every running member applied the same prefix of the same log.
    async fn wait_for_convergence(&self, timeout: Duration) -> Vec<RaftNodeReport> {
        let deadline = Instant::now() + timeout;
        loop {
            let reports = self.reports().await;
            let converged = reports.windows(2).all(|pair| {
                pair[0].last_applied == pair[1].last_applied
                    && pair[0].last_log_index == pair[1].last_log_index
                    && pair[0].commit_index == pair[1].commit_index
            });
            if converged && !reports.is_empty() {
                return reports;
            }

            assert!(Instant::now() < deadline, "Timeout waiting for convergence: {:?}", reports);
            sleep(Duration::from_millis(20)).await;
        }
    }
}

fn raft_options(snapshot_every: u64) -> RaftOptionsValidated {
    RaftOptionsValidated::try_from(RaftOptions {
        leader_heartbeat_duration: Some(Duration::from_millis(50)),
        follower_min_timeout: Some(Duration::from_millis(200)),
        follower_max_timeout: Some(Duration::from_millis(400)),
        leader_append_entries_timeout: Some(Duration::from_millis(100)),
        housekeeping_interval: Some(Duration::from_millis(50)),
        commit_index_advance_count_to_snapshot: Some(snapshot_every),
        ..RaftOptions::default()
    })
    .unwrap()
}

fn endpoint(i: usize) -> RaftEndpoint {
    RaftEndpoint::new(format!("replica-{}", i + 1), format!("127.0.0.1:{}", 4000 + i))
}

fn create_root_logger_for_stdout(test_name: String) -> slog::Logger {
    let decorator = slog_term::TermDecorator::new().build();
    let drain = slog_term::FullFormat::new(decorator).use_file_location().build().fuse();
    let drain = slog_async::Async::new(drain).build().fuse();

    slog::Logger::root(drain, slog::o!("Test" => test_name))
}

async fn sleep(duration: Duration) {
    tokio::time::sleep(duration).await;
}
