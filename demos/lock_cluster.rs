use cp_raft::{
    shutdown_signal, CpClient, CpClientConfig, CpOptions, CpOptionsValidated, CpStateMachine, GrpcTransport,
    InvocationOptions, InvocationOptionsValidated, RaftEndpoint, RaftGroupId, RaftNodeRegistry,
    RaftNodeRegistryConfig, RaftOptions, RaftOptionsValidated, ReplicaId, RpcServer,
};
use slog::Drain;
use std::convert::TryFrom;
use std::error::Error;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

/// Runs a 3 member CP group over gRPC on localhost and has two clients take turns on a fenced lock.
#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let logger = create_root_logger();
    let group_id = RaftGroupId::new("default", 0);
    let members: Vec<RaftEndpoint> = (0..3)
        .map(|i| RaftEndpoint::new(format!("replica-{}", i + 1), format!("127.0.0.1:{}", 7021 + i)))
        .collect();

    let mut shutdown_handles = Vec::new();
    let mut registries = Vec::new();
    for member in members.iter() {
        let registry = Arc::new(RaftNodeRegistry::new(RaftNodeRegistryConfig {
            logger: logger.clone(),
            local: member.clone(),
            options: RaftOptionsValidated::try_from(RaftOptions {
                leader_heartbeat_duration: Some(Duration::from_millis(100)),
                follower_min_timeout: Some(Duration::from_millis(500)),
                follower_max_timeout: Some(Duration::from_millis(1500)),
                ..RaftOptions::default()
            })?,
            transport: Arc::new(GrpcTransport::new(logger.clone(), member.id.clone())),
            state_machine_factory: CpStateMachine::factory(
                logger.clone(),
                CpOptionsValidated::try_from(CpOptions::default())?,
            ),
        }));
        registry.create_group(group_id.clone(), members.clone())?;

        let (handle, signal) = shutdown_signal();
        let socket_addr: SocketAddr = member.address.parse()?;
        tokio::spawn(RpcServer::new(logger.clone(), registry.clone()).run(socket_addr, signal));

        shutdown_handles.push(handle);
        registries.push(registry);
    }

    let alice = create_client(&logger, "alice", &group_id, &members)?;
    let bob = create_client(&logger, "bob", &group_id, &members)?;

    let alice_lock = alice.lock(&group_id, "orders");
    let bob_lock = bob.lock(&group_id, "orders");
    let counter = alice.atomic_long(&group_id, "orders-processed");

    let first_fence = alice_lock.lock().await?;
    counter.increment_and_get().await?;
    slog::info!(logger, "alice holds the lock with fence {}", first_fence);

    let bob_task = tokio::spawn(async move { bob_lock.lock().await.map(|fence| (fence, bob_lock)) });
    tokio::time::sleep(Duration::from_millis(200)).await;
    alice_lock.unlock().await?;

    let (second_fence, bob_lock) = bob_task.await??;
    slog::info!(logger, "bob holds the lock with fence {}", second_fence);
    assert!(second_fence > first_fence);
    bob.atomic_long(&group_id, "orders-processed").increment_and_get().await?;
    bob_lock.unlock().await?;

    let permits = alice.semaphore(&group_id, "workers");
    permits.init(2).await?;
    permits.acquire(2).await?;
    slog::info!(logger, "available permits: {}", permits.available_permits().await?);
    permits.release(2).await?;

    slog::info!(logger, "orders processed: {}", counter.get().await?);

    alice.shutdown().await;
    bob.shutdown().await;
    for registry in registries.iter() {
        registry.shutdown().await;
    }
    drop(shutdown_handles);

    Ok(())
}

fn create_client(
    logger: &slog::Logger,
    name: &str,
    group_id: &RaftGroupId,
    members: &[RaftEndpoint],
) -> Result<CpClient, Box<dyn Error>> {
    let client = CpClient::new(CpClientConfig {
        logger: logger.clone(),
        name: name.to_string(),
        transport: Arc::new(GrpcTransport::new(logger.clone(), ReplicaId::new(name))),
        options: InvocationOptionsValidated::try_from(InvocationOptions::default())?,
    });
    client.register_group(group_id.clone(), members.to_vec());
    Ok(client)
}

fn create_root_logger() -> slog::Logger {
    let decorator = slog_term::TermDecorator::new().build();
    let drain = slog_term::FullFormat::new(decorator).build().fuse();
    let drain = slog_async::Async::new(drain).build().fuse();
    slog::Logger::root(drain, slog::o!())
}
