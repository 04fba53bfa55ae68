use tokio::time::Duration;

/// RaftOptions holds the per-group consensus tuning knobs. Unset values fall back to defaults when
/// validated into `RaftOptionsValidated`.
#[derive(Clone, Debug, Default)]
pub struct RaftOptions {
    pub leader_heartbeat_duration: Option<Duration>,
    pub follower_min_timeout: Option<Duration>,
    pub follower_max_timeout: Option<Duration>,
    pub leader_append_entries_timeout: Option<Duration>,
    /// A leader steps down if it can't reach a majority of followers within this duration.
    pub leader_quorum_timeout: Option<Duration>,
    pub append_request_max_entry_count: Option<usize>,
    pub commit_index_advance_count_to_snapshot: Option<u64>,
    pub uncommitted_entry_count_to_reject_new_appends: Option<u64>,
    pub append_nop_entry_on_leader_election: Option<bool>,
    pub housekeeping_interval: Option<Duration>,
    pub actor_queue_size: Option<usize>,
}

#[derive(Clone, Debug)]
pub struct RaftOptionsValidated {
    pub leader_heartbeat_duration: Duration,
    pub follower_min_timeout: Duration,
    pub follower_max_timeout: Duration,
    pub leader_append_entries_timeout: Duration,
    pub leader_quorum_timeout: Duration,
    pub append_request_max_entry_count: usize,
    pub commit_index_advance_count_to_snapshot: u64,
    pub uncommitted_entry_count_to_reject_new_appends: u64,
    pub append_nop_entry_on_leader_election: bool,
    pub housekeeping_interval: Duration,
    pub actor_queue_size: usize,
}

impl RaftOptionsValidated {
    fn validate(&self) -> Result<(), &'static str> {
        if self.leader_heartbeat_duration >= self.follower_min_timeout {
            return Err("Follower minimum timeout must be greater than leader's heartbeat");
        }
        if self.follower_min_timeout >= self.follower_max_timeout {
            return Err("Follower minimum timeout must be less than maximum timeout");
        }
        if self.leader_append_entries_timeout >= self.follower_min_timeout {
            return Err("Leader's AppendEntries RPC timeout must be less than the follower's heartbeat timeout");
        }
        if self.leader_quorum_timeout <= self.follower_max_timeout {
            return Err("Leader's quorum timeout must be greater than the follower's maximum timeout");
        }
        if self.append_request_max_entry_count == 0 {
            return Err("AppendEntries max entry count must be positive");
        }
        if self.commit_index_advance_count_to_snapshot == 0 {
            return Err("Snapshot commit index advance count must be positive");
        }
        if self.uncommitted_entry_count_to_reject_new_appends == 0 {
            return Err("Uncommitted entry count to reject new appends must be positive");
        }
        if self.housekeeping_interval == Duration::from_millis(0) {
            return Err("Housekeeping interval must be positive");
        }
        if self.actor_queue_size == 0 {
            return Err("Actor queue size must be positive");
        }

        Ok(())
    }
}

impl TryFrom<RaftOptions> for RaftOptionsValidated {
    type Error = &'static str;

    fn try_from(options: RaftOptions) -> Result<Self, Self::Error> {
        let follower_max_timeout = options.follower_max_timeout.unwrap_or(Duration::from_millis(1500));
        let values = RaftOptionsValidated {
            leader_heartbeat_duration: options.leader_heartbeat_duration.unwrap_or(Duration::from_millis(100)),
            follower_min_timeout: options.follower_min_timeout.unwrap_or(Duration::from_millis(500)),
            follower_max_timeout,
            leader_append_entries_timeout: options
                .leader_append_entries_timeout
                .unwrap_or(Duration::from_millis(300)),
            leader_quorum_timeout: options.leader_quorum_timeout.unwrap_or(follower_max_timeout * 2),
            append_request_max_entry_count: options.append_request_max_entry_count.unwrap_or(100),
            commit_index_advance_count_to_snapshot: options.commit_index_advance_count_to_snapshot.unwrap_or(1000),
            uncommitted_entry_count_to_reject_new_appends: options
                .uncommitted_entry_count_to_reject_new_appends
                .unwrap_or(200),
            append_nop_entry_on_leader_election: options.append_nop_entry_on_leader_election.unwrap_or(true),
            housekeeping_interval: options.housekeeping_interval.unwrap_or(Duration::from_millis(200)),
            actor_queue_size: options.actor_queue_size.unwrap_or(1024),
        };

        values.validate()?;
        Ok(values)
    }
}

/// CpOptions configures the session and lock services that run on top of each group.
#[derive(Clone, Debug, Default)]
pub struct CpOptions {
    pub session_ttl: Option<Duration>,
    pub session_heartbeat_interval: Option<Duration>,
    pub lock_reentrancy_limit: Option<u32>,
}

#[derive(Clone, Debug)]
pub struct CpOptionsValidated {
    pub session_ttl: Duration,
    pub session_heartbeat_interval: Duration,
    pub lock_reentrancy_limit: u32,
}

impl TryFrom<CpOptions> for CpOptionsValidated {
    type Error = &'static str;

    fn try_from(options: CpOptions) -> Result<Self, Self::Error> {
        let values = CpOptionsValidated {
            session_ttl: options.session_ttl.unwrap_or(Duration::from_secs(60)),
            session_heartbeat_interval: options.session_heartbeat_interval.unwrap_or(Duration::from_secs(5)),
            lock_reentrancy_limit: options.lock_reentrancy_limit.unwrap_or(u32::MAX),
        };

        if values.session_heartbeat_interval >= values.session_ttl {
            return Err("Session heartbeat interval must be less than session TTL");
        }
        if values.session_heartbeat_interval == Duration::from_millis(0) {
            return Err("Session heartbeat interval must be positive");
        }
        if values.lock_reentrancy_limit == 0 {
            return Err("Lock reentrancy limit must be positive");
        }

        Ok(values)
    }
}

/// InvocationOptions bounds how long the invocation layer keeps chasing a group's leader.
#[derive(Clone, Debug, Default)]
pub struct InvocationOptions {
    pub invocation_timeout: Option<Duration>,
    pub initial_retry_backoff: Option<Duration>,
    pub max_retry_backoff: Option<Duration>,
}

#[derive(Clone, Debug)]
pub struct InvocationOptionsValidated {
    pub invocation_timeout: Duration,
    pub initial_retry_backoff: Duration,
    pub max_retry_backoff: Duration,
}

impl TryFrom<InvocationOptions> for InvocationOptionsValidated {
    type Error = &'static str;

    fn try_from(options: InvocationOptions) -> Result<Self, Self::Error> {
        let values = InvocationOptionsValidated {
            invocation_timeout: options.invocation_timeout.unwrap_or(Duration::from_secs(60)),
            initial_retry_backoff: options.initial_retry_backoff.unwrap_or(Duration::from_millis(50)),
            max_retry_backoff: options.max_retry_backoff.unwrap_or(Duration::from_secs(1)),
        };

        if values.initial_retry_backoff == Duration::from_millis(0) {
            return Err("Initial retry backoff must be positive");
        }
        if values.initial_retry_backoff > values.max_retry_backoff {
            return Err("Initial retry backoff must not exceed the maximum retry backoff");
        }
        if values.invocation_timeout <= values.initial_retry_backoff {
            return Err("Invocation timeout must be greater than the retry backoff");
        }

        Ok(values)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raft_options_defaults_are_valid() {
        let validated = RaftOptionsValidated::try_from(RaftOptions::default()).unwrap();

        assert_eq!(validated.leader_quorum_timeout, validated.follower_max_timeout * 2);
        assert_eq!(validated.uncommitted_entry_count_to_reject_new_appends, 200);
        assert!(validated.append_nop_entry_on_leader_election);
    }

    #[test]
    fn raft_options_reject_heartbeat_slower_than_election() {
        let options = RaftOptions {
            leader_heartbeat_duration: Some(Duration::from_millis(600)),
            ..RaftOptions::default()
        };

        assert!(RaftOptionsValidated::try_from(options).is_err());
    }

    #[test]
    fn raft_options_reject_zero_counts() {
        let options = RaftOptions {
            append_request_max_entry_count: Some(0),
            ..RaftOptions::default()
        };
        assert!(RaftOptionsValidated::try_from(options).is_err());

        let options = RaftOptions {
            commit_index_advance_count_to_snapshot: Some(0),
            ..RaftOptions::default()
        };
        assert!(RaftOptionsValidated::try_from(options).is_err());
    }

    #[test]
    fn cp_options_heartbeat_must_be_below_ttl() {
        let options = CpOptions {
            session_ttl: Some(Duration::from_secs(1)),
            session_heartbeat_interval: Some(Duration::from_secs(1)),
            ..CpOptions::default()
        };

        assert!(CpOptionsValidated::try_from(options).is_err());
    }
}
