mod apply;
mod membership;
mod node;
mod replication;
mod voting;

#[cfg(test)]
mod test_utils;

pub(crate) use node::RaftNode;
pub(crate) use node::RaftNodeConfig;
