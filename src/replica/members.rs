use crate::commitlog::Index;
use serde::{Deserialize, Serialize};
use std::fmt;

/// ReplicaId uniquely identifies a participant across every group it is a member of.
#[derive(Clone, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
pub struct ReplicaId(String);

impl ReplicaId {
    pub fn new<S: Into<String>>(id: S) -> Self {
        ReplicaId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_inner(self) -> String {
        self.0
    }
}

impl fmt::Debug for ReplicaId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// RaftEndpoint is a member's identity plus the address its transport listens on.
#[derive(Clone, Debug, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct RaftEndpoint {
    pub id: ReplicaId,
    pub address: String,
}

impl RaftEndpoint {
    pub fn new<I: Into<String>, A: Into<String>>(id: I, address: A) -> Self {
        RaftEndpoint {
            id: ReplicaId::new(id),
            address: address.into(),
        }
    }
}

/// RaftGroupId names a consensus group. The seed tells apart groups re-created under the same name.
#[derive(Clone, Debug, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
pub struct RaftGroupId {
    pub name: String,
    pub seed: u64,
}

impl RaftGroupId {
    pub fn new<S: Into<String>>(name: S, seed: u64) -> Self {
        RaftGroupId { name: name.into(), seed }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum MembershipChangeMode {
    Add,
    Remove,
}

/// RaftGroupMembers is an immutable view of the group's membership, effective from log `index`
/// onward. Membership changes produce a new instance.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RaftGroupMembers {
    index: Index,
    members: Vec<RaftEndpoint>,
}

impl RaftGroupMembers {
    pub fn new(index: Index, members: Vec<RaftEndpoint>) -> Self {
        let mut deduped: Vec<RaftEndpoint> = Vec::with_capacity(members.len());
        for member in members {
            if !deduped.iter().any(|m| m.id == member.id) {
                deduped.push(member);
            }
        }

        RaftGroupMembers {
            index,
            members: deduped,
        }
    }

    pub fn index(&self) -> Index {
        self.index
    }

    pub fn members(&self) -> &[RaftEndpoint] {
        &self.members
    }

    /// Every member except `local`.
    pub fn remote_members<'a>(&'a self, local: &'a ReplicaId) -> impl Iterator<Item = &'a RaftEndpoint> + 'a {
        self.members.iter().filter(move |m| &m.id != local)
    }

    pub fn size(&self) -> usize {
        self.members.len()
    }

    pub fn majority(&self) -> usize {
        self.members.len() / 2 + 1
    }

    pub fn contains(&self, id: &ReplicaId) -> bool {
        self.members.iter().any(|m| &m.id == id)
    }

    pub fn member(&self, id: &ReplicaId) -> Option<&RaftEndpoint> {
        self.members.iter().find(|m| &m.id == id)
    }

    /// Builds the membership that results from applying `mode` for `member` at log `index`.
    pub(crate) fn apply_change(&self, index: Index, member: &RaftEndpoint, mode: MembershipChangeMode) -> Self {
        let mut members = self.members.clone();
        match mode {
            MembershipChangeMode::Add => members.push(member.clone()),
            MembershipChangeMode::Remove => members.retain(|m| m.id != member.id),
        }

        RaftGroupMembers::new(index, members)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn endpoints(n: usize) -> Vec<RaftEndpoint> {
        (0..n)
            .map(|i| RaftEndpoint::new(format!("m{}", i), format!("127.0.0.1:{}", 7000 + i)))
            .collect()
    }

    #[test]
    fn majority() {
        for (size, majority) in vec![(1, 1), (2, 2), (3, 2), (4, 3), (5, 3), (6, 4), (7, 4)] {
            let members = RaftGroupMembers::new(Index::ZERO, endpoints(size));
            assert_eq!(members.majority(), majority, "size {}", size);
        }
    }

    #[test]
    fn duplicate_members_are_collapsed() {
        let mut list = endpoints(3);
        list.push(list[0].clone());

        let members = RaftGroupMembers::new(Index::ZERO, list);

        assert_eq!(members.size(), 3);
    }

    #[test]
    fn remote_members_excludes_local() {
        let members = RaftGroupMembers::new(Index::ZERO, endpoints(3));
        let local = ReplicaId::new("m1");

        let remote: Vec<_> = members.remote_members(&local).map(|m| m.id.as_str()).collect();

        assert_eq!(remote, vec!["m0", "m2"]);
    }

    #[test]
    fn apply_change_produces_new_instance() {
        let initial = RaftGroupMembers::new(Index::ZERO, endpoints(3));
        let new_member = RaftEndpoint::new("m9", "127.0.0.1:7009");

        let added = initial.apply_change(Index::new(5), &new_member, MembershipChangeMode::Add);
        assert_eq!(added.index(), Index::new(5));
        assert_eq!(added.size(), 4);
        assert_eq!(added.majority(), 3);
        assert_eq!(initial.size(), 3);

        let removed = added.apply_change(Index::new(8), &new_member, MembershipChangeMode::Remove);
        assert_eq!(removed.members(), initial.members());
        assert_eq!(removed.index(), Index::new(8));
    }
}
