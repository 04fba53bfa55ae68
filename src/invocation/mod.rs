mod manager;
mod uid;

pub use manager::InvocationPolicy;
pub use manager::RaftInvocationManager;
pub use uid::InvocationUid;
