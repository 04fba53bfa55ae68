mod registry;

pub use registry::RaftNodeRegistry;
pub use registry::RaftNodeRegistryConfig;
pub use registry::StateMachineFactory;
