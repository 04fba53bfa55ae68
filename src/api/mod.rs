mod codec;
mod error;
mod options;

pub use codec::decode;
pub use codec::encode;
pub use error::RaftError;
pub use options::CpOptions;
pub use options::CpOptionsValidated;
pub use options::InvocationOptions;
pub use options::InvocationOptionsValidated;
pub use options::RaftOptions;
pub use options::RaftOptionsValidated;
