// Raft replica: log, RPC types, election/replication state machine and its async driver
pub mod apply;
pub mod log;
pub mod node;
pub mod persist;
pub mod replication;
pub mod rpc;
pub mod state;
pub mod timer;
pub mod transport;

pub use apply::ApplyMsg;
pub use node::{RaftNode, Submitted};
pub use persist::{FilePersister, MemoryPersister, PersistentState, Persister};
pub use state::{RaftRole, Status};
pub use transport::Transport;
