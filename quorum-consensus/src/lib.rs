pub mod raft;

pub use raft::{
    ApplyMsg, FilePersister, MemoryPersister, Persister, RaftNode, RaftRole, Status, Submitted,
    Transport,
};
