mod init_method;
mod process_group;
mod rendezvous;

pub use init_method::InitMethod;
pub use process_group::{GroupOptions, GroupPhase, ProcessGroup};
pub use rendezvous::RendezvousServer;
