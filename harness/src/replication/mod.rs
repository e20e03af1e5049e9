mod binder;
mod ddp;
mod replica;

pub use binder::ReplicationBinder;
pub use ddp::DistributedModel;
pub use replica::Replica;
