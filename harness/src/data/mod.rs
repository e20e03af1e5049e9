pub mod dataloader;
pub mod dataset;
pub mod sampler;

pub use dataloader::DataLoader;
pub use dataset::{BatchRef, Dataset, InMemoryDataset, Sample};
pub use sampler::{PartitionSkew, ShardSampler};
