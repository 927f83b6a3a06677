pub mod regions;
pub mod shard;

pub use regions::assign_snps;
pub use regions::partition_regions;
pub use regions::read_feature_file;
pub use regions::read_snp_file;
pub use regions::Region;
pub use regions::RegionChunk;
pub use regions::RegionInput;
pub use regions::Snp;

pub use shard::merge_shards;
pub use shard::CountShardWriter;
pub use shard::StreamPaths;
