//! 映射索引与寄存器镜像缓存。

pub mod cache;
pub mod index;
pub mod service;

pub use cache::{CachedData, RegisterCache};
pub use index::{AddressBinding, MappingIndex, RebuildSummary};
pub use service::{ForwardLogHandler, MappingError, MappingService};
