// Property feed ingestion: fetch listing feeds, classify each listing into a
// coastal or inland region and serve cached snapshots to page handlers.

pub mod cache;
pub mod classifier;
pub mod config;
pub mod fetcher;
pub mod format;
pub mod parser;
pub mod pipeline;
pub mod query;
pub mod record;
pub mod region_map;

// Re-export key types for convenience
pub use cache::{CacheError, CacheStatsReport, FeedSnapshot, SnapshotCache};
pub use classifier::{classify, Classified, UnmatchedTown};
pub use config::{ConfigError, FeedConfig};
pub use fetcher::{FeedSource, FetchError, HttpFeedFetcher};
pub use format::{format_price, format_price_or_poa, Locale};
pub use parser::{parse, ParseError, ParseOutcome, ParseWarning};
pub use pipeline::{FeedError, FeedPipeline, PipelineOptions};
pub use query::{featured, feature_score, price_stats, PriceStats, PropertyCatalog, SearchCriteria};
pub use record::{attach_ai_content, Classification, PropertyRecord};
pub use region_map::{Region, RegionMap, REGIONS, REGION_MAP_VERSION};
