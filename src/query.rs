// Read-side helpers over a classified snapshot, plus the async catalog used
// by page handlers.

use crate::cache::{CacheError, SnapshotCache};
use crate::config::FeedConfig;
use crate::fetcher::{FetchError, HttpFeedFetcher};
use crate::pipeline::FeedPipeline;
use crate::record::{Classification, PropertyRecord};
use crate::region_map::{Region, RegionMap};
use serde::{Deserialize, Serialize};
use std::cmp::Reverse;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Records in `region`, in snapshot order.
pub fn filter_by_region(records: &[PropertyRecord], region: Region) -> Vec<&PropertyRecord> {
    records
        .iter()
        .filter(|r| r.region == Classification::Known(region))
        .collect()
}

pub fn inland(records: &[PropertyRecord]) -> Vec<&PropertyRecord> {
    records.iter().filter(|r| r.region.is_inland()).collect()
}

pub fn coastal(records: &[PropertyRecord]) -> Vec<&PropertyRecord> {
    records
        .iter()
        .filter(|r| r.region.region().is_some_and(|region| !region.is_inland()))
        .collect()
}

pub fn unclassified(records: &[PropertyRecord]) -> Vec<&PropertyRecord> {
    records.iter().filter(|r| !r.region.is_known()).collect()
}

/// Every record lands in exactly one bucket.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RegionPartition<'a> {
    pub inland: Vec<&'a PropertyRecord>,
    pub coastal: Vec<&'a PropertyRecord>,
    pub unclassified: Vec<&'a PropertyRecord>,
}

impl RegionPartition<'_> {
    pub fn total(&self) -> usize {
        self.inland.len() + self.coastal.len() + self.unclassified.len()
    }
}

pub fn partition(records: &[PropertyRecord]) -> RegionPartition<'_> {
    let mut result = RegionPartition::default();
    for record in records {
        match record.region {
            Classification::Known(region) if region.is_inland() => result.inland.push(record),
            Classification::Known(_) => result.coastal.push(record),
            Classification::Unclassified => result.unclassified.push(record),
        }
    }
    result
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PriceStats {
    pub min: u64,
    /// Mean rounded half-up to whole euros.
    pub avg: u64,
    /// Number of priced listings the figures are based on.
    pub count: usize,
}

/// Min and average over listings with a positive price. Listings without a
/// price are ignored; no priced listings gives all zeros.
pub fn price_stats<'a>(records: impl IntoIterator<Item = &'a PropertyRecord>) -> PriceStats {
    let mut min = u64::MAX;
    let mut sum: u128 = 0;
    let mut count: usize = 0;

    for price in records.into_iter().filter_map(PropertyRecord::listed_price) {
        min = min.min(price);
        sum += u128::from(price);
        count += 1;
    }

    if count == 0 {
        return PriceStats::default();
    }
    let n = count as u128;
    let avg = (2 * sum + n) / (2 * n);

    PriceStats {
        min,
        avg: u64::try_from(avg).unwrap_or(u64::MAX),
        count,
    }
}

/// How many listings a landing page features when the caller has no
/// preference.
pub const DEFAULT_FEATURED_LIMIT: usize = 6;

const FEATURED_PRICE_THRESHOLD: u64 = 300_000;

/// Highlight score: sea view 3, pool 2, golf view 2, garden 1, terrace 1,
/// more than five images 1 and a price above 300 000 another 1.
pub fn feature_score(record: &PropertyRecord) -> u32 {
    let mut score = 0;
    if record.has_pool() {
        score += 2;
    }
    if record.has_sea_view() {
        score += 3;
    }
    if record.has_golf_view() {
        score += 2;
    }
    if record.has_garden() {
        score += 1;
    }
    if record.has_terrace() {
        score += 1;
    }
    if record.images.len() > 5 {
        score += 1;
    }
    if record
        .listed_price()
        .is_some_and(|price| price > FEATURED_PRICE_THRESHOLD)
    {
        score += 1;
    }
    score
}

/// The `limit` highest-scoring records. Equal scores keep snapshot order.
pub fn featured(records: &[PropertyRecord], limit: usize) -> Vec<&PropertyRecord> {
    let mut ranked: Vec<&PropertyRecord> = records.iter().collect();
    ranked.sort_by_key(|record| Reverse(feature_score(record)));
    ranked.truncate(limit);
    ranked
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SearchCriteria {
    /// Case-insensitive substring of the town.
    pub town_contains: Option<String>,
    /// Case-insensitive substring of the normalized property type.
    pub property_type_contains: Option<String>,
    pub min_bedrooms: Option<u32>,
    pub max_bedrooms: Option<u32>,
    pub min_price: Option<u64>,
    pub max_price: Option<u64>,
    pub region: Option<Region>,
    pub require_pool: bool,
    pub require_sea_view: bool,
    pub require_golf_view: bool,
}

fn contains_ignore_case(haystack: &str, needle: &str) -> bool {
    haystack.to_lowercase().contains(&needle.to_lowercase())
}

impl SearchCriteria {
    pub fn matches(&self, record: &PropertyRecord) -> bool {
        if !self
            .town_contains
            .as_ref()
            .map_or(true, |needle| contains_ignore_case(&record.town, needle))
        {
            return false;
        }

        if !self
            .property_type_contains
            .as_ref()
            .map_or(true, |needle| contains_ignore_case(&record.property_type, needle))
        {
            return false;
        }

        // A bound on a field the listing lacks excludes it.
        if self.min_bedrooms.is_some() || self.max_bedrooms.is_some() {
            let Some(beds) = record.bedrooms else {
                return false;
            };
            if self.min_bedrooms.is_some_and(|min| beds < min)
                || self.max_bedrooms.is_some_and(|max| beds > max)
            {
                return false;
            }
        }

        if self.min_price.is_some() || self.max_price.is_some() {
            let Some(price) = record.listed_price() else {
                return false;
            };
            if self.min_price.is_some_and(|min| price < min)
                || self.max_price.is_some_and(|max| price > max)
            {
                return false;
            }
        }

        if !self
            .region
            .map_or(true, |region| record.region == Classification::Known(region))
        {
            return false;
        }

        if self.require_pool && !record.has_pool() {
            return false;
        }
        if self.require_sea_view && !record.has_sea_view() {
            return false;
        }
        if self.require_golf_view && !record.has_golf_view() {
            return false;
        }

        true
    }
}

pub fn search<'a>(records: &'a [PropertyRecord], criteria: &SearchCriteria) -> Vec<&'a PropertyRecord> {
    records.iter().filter(|r| criteria.matches(r)).collect()
}

pub fn find_by_reference<'a>(records: &'a [PropertyRecord], reference: &str) -> Option<&'a PropertyRecord> {
    let reference = reference.trim();
    records
        .iter()
        .find(|r| r.reference.eq_ignore_ascii_case(reference))
}

/// Listings per town, keyed by the town as the feed spells it.
pub fn count_by_town(records: &[PropertyRecord]) -> BTreeMap<&str, usize> {
    let mut counts = BTreeMap::new();
    for record in records {
        *counts.entry(record.town.as_str()).or_insert(0) += 1;
    }
    counts
}

/// Distinct towns, sorted.
pub fn towns(records: &[PropertyRecord]) -> Vec<&str> {
    count_by_town(records).into_keys().collect()
}

fn owned<'a>(records: impl IntoIterator<Item = &'a PropertyRecord>) -> Vec<PropertyRecord> {
    records.into_iter().cloned().collect()
}

/// Async entry point for callers: every method reads through the snapshot
/// cache and hands back owned records.
#[derive(Clone)]
pub struct PropertyCatalog {
    cache: Arc<SnapshotCache>,
}

impl PropertyCatalog {
    pub fn new(cache: Arc<SnapshotCache>) -> Self {
        Self { cache }
    }

    /// HTTP-backed catalog using the built-in Region Map.
    pub fn from_config(config: &FeedConfig) -> Result<Self, FetchError> {
        let fetcher = HttpFeedFetcher::new(config.fetch.clone())?;
        let pipeline = FeedPipeline::new(
            Arc::new(fetcher),
            config.feed_urls.clone(),
            Arc::new(RegionMap::builtin()),
        )
        .with_options(config.pipeline.clone());
        let cache = SnapshotCache::new(pipeline, config.cache.clone());
        Ok(Self::new(Arc::new(cache)))
    }

    pub fn cache(&self) -> &Arc<SnapshotCache> {
        &self.cache
    }

    pub async fn fetch_inland_properties(&self) -> Result<Vec<PropertyRecord>, CacheError> {
        let snapshot = self.cache.get_snapshot().await?;
        Ok(owned(inland(&snapshot.records)))
    }

    pub async fn properties_in_region(&self, region: Region) -> Result<Vec<PropertyRecord>, CacheError> {
        let snapshot = self.cache.get_snapshot().await?;
        Ok(owned(filter_by_region(&snapshot.records, region)))
    }

    pub async fn all_properties(&self) -> Result<Vec<PropertyRecord>, CacheError> {
        let snapshot = self.cache.get_snapshot().await?;
        Ok(snapshot.records.clone())
    }

    pub async fn property_by_reference(&self, reference: &str) -> Result<Option<PropertyRecord>, CacheError> {
        let snapshot = self.cache.get_snapshot().await?;
        Ok(find_by_reference(&snapshot.records, reference).cloned())
    }

    pub async fn search(&self, criteria: &SearchCriteria) -> Result<Vec<PropertyRecord>, CacheError> {
        let snapshot = self.cache.get_snapshot().await?;
        Ok(owned(search(&snapshot.records, criteria)))
    }

    pub async fn inland_price_stats(&self) -> Result<PriceStats, CacheError> {
        let snapshot = self.cache.get_snapshot().await?;
        Ok(price_stats(inland(&snapshot.records)))
    }

    pub async fn featured_properties(&self, limit: usize) -> Result<Vec<PropertyRecord>, CacheError> {
        let snapshot = self.cache.get_snapshot().await?;
        Ok(owned(featured(&snapshot.records, limit)))
    }
}
