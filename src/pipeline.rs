// Refresh chain: fetch every configured feed, parse, merge, filter to the
// covered area and classify. Produces the material for one snapshot.

use crate::classifier::{classify, UnmatchedTown};
use crate::fetcher::{FeedSource, FetchError};
use crate::parser::{parse, ParseError, ParseWarning};
use crate::record::PropertyRecord;
use crate::region_map::RegionMap;
use futures::future::join_all;
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FeedError {
    #[error("No feed URLs configured")]
    NoSources,

    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error(transparent)]
    Parse(#[from] ParseError),

    #[error("All {} feed sources failed: {}", .0.len(), .0.join("; "))]
    AllSourcesFailed(Vec<String>),
}

#[derive(Debug, Clone)]
pub struct PipelineOptions {
    /// Drop listings outside the covered provinces/towns before classifying.
    pub exclude_out_of_area: bool,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            exclude_out_of_area: true,
        }
    }
}

/// Outcome of one source within a refresh.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SourceReport {
    pub url: String,
    /// Records contributed after cross-feed deduplication.
    pub records: usize,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PipelineOutput {
    pub records: Vec<PropertyRecord>,
    pub unmatched: Vec<UnmatchedTown>,
    pub warnings: Vec<ParseWarning>,
    pub sources: Vec<SourceReport>,
    pub excluded: usize,
}

pub struct FeedPipeline {
    source: Arc<dyn FeedSource>,
    urls: Vec<String>,
    region_map: Arc<RegionMap>,
    options: PipelineOptions,
}

impl FeedPipeline {
    pub fn new(source: Arc<dyn FeedSource>, urls: Vec<String>, region_map: Arc<RegionMap>) -> Self {
        Self {
            source,
            urls,
            region_map,
            options: PipelineOptions::default(),
        }
    }

    pub fn with_options(mut self, options: PipelineOptions) -> Self {
        self.options = options;
        self
    }

    pub fn urls(&self) -> &[String] {
        &self.urls
    }

    pub fn region_map(&self) -> &RegionMap {
        &self.region_map
    }

    /// Run the full chain once. Feeds are fetched concurrently and merged in
    /// configured order, so on a reference collision the earlier feed wins.
    /// A failing feed is reported and skipped; the run fails only when every
    /// feed failed.
    pub async fn run(&self) -> Result<PipelineOutput, FeedError> {
        if self.urls.is_empty() {
            return Err(FeedError::NoSources);
        }

        let fetches = self.urls.iter().map(|url| self.source.fetch(url));
        let bodies = join_all(fetches).await;

        let mut output = PipelineOutput::default();
        let mut failures: Vec<FeedError> = Vec::new();
        let mut seen: HashSet<String> = HashSet::new();
        let mut merged: Vec<PropertyRecord> = Vec::new();

        for (url, body) in self.urls.iter().zip(bodies) {
            let parsed = body
                .map_err(FeedError::from)
                .and_then(|bytes| parse(&bytes).map_err(FeedError::from));

            let outcome = match parsed {
                Ok(outcome) => outcome,
                Err(err) => {
                    warn!(url = %url, error = %err, "feed source failed");
                    output.sources.push(SourceReport {
                        url: url.clone(),
                        records: 0,
                        error: Some(err.to_string()),
                    });
                    failures.push(err);
                    continue;
                }
            };

            output.warnings.extend(outcome.warnings);
            let mut contributed = 0;
            for record in outcome.records {
                if seen.insert(record.reference.to_uppercase()) {
                    merged.push(record);
                    contributed += 1;
                } else {
                    output.warnings.push(ParseWarning::DuplicateReference {
                        reference: record.reference,
                    });
                }
            }
            output.sources.push(SourceReport {
                url: url.clone(),
                records: contributed,
                error: None,
            });
        }

        if failures.len() == self.urls.len() {
            return Err(match failures.len() {
                1 => failures.remove(0),
                _ => FeedError::AllSourcesFailed(failures.iter().map(|e| e.to_string()).collect()),
            });
        }

        if self.options.exclude_out_of_area {
            let before = merged.len();
            merged.retain(|record| {
                self.region_map
                    .is_in_target_area(record.province.as_deref(), &record.town)
            });
            output.excluded = before - merged.len();
        }

        let classified = classify(&merged, &self.region_map);
        output.records = classified.records;
        output.unmatched = classified.unmatched;

        info!(
            records = output.records.len(),
            unmatched = output.unmatched.len(),
            excluded = output.excluded,
            warnings = output.warnings.len(),
            failed_sources = failures.len(),
            "feed pipeline finished"
        );
        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetcher::mock_source::{MockFeedSource, SAMPLE_FEED};
    use crate::record::Classification;
    use crate::region_map::Region;

    const SECOND_FEED: &str = r#"<root>
        <listing><reference>CB-001</reference><town>Algorfa</town><price>1</price></listing>
        <listing><reference>BP-900</reference><town>Pedreguer</town><price>410000</price></listing>
    </root>"#;

    fn pipeline(source: Arc<MockFeedSource>, urls: &[&str]) -> FeedPipeline {
        FeedPipeline::new(
            source,
            urls.iter().map(|u| u.to_string()).collect(),
            Arc::new(RegionMap::builtin()),
        )
    }

    #[tokio::test]
    async fn test_run_classifies_and_filters() {
        let source = Arc::new(MockFeedSource::new(SAMPLE_FEED));
        let output = pipeline(source.clone(), &["https://feeds.test/main.xml"])
            .run()
            .await
            .unwrap();

        assert_eq!(source.fetch_count(), 1);
        // Vera (Almería) is outside the covered area
        assert_eq!(output.excluded, 1);
        assert!(output.records.iter().all(|r| r.town != "Vera"));

        let algorfa = output.records.iter().find(|r| r.reference == "CB-001").unwrap();
        assert_eq!(
            algorfa.region,
            Classification::Known(Region::CostaBlancaSouthInland)
        );
        assert_eq!(
            output.unmatched,
            vec![UnmatchedTown {
                town: "Gandia".to_string(),
                reference: "CB-008".to_string()
            }]
        );
        assert_eq!(output.sources.len(), 1);
        assert_eq!(output.sources[0].error, None);
    }

    #[tokio::test]
    async fn test_run_without_area_filter_keeps_everything() {
        let source = Arc::new(MockFeedSource::new(SAMPLE_FEED));
        let output = pipeline(source, &["https://feeds.test/main.xml"])
            .with_options(PipelineOptions {
                exclude_out_of_area: false,
            })
            .run()
            .await
            .unwrap();
        assert_eq!(output.excluded, 0);
        assert!(output.records.iter().any(|r| r.town == "Vera"));
    }

    #[tokio::test]
    async fn test_merge_first_feed_wins() {
        let source = Arc::new(MockFeedSource::new(SAMPLE_FEED));
        source.set_url_body("https://feeds.test/second.xml", SECOND_FEED);
        let output = pipeline(
            source.clone(),
            &["https://feeds.test/main.xml", "https://feeds.test/second.xml"],
        )
        .run()
        .await
        .unwrap();

        assert_eq!(source.fetch_count(), 2);
        let cb001: Vec<_> = output.records.iter().filter(|r| r.reference == "CB-001").collect();
        assert_eq!(cb001.len(), 1);
        assert_eq!(cb001[0].price, Some(189_000));
        assert!(output.records.iter().any(|r| r.reference == "BP-900"));
        assert!(output.warnings.contains(&ParseWarning::DuplicateReference {
            reference: "CB-001".to_string()
        }));
        assert_eq!(output.sources[1].records, 1);
    }

    #[tokio::test]
    async fn test_merge_matches_references_across_case() {
        let source = Arc::new(MockFeedSource::new(SAMPLE_FEED));
        source.set_url_body(
            "https://feeds.test/second.xml",
            r#"<root><property><ref>cb-003</ref><town>Rojales</town><price>1</price></property></root>"#,
        );
        let output = pipeline(
            source.clone(),
            &["https://feeds.test/main.xml", "https://feeds.test/second.xml"],
        )
        .run()
        .await
        .unwrap();

        let polop: Vec<_> = output
            .records
            .iter()
            .filter(|r| r.reference.eq_ignore_ascii_case("CB-003"))
            .collect();
        assert_eq!(polop.len(), 1);
        assert_eq!(polop[0].town, "Polop");
        assert!(output.warnings.contains(&ParseWarning::DuplicateReference {
            reference: "cb-003".to_string()
        }));
        assert_eq!(output.sources[1].records, 0);
    }

    #[tokio::test]
    async fn test_one_failing_feed_is_skipped() {
        let source = Arc::new(MockFeedSource::new(SAMPLE_FEED));
        source.set_url_failure(
            "https://feeds.test/second.xml",
            FetchError::Timeout(5000),
        );
        let output = pipeline(
            source,
            &["https://feeds.test/main.xml", "https://feeds.test/second.xml"],
        )
        .run()
        .await
        .unwrap();

        assert!(!output.records.is_empty());
        assert_eq!(output.sources[1].records, 0);
        assert!(output.sources[1].error.is_some());
    }

    #[tokio::test]
    async fn test_single_malformed_feed_is_fatal() {
        let source = Arc::new(MockFeedSource::new("<kyero><property>"));
        let err = pipeline(source, &["https://feeds.test/main.xml"])
            .run()
            .await
            .unwrap_err();
        assert!(matches!(err, FeedError::Parse(ParseError::MalformedXml(_))));
    }

    #[tokio::test]
    async fn test_all_feeds_failing() {
        let source = Arc::new(MockFeedSource::failing(FetchError::NetworkError(
            "connection refused".to_string(),
        )));
        let err = pipeline(source, &["https://a.test/feed.xml", "https://b.test/feed.xml"])
            .run()
            .await
            .unwrap_err();
        match err {
            FeedError::AllSourcesFailed(errors) => assert_eq!(errors.len(), 2),
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_no_sources() {
        let source = Arc::new(MockFeedSource::new(SAMPLE_FEED));
        let err = pipeline(source, &[]).run().await.unwrap_err();
        assert_eq!(err, FeedError::NoSources);
    }
}
