// Region Classifier: stamps each record with the region of its town.

use crate::record::{Classification, PropertyRecord};
use crate::region_map::RegionMap;
use serde::Serialize;
use std::collections::BTreeMap;
use tracing::{debug, warn};

/// A listing whose town is missing from the Region Map. Collected so the map
/// can be extended as new developments appear.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UnmatchedTown {
    pub town: String,
    pub reference: String,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Classified {
    pub records: Vec<PropertyRecord>,
    pub unmatched: Vec<UnmatchedTown>,
}

impl Classified {
    /// Unmatched towns with the number of listings each, sorted by town.
    pub fn unmatched_counts(&self) -> BTreeMap<&str, usize> {
        let mut counts = BTreeMap::new();
        for entry in &self.unmatched {
            *counts.entry(entry.town.as_str()).or_insert(0) += 1;
        }
        counts
    }
}

pub fn classify_one(record: &PropertyRecord, map: &RegionMap) -> PropertyRecord {
    let mut classified = record.clone();
    classified.region = Classification::from(map.lookup(&record.town));
    classified
}

/// Classify every record against `map`. The input is left untouched and the
/// output keeps its order. A miss yields `Unclassified` plus a report entry.
pub fn classify(records: &[PropertyRecord], map: &RegionMap) -> Classified {
    let mut result = Classified {
        records: Vec::with_capacity(records.len()),
        unmatched: Vec::new(),
    };

    for record in records {
        let classified = classify_one(record, map);
        if !classified.region.is_known() {
            debug!(reference = %record.reference, town = %record.town, "town not in region map");
            result.unmatched.push(UnmatchedTown {
                town: record.town.clone(),
                reference: record.reference.clone(),
            });
        }
        result.records.push(classified);
    }

    for (town, listings) in result.unmatched_counts() {
        warn!(town, listings, map_version = map.version(), "unmatched town");
    }
    result
}
