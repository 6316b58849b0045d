// Canonical listing record produced by the parser and stamped by the classifier.

use crate::region_map::Region;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// Region assignment of a listing. `Unclassified` means the town is not in the
/// Region Map; it is a normal state, not an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Classification {
    Known(Region),
    #[default]
    Unclassified,
}

impl Classification {
    pub fn region(self) -> Option<Region> {
        match self {
            Classification::Known(region) => Some(region),
            Classification::Unclassified => None,
        }
    }

    pub fn is_known(self) -> bool {
        matches!(self, Classification::Known(_))
    }

    pub fn is_inland(self) -> bool {
        self.region().is_some_and(Region::is_inland)
    }
}

impl From<Option<Region>> for Classification {
    fn from(region: Option<Region>) -> Self {
        region.map_or(Classification::Unclassified, Classification::Known)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PropertyRecord {
    #[serde(rename = "ref")]
    pub reference: String,
    pub title: String,
    pub property_type: String,
    pub town: String,
    pub province: Option<String>,
    /// `None` is rendered as POA.
    pub price: Option<u64>,
    pub bedrooms: Option<u32>,
    pub bathrooms: Option<u32>,
    pub size: Option<u32>,
    pub plot_size: Option<u32>,
    pub images: Vec<String>,
    pub features: Vec<String>,
    pub description: Option<String>,
    pub new_build: bool,
    pub region: Classification,
    pub ai_content: Option<Value>,
}

impl PropertyRecord {
    /// Minimal record with every optional field empty.
    pub fn new(reference: impl Into<String>, town: impl Into<String>) -> Self {
        let town = town.into();
        Self {
            reference: reference.into(),
            title: format!("Property in {}", town),
            property_type: "Property".to_string(),
            town,
            province: None,
            price: None,
            bedrooms: None,
            bathrooms: None,
            size: None,
            plot_size: None,
            images: Vec::new(),
            features: Vec::new(),
            description: None,
            new_build: false,
            region: Classification::Unclassified,
            ai_content: None,
        }
    }

    pub fn with_price(mut self, price: Option<u64>) -> Self {
        self.price = price.filter(|p| *p > 0);
        self
    }

    pub fn with_region(mut self, region: Classification) -> Self {
        self.region = region;
        self
    }

    /// Price usable for aggregation, i.e. present and positive.
    pub fn listed_price(&self) -> Option<u64> {
        self.price.filter(|p| *p > 0)
    }

    pub fn main_image(&self) -> Option<&str> {
        self.images.first().map(String::as_str)
    }

    pub fn has_feature(&self, needle: &str) -> bool {
        let needle = needle.to_lowercase();
        self.features
            .iter()
            .any(|f| f.to_lowercase().contains(&needle))
    }

    pub fn has_pool(&self) -> bool {
        self.features_mention(&["pool", "piscina"])
    }

    pub fn has_sea_view(&self) -> bool {
        self.features_mention(&["sea view", "vista mar", "seaview"])
    }

    /// Golf plus a view keyword anywhere in the feature list, so
    /// "Golf course" next to "Mountain views" also counts.
    pub fn has_golf_view(&self) -> bool {
        let text = self.features_text();
        text.contains("golf") && (text.contains("view") || text.contains("vista"))
    }

    pub fn has_garden(&self) -> bool {
        self.features_mention(&["garden", "jardin"])
    }

    pub fn has_terrace(&self) -> bool {
        self.features_mention(&["terrace", "terraza"])
    }

    fn features_text(&self) -> String {
        self.features
            .iter()
            .map(|f| f.to_lowercase())
            .collect::<Vec<_>>()
            .join(" ")
    }

    fn features_mention(&self, keywords: &[&str]) -> bool {
        let text = self.features_text();
        keywords.iter().any(|k| text.contains(k))
    }
}

/// Attach enrichment payloads keyed by reference. Returns a new list; records
/// without an entry keep whatever they had. Payloads are forwarded untouched.
pub fn attach_ai_content(
    records: &[PropertyRecord],
    content: &HashMap<String, Value>,
) -> Vec<PropertyRecord> {
    records
        .iter()
        .map(|record| {
            let mut record = record.clone();
            if let Some(payload) = content.get(&record.reference) {
                record.ai_content = Some(payload.clone());
            }
            record
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use test_case::test_case;

    #[test]
    fn test_classification_serializes_as_nullable_tag() {
        let known = Classification::Known(Region::CostaCalida);
        assert_eq!(serde_json::to_value(known).unwrap(), json!("costa-calida"));
        assert_eq!(
            serde_json::to_value(Classification::Unclassified).unwrap(),
            Value::Null
        );

        let back: Classification = serde_json::from_value(json!("costa-calida")).unwrap();
        assert_eq!(back, known);
        let back: Classification = serde_json::from_value(Value::Null).unwrap();
        assert_eq!(back, Classification::Unclassified);
    }

    #[test]
    fn test_record_json_shape() {
        let record = PropertyRecord::new("N1234", "Algorfa")
            .with_price(Some(199_000))
            .with_region(Classification::Known(Region::CostaBlancaSouthInland));
        let value = serde_json::to_value(&record).unwrap();
        assert_eq!(value["ref"], json!("N1234"));
        assert_eq!(value["propertyType"], json!("Property"));
        assert_eq!(value["region"], json!("costa-blanca-south-inland"));
        assert_eq!(value["aiContent"], Value::Null);
    }

    #[test]
    fn test_zero_price_is_poa() {
        let record = PropertyRecord::new("A", "Rojales").with_price(Some(0));
        assert_eq!(record.price, None);
        assert_eq!(record.listed_price(), None);
    }

    #[test]
    fn test_attach_ai_content_is_pass_through() {
        let records = vec![
            PropertyRecord::new("A", "Rojales"),
            PropertyRecord::new("B", "Polop"),
        ];
        let mut content = HashMap::new();
        let payload = json!({"title": {"en": "Villa with a view"}, "anything": [1, 2, 3]});
        content.insert("B".to_string(), payload.clone());

        let enriched = attach_ai_content(&records, &content);
        assert_eq!(enriched[0].ai_content, None);
        assert_eq!(enriched[1].ai_content, Some(payload));
        // input untouched
        assert_eq!(records[1].ai_content, None);
    }

    #[test]
    fn test_has_feature_is_case_insensitive() {
        let mut record = PropertyRecord::new("A", "Rojales");
        record.features = vec!["Private Pool".to_string(), "Garden".to_string()];
        assert!(record.has_feature("pool"));
        assert!(!record.has_feature("sea view"));
    }

    #[test_case(&["Private Pool"], [true, false, false, false, false] ; "english pool")]
    #[test_case(&["Piscina comunitaria", "Terraza"], [true, false, false, false, true] ; "spanish pool and terrace")]
    #[test_case(&["Sea views", "Garden"], [false, true, false, true, false] ; "sea view and garden")]
    #[test_case(&["Vista mar", "Jardin"], [false, true, false, true, false] ; "spanish sea view and garden")]
    #[test_case(&["Golf course", "Mountain views"], [false, false, true, false, false] ; "golf with views")]
    #[test_case(&["Golf nearby"], [false, false, false, false, false] ; "golf without view")]
    #[test_case(&[], [false, false, false, false, false] ; "no features")]
    fn test_feature_flags(features: &[&str], expected: [bool; 5]) {
        let mut record = PropertyRecord::new("A", "Rojales");
        record.features = features.iter().map(|f| f.to_string()).collect();
        assert_eq!(
            [
                record.has_pool(),
                record.has_sea_view(),
                record.has_golf_view(),
                record.has_garden(),
                record.has_terrace(),
            ],
            expected
        );
    }
}
