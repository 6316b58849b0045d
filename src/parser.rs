// Feed parsing and field normalization.
//
// The upstream schema is not ours, so the parser walks raw XML events instead
// of deserializing into a fixed shape: unknown elements are ignored, repeated
// elements do not fail the document, and each listing is salvaged field by
// field. Only a document that is not well-formed XML is rejected.

use crate::record::{Classification, PropertyRecord};
use crate::region_map::normalize_town_key;
use quick_xml::escape::{resolve_predefined_entity, unescape};
use quick_xml::events::Event;
use quick_xml::reader::Reader;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::fmt;
use thiserror::Error;
use tracing::debug;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("Malformed XML: {0}")]
    MalformedXml(String),

    #[error("Encoding error: {0}")]
    Encoding(String),
}

/// Recoverable problem found while parsing a single listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ParseWarning {
    /// Listing at `index` (0-based, document order) has no reference; skipped.
    MissingReference { index: usize },
    /// Listing has no town; skipped.
    MissingTown { reference: String },
    /// A later listing reused a reference; the later one was dropped.
    DuplicateReference { reference: String },
    /// A numeric field was present but unusable; the field was nulled.
    InvalidNumber {
        reference: String,
        field: &'static str,
        value: String,
    },
}

impl fmt::Display for ParseWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParseWarning::MissingReference { index } => {
                write!(f, "listing #{} has no reference", index)
            }
            ParseWarning::MissingTown { reference } => {
                write!(f, "listing {} has no town", reference)
            }
            ParseWarning::DuplicateReference { reference } => {
                write!(f, "duplicate reference {}", reference)
            }
            ParseWarning::InvalidNumber {
                reference,
                field,
                value,
            } => write!(f, "listing {}: invalid {} {:?}", reference, field, value),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParseOutcome {
    pub records: Vec<PropertyRecord>,
    pub warnings: Vec<ParseWarning>,
}

const LISTING_ELEMENTS: &[&str] = &["property", "listing"];

const REFERENCE_FIELDS: &[&str] = &["id", "ref", "reference"];
const TITLE_FIELDS: &[&str] = &["title", "name"];
const TYPE_FIELDS: &[&str] = &["type", "property_type"];
const TOWN_FIELDS: &[&str] = &["town", "location", "city"];
const PROVINCE_FIELDS: &[&str] = &["province"];
const PRICE_FIELDS: &[&str] = &["price"];
const BEDROOM_FIELDS: &[&str] = &["beds", "bedrooms"];
const BATHROOM_FIELDS: &[&str] = &["baths", "bathrooms"];
const SIZE_FIELDS: &[&str] = &["built", "built_size", "size", "surface_area"];
const PLOT_FIELDS: &[&str] = &["plot", "plot_size"];
const DESCRIPTION_FIELDS: &[&str] = &["desc.en", "description", "desc"];

// Checked in order, so more specific keywords come first.
const PROPERTY_TYPES: &[(&str, &str)] = &[
    ("penthouse", "Penthouse"),
    ("atico", "Penthouse"),
    ("semi-detached", "Semi-Detached"),
    ("semi detached", "Semi-Detached"),
    ("townhouse", "Townhouse"),
    ("town house", "Townhouse"),
    ("terraced", "Townhouse"),
    ("adosado", "Townhouse"),
    ("bungalow", "Bungalow"),
    ("duplex", "Duplex"),
    ("studio", "Studio"),
    ("apartment", "Apartment"),
    ("apartamento", "Apartment"),
    ("flat", "Apartment"),
    ("piso", "Apartment"),
    ("villa", "Villa"),
    ("detached", "Villa"),
    ("chalet", "Villa"),
    ("country house", "Country House"),
    ("finca", "Country House"),
    ("land", "Land"),
    ("plot", "Land"),
    ("terreno", "Land"),
];

/// Map a free-text property type onto the site's categories. Unknown types
/// pass through trimmed; an empty type becomes "Property".
pub fn normalize_property_type(raw: &str) -> String {
    let key = normalize_town_key(raw);
    if key.is_empty() {
        return "Property".to_string();
    }
    PROPERTY_TYPES
        .iter()
        .find(|(keyword, _)| key.contains(keyword))
        .map(|(_, label)| label.to_string())
        .unwrap_or_else(|| raw.trim().to_string())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Coerced {
    Value(u64),
    NoDigits,
    Overflow,
}

/// Integer coercion used for price, size and room counts: every non-digit is
/// stripped before parsing. A trailing decimal fraction of one or two digits
/// ("250000.00", "99,5") is dropped first so it does not get folded into the
/// integer part; three-digit groups stay thousands separators.
pub fn coerce_integer(raw: &str) -> Coerced {
    let trimmed = raw.trim();
    let integer_part = match trimmed.rfind(['.', ',']) {
        Some(pos) => {
            let fraction = &trimmed[pos + 1..];
            let has_leading_digits = trimmed[..pos].chars().any(|c| c.is_ascii_digit());
            if has_leading_digits
                && (1..=2).contains(&fraction.len())
                && fraction.chars().all(|c| c.is_ascii_digit())
            {
                &trimmed[..pos]
            } else {
                trimmed
            }
        }
        None => trimmed,
    };

    let digits: String = integer_part.chars().filter(char::is_ascii_digit).collect();
    if digits.is_empty() {
        return Coerced::NoDigits;
    }
    digits
        .parse::<u64>()
        .map_or(Coerced::Overflow, Coerced::Value)
}

// One open element inside a listing.
#[derive(Debug)]
struct Frame {
    name: String,
    text: String,
    has_children: bool,
}

impl Frame {
    fn new(name: String) -> Self {
        Self {
            name,
            text: String::new(),
            has_children: false,
        }
    }
}

// Collects the leaves of one listing element while the reader walks it.
#[derive(Debug)]
struct ListingNode {
    depth: usize,
    frames: Vec<Frame>,
    fields: HashMap<String, String>,
    images: Vec<String>,
    features: Vec<String>,
}

impl ListingNode {
    fn new(name: String, depth: usize) -> Self {
        Self {
            depth,
            frames: vec![Frame::new(name)],
            fields: HashMap::new(),
            images: Vec::new(),
            features: Vec::new(),
        }
    }

    fn open(&mut self, name: String) {
        self.mark_child();
        self.frames.push(Frame::new(name));
    }

    fn mark_child(&mut self) {
        if let Some(top) = self.frames.last_mut() {
            top.has_children = true;
        }
    }

    fn push_text(&mut self, text: &str) {
        if let Some(top) = self.frames.last_mut() {
            top.text.push_str(text);
        }
    }

    fn close(&mut self) {
        let Some(frame) = self.frames.pop() else {
            return;
        };
        let value = frame.text.trim();
        if frame.has_children || value.is_empty() {
            return;
        }
        let parent = self.frames.last().map(|f| f.name.as_str()).unwrap_or("");

        match (parent, frame.name.as_str()) {
            ("image" | "photo", "url") | (_, "image" | "photo") => {
                self.images.push(value.to_string())
            }
            (_, "feature") => self.features.push(value.to_string()),
            ("desc", lang) => {
                let key = format!("desc.{}", lang);
                self.fields.entry(key).or_insert_with(|| value.to_string());
            }
            (_, name) => {
                self.fields
                    .entry(name.to_string())
                    .or_insert_with(|| value.to_string());
            }
        }
    }

    fn field(&self, names: &[&str]) -> Option<&str> {
        names
            .iter()
            .filter_map(|name| self.fields.get(*name))
            .map(|value| value.as_str())
            .find(|value| !value.is_empty())
    }

    fn number(
        &self,
        names: &[&str],
        label: &'static str,
        reference: &str,
        warnings: &mut Vec<ParseWarning>,
    ) -> Option<u64> {
        let raw = self.field(names)?;
        match coerce_integer(raw) {
            Coerced::Value(value) => Some(value),
            Coerced::NoDigits | Coerced::Overflow => {
                warnings.push(ParseWarning::InvalidNumber {
                    reference: reference.to_string(),
                    field: label,
                    value: raw.to_string(),
                });
                None
            }
        }
    }

    fn small_number(
        &self,
        names: &[&str],
        label: &'static str,
        reference: &str,
        warnings: &mut Vec<ParseWarning>,
    ) -> Option<u32> {
        let value = self.number(names, label, reference, warnings)?;
        match u32::try_from(value) {
            Ok(value) => Some(value),
            Err(_) => {
                warnings.push(ParseWarning::InvalidNumber {
                    reference: reference.to_string(),
                    field: label,
                    value: value.to_string(),
                });
                None
            }
        }
    }

    fn into_record(self, index: usize, warnings: &mut Vec<ParseWarning>) -> Option<PropertyRecord> {
        let Some(reference) = self.field(REFERENCE_FIELDS).map(str::to_string) else {
            warnings.push(ParseWarning::MissingReference { index });
            return None;
        };
        let Some(town) = self.field(TOWN_FIELDS).map(str::to_string) else {
            warnings.push(ParseWarning::MissingTown { reference });
            return None;
        };

        let property_type = normalize_property_type(self.field(TYPE_FIELDS).unwrap_or_default());
        let title = self
            .field(TITLE_FIELDS)
            .map(str::to_string)
            .unwrap_or_else(|| format!("{} in {}", property_type, town));
        let price = self
            .number(PRICE_FIELDS, "price", &reference, warnings)
            .filter(|p| *p > 0);
        let bedrooms = self.small_number(BEDROOM_FIELDS, "bedrooms", &reference, warnings);
        let bathrooms = self.small_number(BATHROOM_FIELDS, "bathrooms", &reference, warnings);
        let size = self.small_number(SIZE_FIELDS, "size", &reference, warnings);
        let plot_size = self.small_number(PLOT_FIELDS, "plot_size", &reference, warnings);
        let new_build = self
            .field(&["new_build"])
            .is_some_and(|v| matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes"));

        Some(PropertyRecord {
            title,
            property_type,
            province: self.field(PROVINCE_FIELDS).map(str::to_string),
            price,
            bedrooms,
            bathrooms,
            size,
            plot_size,
            description: self.field(DESCRIPTION_FIELDS).map(str::to_string),
            new_build,
            region: Classification::Unclassified,
            ai_content: None,
            images: self.images,
            features: self.features,
            reference,
            town,
        })
    }
}

fn element_name(raw: &[u8]) -> String {
    String::from_utf8_lossy(raw).to_ascii_lowercase()
}

fn malformed<R>(reader: &Reader<R>, err: impl fmt::Display) -> ParseError {
    ParseError::MalformedXml(format!(
        "error at position {}: {}",
        reader.error_position(),
        err
    ))
}

/// Parse a raw feed document into records plus recoverable warnings.
///
/// Deterministic: the same bytes always produce the same output. Listings
/// sharing a reference, compared case-insensitively, keep the first
/// occurrence.
pub fn parse(raw: &[u8]) -> Result<ParseOutcome, ParseError> {
    let mut reader = Reader::from_reader(raw);
    let mut buf = Vec::new();

    let mut open_elements: Vec<String> = Vec::new();
    let mut saw_root = false;
    let mut current: Option<ListingNode> = None;
    let mut listing_index = 0usize;

    let mut outcome = ParseOutcome::default();
    let mut seen: HashSet<String> = HashSet::new();

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => {
                saw_root = true;
                let name = element_name(e.local_name().as_ref());
                open_elements.push(name.clone());
                match current.as_mut() {
                    Some(node) => node.open(name),
                    None if LISTING_ELEMENTS.contains(&name.as_str()) => {
                        current = Some(ListingNode::new(name, open_elements.len()));
                    }
                    None => {}
                }
            }
            Ok(Event::Empty(e)) => {
                saw_root = true;
                let name = element_name(e.local_name().as_ref());
                match current.as_mut() {
                    Some(node) => node.mark_child(),
                    None if LISTING_ELEMENTS.contains(&name.as_str()) => {
                        outcome.warnings.push(ParseWarning::MissingReference { index: listing_index });
                        listing_index += 1;
                    }
                    None => {}
                }
            }
            Ok(Event::End(_)) => {
                let depth = open_elements.len();
                open_elements.pop();
                let finished = current.as_ref().is_some_and(|node| node.depth == depth);
                if finished {
                    if let Some(node) = current.take() {
                        let index = listing_index;
                        listing_index += 1;
                        if let Some(record) = node.into_record(index, &mut outcome.warnings) {
                            if seen.insert(record.reference.to_uppercase()) {
                                outcome.records.push(record);
                            } else {
                                outcome.warnings.push(ParseWarning::DuplicateReference {
                                    reference: record.reference,
                                });
                            }
                        }
                    }
                } else if let Some(node) = current.as_mut() {
                    node.close();
                }
            }
            Ok(Event::Text(t)) => {
                if let Some(node) = current.as_mut() {
                    let decoded = reader
                        .decoder()
                        .decode(&t)
                        .map_err(|e| ParseError::Encoding(e.to_string()))?;
                    let text = unescape(&decoded).map_err(|e| malformed(&reader, e))?;
                    node.push_text(&text);
                }
            }
            Ok(Event::CData(c)) => {
                if let Some(node) = current.as_mut() {
                    let text = reader
                        .decoder()
                        .decode(&c)
                        .map_err(|e| ParseError::Encoding(e.to_string()))?;
                    node.push_text(&text);
                }
            }
            Ok(Event::GeneralRef(r)) => {
                if let Some(node) = current.as_mut() {
                    if let Some(ch) = r.resolve_char_ref().map_err(|e| malformed(&reader, e))? {
                        node.push_text(ch.encode_utf8(&mut [0u8; 4]));
                    } else {
                        let entity = reader
                            .decoder()
                            .decode(&r)
                            .map_err(|e| ParseError::Encoding(e.to_string()))?;
                        match resolve_predefined_entity(&entity) {
                            Some(resolved) => node.push_text(resolved),
                            None => node.push_text(&format!("&{};", entity)),
                        }
                    }
                }
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(malformed(&reader, e)),
            _ => (),
        }
        buf.clear();
    }

    if let Some(unclosed) = open_elements.last() {
        return Err(ParseError::MalformedXml(format!(
            "unexpected end of document, <{}> is not closed",
            unclosed
        )));
    }
    if !saw_root {
        return Err(ParseError::MalformedXml(
            "document has no root element".to_string(),
        ));
    }

    for warning in &outcome.warnings {
        debug!(%warning, "feed listing warning");
    }
    Ok(outcome)
}
