// Region Map: curated town -> region table for the listings feed.
//
// Keys are stored normalized (see `normalize_town_key`), so a lookup only has
// to normalize the incoming town once. The table is expected to be incomplete;
// a miss is a valid answer, not an error.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use unicode_normalization::char::is_combining_mark;
use unicode_normalization::UnicodeNormalization;

/// Version of the built-in town table. Bump when towns are added or moved.
pub const REGION_MAP_VERSION: &str = "2025.2";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Region {
    CostaBlancaNorth,
    CostaBlancaNorthInland,
    CostaBlancaSouth,
    CostaBlancaSouthInland,
    CostaCalida,
    CostaCalidaInland,
}

/// Every valid region tag, in display order.
pub const REGIONS: [Region; 6] = Region::ALL;

impl Region {
    pub const ALL: [Region; 6] = [
        Region::CostaBlancaNorth,
        Region::CostaBlancaNorthInland,
        Region::CostaBlancaSouth,
        Region::CostaBlancaSouthInland,
        Region::CostaCalida,
        Region::CostaCalidaInland,
    ];

    pub fn tag(self) -> &'static str {
        match self {
            Region::CostaBlancaNorth => "costa-blanca-north",
            Region::CostaBlancaNorthInland => "costa-blanca-north-inland",
            Region::CostaBlancaSouth => "costa-blanca-south",
            Region::CostaBlancaSouthInland => "costa-blanca-south-inland",
            Region::CostaCalida => "costa-calida",
            Region::CostaCalidaInland => "costa-calida-inland",
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Region::CostaBlancaNorth => "Costa Blanca North",
            Region::CostaBlancaNorthInland => "Costa Blanca North Inland",
            Region::CostaBlancaSouth => "Costa Blanca South",
            Region::CostaBlancaSouthInland => "Costa Blanca South Inland",
            Region::CostaCalida => "Costa Calida",
            Region::CostaCalidaInland => "Costa Calida Inland",
        }
    }

    pub fn short_label(self) -> &'static str {
        match self {
            Region::CostaBlancaNorth => "CB North",
            Region::CostaBlancaNorthInland => "CB North Inland",
            Region::CostaBlancaSouth => "CB South",
            Region::CostaBlancaSouthInland => "CB South Inland",
            Region::CostaCalida => "Costa Calida",
            Region::CostaCalidaInland => "CC Inland",
        }
    }

    pub fn description(self) -> &'static str {
        match self {
            Region::CostaBlancaNorth => {
                "From Denia to Benidorm - dramatic coastline, established resorts"
            }
            Region::CostaBlancaNorthInland => {
                "Jalon Valley, Polop, La Nucia - mountain and valley living"
            }
            Region::CostaBlancaSouth => {
                "From Torrevieja to Pilar de la Horadada - sunny beaches, golf"
            }
            Region::CostaBlancaSouthInland => {
                "Vega Baja region - Algorfa, Rojales, best value for money"
            }
            Region::CostaCalida => "Mar Menor, La Manga - warm waters, Spanish feel",
            Region::CostaCalidaInland => "Murcia region - Torre Pacheco, authentic rural Spain",
        }
    }

    pub fn is_inland(self) -> bool {
        matches!(
            self,
            Region::CostaBlancaNorthInland
                | Region::CostaBlancaSouthInland
                | Region::CostaCalidaInland
        )
    }

    pub fn inland() -> impl Iterator<Item = Region> {
        Region::ALL.into_iter().filter(|r| r.is_inland())
    }
}

impl fmt::Display for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Unknown region tag: {0}")]
pub struct UnknownRegion(pub String);

impl FromStr for Region {
    type Err = UnknownRegion;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_lowercase();
        Region::ALL
            .into_iter()
            .find(|r| r.tag() == wanted)
            .ok_or_else(|| UnknownRegion(s.to_string()))
    }
}

/// Normalize a free-text town into a lookup key: trim, lowercase, strip
/// diacritics and collapse internal whitespace.
pub fn normalize_town_key(town: &str) -> String {
    let folded: String = town
        .nfd()
        .filter(|c| !is_combining_mark(*c))
        .flat_map(char::to_lowercase)
        .collect();
    folded.split_whitespace().collect::<Vec<_>>().join(" ")
}

use Region::*;

const TOWN_REGIONS: &[(&str, Region)] = &[
    // Costa Blanca North, coastal
    ("denia", CostaBlancaNorth),
    ("javea", CostaBlancaNorth),
    ("xabia", CostaBlancaNorth),
    ("moraira", CostaBlancaNorth),
    ("teulada", CostaBlancaNorth),
    ("benissa", CostaBlancaNorth),
    ("calpe", CostaBlancaNorth),
    ("altea", CostaBlancaNorth),
    ("alfaz del pi", CostaBlancaNorth),
    ("albir", CostaBlancaNorth),
    ("benidorm", CostaBlancaNorth),
    ("villajoyosa", CostaBlancaNorth),
    ("benitachell", CostaBlancaNorth),
    ("cumbre del sol", CostaBlancaNorth),
    // Costa Blanca North, inland
    ("jalon", CostaBlancaNorthInland),
    ("xalo", CostaBlancaNorthInland),
    ("lliber", CostaBlancaNorthInland),
    ("parcent", CostaBlancaNorthInland),
    ("murla", CostaBlancaNorthInland),
    ("alcalali", CostaBlancaNorthInland),
    ("pedreguer", CostaBlancaNorthInland),
    ("ondara", CostaBlancaNorthInland),
    ("gata de gorgos", CostaBlancaNorthInland),
    ("polop", CostaBlancaNorthInland),
    ("la nucia", CostaBlancaNorthInland),
    ("relleu", CostaBlancaNorthInland),
    ("finestrat", CostaBlancaNorthInland),
    ("sella", CostaBlancaNorthInland),
    ("orxeta", CostaBlancaNorthInland),
    ("callosa d'en sarria", CostaBlancaNorthInland),
    ("callosa den sarria", CostaBlancaNorthInland),
    ("tarbena", CostaBlancaNorthInland),
    ("benigembla", CostaBlancaNorthInland),
    // Costa Blanca South, coastal
    ("torrevieja", CostaBlancaSouth),
    ("orihuela costa", CostaBlancaSouth),
    ("punta prima", CostaBlancaSouth),
    ("playa flamenca", CostaBlancaSouth),
    ("la zenia", CostaBlancaSouth),
    ("cabo roig", CostaBlancaSouth),
    ("campoamor", CostaBlancaSouth),
    ("pilar de la horadada", CostaBlancaSouth),
    ("mil palmeras", CostaBlancaSouth),
    ("torre de la horadada", CostaBlancaSouth),
    ("guardamar del segura", CostaBlancaSouth),
    ("santa pola", CostaBlancaSouth),
    ("gran alacant", CostaBlancaSouth),
    ("alicante", CostaBlancaSouth),
    // Costa Blanca South, inland (Vega Baja)
    ("algorfa", CostaBlancaSouthInland),
    ("la finca", CostaBlancaSouthInland),
    ("la finca golf", CostaBlancaSouthInland),
    ("rojales", CostaBlancaSouthInland),
    ("benijofar", CostaBlancaSouthInland),
    ("formentera del segura", CostaBlancaSouthInland),
    ("formentera", CostaBlancaSouthInland),
    ("san fulgencio", CostaBlancaSouthInland),
    ("daya nueva", CostaBlancaSouthInland),
    ("daya vieja", CostaBlancaSouthInland),
    ("almoradi", CostaBlancaSouthInland),
    ("catral", CostaBlancaSouthInland),
    ("dolores", CostaBlancaSouthInland),
    ("bigastro", CostaBlancaSouthInland),
    ("jacarilla", CostaBlancaSouthInland),
    ("benejuzar", CostaBlancaSouthInland),
    ("redovan", CostaBlancaSouthInland),
    ("callosa de segura", CostaBlancaSouthInland),
    ("cox", CostaBlancaSouthInland),
    ("rafal", CostaBlancaSouthInland),
    ("benferri", CostaBlancaSouthInland),
    ("san miguel de salinas", CostaBlancaSouthInland),
    ("las salinas", CostaBlancaSouthInland),
    ("los montesinos", CostaBlancaSouthInland),
    ("orihuela", CostaBlancaSouthInland),
    ("ciudad quesada", CostaBlancaSouthInland),
    ("vistabella", CostaBlancaSouthInland),
    ("vistabella golf", CostaBlancaSouthInland),
    ("villamartin", CostaBlancaSouthInland),
    ("las ramblas", CostaBlancaSouthInland),
    ("campoamor golf", CostaBlancaSouthInland),
    ("las colinas", CostaBlancaSouthInland),
    // Costa Calida, coastal (Mar Menor)
    ("san javier", CostaCalida),
    ("san pedro del pinatar", CostaCalida),
    ("santiago de la ribera", CostaCalida),
    ("los alcazares", CostaCalida),
    ("la manga", CostaCalida),
    ("la manga del mar menor", CostaCalida),
    ("los urrutias", CostaCalida),
    ("los nietos", CostaCalida),
    ("mar de cristal", CostaCalida),
    ("playa honda", CostaCalida),
    ("cartagena", CostaCalida),
    ("mazarron", CostaCalida),
    ("puerto de mazarron", CostaCalida),
    ("aguilas", CostaCalida),
    // Costa Calida, inland (Murcia)
    ("torre pacheco", CostaCalidaInland),
    ("sucina", CostaCalidaInland),
    ("roldan", CostaCalidaInland),
    ("balsicas", CostaCalidaInland),
    ("fuente alamo", CostaCalidaInland),
    ("alhama de murcia", CostaCalidaInland),
    ("totana", CostaCalidaInland),
    ("librilla", CostaCalidaInland),
    ("mula", CostaCalidaInland),
    ("murcia", CostaCalidaInland),
];

// Alternative spellings folded onto a canonical town key.
const TOWN_ALIASES: &[(&str, &str)] = &[
    ("javea xabia", "javea"),
    ("jávea xàbia", "javea"),
    ("alfas del pi", "alfaz del pi"),
    ("l'alfas del pi", "alfaz del pi"),
    ("lalfas del pi", "alfaz del pi"),
    ("moraira_teulada", "moraira"),
    ("moraira-teulada", "moraira"),
    ("moraira teulada", "moraira"),
    ("teulada-moraira", "moraira"),
    ("teulada moraira", "moraira"),
    ("calp", "calpe"),
    ("guardamar", "guardamar del segura"),
    ("orihuela-costa", "orihuela costa"),
    ("san miguel", "san miguel de salinas"),
    ("montesinos", "los montesinos"),
    ("quesada", "ciudad quesada"),
];

const ALLOWED_PROVINCES: &[&str] = &["alicante", "alacant", "murcia"];
const EXCLUDED_PROVINCES: &[&str] = &["almeria", "granada", "malaga"];
const EXCLUDED_TOWNS: &[&str] = &[
    "vera",
    "mojacar",
    "garrucha",
    "carboneras",
    "nijar",
    "almeria",
    "roquetas",
    "aguadulce",
    "almerimar",
    "macenas",
    "desert springs",
    "palomares",
    "cuevas",
    "pulpi",
    "san juan de los terreros",
];

/// Immutable town lookup table.
#[derive(Debug, Clone)]
pub struct RegionMap {
    version: String,
    towns: HashMap<String, Region>,
    aliases: HashMap<String, String>,
}

impl Default for RegionMap {
    fn default() -> Self {
        Self::builtin()
    }
}

impl RegionMap {
    /// The curated table shipped with the crate.
    pub fn builtin() -> Self {
        Self::from_entries(
            REGION_MAP_VERSION,
            TOWN_REGIONS.iter().copied(),
            TOWN_ALIASES.iter().copied(),
        )
    }

    /// Build a map from arbitrary entries. Keys are normalized on insert; on a
    /// repeated key the first entry is kept.
    pub fn from_entries<'a>(
        version: &str,
        towns: impl IntoIterator<Item = (&'a str, Region)>,
        aliases: impl IntoIterator<Item = (&'a str, &'a str)>,
    ) -> Self {
        let mut town_map = HashMap::new();
        for (town, region) in towns {
            town_map.entry(normalize_town_key(town)).or_insert(region);
        }
        let mut alias_map = HashMap::new();
        for (alias, canonical) in aliases {
            alias_map
                .entry(normalize_town_key(alias))
                .or_insert_with(|| normalize_town_key(canonical));
        }

        Self {
            version: version.to_string(),
            towns: town_map,
            aliases: alias_map,
        }
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn len(&self) -> usize {
        self.towns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.towns.is_empty()
    }

    /// Resolve a raw town name. Aliases are applied first; a miss returns `None`.
    pub fn lookup(&self, town: &str) -> Option<Region> {
        let key = normalize_town_key(town);
        self.lookup_key(&key)
    }

    /// Same as `lookup` for a key that is already normalized.
    pub fn lookup_key(&self, key: &str) -> Option<Region> {
        if key.is_empty() {
            return None;
        }
        if let Some(canonical) = self.aliases.get(key) {
            if let Some(region) = self.towns.get(canonical) {
                return Some(*region);
            }
        }
        self.towns.get(key).copied()
    }

    /// Town keys mapped to `region`, sorted.
    pub fn towns_in(&self, region: Region) -> Vec<&str> {
        let mut towns: Vec<&str> = self
            .towns
            .iter()
            .filter(|(_, r)| **r == region)
            .map(|(town, _)| town.as_str())
            .collect();
        towns.sort_unstable();
        towns
    }

    pub fn is_excluded_town(&self, town: &str) -> bool {
        let key = normalize_town_key(town);
        EXCLUDED_TOWNS.iter().any(|t| key.contains(t))
    }

    pub fn is_excluded_province(&self, province: &str) -> bool {
        let key = normalize_town_key(province);
        EXCLUDED_PROVINCES.iter().any(|p| key.contains(p))
    }

    /// Whether a listing belongs to the area the site covers. Listings with an
    /// unknown province and an unmapped town are kept so they show up in the
    /// unmatched-town report instead of disappearing.
    pub fn is_in_target_area(&self, province: Option<&str>, town: &str) -> bool {
        if province.is_some_and(|p| self.is_excluded_province(p)) || self.is_excluded_town(town) {
            return false;
        }
        match province.map(normalize_town_key) {
            Some(p) if !p.is_empty() => {
                ALLOWED_PROVINCES.iter().any(|allowed| p.contains(allowed))
                    || self.lookup(town).is_some()
            }
            _ => true,
        }
    }
}
