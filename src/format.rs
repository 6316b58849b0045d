// Locale-aware EUR price formatting for listing cards and stats.

use serde::{Deserialize, Serialize};
use std::str::FromStr;
use thiserror::Error;

/// Label shown when a listing has no price.
pub const POA_LABEL: &str = "POA";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Locale {
    #[default]
    English,
    Norwegian,
    Swedish,
    German,
    French,
    Dutch,
    Polish,
    Russian,
    Spanish,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Unsupported locale: {0}")]
pub struct UnsupportedLocale(pub String);

impl FromStr for Locale {
    type Err = UnsupportedLocale;

    fn from_str(tag: &str) -> Result<Self, Self::Err> {
        let normalized = tag.trim().replace('_', "-").to_ascii_lowercase();
        let language = normalized.split('-').next().unwrap_or_default();
        match language {
            "en" => Ok(Locale::English),
            "no" | "nb" | "nn" => Ok(Locale::Norwegian),
            "sv" => Ok(Locale::Swedish),
            "de" => Ok(Locale::German),
            "fr" => Ok(Locale::French),
            "nl" => Ok(Locale::Dutch),
            "pl" => Ok(Locale::Polish),
            "ru" => Ok(Locale::Russian),
            "es" => Ok(Locale::Spanish),
            _ => Err(UnsupportedLocale(tag.to_string())),
        }
    }
}

impl Locale {
    /// Parse a locale tag, falling back to English for anything unknown.
    pub fn from_tag_or_default(tag: &str) -> Self {
        tag.parse().unwrap_or_default()
    }

    fn style(self) -> NumberStyle {
        match self {
            Locale::English => NumberStyle {
                group: ',',
                layout: Layout::SymbolFirst,
            },
            Locale::Dutch => NumberStyle {
                group: '.',
                layout: Layout::SymbolFirstSpaced,
            },
            Locale::German | Locale::Spanish => NumberStyle {
                group: '.',
                layout: Layout::SymbolLast,
            },
            Locale::Norwegian
            | Locale::Swedish
            | Locale::French
            | Locale::Polish
            | Locale::Russian => NumberStyle {
                group: ' ',
                layout: Layout::SymbolLast,
            },
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Layout {
    SymbolFirst,
    SymbolFirstSpaced,
    SymbolLast,
}

#[derive(Debug, Clone, Copy)]
struct NumberStyle {
    group: char,
    layout: Layout,
}

fn group_digits(amount: u64, separator: char) -> String {
    let digits = amount.to_string();
    let mut grouped = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, digit) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            grouped.push(separator);
        }
        grouped.push(digit);
    }
    grouped
}

/// Format a whole-euro amount, e.g. `€250,000` (English) or `250 000 €`
/// (Norwegian). Pure: depends only on its arguments.
pub fn format_price(amount: u64, locale: Locale) -> String {
    let style = locale.style();
    let number = group_digits(amount, style.group);
    match style.layout {
        Layout::SymbolFirst => format!("€{}", number),
        Layout::SymbolFirstSpaced => format!("€ {}", number),
        Layout::SymbolLast => format!("{} €", number),
    }
}

pub fn format_price_or_poa(price: Option<u64>, locale: Locale) -> String {
    match price {
        Some(amount) if amount > 0 => format_price(amount, locale),
        _ => POA_LABEL.to_string(),
    }
}
