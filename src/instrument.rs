use std::{collections::HashMap, str::FromStr};

use serde::{Deserialize, Serialize};

/// Reference data for one trading pair: base/quote.
///
/// Decimals are optional here because they come from an external reference-data
/// source; settlement refuses to guess when they are missing.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct PairSpec {
    /// The usual string code, e.g. "MBTC-MUSDT"
    pub id: String,
    /// The asset you buy or sell
    pub base: String,
    /// The asset you pay or receive
    pub quote: String,
    #[serde(default)]
    pub base_decimals: Option<u32>,
    #[serde(default)]
    pub quote_decimals: Option<u32>,
}

impl PairSpec {
    pub fn new(base: &str, quote: &str, base_decimals: u32, quote_decimals: u32) -> Self {
        PairSpec {
            id: format!("{base}-{quote}"),
            base: base.to_string(),
            quote: quote.to_string(),
            base_decimals: Some(base_decimals),
            quote_decimals: Some(quote_decimals),
        }
    }

    /// Returns the usual string code, e.g "MBTC-MUSDT"
    pub fn code(&self) -> &str {
        &self.id
    }
}

impl FromStr for PairSpec {
    type Err = String;
    /// Parses `BASE-QUOTE` without decimals.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (base, quote) = s
            .split_once('-')
            .ok_or_else(|| format!("malformed pair code: `{s}`"))?;
        let valid = |a: &str| !a.is_empty() && a.chars().all(|c| c.is_ascii_alphanumeric());
        if !valid(base) || !valid(quote) {
            return Err(format!("malformed pair code: `{s}`"));
        }
        Ok(PairSpec {
            id: s.to_string(),
            base: base.to_string(),
            quote: quote.to_string(),
            base_decimals: None,
            quote_decimals: None,
        })
    }
}

/// Supported pairs, keyed by code.
#[derive(Debug, Clone, Default)]
pub struct PairRegistry {
    pairs: HashMap<String, PairSpec>,
}

impl PairRegistry {
    pub fn new(specs: impl IntoIterator<Item = PairSpec>) -> Self {
        Self {
            pairs: specs.into_iter().map(|p| (p.id.clone(), p)).collect(),
        }
    }

    pub fn get(&self, code: &str) -> Option<&PairSpec> {
        self.pairs.get(code)
    }

    pub fn codes(&self) -> impl Iterator<Item = &str> {
        self.pairs.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }
}
