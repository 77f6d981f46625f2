//! Analysis configuration
//!
//! Embedders pass a flat key/value map (or the equivalent JSON object). Keys use
//! kebab-case:
//! - `association-confidence`: in-error fraction for a function to count as an error handler
//! - `interval-confidence`: histogram fraction an interval needs to be kept
//! - `incorrect-check-threshold`, `missing-check-threshold`: minimum report scores
//! - `refine-vsa`: narrow learned intervals with value-set analysis
//! - `allowlist`: comma-separated function names; empty analyses everything
//! - `threads`: worker cap for the per-module stages
//! - `show-safety-checks`: log every extracted check

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default, deny_unknown_fields)]
pub struct AnalysisConfig {
    pub association_confidence: f64,
    pub interval_confidence: f64,
    pub incorrect_check_threshold: f64,
    pub missing_check_threshold: f64,
    pub refine_vsa: bool,
    #[serde(with = "allowlist_format")]
    pub allowlist: BTreeSet<String>,
    pub threads: usize,
    pub show_safety_checks: bool,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            association_confidence: 0.925,
            interval_confidence: 0.5,
            incorrect_check_threshold: 0.725,
            missing_check_threshold: 0.725,
            refine_vsa: true,
            allowlist: BTreeSet::new(),
            threads: 2,
            show_safety_checks: false,
        }
    }
}

impl AnalysisConfig {
    /// Build a configuration from flat string pairs, starting from the defaults
    pub fn from_pairs<'a>(
        pairs: impl IntoIterator<Item = (&'a str, &'a str)>,
    ) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        for (key, value) in pairs {
            config.set(key, value)?;
        }
        config.validate()?;
        Ok(config)
    }

    /// Parse a JSON object with the same keys as [`from_pairs`](Self::from_pairs)
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| ConfigError::Json(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Apply a single key/value pair
    pub fn set(&mut self, key: &str, value: &str) -> Result<(), ConfigError> {
        let value = value.trim();
        match key {
            "association-confidence" => self.association_confidence = parse_fraction(key, value)?,
            "interval-confidence" => self.interval_confidence = parse_fraction(key, value)?,
            "incorrect-check-threshold" => {
                self.incorrect_check_threshold = parse_fraction(key, value)?
            }
            "missing-check-threshold" => self.missing_check_threshold = parse_fraction(key, value)?,
            "refine-vsa" => self.refine_vsa = parse_value(key, value)?,
            "allowlist" => self.allowlist = split_allowlist(value),
            "threads" => self.threads = parse_value(key, value)?,
            "show-safety-checks" => self.show_safety_checks = parse_value(key, value)?,
            _ => return Err(ConfigError::UnknownKey(key.to_string())),
        }
        Ok(())
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let fractions = [
            ("association-confidence", self.association_confidence),
            ("interval-confidence", self.interval_confidence),
            ("incorrect-check-threshold", self.incorrect_check_threshold),
            ("missing-check-threshold", self.missing_check_threshold),
        ];
        for (key, value) in fractions {
            check_fraction(key, value)?;
        }
        if self.threads == 0 {
            return Err(ConfigError::InvalidValue {
                key: "threads".to_string(),
                value: "0".to_string(),
            });
        }
        Ok(())
    }

    /// Whether a function with this name takes part in the analysis
    pub fn is_allowed(&self, name: &str) -> bool {
        self.allowlist.is_empty() || self.allowlist.contains(name)
    }
}

fn parse_value<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value.parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
    })
}

fn parse_fraction(key: &str, value: &str) -> Result<f64, ConfigError> {
    let parsed: f64 = parse_value(key, value)?;
    check_fraction(key, parsed)?;
    Ok(parsed)
}

fn check_fraction(key: &str, value: f64) -> Result<(), ConfigError> {
    if (0.0..=1.0).contains(&value) {
        Ok(())
    } else {
        Err(ConfigError::OutOfRange {
            key: key.to_string(),
            value,
        })
    }
}

fn split_allowlist(value: &str) -> BTreeSet<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .map(str::to_string)
        .collect()
}

/// The allowlist travels as one comma-separated string in both formats
mod allowlist_format {
    use std::collections::BTreeSet;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(names: &BTreeSet<String>, s: S) -> Result<S::Ok, S::Error> {
        let joined: Vec<&str> = names.iter().map(String::as_str).collect();
        s.serialize_str(&joined.join(","))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<BTreeSet<String>, D::Error> {
        let raw = String::deserialize(d)?;
        Ok(super::split_allowlist(&raw))
    }
}
