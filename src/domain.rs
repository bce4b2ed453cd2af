use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, NaiveDateTime, Timelike, Utc};
use clap::ValueEnum;
use serde::de::Error as DeError;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::ArchiveError;

/// A capture instant, UTC, truncated to the product's native minute
/// resolution. Totally ordered; the compact form `YYYYMMDDHHMM` is the
/// canonical spelling used in filenames and cache keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Timestamp(DateTime<Utc>);

impl Timestamp {
    pub fn from_datetime(dt: DateTime<Utc>) -> Self {
        let truncated = dt
            .with_second(0)
            .and_then(|dt| dt.with_nanosecond(0))
            .unwrap_or(dt);
        Self(truncated)
    }

    pub fn parse_compact(value: &str) -> Result<Self, ArchiveError> {
        let naive = NaiveDateTime::parse_from_str(value, "%Y%m%d%H%M")
            .map_err(|_| ArchiveError::InvalidTimestamp(value.to_string()))?;
        Ok(Self(naive.and_utc()))
    }

    pub fn compact(&self) -> String {
        self.0.format("%Y%m%d%H%M").to_string()
    }

    pub fn as_datetime(&self) -> DateTime<Utc> {
        self.0
    }

    pub fn plus_minutes(&self, minutes: i64) -> Self {
        Self(self.0 + Duration::minutes(minutes))
    }

    pub fn minutes_until(&self, later: &Timestamp) -> i64 {
        (later.0 - self.0).num_minutes()
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.format("%Y-%m-%dT%H:%MZ"))
    }
}

impl FromStr for Timestamp {
    type Err = ArchiveError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let trimmed = value.trim();
        if let Ok(ts) = Self::parse_compact(trimmed) {
            return Ok(ts);
        }
        for format in ["%Y-%m-%dT%H:%MZ", "%Y-%m-%dT%H:%M", "%Y-%m-%d %H:%M"] {
            if let Ok(naive) = NaiveDateTime::parse_from_str(trimmed, format) {
                return Ok(Self(naive.and_utc()));
            }
        }
        Err(ArchiveError::InvalidTimestamp(value.to_string()))
    }
}

impl Serialize for Timestamp {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.compact())
    }
}

impl<'de> Deserialize<'de> for Timestamp {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = String::deserialize(deserializer)?;
        value.parse().map_err(DeError::custom)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
#[value(rename_all = "lower")]
pub enum Satellite {
    Goes16,
    Goes17,
    Goes18,
    Goes19,
}

impl Satellite {
    pub fn slug(&self) -> &'static str {
        match self {
            Satellite::Goes16 => "goes16",
            Satellite::Goes17 => "goes17",
            Satellite::Goes18 => "goes18",
            Satellite::Goes19 => "goes19",
        }
    }
}

impl fmt::Display for Satellite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.slug())
    }
}

impl FromStr for Satellite {
    type Err = ArchiveError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_lowercase().as_str() {
            "goes16" | "goes-16" => Ok(Satellite::Goes16),
            "goes17" | "goes-17" => Ok(Satellite::Goes17),
            "goes18" | "goes-18" => Ok(Satellite::Goes18),
            "goes19" | "goes-19" => Ok(Satellite::Goes19),
            _ => Err(ArchiveError::InvalidSatellite(value.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
#[value(rename_all = "lower")]
pub enum Product {
    GeoColor,
    AirMass,
    Band02,
    Band07,
    Band13,
}

impl Product {
    pub fn code(&self) -> &'static str {
        match self {
            Product::GeoColor => "geocolor",
            Product::AirMass => "airmass",
            Product::Band02 => "band02",
            Product::Band07 => "band07",
            Product::Band13 => "band13",
        }
    }

    pub fn extension(&self) -> &'static str {
        "png"
    }
}

impl fmt::Display for Product {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

impl FromStr for Product {
    type Err = ArchiveError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_lowercase().as_str() {
            "geocolor" => Ok(Product::GeoColor),
            "airmass" => Ok(Product::AirMass),
            "band02" => Ok(Product::Band02),
            "band07" => Ok(Product::Band07),
            "band13" => Ok(Product::Band13),
            _ => Err(ArchiveError::InvalidProduct(value.to_string())),
        }
    }
}
