//! Pulls a location/time reading out of the JSON document embedded in a device page.
//!
//! The page is parsed with `scraper`, the first element matching the configured CSS
//! selector supplies the JSON text, and four dotted key paths pick the fields out of
//! the parsed document. Everything here is pure: identical inputs give identical
//! results, so the whole pipeline is tested against literal HTML fixtures.

use scraper::{Html, Selector};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use thiserror::Error;

/// A validated reading from the device page.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LocationRecord {
    pub latitude: f64,
    pub longitude: f64,
    pub altitude_meters: f64,
    /// Raw GPS timestamp exactly as it appeared in the payload.
    pub gps_time_s: f64,
}

/// The four fields a reading is built from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Field {
    Latitude,
    Longitude,
    Altitude,
    GpsTime,
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Field::Latitude => "latitude",
            Field::Longitude => "longitude",
            Field::Altitude => "altitude",
            Field::GpsTime => "gps_time",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum ExtractError {
    #[error("selector '{0}' matched no element")]
    SelectorNotFound(String),
    #[error("embedded JSON is malformed: {0}")]
    MalformedJson(String),
    #[error("key path '{0}' not present in payload")]
    MissingField(String),
    /// `value` is the offending JSON text, which need not be a number at all.
    #[error("{field} out of range: {value}")]
    OutOfRange { field: Field, value: String },
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid key path '{0}': segments must be non-empty")]
pub struct KeyPathError(pub String);

/// A dotted path such as `location.latitude`. Numeric segments also index into arrays.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyPath {
    raw: String,
    segments: Vec<String>,
}

impl KeyPath {
    pub fn parse(dotted: &str) -> Result<Self, KeyPathError> {
        let trimmed = dotted.trim();
        if trimmed.is_empty() {
            return Err(KeyPathError(dotted.to_string()));
        }
        let segments: Vec<String> = trimmed.split('.').map(str::to_string).collect();
        if segments.iter().any(|s| s.is_empty()) {
            return Err(KeyPathError(dotted.to_string()));
        }
        Ok(KeyPath {
            raw: trimmed.to_string(),
            segments,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Walk the document one segment at a time. `None` as soon as a segment is missing.
    pub fn resolve<'a>(&self, doc: &'a Value) -> Option<&'a Value> {
        resolve_segments(doc, &self.segments)
    }
}

fn resolve_segments<'a>(node: &'a Value, segments: &[String]) -> Option<&'a Value> {
    let Some((head, rest)) = segments.split_first() else {
        return Some(node);
    };
    let child = match node {
        Value::Object(map) => map.get(head.as_str()),
        Value::Array(items) => head.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    }?;
    resolve_segments(child, rest)
}

impl fmt::Display for KeyPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyPaths {
    pub latitude: KeyPath,
    pub longitude: KeyPath,
    pub altitude: KeyPath,
    pub gps_time: KeyPath,
}

impl KeyPaths {
    pub fn parse(
        latitude: &str,
        longitude: &str,
        altitude: &str,
        gps_time: &str,
    ) -> Result<Self, KeyPathError> {
        Ok(KeyPaths {
            latitude: KeyPath::parse(latitude)?,
            longitude: KeyPath::parse(longitude)?,
            altitude: KeyPath::parse(altitude)?,
            gps_time: KeyPath::parse(gps_time)?,
        })
    }
}

/// A CSS selector checked at startup, kept alongside its source text for error messages.
#[derive(Debug, Clone)]
pub struct PageSelector {
    css: String,
    selector: Selector,
}

impl PageSelector {
    pub fn parse(css: &str) -> anyhow::Result<Self> {
        let selector = Selector::parse(css)
            .map_err(|e| anyhow::anyhow!("invalid CSS selector '{}': {:?}", css, e))?;
        Ok(PageSelector {
            css: css.to_string(),
            selector,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.css
    }
}

pub fn extract(
    html: &str,
    selector: &PageSelector,
    keys: &KeyPaths,
) -> Result<LocationRecord, ExtractError> {
    let doc = Html::parse_document(html);
    let element = doc
        .select(&selector.selector)
        .next()
        .ok_or_else(|| ExtractError::SelectorNotFound(selector.css.clone()))?;

    let text: String = element.text().collect();
    let payload: Value = serde_json::from_str(text.trim())
        .map_err(|e| ExtractError::MalformedJson(e.to_string()))?;

    let latitude = numeric_field(&payload, &keys.latitude, Field::Latitude)?;
    let longitude = numeric_field(&payload, &keys.longitude, Field::Longitude)?;
    let altitude_meters = numeric_field(&payload, &keys.altitude, Field::Altitude)?;
    let gps_time_s = numeric_field(&payload, &keys.gps_time, Field::GpsTime)?;

    check_range(Field::Latitude, latitude, -90.0, 90.0)?;
    check_range(Field::Longitude, longitude, -180.0, 180.0)?;
    check_range(Field::Altitude, altitude_meters, f64::MIN, f64::MAX)?;
    check_range(Field::GpsTime, gps_time_s, 0.0, f64::MAX)?;

    Ok(LocationRecord {
        latitude,
        longitude,
        altitude_meters,
        gps_time_s,
    })
}

fn numeric_field(payload: &Value, path: &KeyPath, field: Field) -> Result<f64, ExtractError> {
    let value = path
        .resolve(payload)
        .ok_or_else(|| ExtractError::MissingField(path.to_string()))?;
    let number = match value {
        Value::Number(n) => n.as_f64(),
        // Some firmwares quote their numbers
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    };
    number.ok_or_else(|| ExtractError::OutOfRange {
        field,
        value: value.to_string(),
    })
}

fn check_range(field: Field, value: f64, min: f64, max: f64) -> Result<(), ExtractError> {
    if value.is_finite() && value >= min && value <= max {
        Ok(())
    } else {
        Err(ExtractError::OutOfRange {
            field,
            value: value.to_string(),
        })
    }
}
