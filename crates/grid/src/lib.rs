//! Grid input parsing: GeoJSON grid file → ordered crawl units.
//!
//! The input is a GeoJSON FeatureCollection describing a grid of cells over
//! the target area. Each feature carries `lat`/`lng` properties (the cell's
//! camera anchor point) and optionally an `id`. Parsing is pure and
//! synchronous; a malformed or unreadable grid is a fatal error — the
//! pipeline aborts rather than crawling a partial grid.

use std::path::Path;

use serde::Deserialize;
use tracing::info;

use meshharvest_shared::{HarvestError, Result};

// ---------------------------------------------------------------------------
// CrawlUnit
// ---------------------------------------------------------------------------

/// One independently-crawled partition of the input grid.
///
/// Immutable once produced; consumed exactly once by the crawler.
#[derive(Debug, Clone, PartialEq)]
pub struct CrawlUnit {
    /// Stable cell identifier (from the feature's `id` property, or
    /// positional when the grid does not name its cells).
    pub cell_id: String,
    pub lat: f64,
    pub lng: f64,
}

// ---------------------------------------------------------------------------
// GeoJSON wire structs
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct FeatureCollection {
    #[serde(default)]
    features: Vec<Feature>,
}

#[derive(Debug, Deserialize)]
struct Feature {
    properties: FeatureProperties,
}

#[derive(Debug, Deserialize)]
struct FeatureProperties {
    lat: f64,
    lng: f64,
    #[serde(default)]
    id: Option<serde_json::Value>,
}

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

/// Read and parse the grid file at `path`.
pub fn load_grid(path: &Path) -> Result<Vec<CrawlUnit>> {
    let content = std::fs::read_to_string(path).map_err(|e| HarvestError::io(path, e))?;
    let units = parse_grid(&content)
        .map_err(|e| HarvestError::parse(format!("{}: {e}", path.display())))?;

    info!(path = %path.display(), cells = units.len(), "grid loaded");
    Ok(units)
}

/// Parse GeoJSON grid content into crawl units, preserving input order.
pub fn parse_grid(content: &str) -> Result<Vec<CrawlUnit>> {
    let collection: FeatureCollection = serde_json::from_str(content)
        .map_err(|e| HarvestError::parse(format!("invalid grid GeoJSON: {e}")))?;

    if collection.features.is_empty() {
        return Err(HarvestError::validation("grid contains no features"));
    }

    let units = collection
        .features
        .into_iter()
        .enumerate()
        .map(|(i, feature)| {
            let props = feature.properties;
            let cell_id = match props.id {
                Some(serde_json::Value::String(s)) => s,
                Some(serde_json::Value::Number(n)) => n.to_string(),
                _ => format!("cell-{i:04}"),
            };
            CrawlUnit {
                cell_id,
                lat: props.lat,
                lng: props.lng,
            }
        })
        .collect();

    Ok(units)
}

#[cfg(test)]
mod tests {
    use super::*;

    const GRID_FIXTURE: &str = r#"{
        "type": "FeatureCollection",
        "features": [
            {
                "type": "Feature",
                "geometry": {"type": "Point", "coordinates": [126.97, 37.56]},
                "properties": {"id": "A-01", "lat": 37.56, "lng": 126.97}
            },
            {
                "type": "Feature",
                "geometry": {"type": "Point", "coordinates": [126.98, 37.57]},
                "properties": {"id": "A-02", "lat": 37.57, "lng": 126.98}
            },
            {
                "type": "Feature",
                "geometry": {"type": "Point", "coordinates": [126.99, 37.58]},
                "properties": {"lat": 37.58, "lng": 126.99}
            }
        ]
    }"#;

    #[test]
    fn parses_grid_in_input_order() {
        let units = parse_grid(GRID_FIXTURE).expect("parse");
        assert_eq!(units.len(), 3);
        assert_eq!(units[0].cell_id, "A-01");
        assert_eq!(units[1].cell_id, "A-02");
        assert!((units[0].lat - 37.56).abs() < 1e-9);
        assert!((units[1].lng - 126.98).abs() < 1e-9);
    }

    #[test]
    fn generates_positional_id_when_missing() {
        let units = parse_grid(GRID_FIXTURE).expect("parse");
        assert_eq!(units[2].cell_id, "cell-0002");
    }

    #[test]
    fn numeric_cell_ids_are_stringified() {
        let content = r#"{
            "type": "FeatureCollection",
            "features": [
                {"type": "Feature", "properties": {"id": 42, "lat": 1.0, "lng": 2.0}}
            ]
        }"#;
        let units = parse_grid(content).expect("parse");
        assert_eq!(units[0].cell_id, "42");
    }

    #[test]
    fn malformed_grid_is_fatal() {
        let err = parse_grid("not geojson at all").unwrap_err();
        assert!(matches!(err, HarvestError::Parse { .. }));

        let err = parse_grid(r#"{"type": "FeatureCollection", "features": []}"#).unwrap_err();
        assert!(matches!(err, HarvestError::Validation { .. }));
    }

    #[test]
    fn missing_lat_lng_is_fatal() {
        let content = r#"{
            "type": "FeatureCollection",
            "features": [{"type": "Feature", "properties": {"id": "x"}}]
        }"#;
        assert!(parse_grid(content).is_err());
    }

    #[test]
    fn load_grid_reports_unreadable_file() {
        let err = load_grid(Path::new("/nonexistent/grid.geojson")).unwrap_err();
        assert!(matches!(err, HarvestError::Io { .. }));
    }

    #[test]
    fn load_grid_reads_file() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let path = tmp.path().join("grid.geojson");
        std::fs::write(&path, GRID_FIXTURE).expect("write fixture");

        let units = load_grid(&path).expect("load");
        assert_eq!(units.len(), 3);
    }
}
