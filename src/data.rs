use crate::error::MapError;
use crate::types::{EventRecord, Region};
use anyhow::{anyhow, Context, Result};
use chrono::NaiveDateTime;
use csv::ReaderBuilder;
use geo::MultiPolygon;
use serde::Deserialize;
use shapefile::dbase::FieldValue;
use shapefile::Reader;
use std::fs::File;
use std::io::Read;
use std::path::Path;
use tracing::info;

/// Format of the `date` column, e.g. `13-07-1930 (15:00 h)`.
pub const DATE_FORMAT: &str = "%d-%m-%Y (%H:%M h)";

#[derive(Debug, Deserialize)]
struct RawEvent {
    date: String,
    attendance: String,
    team1: String,
    team2: String,
    lat: String,
    long: String,
}

pub fn load_events(path: &Path) -> Result<Vec<EventRecord>> {
    let file = File::open(path).with_context(|| format!("Failed to open events file: {:?}", path))?;
    let events = parse_events(file).with_context(|| format!("Failed to load events from {:?}", path))?;
    info!(count = events.len(), "loaded event records");
    Ok(events)
}

/// Parse a tab separated events table. The whole table is rejected if any row is bad.
pub fn parse_events<R: Read>(reader: R) -> Result<Vec<EventRecord>, MapError> {
    let mut rdr = ReaderBuilder::new().delimiter(b'\t').from_reader(reader);
    let headers = rdr
        .headers()
        .map_err(|e| MapError::data(format!("unreadable header row: {e}")))?
        .clone();

    let mut events = Vec::new();
    for (idx, result) in rdr.records().enumerate() {
        // Header is row 1.
        let row = idx + 2;
        let record = result.map_err(|e| MapError::data(format!("row {row}: {e}")))?;
        let raw: RawEvent = record
            .deserialize(Some(&headers))
            .map_err(|e| MapError::data(format!("row {row}: {e}")))?;
        let event = parse_event(raw).map_err(|msg| MapError::data(format!("row {row}: {msg}")))?;
        events.push(event);
    }
    Ok(events)
}

fn parse_event(raw: RawEvent) -> std::result::Result<EventRecord, String> {
    let date = NaiveDateTime::parse_from_str(raw.date.trim(), DATE_FORMAT)
        .map_err(|e| format!("bad date {:?}: {e}", raw.date))?;
    let attendance = raw
        .attendance
        .trim()
        .parse::<u64>()
        .map_err(|e| format!("bad attendance {:?}: {e}", raw.attendance))?;
    let lat = parse_coord(&raw.lat, "lat", 90.0)?;
    let long = parse_coord(&raw.long, "long", 180.0)?;

    Ok(EventRecord {
        date,
        attendance,
        team1: raw.team1.trim().to_string(),
        team2: raw.team2.trim().to_string(),
        lat,
        long,
    })
}

fn parse_coord(value: &str, column: &str, limit: f64) -> std::result::Result<f64, String> {
    let v: f64 = value
        .trim()
        .parse()
        .map_err(|e| format!("bad {column} {value:?}: {e}"))?;
    if !v.is_finite() || v.abs() > limit {
        return Err(format!("{column} {v} out of range"));
    }
    Ok(v)
}

/// Load the region polygons from GeoJSON or an ESRI shapefile.
pub fn load_boundaries(path: &Path, name_property: &str) -> Result<Vec<Region>> {
    let extension = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|s: &str| s.to_lowercase())
        .ok_or_else(|| anyhow!("Boundary file has no extension: {:?}", path))?;

    let regions = match extension.as_str() {
        "shp" => load_shapefile(path, name_property)?,
        "json" | "geojson" => {
            let file = File::open(path)
                .with_context(|| format!("Failed to open GeoJSON file: {:?}", path))?;
            parse_geojson(file, name_property)
                .with_context(|| format!("Failed to load boundaries from {:?}", path))?
        }
        _ => return Err(anyhow!("Unsupported geometry format: {}", extension)),
    };

    info!(count = regions.len(), "loaded boundary regions");
    Ok(regions)
}

pub fn parse_geojson<R: Read>(reader: R, name_property: &str) -> Result<Vec<Region>> {
    use geojson::GeoJson;
    use std::io::BufReader;

    // The whole document is held in memory; world boundary files are small.
    let geojson = GeoJson::from_reader(BufReader::new(reader)).context("Failed to parse GeoJSON")?;

    let collection = match geojson {
        GeoJson::FeatureCollection(fc) => fc,
        _ => return Err(anyhow!("GeoJSON must be a FeatureCollection")),
    };

    let mut regions = Vec::new();

    for feature in collection.features {
        let name = match feature
            .properties
            .as_ref()
            .and_then(|props| props.get(name_property))
        {
            Some(serde_json::Value::String(s)) => s.clone(),
            Some(serde_json::Value::Number(n)) => n.to_string(),
            _ => continue,
        };

        let geometry = match feature.geometry {
            Some(geom) => {
                let converted: geo::Geometry<f64> = geom
                    .value
                    .try_into()
                    .map_err(|e| anyhow!("Failed to convert geometry of {}: {:?}", name, e))?;
                match areal(converted) {
                    Some(mp) => mp,
                    None => continue,
                }
            }
            None => continue,
        };

        regions.push(Region { name, geometry });
    }

    Ok(regions)
}

/// Polygonal geometry as a multipolygon; points and lines are not regions.
fn areal(geometry: geo::Geometry<f64>) -> Option<MultiPolygon<f64>> {
    match geometry {
        geo::Geometry::MultiPolygon(mp) => Some(mp),
        geo::Geometry::Polygon(p) => Some(MultiPolygon::new(vec![p])),
        _ => None,
    }
}

fn load_shapefile(path: &Path, name_property: &str) -> Result<Vec<Region>> {
    let mut reader = Reader::from_path(path).with_context(|| format!("Failed to open shapefile: {:?}", path))?;

    let mut regions = Vec::new();
    for (index, item) in reader.iter_shapes_and_records().enumerate() {
        let (shape, record) = item.with_context(|| format!("Failed to read shape {index} of {:?}", path))?;

        let name = match record.get(name_property) {
            Some(FieldValue::Character(Some(s))) => s.trim().to_string(),
            Some(FieldValue::Character(None)) => continue,
            Some(other) => return Err(anyhow!("shape {index}: '{name_property}' is not text ({other:?})")),
            None => return Err(anyhow!("column '{name_property}' not found in {:?}", path)),
        };

        // Null shapes have no geometry and are skipped like non-polygons.
        let Some(geometry) = geo::Geometry::<f64>::try_from(shape).ok().and_then(areal) else {
            continue;
        };
        regions.push(Region { name, geometry });
    }

    Ok(regions)
}
