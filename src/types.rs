use chrono::NaiveDateTime;
use geo::MultiPolygon;
use serde::Serialize;
use std::collections::BTreeSet;

/// One match as read from the events table.
#[derive(Debug, Clone, PartialEq)]
pub struct EventRecord {
    pub date: NaiveDateTime,
    pub attendance: u64,
    pub team1: String,
    pub team2: String,
    pub lat: f64,
    pub long: f64,
}

/// Per-year summary derived from the events of that year.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct YearAggregate {
    pub year: i32,
    pub attendance: u64,
    // Mean projected venue position
    pub x: f64,
    pub y: f64,
    pub teams: BTreeSet<String>,
}

/// A named polygon from the boundary dataset.
#[derive(Debug, Clone)]
pub struct Region {
    pub name: String,
    pub geometry: MultiPolygon<f64>,
}
