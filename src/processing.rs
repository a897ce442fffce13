use crate::projection::Mercator;
use crate::types::{EventRecord, YearAggregate};
use chrono::Datelike;
use rayon::prelude::*;
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, warn};

/// Group events by calendar year and summarize each group.
pub fn aggregate_years(
    events: &[EventRecord],
    projection: &Mercator,
) -> BTreeMap<i32, YearAggregate> {
    let mut groups: BTreeMap<i32, Vec<&EventRecord>> = BTreeMap::new();
    for event in events {
        groups.entry(event.date.year()).or_default().push(event);
    }

    let aggregates: BTreeMap<i32, YearAggregate> = groups
        .into_par_iter()
        .map(|(year, members)| (year, aggregate_year(year, &members, projection)))
        .collect();

    debug!(years = aggregates.len(), "aggregated events by year");
    aggregates
}

fn aggregate_year(year: i32, members: &[&EventRecord], projection: &Mercator) -> YearAggregate {
    let attendance = members.iter().map(|e| e.attendance).sum();

    // Sum in a canonical order so the mean does not depend on input order.
    let mut coords: Vec<(f64, f64)> = members
        .iter()
        .map(|e| projection.project(e.long, e.lat))
        .collect();
    coords.sort_by(|a, b| a.0.total_cmp(&b.0).then(a.1.total_cmp(&b.1)));

    let n = coords.len() as f64;
    let (sum_x, sum_y) = coords
        .iter()
        .fold((0.0, 0.0), |(sx, sy), (x, y)| (sx + x, sy + y));

    let mut teams = BTreeSet::new();
    for event in members {
        teams.insert(event.team1.clone());
        teams.insert(event.team2.clone());
    }

    YearAggregate {
        year,
        attendance,
        x: sum_x / n,
        y: sum_y / n,
        teams,
    }
}

/// Years of the sequence that have no aggregate. Each one is logged.
pub fn reconcile(sequence: &[i32], aggregates: &BTreeMap<i32, YearAggregate>) -> Vec<i32> {
    let missing: Vec<i32> = sequence
        .iter()
        .copied()
        .filter(|year| !aggregates.contains_key(year))
        .collect();
    for year in &missing {
        warn!(year, "year in sequence has no events; it will render as an empty frame");
    }
    missing
}

/// Square-root scale from attendance to bubble radius.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RadiusScale {
    max_attendance: u64,
    max_radius: f64,
}

impl RadiusScale {
    pub fn new(max_attendance: u64, max_radius: f64) -> Self {
        Self {
            max_attendance,
            max_radius,
        }
    }

    pub fn for_aggregates<'a>(
        aggregates: impl IntoIterator<Item = &'a YearAggregate>,
        max_radius: f64,
    ) -> Self {
        let max = aggregates
            .into_iter()
            .map(|a| a.attendance)
            .max()
            .unwrap_or(0);
        Self::new(max, max_radius)
    }

    pub fn radius(&self, attendance: u64) -> f64 {
        if self.max_attendance == 0 {
            return 0.0;
        }
        (attendance as f64 / self.max_attendance as f64).sqrt() * self.max_radius
    }
}
