use crate::error::{MapError, MapResult};

/// Years from `start` to `end` inclusive in `step` increments, minus `exclude`.
///
/// Returns an empty sequence when `start > end` and fails on a non-positive
/// step.
pub fn year_sequence(start: i32, end: i32, step: i32, exclude: &[i32]) -> MapResult<Vec<i32>> {
    if step <= 0 {
        return Err(MapError::invalid_argument(format!(
            "year step must be positive, got {step}"
        )));
    }

    let mut years = Vec::new();
    let mut year = start;
    while year <= end {
        if !exclude.contains(&year) {
            years.push(year);
        }
        year = match year.checked_add(step) {
            Some(next) => next,
            None => break,
        };
    }
    Ok(years)
}
