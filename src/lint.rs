use crate::pipeline::{ArtifactKind, Pipeline};
use crate::processing::reconcile;
use crate::transform::{check_script, missing_anchors};
use crate::types::{Region, YearAggregate};
use anyhow::Result;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::fs;
use std::path::PathBuf;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Finding {
    /// A year in the sequence that has no events.
    MissingYear(i32),
    /// A team that never matches a region, so it can never be highlighted.
    UnknownTeam { team: String, years: Vec<i32> },
    /// Markup without an injection anchor.
    MissingAnchor { path: PathBuf, anchor: &'static str },
    /// Page script that will not parse, or would be broken by minification.
    Script { path: PathBuf, line: usize, message: String },
}

impl fmt::Display for Finding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Finding::MissingYear(year) => write!(f, "year {year} is in the sequence but has no events"),
            Finding::UnknownTeam { team, years } => {
                write!(f, "team {team:?} (played {years:?}) matches no boundary region")
            }
            Finding::MissingAnchor { path, anchor } => {
                write!(f, "{} has no {anchor}; assets cannot be injected", path.display())
            }
            Finding::Script { path, line, message } => write!(f, "{}:{line}: {message}", path.display()),
        }
    }
}

pub fn lint_data(
    sequence: &[i32],
    aggregates: &BTreeMap<i32, YearAggregate>,
    regions: &[Region],
) -> Vec<Finding> {
    let mut findings: Vec<Finding> = reconcile(sequence, aggregates)
        .into_iter()
        .map(Finding::MissingYear)
        .collect();

    let names: BTreeSet<&str> = regions.iter().map(|r| r.name.as_str()).collect();
    let mut unknown: BTreeMap<&str, Vec<i32>> = BTreeMap::new();
    for agg in aggregates.values() {
        for team in &agg.teams {
            if !names.contains(team.as_str()) {
                unknown.entry(team.as_str()).or_default().push(agg.year);
            }
        }
    }
    findings.extend(unknown.into_iter().map(|(team, years)| Finding::UnknownTeam {
        team: team.to_string(),
        years,
    }));
    findings
}

pub fn lint_markup(pipeline: &Pipeline) -> Result<Vec<Finding>> {
    let mut findings = Vec::new();
    for path in pipeline.sources(ArtifactKind::Markup)? {
        let html = fs::read_to_string(&path)?;
        for anchor in missing_anchors(&html) {
            findings.push(Finding::MissingAnchor {
                path: path.clone(),
                anchor,
            });
        }
    }
    Ok(findings)
}

pub fn lint_scripts(pipeline: &Pipeline) -> Result<Vec<Finding>> {
    let mut findings = Vec::new();
    for path in pipeline.sources(ArtifactKind::Script)? {
        let js = fs::read_to_string(&path)?;
        findings.extend(check_script(&js).into_iter().map(|issue| Finding::Script {
            path: path.clone(),
            line: issue.line,
            message: issue.message,
        }));
    }
    Ok(findings)
}
