//! Retained scene for the map: boundary layer, bubble layer and year label.
//!
//! Rendering a year diffs the new bubble set and highlight set against what is
//! currently on screen and only touches elements that changed. The resulting
//! [`FrameDelta`] is what live clients receive; [`RenderState::to_svg`]
//! serializes the whole scene for export.

use crate::config::MapConfig;
use crate::processing::RadiusScale;
use crate::projection::Mercator;
use crate::types::{Region, YearAggregate};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Write;
use tracing::{debug, warn};

/// One region outline with its highlight class.
#[derive(Debug, Clone)]
pub struct RegionShape {
    pub name: String,
    pub path: String,
    pub highlighted: bool,
}

/// Marker for one year aggregate.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Bubble {
    pub cx: f64,
    pub cy: f64,
    pub r: f64,
    pub attendance: u64,
}

impl Bubble {
    fn sized(agg: &YearAggregate, radius: &RadiusScale) -> Self {
        Self {
            cx: agg.x,
            cy: agg.y,
            r: radius.radius(agg.attendance),
            attendance: agg.attendance,
        }
    }
}

/// Changes applied by one [`RenderState::render_year`] call.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct FrameDelta {
    pub year: i32,
    pub added: Vec<i32>,
    pub removed: Vec<i32>,
    pub updated: Vec<i32>,
    pub highlighted: Vec<String>,
    pub unhighlighted: Vec<String>,
    pub label_changed: bool,
    /// False when the year had no aggregate.
    pub consistent: bool,
}

impl FrameDelta {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty()
            && self.removed.is_empty()
            && self.updated.is_empty()
            && self.highlighted.is_empty()
            && self.unhighlighted.is_empty()
            && !self.label_changed
    }
}

#[derive(Debug, Clone)]
pub struct RenderState {
    style: MapConfig,
    radius: RadiusScale,
    regions: Vec<RegionShape>,
    bubbles: BTreeMap<i32, Bubble>,
    label: String,
    current_year: Option<i32>,
    disposed: bool,
}

impl RenderState {
    pub fn new(style: MapConfig, projection: &Mercator, regions: &[Region], radius: RadiusScale) -> Self {
        let regions = regions
            .iter()
            .map(|region| RegionShape {
                name: region.name.clone(),
                path: projection.path_data(&region.geometry),
                highlighted: false,
            })
            .collect();

        Self {
            style,
            radius,
            regions,
            bubbles: BTreeMap::new(),
            label: String::new(),
            current_year: None,
            disposed: false,
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn current_year(&self) -> Option<i32> {
        self.current_year
    }

    pub fn bubbles(&self) -> &BTreeMap<i32, Bubble> {
        &self.bubbles
    }

    pub fn regions(&self) -> &[RegionShape] {
        &self.regions
    }

    pub fn highlighted(&self) -> impl Iterator<Item = &str> {
        self.regions
            .iter()
            .filter(|r| r.highlighted)
            .map(|r| r.name.as_str())
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed
    }

    /// Show `year`: the bubble for its aggregate, the highlight on its teams
    /// and the label. A missing aggregate produces an empty frame.
    pub fn render_year(&mut self, year: i32, aggregate: Option<&YearAggregate>) -> FrameDelta {
        let mut delta = FrameDelta {
            year,
            consistent: aggregate.is_some(),
            ..FrameDelta::default()
        };

        if self.disposed {
            warn!(year, "render after dispose ignored");
            return delta;
        }

        if aggregate.is_none() {
            warn!(year, "no aggregate for year; rendering empty frame");
        }

        let mut next: BTreeMap<i32, Bubble> = BTreeMap::new();
        if let Some(agg) = aggregate {
            next.insert(year, Bubble::sized(agg, &self.radius));
        }
        self.patch_bubbles(next, &mut delta);

        let empty = BTreeSet::new();
        let teams = aggregate.map(|a| &a.teams).unwrap_or(&empty);
        for region in &mut self.regions {
            let want = teams.contains(&region.name);
            if want != region.highlighted {
                region.highlighted = want;
                if want {
                    delta.highlighted.push(region.name.clone());
                } else {
                    delta.unhighlighted.push(region.name.clone());
                }
            }
        }

        let label = format!("World Cup {year}");
        if label != self.label {
            self.label = label;
            delta.label_changed = true;
        }
        self.current_year = Some(year);

        debug!(
            year,
            added = delta.added.len(),
            removed = delta.removed.len(),
            updated = delta.updated.len(),
            highlighted = delta.highlighted.len(),
            unhighlighted = delta.unhighlighted.len(),
            "frame rendered"
        );
        delta
    }

    /// Show every aggregate's bubble at once, with no highlight and no label.
    /// Returns the number of bubbles on screen.
    pub fn render_overview<'a>(&mut self, aggregates: impl IntoIterator<Item = &'a YearAggregate>) -> usize {
        if self.disposed {
            warn!("overview after dispose ignored");
            return 0;
        }
        let radius = self.radius;
        let next: BTreeMap<i32, Bubble> = aggregates
            .into_iter()
            .map(|agg| (agg.year, Bubble::sized(agg, &radius)))
            .collect();
        self.patch_bubbles(next, &mut FrameDelta::default());
        for region in &mut self.regions {
            region.highlighted = false;
        }
        self.label.clear();
        self.current_year = None;
        debug!(bubbles = self.bubbles.len(), "overview rendered");
        self.bubbles.len()
    }

    fn patch_bubbles(&mut self, next: BTreeMap<i32, Bubble>, delta: &mut FrameDelta) {
        let stale: Vec<i32> = self
            .bubbles
            .keys()
            .filter(|key| !next.contains_key(key))
            .copied()
            .collect();
        for key in stale {
            self.bubbles.remove(&key);
            delta.removed.push(key);
        }

        for (key, bubble) in next {
            match self.bubbles.get(&key) {
                None => {
                    self.bubbles.insert(key, bubble);
                    delta.added.push(key);
                }
                Some(existing) if *existing != bubble => {
                    self.bubbles.insert(key, bubble);
                    delta.updated.push(key);
                }
                Some(_) => {}
            }
        }
    }

    /// Drop everything on screen. Later renders are ignored.
    pub fn dispose(&mut self) {
        if self.disposed {
            return;
        }
        self.bubbles.clear();
        self.regions.clear();
        self.label.clear();
        self.current_year = None;
        self.disposed = true;
    }

    /// Serialize the current scene as a standalone SVG document.
    pub fn to_svg(&self) -> String {
        let s = &self.style;
        let mut out = String::new();
        let _ = writeln!(
            out,
            r#"<svg xmlns="http://www.w3.org/2000/svg" width="{w}" height="{h}" viewBox="0 0 {w} {h}">"#,
            w = s.width,
            h = s.height
        );
        let _ = writeln!(
            out,
            r#"<rect width="{}" height="{}" fill="{}"/>"#,
            s.width,
            s.height,
            escape(&s.background)
        );
        let _ = writeln!(
            out,
            r#"<text class="year-label" x="{}" y="40" font-family="sans-serif" font-size="28" text-anchor="middle">{}</text>"#,
            s.width / 2.0,
            escape(&self.label)
        );

        out.push_str("<g class=\"map\">\n");
        for region in &self.regions {
            let (class, fill) = if region.highlighted {
                ("country country-fill", &s.highlight_fill)
            } else {
                ("country", &s.region_fill)
            };
            let _ = writeln!(
                out,
                r#"<path class="{class}" data-name="{}" d="{}" fill="{}" stroke="{}" stroke-width="{}"/>"#,
                escape(&region.name),
                region.path,
                escape(fill),
                escape(&s.stroke),
                s.stroke_width
            );
        }

        out.push_str("<g class=\"bubble\">\n");
        // Largest first so small bubbles stay visible on top.
        let mut bubbles: Vec<(&i32, &Bubble)> = self.bubbles.iter().collect();
        bubbles.sort_by(|a, b| b.1.attendance.cmp(&a.1.attendance).then(a.0.cmp(b.0)));
        for (year, b) in bubbles {
            let _ = writeln!(
                out,
                r#"<circle data-year="{year}" cx="{:.2}" cy="{:.2}" r="{:.2}" fill="{}" fill-opacity="0.7" stroke="{}" stroke-width="{}"/>"#,
                b.cx,
                b.cy,
                b.r,
                escape(&s.bubble_fill),
                escape(&s.stroke),
                s.stroke_width
            );
        }
        out.push_str("</g>\n</g>\n</svg>\n");
        out
    }
}

fn escape(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}
