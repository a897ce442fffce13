use crate::animation::{AnimationState, Animator, VirtualClock};
use crate::error::{MapError, MapResult};
use crate::types::YearAggregate;
use anyhow::{anyhow, Context, Result};
use image::RgbaImage;
use rayon::prelude::*;
use resvg::{tiny_skia, usvg};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info};

/// One exported frame.
#[derive(Debug, Clone)]
pub struct Frame {
    pub year: i32,
    pub svg: String,
}

/// Everything one animation run draws.
#[derive(Debug, Clone)]
pub struct Playback {
    /// The scene right after start: every bubble, nothing highlighted.
    pub overview: String,
    pub frames: Vec<Frame>,
}

impl Playback {
    /// File stem and SVG for each output, overview first.
    fn outputs(&self) -> impl Iterator<Item = (String, &str)> {
        std::iter::once((OVERVIEW_STEM.to_string(), self.overview.as_str()))
            .chain(self.frames.iter().map(|f| (f.year.to_string(), f.svg.as_str())))
    }
}

const OVERVIEW_STEM: &str = "overview";

#[derive(Debug, Serialize)]
struct Manifest<'a> {
    overview: String,
    years: Vec<i32>,
    missing: &'a [i32],
    frames: Vec<String>,
    aggregates: Vec<&'a YearAggregate>,
}

/// Play the whole animation on a virtual clock and collect every frame.
pub fn collect_frames(animator: &mut Animator<VirtualClock>, clock: &VirtualClock) -> MapResult<Playback> {
    animator.start()?;
    let overview = animator.scene().to_svg();
    let mut frames = Vec::with_capacity(animator.years().len());
    while animator.state() == AnimationState::Advancing {
        clock.advance(animator.interval());
        let fired = animator.poll_with(|delta, scene| {
            frames.push(Frame {
                year: delta.year,
                svg: scene.to_svg(),
            });
        });
        if fired == 0 {
            return Err(MapError::data("animation stalled before finishing"));
        }
    }
    Ok(Playback { overview, frames })
}

/// Write `overview.svg` and `{year}.svg` per frame (optionally PNGs too) plus
/// `manifest.json`.
pub fn write_frames(
    frame_dir: &Path,
    playback: &Playback,
    aggregates: &Arc<BTreeMap<i32, YearAggregate>>,
    missing: &[i32],
    png: bool,
) -> Result<()> {
    fs::create_dir_all(frame_dir).context("Failed to create frame directory")?;

    for (stem, svg) in playback.outputs() {
        let path = frame_dir.join(format!("{stem}.svg"));
        fs::write(&path, svg).with_context(|| format!("Failed to write frame {:?}", path))?;
    }

    if png {
        let fontdb = load_fonts();
        let outputs: Vec<(String, &str)> = playback.outputs().collect();
        let failures: Vec<PathBuf> = outputs
            .par_iter()
            .filter_map(|(stem, svg)| {
                let path = frame_dir.join(format!("{stem}.png"));
                match rasterize(svg, &fontdb).and_then(|img| img.save(&path).map_err(Into::into)) {
                    Ok(()) => None,
                    Err(e) => {
                        error!(path = ?path, "failed to save frame: {e:#}");
                        Some(path)
                    }
                }
            })
            .collect();
        if !failures.is_empty() {
            return Err(anyhow!("{} PNG frame(s) could not be written", failures.len()));
        }
    }

    let frames = &playback.frames;
    let manifest = Manifest {
        overview: format!("{OVERVIEW_STEM}.svg"),
        years: frames.iter().map(|f| f.year).collect(),
        missing,
        frames: frames.iter().map(|f| format!("{}.svg", f.year)).collect(),
        aggregates: aggregates.values().collect(),
    };
    let json = serde_json::to_string_pretty(&manifest)?;
    fs::write(frame_dir.join("manifest.json"), json).context("Failed to write frame manifest")?;

    info!(frames = frames.len(), dir = ?frame_dir, png, "frames written");
    Ok(())
}

fn load_fonts() -> Arc<usvg::fontdb::Database> {
    let mut db = usvg::fontdb::Database::new();
    db.load_system_fonts();
    Arc::new(db)
}

/// Rasterize an SVG document at its natural size.
pub fn rasterize(svg: &str, fontdb: &Arc<usvg::fontdb::Database>) -> Result<RgbaImage> {
    let options = usvg::Options {
        fontdb: fontdb.clone(),
        ..usvg::Options::default()
    };
    let tree = usvg::Tree::from_str(svg, &options).context("parse frame svg")?;

    let size = tree.size().to_int_size();
    let mut pixmap = tiny_skia::Pixmap::new(size.width(), size.height())
        .ok_or_else(|| anyhow!("failed to allocate {}x{} pixmap", size.width(), size.height()))?;
    resvg::render(&tree, tiny_skia::Transform::default(), &mut pixmap.as_mut());

    // Frames carry an opaque background, so premultiplied and straight alpha agree.
    RgbaImage::from_raw(size.width(), size.height(), pixmap.data().to_vec())
        .ok_or_else(|| anyhow!("pixmap size does not match image buffer"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scene::tests::{aggregate, scene};
    use std::time::Duration;

    fn fixture(years: Vec<i32>) -> (Animator<VirtualClock>, VirtualClock, Arc<BTreeMap<i32, YearAggregate>>) {
        let aggregates: Arc<BTreeMap<i32, YearAggregate>> = Arc::new(
            [1930, 1934]
                .into_iter()
                .map(|y| (y, aggregate(y, 40_000, &["A"])))
                .collect(),
        );
        let clock = VirtualClock::new();
        let anim = Animator::new(years, aggregates.clone(), scene(), clock.clone(), Duration::from_millis(1000))
            .unwrap();
        (anim, clock, aggregates)
    }

    #[test]
    fn collects_one_frame_per_year() {
        let (mut anim, clock, _) = fixture(vec![1930, 1934, 1938]);
        let playback = collect_frames(&mut anim, &clock).unwrap();
        assert_eq!(playback.overview.matches("<circle").count(), 2);
        assert!(!playback.overview.contains("World Cup"));
        let frames = &playback.frames;
        assert_eq!(frames.iter().map(|f| f.year).collect::<Vec<_>>(), vec![1930, 1934, 1938]);
        assert!(frames[0].svg.contains("World Cup 1930"));
        assert!(frames[2].svg.contains("World Cup 1938"));
        assert!(!frames[2].svg.contains("<circle"));
        assert_eq!(anim.state(), AnimationState::Done);
    }

    #[test]
    fn writes_svgs_and_manifest() {
        let dir = tempfile::tempdir().unwrap();
        let (mut anim, clock, aggregates) = fixture(vec![1930, 1934]);
        let playback = collect_frames(&mut anim, &clock).unwrap();
        write_frames(dir.path(), &playback, &aggregates, &[], false).unwrap();

        assert!(dir.path().join("overview.svg").exists());
        assert!(dir.path().join("1930.svg").exists());
        assert!(dir.path().join("1934.svg").exists());
        assert!(!dir.path().join("1930.png").exists());

        let manifest: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(dir.path().join("manifest.json")).unwrap()).unwrap();
        assert_eq!(manifest["years"], serde_json::json!([1930, 1934]));
        assert_eq!(manifest["aggregates"][0]["attendance"], 40_000);
        assert_eq!(manifest["frames"][1], "1934.svg");
        assert_eq!(manifest["overview"], "overview.svg");
    }

    #[test]
    fn rasterizes_frame_at_canvas_size() {
        let (mut anim, clock, _) = fixture(vec![1930]);
        let playback = collect_frames(&mut anim, &clock).unwrap();
        let img = rasterize(&playback.frames[0].svg, &Arc::new(usvg::fontdb::Database::new())).unwrap();
        assert_eq!(img.dimensions(), (1000, 600));
        // Background is opaque white.
        assert_eq!(img.get_pixel(0, 0).0, [255, 255, 255, 255]);
    }

    #[test]
    fn rejects_invalid_svg() {
        assert!(rasterize("<not svg", &Arc::new(usvg::fontdb::Database::new())).is_err());
    }
}
