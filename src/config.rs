use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

/// Environment variable selecting production or development transforms.
pub const ENV_MODE_VAR: &str = "CUPMAP_ENV";

#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub input: InputConfig,
    #[serde(default)]
    pub sequence: SequenceConfig,
    #[serde(default)]
    pub map: MapConfig,
    #[serde(default)]
    pub animation: AnimationConfig,
    #[serde(default)]
    pub output: OutputConfig,
    #[serde(default)]
    pub build: BuildConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct InputConfig {
    pub events: PathBuf,
    pub boundaries: PathBuf,
    #[serde(default = "default_name_property")]
    pub region_name_property: String,
}

fn default_name_property() -> String {
    "name".to_string()
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct SequenceConfig {
    pub start: i32,
    pub end: i32,
    pub step: i32,
    pub exclude: Vec<i32>,
}

impl Default for SequenceConfig {
    fn default() -> Self {
        Self {
            start: 1930,
            end: 2015,
            step: 4,
            exclude: vec![1942, 1946],
        }
    }
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct MapConfig {
    pub width: f64,
    pub height: f64,
    pub margin: f64,
    pub scale: f64,
    pub max_radius: f64,
    pub background: String,
    pub region_fill: String,
    pub highlight_fill: String,
    pub bubble_fill: String,
    pub stroke: String,
    pub stroke_width: f64,
}

impl MapConfig {
    /// Drawing area inside the margin.
    pub fn inner_size(&self) -> (f64, f64) {
        (self.width - self.margin, self.height - self.margin)
    }
}

impl Default for MapConfig {
    fn default() -> Self {
        Self {
            width: 1000.0,
            height: 600.0,
            margin: 75.0,
            scale: 140.0,
            max_radius: 15.0,
            background: "#ffffff".to_string(),
            region_fill: "#d9d9d9".to_string(),
            highlight_fill: "#7fb2d9".to_string(),
            bubble_fill: "#c0392b".to_string(),
            stroke: "#000000".to_string(),
            stroke_width: 0.5,
        }
    }
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct AnimationConfig {
    pub interval_ms: u64,
}

impl Default for AnimationConfig {
    fn default() -> Self {
        Self { interval_ms: 1000 }
    }
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct OutputConfig {
    pub frame_dir: PathBuf,
    pub png: bool,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            frame_dir: PathBuf::from("dist/frames"),
            png: false,
        }
    }
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct BuildConfig {
    pub src_dir: PathBuf,
    pub dist_dir: PathBuf,
    pub production: bool,
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            src_dir: PathBuf::from("site"),
            dist_dir: PathBuf::from("dist"),
            production: false,
        }
    }
}

impl BuildConfig {
    /// Apply an explicit mode value (`production` / `development`).
    pub fn apply_mode(&mut self, mode: Option<&str>) {
        match mode.map(str::trim) {
            Some("production") => self.production = true,
            Some("development") => self.production = false,
            _ => {}
        }
    }
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    pub port: u16,
    pub watch_interval_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 3000,
            watch_interval_ms: 300,
        }
    }
}

impl AppConfig {
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;
        let mut config = Self::from_toml(&content)?;
        config
            .build
            .apply_mode(std::env::var(ENV_MODE_VAR).ok().as_deref());
        Ok(config)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let config: AppConfig =
            toml::from_str(content).with_context(|| "Failed to parse TOML configuration")?;
        Ok(config)
    }
}
