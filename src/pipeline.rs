//! Static asset build: styles, scripts, markup with injected asset tags, and
//! verbatim assets, written into the output directory.
//!
//! Tasks form a small dependency graph. Running a task runs its prerequisites
//! first in topological order. A compile failure in one source file only
//! drops that file's output; the rest of the build still completes and the
//! failure is reported in the [`BuildReport`].

use crate::config::BuildConfig;
use crate::error::{MapError, MapResult};
use crate::transform;
use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, error, info};
use walkdir::WalkDir;

/// Directory under the source root copied verbatim.
pub const ASSETS_DIR: &str = "assets";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, clap::ValueEnum)]
pub enum Task {
    Clean,
    Styles,
    Scripts,
    Markup,
    Copy,
    Default,
}

impl Task {
    const ALL: [Task; 6] = [
        Task::Clean,
        Task::Styles,
        Task::Scripts,
        Task::Markup,
        Task::Copy,
        Task::Default,
    ];

    fn prerequisites(self) -> &'static [Task] {
        match self {
            Task::Markup => &[Task::Styles, Task::Scripts],
            Task::Default => &[Task::Markup, Task::Copy],
            _ => &[],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ArtifactKind {
    Style,
    Script,
    Markup,
    Asset,
}

impl ArtifactKind {
    /// Classify a source path, if it takes part in the build.
    pub fn of(src_dir: &Path, path: &Path) -> Option<Self> {
        if path
            .strip_prefix(src_dir)
            .map(|rel| rel.starts_with(ASSETS_DIR))
            .unwrap_or(false)
        {
            return Some(Self::Asset);
        }
        match path.extension().and_then(|e| e.to_str()) {
            Some("scss" | "css") => Some(Self::Style),
            Some("js") => Some(Self::Script),
            Some("html") => Some(Self::Markup),
            _ => None,
        }
    }
}

/// A built file, addressed relative to the output directory.
#[derive(Debug, Clone, PartialEq)]
pub struct Artifact {
    pub kind: ArtifactKind,
    pub rel_path: PathBuf,
    pub contents: Vec<u8>,
}

impl Artifact {
    /// Root-relative URL used when referencing the artifact from markup.
    pub fn href(&self) -> String {
        let parts: Vec<String> = self
            .rel_path
            .components()
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .collect();
        format!("/{}", parts.join("/"))
    }

    fn stem(&self) -> Option<&str> {
        self.rel_path.file_stem().and_then(|s| s.to_str())
    }
}

/// Output of one compile stage: what built and what did not.
#[derive(Debug, Default)]
pub struct StageOutput {
    pub artifacts: Vec<Artifact>,
    pub failures: Vec<MapError>,
}

impl StageOutput {
    fn push(&mut self, result: MapResult<Artifact>) {
        match result {
            Ok(artifact) => self.artifacts.push(artifact),
            Err(e) => {
                error!("{e}");
                self.failures.push(e);
            }
        }
    }
}

#[derive(Debug, Default)]
pub struct BuildReport {
    pub tasks: Vec<Task>,
    pub written: Vec<PathBuf>,
    pub failures: Vec<MapError>,
}

impl BuildReport {
    pub fn is_success(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Order in which `target` and its prerequisites run.
pub fn plan(target: Task) -> Vec<Task> {
    let mut graph: DiGraph<Task, ()> = DiGraph::new();
    let nodes: HashMap<Task, NodeIndex> = Task::ALL.iter().map(|&t| (t, graph.add_node(t))).collect();
    for task in Task::ALL {
        for dep in task.prerequisites() {
            graph.add_edge(nodes[dep], nodes[&task], ());
        }
    }

    let mut needed = HashSet::new();
    let mut stack = vec![nodes[&target]];
    while let Some(idx) = stack.pop() {
        if needed.insert(idx) {
            stack.extend(graph.neighbors_directed(idx, Direction::Incoming));
        }
    }

    match toposort(&graph, None) {
        Ok(order) => order
            .into_iter()
            .filter(|idx| needed.contains(idx))
            .map(|idx| graph[idx])
            .collect(),
        // The task table is fixed and acyclic.
        Err(_) => vec![target],
    }
}

#[derive(Debug, Clone)]
pub struct Pipeline {
    config: BuildConfig,
}

impl Pipeline {
    pub fn new(config: BuildConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &BuildConfig {
        &self.config
    }

    pub fn run(&self, target: Task) -> MapResult<BuildReport> {
        let mut report = BuildReport {
            tasks: plan(target),
            ..BuildReport::default()
        };
        info!(?target, tasks = ?report.tasks, production = self.config.production, "build started");

        let mut collected: BTreeMap<ArtifactKind, Vec<Artifact>> = BTreeMap::new();
        for task in report.tasks.clone() {
            debug!(?task, "running task");
            let stage = match task {
                Task::Clean => {
                    self.clean()?;
                    continue;
                }
                Task::Default => continue,
                Task::Styles => self.compile_styles()?,
                Task::Scripts => self.compile_scripts()?,
                Task::Markup => {
                    let mut injectable: Vec<Artifact> = Vec::new();
                    for kind in [ArtifactKind::Style, ArtifactKind::Script] {
                        injectable.extend(collected.get(&kind).cloned().unwrap_or_default());
                    }
                    self.compile_markup(&injectable)?
                }
                Task::Copy => self.copy_assets()?,
            };
            report.written.extend(self.write_output(&stage.artifacts)?);
            for artifact in stage.artifacts {
                collected.entry(artifact.kind).or_default().push(artifact);
            }
            report.failures.extend(stage.failures);
        }

        info!(written = report.written.len(), failed = report.failures.len(), "build finished");
        Ok(report)
    }

    pub fn clean(&self) -> MapResult<()> {
        let dist = &self.config.dist_dir;
        if dist.exists() {
            fs::remove_dir_all(dist).map_err(|e| MapError::io(dist, e))?;
            info!(dir = ?dist, "output removed");
        }
        Ok(())
    }

    pub fn compile_styles(&self) -> MapResult<StageOutput> {
        let mut out = StageOutput::default();
        for path in self.sources(ArtifactKind::Style)? {
            // Underscore files are partials, only reachable through @import.
            if path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.starts_with('_'))
            {
                continue;
            }
            out.push(self.compile_style(&path));
        }
        Ok(out)
    }

    fn compile_style(&self, path: &Path) -> MapResult<Artifact> {
        let css = transform::compile_scss(path, &self.config.src_dir)?;
        let css = transform::autoprefix(&css);
        let css = if self.config.production {
            transform::minify_css(&css)
        } else {
            css
        };
        Ok(Artifact {
            kind: ArtifactKind::Style,
            rel_path: self.relative(path)?.with_extension("css"),
            contents: css.into_bytes(),
        })
    }

    pub fn compile_scripts(&self) -> MapResult<StageOutput> {
        let mut out = StageOutput::default();
        for path in self.sources(ArtifactKind::Script)? {
            out.push(self.compile_script(&path));
        }
        Ok(out)
    }

    fn compile_script(&self, path: &Path) -> MapResult<Artifact> {
        let js = fs::read_to_string(path).map_err(|e| MapError::io(path, e))?;
        let js = if self.config.production {
            transform::minify_js(&js)
        } else {
            js
        };
        Ok(Artifact {
            kind: ArtifactKind::Script,
            rel_path: self.relative(path)?,
            contents: js.into_bytes(),
        })
    }

    fn compile_markup(&self, injectable: &[Artifact]) -> MapResult<StageOutput> {
        let mut out = StageOutput::default();
        for path in self.sources(ArtifactKind::Markup)? {
            let result = fs::read_to_string(&path)
                .map_err(|e| MapError::io(&path, e))
                .and_then(|html| self.inject_assets_into_markup(&path, &html, injectable));
            out.push(result);
        }
        Ok(out)
    }

    /// Reference every style and script whose file stem matches the markup's.
    pub fn inject_assets_into_markup(
        &self,
        path: &Path,
        markup: &str,
        artifacts: &[Artifact],
    ) -> MapResult<Artifact> {
        let stem = path.file_stem().and_then(|s| s.to_str());
        let matching = |kind: ArtifactKind| -> Vec<String> {
            artifacts
                .iter()
                .filter(|a| a.kind == kind && a.stem() == stem)
                .map(Artifact::href)
                .collect()
        };
        let html = transform::inject_tags(
            path,
            markup,
            &matching(ArtifactKind::Style),
            &matching(ArtifactKind::Script),
        )?;
        let html = if self.config.production {
            transform::minify_html(&html)
        } else {
            html
        };
        Ok(Artifact {
            kind: ArtifactKind::Markup,
            rel_path: self.relative(path)?,
            contents: html.into_bytes(),
        })
    }

    pub fn copy_assets(&self) -> MapResult<StageOutput> {
        let mut out = StageOutput::default();
        for path in self.sources(ArtifactKind::Asset)? {
            let result = fs::read(&path)
                .map_err(|e| MapError::io(&path, e))
                .and_then(|contents| {
                    Ok(Artifact {
                        kind: ArtifactKind::Asset,
                        rel_path: self.relative(&path)?,
                        contents,
                    })
                });
            out.push(result);
        }
        Ok(out)
    }

    pub fn write_output(&self, artifacts: &[Artifact]) -> MapResult<Vec<PathBuf>> {
        let mut written = Vec::with_capacity(artifacts.len());
        for artifact in artifacts {
            let dest = self.config.dist_dir.join(&artifact.rel_path);
            if let Some(parent) = dest.parent() {
                fs::create_dir_all(parent).map_err(|e| MapError::io(parent, e))?;
            }
            fs::write(&dest, &artifact.contents).map_err(|e| MapError::io(&dest, e))?;
            debug!(path = ?dest, bytes = artifact.contents.len(), "wrote artifact");
            written.push(dest);
        }
        Ok(written)
    }

    /// Source files of one kind, sorted for stable output.
    pub fn sources(&self, kind: ArtifactKind) -> MapResult<Vec<PathBuf>> {
        let src = &self.config.src_dir;
        let mut files = source_files(src)?;
        files.retain(|p| ArtifactKind::of(src, p) == Some(kind));
        Ok(files)
    }

    fn relative(&self, path: &Path) -> MapResult<PathBuf> {
        path.strip_prefix(&self.config.src_dir)
            .map(Path::to_path_buf)
            .map_err(|_| MapError::compile(path, "source outside of source directory"))
    }
}

/// Regular files under `dir` in path order. A missing directory has none.
pub fn source_files(dir: &Path) -> MapResult<Vec<PathBuf>> {
    if !dir.exists() {
        return Ok(Vec::new());
    }
    let mut files = Vec::new();
    for entry in WalkDir::new(dir).follow_links(true).sort_by_file_name() {
        let entry = entry.map_err(|e| {
            let path = e.path().unwrap_or(dir).to_path_buf();
            MapError::io(&path, e.into())
        })?;
        if entry.file_type().is_file() {
            files.push(entry.into_path());
        }
    }
    Ok(files)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use tempfile::TempDir;

    pub(crate) fn site() -> (TempDir, BuildConfig) {
        let root = tempfile::tempdir().unwrap();
        let src = root.path().join("site");
        fs::create_dir_all(src.join("assets")).unwrap();
        fs::create_dir_all(src.join("css")).unwrap();
        fs::write(
            src.join("index.html"),
            "<html>\n<head><title>World Cup</title></head>\n<body>\n  <!-- map -->\n  <div id=\"svgWrapper\"></div>\n</body>\n</html>\n",
        )
        .unwrap();
        fs::write(src.join("index.scss"), "$land: #ddd;\n@import 'css/map';\nh2 { text-align: center; }\n").unwrap();
        fs::write(
            src.join("css/_map.scss"),
            ".country {\n  fill: $land;\n  transition: fill 50ms;\n  &:hover { fill: red; }\n}\n",
        )
        .unwrap();
        fs::write(src.join("index.js"), "// entry\n\"use strict\";\nconsole.log(1);\n").unwrap();
        fs::write(src.join("other.js"), "var x = 2;\n").unwrap();
        fs::write(src.join("assets/world_cup_geo.tsv"), "date\tattendance\n").unwrap();

        let config = BuildConfig {
            src_dir: src,
            dist_dir: root.path().join("dist"),
            production: false,
        };
        (root, config)
    }

    #[test]
    fn plans_follow_dependencies() {
        assert_eq!(plan(Task::Styles), vec![Task::Styles]);
        assert_eq!(plan(Task::Clean), vec![Task::Clean]);

        let markup = plan(Task::Markup);
        assert_eq!(markup.len(), 3);
        assert_eq!(markup.last(), Some(&Task::Markup));
        assert!(markup.contains(&Task::Styles));
        assert!(markup.contains(&Task::Scripts));

        let default = plan(Task::Default);
        let pos = |t: Task| default.iter().position(|x| *x == t).unwrap();
        assert_eq!(default.len(), 5);
        assert!(pos(Task::Styles) < pos(Task::Markup));
        assert!(pos(Task::Scripts) < pos(Task::Markup));
        assert!(pos(Task::Markup) < pos(Task::Default));
        assert!(pos(Task::Copy) < pos(Task::Default));
        assert!(!default.contains(&Task::Clean));
    }

    #[test]
    fn classifies_sources() {
        let src = Path::new("site");
        assert_eq!(ArtifactKind::of(src, Path::new("site/a.css")), Some(ArtifactKind::Style));
        assert_eq!(ArtifactKind::of(src, Path::new("site/css/_a.scss")), Some(ArtifactKind::Style));
        assert_eq!(ArtifactKind::of(src, Path::new("site/js/a.js")), Some(ArtifactKind::Script));
        assert_eq!(ArtifactKind::of(src, Path::new("site/index.html")), Some(ArtifactKind::Markup));
        assert_eq!(ArtifactKind::of(src, Path::new("site/assets/a.js")), Some(ArtifactKind::Asset));
        assert_eq!(ArtifactKind::of(src, Path::new("site/README.md")), None);
    }

    #[test]
    fn default_build_writes_everything() {
        let (_root, config) = site();
        let dist = config.dist_dir.clone();
        let report = Pipeline::new(config).run(Task::Default).unwrap();
        assert!(report.is_success(), "{:?}", report.failures);

        let html = fs::read_to_string(dist.join("index.html")).unwrap();
        assert!(html.contains("<link rel=\"stylesheet\" href=\"/index.css\">"));
        assert!(html.contains("<script src=\"/index.js\"></script>"));
        assert!(!html.contains("/other.js"));
        assert!(html.contains("<!-- map -->"));

        let css = fs::read_to_string(dist.join("index.css")).unwrap();
        assert!(css.contains("-webkit-transition: fill 50ms;"));
        assert!(css.contains("fill: #ddd;"));
        assert!(css.contains(".country:hover"));
        assert!(!dist.join("index.scss").exists());
        assert!(!dist.join("css/_map.css").exists());

        assert!(dist.join("other.js").exists());
        assert!(dist.join("assets/world_cup_geo.tsv").exists());
    }

    #[test]
    fn production_build_minifies() {
        let (_root, mut config) = site();
        config.production = true;
        let dist = config.dist_dir.clone();
        let report = Pipeline::new(config).run(Task::Default).unwrap();
        assert!(report.is_success());

        let html = fs::read_to_string(dist.join("index.html")).unwrap();
        assert!(!html.contains("<!--"));
        assert!(!html.contains('\n'));
        let css = fs::read_to_string(dist.join("index.css")).unwrap();
        assert!(css.contains("h2{text-align:center}"));
        let js = fs::read_to_string(dist.join("index.js")).unwrap();
        assert!(!js.contains("// entry"));
    }

    #[test]
    fn broken_style_fails_only_its_output() {
        let (_root, config) = site();
        fs::write(config.src_dir.join("broken.scss"), ".x {\n").unwrap();
        let dist = config.dist_dir.clone();
        let report = Pipeline::new(config).run(Task::Default).unwrap();

        assert_eq!(report.failures.len(), 1);
        assert!(matches!(&report.failures[0], MapError::Compile { path, .. } if path.ends_with("broken.scss")));
        assert!(!dist.join("broken.css").exists());
        assert!(dist.join("index.css").exists());
        assert!(dist.join("index.html").exists());
    }

    #[test]
    fn clean_removes_output() {
        let (_root, config) = site();
        let dist = config.dist_dir.clone();
        let pipeline = Pipeline::new(config);
        pipeline.run(Task::Default).unwrap();
        assert!(dist.exists());
        pipeline.run(Task::Clean).unwrap();
        assert!(!dist.exists());
        pipeline.clean().unwrap();
    }

    #[test]
    fn href_uses_forward_slashes() {
        let artifact = Artifact {
            kind: ArtifactKind::Style,
            rel_path: PathBuf::from("css").join("main.css"),
            contents: Vec::new(),
        };
        assert_eq!(artifact.href(), "/css/main.css");
    }

    #[test]
    fn source_files_are_recursive_and_ordered() {
        let (_root, config) = site();
        let files = source_files(&config.src_dir).unwrap();
        let rel: Vec<PathBuf> = files
            .iter()
            .map(|p| p.strip_prefix(&config.src_dir).unwrap().to_path_buf())
            .collect();
        let mut sorted = rel.clone();
        sorted.sort();
        assert_eq!(rel, sorted);
        assert!(rel.contains(&PathBuf::from("css").join("_map.scss")));
        assert!(rel.contains(&PathBuf::from("assets").join("world_cup_geo.tsv")));
        assert!(!rel.iter().any(|p| p == Path::new("css") || p == Path::new("assets")));
        assert!(source_files(&config.src_dir.join("missing")).unwrap().is_empty());
    }

    #[test]
    fn missing_source_dir_builds_nothing() {
        let root = tempfile::tempdir().unwrap();
        let pipeline = Pipeline::new(BuildConfig {
            src_dir: root.path().join("nope"),
            dist_dir: root.path().join("dist"),
            production: false,
        });
        let report = pipeline.run(Task::Default).unwrap();
        assert!(report.written.is_empty());
        assert!(report.is_success());
    }
}
