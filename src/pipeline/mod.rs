//! The font build itself: every rule that turns the source fonts into the
//! release artifacts, and the fan-out that decides which of them to request.

mod archive;
mod bundle;
mod glyph;
mod hint;
mod oracle;
mod source;
mod targets;

use std::collections::HashMap;
use std::sync::Arc;

use camino::{Utf8Path, Utf8PathBuf};
use serde_json::Value;

use crate::config::{Config, Filter, read_version};
use crate::engine::TaskContext;
use crate::error::ConfigError;
use crate::tool::Toolchain;

pub use crate::pipeline::archive::{Archive, Format, Scope, write_checksums};
pub use crate::pipeline::bundle::{SuperTtcFile, TtcFile, TtcFontFiles, TtfFontFiles, Woff2File};
pub use crate::pipeline::glyph::{
    As0, Block, FeMisc0, FromShs, Hangul0, Kanji0, NonKanji0, Pass1, Pass1Hinted, Prod, Punct,
    Split, Ws0,
};
pub use crate::pipeline::hint::{
    GroupHint, GroupInstr, GroupInstrAll, HintBatch, HintData, HintFe, HintPass1, HintedFont, Part,
    Piece,
};
pub use crate::pipeline::oracle::{
    CheckTool, ConfigOracle, HintingJobs, PackageDeps, Packages, Script, Scripts,
    ScriptsStructure, Version,
};
pub use crate::pipeline::source::{BreakTtc, LatinSource, ShsClassicalOverride, ShsPart, ShsTtf, SourceFile};
pub use crate::pipeline::targets::{
    All, Archives, Goal, SuperTtc, Ttc, Ttf, Woff2, archives, plan,
};

pub(crate) type Cx<'a> = TaskContext<'a, Project>;

const BUILD: &str = ".build";
const OUT: &str = "out";
const SOURCES: &str = "sources";

/// Where everything lives, relative to the project root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Layout {
    pub root: Utf8PathBuf,
    /// Intermediate files.
    pub build: Utf8PathBuf,
    /// Release artifacts.
    pub out: Utf8PathBuf,
    pub sources: Utf8PathBuf,
    /// Glyph manipulation scripts.
    pub make: Utf8PathBuf,
}

impl Layout {
    pub fn new(root: impl Into<Utf8PathBuf>) -> Self {
        let root = root.into();
        Self {
            build: root.join(BUILD),
            out: root.join(OUT),
            sources: root.join(SOURCES),
            make: root.join("make"),
            root,
        }
    }

    pub fn journal(&self) -> Utf8PathBuf {
        self.build.join(".karakuri-journal")
    }
}

/// Hinted fonts go through the full autohinting and instruction pipeline,
/// unhinted ones skip it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Hinting {
    Hinted,
    Unhinted,
}

impl Hinting {
    pub const fn as_str(self) -> &'static str {
        match self {
            Hinting::Hinted => "hinted",
            Hinting::Unhinted => "unhinted",
        }
    }

    pub const fn ttf_dir(self) -> &'static str {
        match self {
            Hinting::Hinted => "TTF",
            Hinting::Unhinted => "TTF-Unhinted",
        }
    }

    pub const fn ttc_dir(self) -> &'static str {
        match self {
            Hinting::Hinted => "TTC",
            Hinting::Unhinted => "TTC-Unhinted",
        }
    }

    /// The variants being built.
    pub fn variants(hinted_only: bool) -> &'static [Hinting] {
        if hinted_only {
            &[Hinting::Hinted]
        } else {
            &[Hinting::Hinted, Hinting::Unhinted]
        }
    }
}

/// Global data every rule of the font build can see.
#[derive(Debug)]
pub struct Project {
    /// The active configuration, already narrowed by the build filter.
    pub config: Config,
    /// The configuration as loaded, before any filtering.
    pub base: Config,
    pub version: String,
    pub layout: Layout,
    pub tools: Toolchain,
    batches: HashMap<String, Arc<HintBatch>>,
}

impl Project {
    /// Narrows `base` with `filter` and plans the hinting batches of what is
    /// left.
    pub fn new(
        base: Config,
        filter: &Filter,
        version: impl Into<String>,
        layout: Layout,
        tools: Toolchain,
    ) -> Result<Self, ConfigError> {
        let config = filter.apply(&base)?;
        let batches = config
            .hint_weights()
            .into_iter()
            .map(|weight| {
                let batch = Arc::new(HintBatch::plan(&config, &weight));
                (weight, batch)
            })
            .collect();

        Ok(Self {
            config,
            base,
            version: version.into(),
            layout,
            tools,
            batches,
        })
    }

    /// Loads and narrows the configuration of the project at `root`.
    pub fn load(root: impl Into<Utf8PathBuf>) -> Result<Self, ConfigError> {
        let layout = Layout::new(root);
        let config = Config::load(&layout.root)?;
        let filter = Filter::from_env(&config.build_options);
        let version = read_version(&layout.root)?;
        let tools = Toolchain::from_env(&layout.root);

        let project = Self::new(config, &filter, version, layout, tools)?;
        let active = &project.config;
        tracing::info!(
            families = active.family_order.len(),
            subfamilies = active.subfamily_order.len(),
            styles = active.style_order.len(),
            hinted_only = active.hinted_only(),
            "Loaded configuration for version {}",
            project.version
        );

        Ok(project)
    }

    /// What the build steps depend on: the whole configuration minus the
    /// options selecting what to build. Narrowing the build never changes it.
    pub fn observed_config(&self) -> Config {
        self.base.observed()
    }

    /// The inputs and outputs of one weight's hinting stage, listed once per
    /// invocation so every rule sees the same order.
    pub fn hint_batch(&self, weight: &str) -> Option<&Arc<HintBatch>> {
        self.batches.get(weight)
    }

    /// `<Prefix><Family><Subfamily>-<Style>`, the stem of a release font.
    pub fn font_name(&self, family: &str, region: &str, style: &str) -> String {
        format!("{}{family}{region}-{style}", self.config.prefix)
    }
}

/// Creates the parent directory of an artifact about to be written.
pub(crate) async fn prepare(path: &Utf8Path) -> std::io::Result<()> {
    match path.parent() {
        Some(dir) if !dir.as_str().is_empty() => tokio::fs::create_dir_all(dir).await,
        _ => Ok(()),
    }
}

/// Removes a file, treating "already gone" as success.
pub(crate) async fn remove(path: &Utf8Path) -> std::io::Result<()> {
    match tokio::fs::remove_file(path).await {
        Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

/// Runs one of the glyph scripts under `make/` with its arguments passed as
/// a single JSON object.
pub(crate) async fn run_script(cx: &Cx<'_>, script: &str, args: Value) -> anyhow::Result<()> {
    let env = cx.env;
    let invocation = env
        .tools
        .node
        .invoke()
        .path(env.layout.make.join(script))
        .arg(args.to_string())
        .current_dir(&env.layout.root);

    cx.exec(invocation).await?;
    Ok(())
}

/// Checks that a file some other node promised to produce is really there.
pub(crate) fn expect_file(path: Utf8PathBuf) -> anyhow::Result<crate::engine::Target> {
    if !path.is_file() {
        anyhow::bail!("{path} was not produced");
    }
    Ok(crate::engine::Target::new(path))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::config::tests::sample;

    pub(crate) fn project_with(filter: Filter) -> Project {
        let root = Utf8PathBuf::from("/work/sarasa");
        Project::new(
            sample(),
            &filter,
            "1.0.0",
            Layout::new(root.clone()),
            Toolchain::from_env(&root),
        )
        .unwrap()
    }

    pub(crate) fn project() -> Project {
        project_with(Filter::default())
    }

    #[test]
    fn test_layout() {
        let layout = Layout::new("/work/sarasa");
        assert_eq!(layout.build, "/work/sarasa/.build");
        assert_eq!(layout.journal(), "/work/sarasa/.build/.karakuri-journal");
    }

    #[test]
    fn test_batches_follow_hint_weights() {
        let project = project();
        assert!(project.hint_batch("Regular").is_some());
        assert!(project.hint_batch("Bold").is_some());
        assert!(project.hint_batch("Italic").is_none());
    }

    #[test]
    fn test_observed_config_ignores_the_build_filter() {
        let full = project();
        let narrowed = project_with(Filter {
            families: Some(vec!["Mono".into()]),
            styles: Some(vec!["Bold".into(), "BoldItalic".into()]),
            hinted_only: true,
            ..Filter::default()
        });

        assert_eq!(narrowed.config.family_order, vec!["Mono"]);
        assert_eq!(full.observed_config(), narrowed.observed_config());
        assert_eq!(narrowed.observed_config().family_order, vec!["Gothic", "Mono"]);
    }

    #[test]
    fn test_font_name() {
        let project = project();
        assert_eq!(
            project.font_name("Gothic", "SC", "BoldItalic"),
            "SarasaGothicSC-BoldItalic"
        );
    }

    #[test]
    fn test_variants() {
        assert_eq!(Hinting::variants(true), &[Hinting::Hinted]);
        assert_eq!(Hinting::variants(false).len(), 2);
    }
}
