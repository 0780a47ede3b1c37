use std::future::Future;

use camino::Utf8PathBuf;

use crate::core::ArcStr;
use crate::engine::{Handle, Params, Registry, Resolved, Rule, Target, TaskKind};
use crate::error::GraphError;
use crate::params;
use crate::pipeline::oracle::{CheckTool, ConfigOracle, Scripts};
use crate::pipeline::{Cx, Project, prepare, remove};

/// A hand-maintained input file, named relative to the project root.
///
/// Its stamp is the content hash, so editing the file invalidates exactly
/// the nodes built from it.
pub struct SourceFile(pub ArcStr);

impl SourceFile {
    pub fn new(path: impl AsRef<str>) -> Self {
        Self(ArcStr::from(path.as_ref()))
    }
}

impl Rule<Project> for SourceFile {
    const NAME: &'static str = "source";
    const KIND: TaskKind = TaskKind::File;
    type Output = Target;
    type Needs = ();

    fn params(&self) -> Params {
        params![&*self.0]
    }

    fn target(&self, env: &Project) -> Option<Utf8PathBuf> {
        Some(env.layout.root.join(&*self.0))
    }

    fn needs(&self, _: &mut Registry<Project>) -> Result<(), GraphError> {
        Ok(())
    }

    fn run<'a>(
        &'a self,
        cx: &'a Cx<'a>,
        _: Resolved<'a, Self, Project>,
    ) -> impl Future<Output = anyhow::Result<Target>> + Send + 'a {
        async move {
            let path = cx.env.layout.root.join(&*self.0);
            if !path.is_file() {
                anyhow::bail!("Source file {path} does not exist");
            }
            Ok(Target::new(path))
        }
    }
}

/// Splits the source collection of one weight into per-region OpenType
/// fonts and moves the ones the build uses into `.build/shs`.
pub struct BreakTtc {
    pub weight: ArcStr,
}

impl Rule<Project> for BreakTtc {
    const NAME: &'static str = "break-ttc";
    const KIND: TaskKind = TaskKind::Task;
    type Output = Vec<String>;
    type Needs = Handle<Target>;

    fn params(&self) -> Params {
        params![&*self.weight]
    }

    /// The parts this run moved into the build directory.
    fn produces(&self, env: &Project, moved: &Vec<String>) -> Vec<Utf8PathBuf> {
        let dest = env.layout.build.join("shs");
        moved.iter().map(|part| dest.join(part)).collect()
    }

    fn needs(&self, registry: &mut Registry<Project>) -> Result<Self::Needs, GraphError> {
        let env = registry.env();
        let shs = &env.config.shs_source_map;
        registry.request(SourceFile::new(format!(
            "sources/shs/{}-{}.ttc",
            shs.default_region,
            shs.suffix(&self.weight)
        )))
    }

    fn run<'a>(
        &'a self,
        cx: &'a Cx<'a>,
        collection: Resolved<'a, Self, Project>,
    ) -> impl Future<Output = anyhow::Result<Vec<String>>> + Send + 'a {
        async move {
            let env = cx.env;
            let shs = &env.config.shs_source_map;
            let suffix = shs.suffix(&self.weight);

            cx.exec(env.tools.otc2otf.invoke().path(collection.path()))
                .await?;

            let sources = collection.dir();
            let dest = env.layout.build.join("shs");
            tokio::fs::create_dir_all(&dest).await?;

            let mut moved = Vec::new();
            for prefix in shs.region.values() {
                let part = format!("{prefix}-{suffix}.otf");
                let from = sources.join(&part);
                if !from.is_file() {
                    continue;
                }

                let to = dest.join(&part);
                remove(&to).await?;
                tokio::fs::rename(&from, &to).await?;
                moved.push(part);
            }

            Ok(moved)
        }
    }
}

/// One OpenType font extracted by [`BreakTtc`].
pub struct ShsPart {
    pub prefix: ArcStr,
    pub weight: ArcStr,
}

impl ShsPart {
    fn path(&self, env: &Project) -> Utf8PathBuf {
        let suffix = env.config.shs_source_map.suffix(&self.weight);
        env.layout
            .build
            .join("shs")
            .join(format!("{}-{suffix}.otf", self.prefix))
    }
}

impl Rule<Project> for ShsPart {
    const NAME: &'static str = "shs-part";
    const KIND: TaskKind = TaskKind::File;
    type Output = Target;
    type Needs = Handle<Vec<String>>;

    fn params(&self) -> Params {
        params![&*self.prefix, &*self.weight]
    }

    fn target(&self, env: &Project) -> Option<Utf8PathBuf> {
        Some(self.path(env))
    }

    fn needs(&self, registry: &mut Registry<Project>) -> Result<Self::Needs, GraphError> {
        registry.request(BreakTtc {
            weight: self.weight.clone(),
        })
    }

    fn run<'a>(
        &'a self,
        cx: &'a Cx<'a>,
        _: Resolved<'a, Self, Project>,
    ) -> impl Future<Output = anyhow::Result<Target>> + Send + 'a {
        async move {
            let path = self.path(cx.env);
            if !path.is_file() {
                anyhow::bail!(
                    "{path} is missing; the source collection may not contain this region"
                );
            }
            Ok(Target::new(path))
        }
    }
}

/// A region's CJK source converted to TrueType outlines.
pub struct ShsTtf {
    pub region: ArcStr,
    pub weight: ArcStr,
}

impl ShsTtf {
    pub fn new(region: impl AsRef<str>, weight: impl AsRef<str>) -> Self {
        Self {
            region: region.as_ref().into(),
            weight: weight.as_ref().into(),
        }
    }

    fn path(&self, env: &Project) -> Utf8PathBuf {
        env.layout
            .build
            .join("shs")
            .join(format!("{}-{}.ttf", self.region, self.weight))
    }
}

impl Rule<Project> for ShsTtf {
    const NAME: &'static str = "shs-ttf";
    const KIND: TaskKind = TaskKind::File;
    type Output = Target;
    type Needs = Handle<Target>;

    fn params(&self) -> Params {
        params![&*self.region, &*self.weight]
    }

    fn target(&self, env: &Project) -> Option<Utf8PathBuf> {
        Some(self.path(env))
    }

    fn needs(&self, registry: &mut Registry<Project>) -> Result<Self::Needs, GraphError> {
        let env = registry.env();
        let prefix = env
            .config
            .shs_source_map
            .region
            .get(&*self.region)
            .ok_or_else(|| {
                GraphError::Plan(
                    format!("shs-ttf({}, {})", self.region, self.weight),
                    anyhow::anyhow!("no source prefix for region {}", self.region),
                )
            })?;

        registry.request(ShsPart {
            prefix: prefix.as_str().into(),
            weight: self.weight.clone(),
        })
    }

    fn run<'a>(
        &'a self,
        cx: &'a Cx<'a>,
        part: Resolved<'a, Self, Project>,
    ) -> impl Future<Output = anyhow::Result<Target>> + Send + 'a {
        async move {
            let out = self.path(cx.env);
            prepare(&out).await?;
            cx.exec(
                cx.env
                    .tools
                    .otf2ttf
                    .invoke()
                    .arg("-o")
                    .path(&out)
                    .path(part.path()),
            )
            .await?;
            Ok(Target::new(out))
        }
    }
}

/// Replacement glyphs for the classical region, converted to TrueType.
pub struct ShsClassicalOverride {
    pub weight: ArcStr,
}

impl ShsClassicalOverride {
    fn path(&self, env: &Project) -> Utf8PathBuf {
        env.layout
            .build
            .join("shs-classical-override")
            .join(format!("{}.ttf", self.weight))
    }
}

impl Rule<Project> for ShsClassicalOverride {
    const NAME: &'static str = "shs-classical-override";
    const KIND: TaskKind = TaskKind::File;
    type Output = Target;
    type Needs = Handle<Target>;

    fn params(&self) -> Params {
        params![&*self.weight]
    }

    fn target(&self, env: &Project) -> Option<Utf8PathBuf> {
        Some(self.path(env))
    }

    fn needs(&self, registry: &mut Registry<Project>) -> Result<Self::Needs, GraphError> {
        let env = registry.env();
        let shs = &env.config.shs_source_map;
        let prefix = shs.classical_override_prefix.as_deref().ok_or_else(|| {
            GraphError::Plan(
                format!("shs-classical-override({})", self.weight),
                anyhow::anyhow!("classicalOverridePrefix is not configured"),
            )
        })?;

        let weight = shs
            .classical_override_suffix_map
            .get(&*self.weight)
            .map(String::as_str)
            .unwrap_or(&*self.weight);

        registry.request(SourceFile::new(format!(
            "sources/shs-classical-override/{prefix}-{weight}.otf"
        )))
    }

    fn run<'a>(
        &'a self,
        cx: &'a Cx<'a>,
        source: Resolved<'a, Self, Project>,
    ) -> impl Future<Output = anyhow::Result<Target>> + Send + 'a {
        async move {
            let out = self.path(cx.env);
            prepare(&out).await?;
            cx.exec(
                cx.env
                    .tools
                    .otf2ttf
                    .invoke()
                    .arg("-o")
                    .path(&out)
                    .path(source.path()),
            )
            .await?;
            Ok(Target::new(out))
        }
    }
}

/// Latin glyphs of one latin group and style, as TrueType with
/// autohinting instructions removed (`ttfautohint -d`) or converted from
/// CFF outlines.
pub struct LatinSource {
    pub group: ArcStr,
    pub style: ArcStr,
}

impl LatinSource {
    pub fn new(group: impl AsRef<str>, style: impl AsRef<str>) -> Self {
        Self {
            group: group.as_ref().into(),
            style: style.as_ref().into(),
        }
    }

    fn path(&self, env: &Project) -> Utf8PathBuf {
        env.layout
            .build
            .join(format!("latin-{}", self.group))
            .join(format!("{}-{}.ttf", self.group, self.style))
    }
}

impl Rule<Project> for LatinSource {
    const NAME: &'static str = "latin-source";
    const KIND: TaskKind = TaskKind::File;
    type Output = Target;
    type Needs = (
        Handle<crate::config::Config>,
        Handle<()>,
        Handle<Target>,
        Option<Handle<String>>,
    );

    fn params(&self) -> Params {
        params![&*self.group, &*self.style]
    }

    fn target(&self, env: &Project) -> Option<Utf8PathBuf> {
        Some(self.path(env))
    }

    fn needs(&self, registry: &mut Registry<Project>) -> Result<Self::Needs, GraphError> {
        let env = registry.env();
        let is_cff = env.config.latin_group(&self.group).is_cff;
        let ext = if is_cff { "otf" } else { "ttf" };

        let config = registry.request(ConfigOracle)?;
        let scripts = registry.request(Scripts)?;
        let source = registry.request(SourceFile::new(format!(
            "sources/{0}/{0}-{1}.{ext}",
            self.group, self.style
        )))?;
        let check = match is_cff {
            true => None,
            false => Some(registry.request(CheckTool("ttfautohint"))?),
        };

        Ok((config, scripts, source, check))
    }

    fn run<'a>(
        &'a self,
        cx: &'a Cx<'a>,
        (config, _, source, _): Resolved<'a, Self, Project>,
    ) -> impl Future<Output = anyhow::Result<Target>> + Send + 'a {
        async move {
            let tools = &cx.env.tools;
            let out = self.path(cx.env);
            prepare(&out).await?;

            let invocation = if config.latin_group(&self.group).is_cff {
                tools.otf2ttf.invoke().arg("-o").path(&out).path(source.path())
            } else {
                tools.ttfautohint.invoke().arg("-d").path(source.path()).path(&out)
            };

            cx.exec(invocation).await?;
            Ok(Target::new(out))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Filter;
    use crate::config::tests::sample;
    use crate::engine::{Journal, Key, Registry, RunOptions, Runner};
    use crate::error::{KarakuriError, TaskError};
    use crate::pipeline::Layout;
    use crate::pipeline::tests::project;
    use crate::tool::{Tool, Toolchain};

    #[test]
    fn test_cff_latin_skips_autohinter_check() {
        let mut registry = Registry::new(project());

        registry.request(LatinSource::new("iosevka", "Bold")).unwrap();
        registry.request(LatinSource::new("inter", "Bold")).unwrap();

        let check = Key::new(TaskKind::Oracle, "check-tool", params!["ttfautohint"]);
        let check = registry.lookup(&check).unwrap();

        let cff = registry
            .lookup(&Key::new(TaskKind::File, "latin-source", params!["iosevka", "Bold"]))
            .unwrap();
        let ttf = registry
            .lookup(&Key::new(TaskKind::File, "latin-source", params!["inter", "Bold"]))
            .unwrap();

        assert!(!registry.needs_of(cff).contains(&check.index()));
        assert!(registry.needs_of(ttf).contains(&check.index()));
        assert_eq!(
            registry.target(cff).unwrap().as_str(),
            "/work/sarasa/.build/latin-iosevka/iosevka-Bold.ttf"
        );
    }

    #[test]
    fn test_regions_sharing_a_source_share_the_part() {
        let mut registry = Registry::new(project());

        registry.request(ShsTtf::new("SC", "Regular")).unwrap();
        registry.request(ShsTtf::new("J", "Regular")).unwrap();
        let before = registry.len();
        registry.request(ShsTtf::new("J", "Regular")).unwrap();
        assert_eq!(registry.len(), before);

        let part = Key::new(TaskKind::File, "shs-part", params!["SourceHanSans", "Regular"]);
        let part = registry.lookup(&part).unwrap();
        assert_eq!(
            registry.target(part).unwrap().as_str(),
            "/work/sarasa/.build/shs/SourceHanSans-Normal.otf"
        );

        let source = Key::new(
            TaskKind::File,
            "source",
            params!["sources/shs/SourceHanSans-Normal.ttc"],
        );
        assert!(registry.lookup(&source).is_some());
    }

    #[tokio::test]
    async fn test_missing_autohinter_skips_latin_source() {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();
        std::fs::write(root.join("package.json"), r#"{ "version": "1.0.0" }"#).unwrap();
        std::fs::create_dir_all(root.join("sources/inter")).unwrap();
        std::fs::write(root.join("sources/inter/inter-Bold.ttf"), "glyf").unwrap();

        let mut tools = Toolchain::from_env(&root);
        tools.ttfautohint = Tool::new("ttfautohint", "karakuri-no-such-autohinter");
        let env = Project::new(sample(), &Filter::default(), "1.0.0", Layout::new(root.clone()), tools)
            .unwrap();

        let mut registry = Registry::new(env);
        let latin = registry.request(LatinSource::new("inter", "Bold")).unwrap();
        let graph = registry.finish().unwrap();
        let check = graph
            .lookup(&Key::new(TaskKind::Oracle, "check-tool", params!["ttfautohint"]))
            .unwrap();

        let runner = Runner::new(&graph, Journal::in_memory(), RunOptions::default());
        let err = runner.run(&[latin.erase()]).await.unwrap_err();

        let KarakuriError::Failed(origins) = err else {
            panic!("expected task failures");
        };
        assert_eq!(origins.len(), 1);
        assert!(matches!(
            &*origins[0],
            TaskError::Recipe(label, e) if label == "check-tool(ttfautohint)"
                && format!("{e:#}").contains("<ttfautohint> could not be found")
        ));

        let report = runner.diagnostics();
        assert!(matches!(
            report.failed.get(&latin.index()).map(|e| &**e),
            Some(TaskError::Dependency { need, .. }) if need == "check-tool(ttfautohint)"
        ));
        assert!(!report.was_executed(latin.index()));
        assert!(report.failed.contains_key(&check.index()));
        assert!(!root.join(".build/latin-inter/inter-Bold.ttf").exists());
    }
}
