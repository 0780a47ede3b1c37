use std::future::Future;

use camino::Utf8PathBuf;

use crate::core::ArcStr;
use crate::engine::{Handle, Params, Registry, Resolved, Rule, Target, TaskKind};
use crate::error::GraphError;
use crate::params;
use crate::pipeline::glyph::Prod;
use crate::pipeline::{Cx, Hinting, Project, prepare, remove};

/// Every family and region of one style, collected into a font collection.
pub struct TtcFile {
    pub hinting: Hinting,
    pub style: ArcStr,
}

impl TtcFile {
    pub fn new(hinting: Hinting, style: impl AsRef<str>) -> Self {
        Self {
            hinting,
            style: style.as_ref().into(),
        }
    }

    fn path(&self, env: &Project) -> Utf8PathBuf {
        env.layout
            .out
            .join(self.hinting.ttc_dir())
            .join(format!("{}-{}.ttc", env.config.prefix, self.style))
    }
}

impl Rule<Project> for TtcFile {
    const NAME: &'static str = "ttc-file";
    const KIND: TaskKind = TaskKind::File;
    type Output = Target;
    type Needs = Vec<Handle<Target>>;

    fn params(&self) -> Params {
        params![self.hinting.as_str(), &*self.style]
    }

    fn target(&self, env: &Project) -> Option<Utf8PathBuf> {
        Some(self.path(env))
    }

    fn needs(&self, registry: &mut Registry<Project>) -> Result<Self::Needs, GraphError> {
        let env = registry.env();
        let config = &env.config;

        let mut fonts = Vec::new();
        for family in &config.family_order {
            for region in &config.subfamily_order {
                fonts.push(registry.request(Prod::new(self.hinting, family, region, &*self.style))?);
            }
        }

        Ok(fonts)
    }

    fn run<'a>(
        &'a self,
        cx: &'a Cx<'a>,
        fonts: Resolved<'a, Self, Project>,
    ) -> impl Future<Output = anyhow::Result<Target>> + Send + 'a {
        async move {
            let out = self.path(cx.env);
            prepare(&out).await?;

            let invocation = cx
                .env
                .tools
                .ttc_bundle
                .invoke()
                .arg("--verbose")
                .arg("-x")
                .arg("-o")
                .path(&out)
                .args(fonts.iter().map(|font| font.path().as_os_str()));

            cx.exec(invocation.current_dir(&cx.env.layout.root)).await?;
            Ok(Target::new(out))
        }
    }
}

/// Every TTC of one variant.
pub struct TtcFontFiles {
    pub hinting: Hinting,
}

impl Rule<Project> for TtcFontFiles {
    const NAME: &'static str = "ttc-font-files";
    const KIND: TaskKind = TaskKind::Task;
    type Output = ();
    type Needs = Vec<Handle<Target>>;

    fn params(&self) -> Params {
        params![self.hinting.as_str()]
    }

    fn needs(&self, registry: &mut Registry<Project>) -> Result<Self::Needs, GraphError> {
        let env = registry.env();
        registry.request_all(
            env.config
                .style_order
                .iter()
                .map(|style| TtcFile::new(self.hinting, style)),
        )
    }

    fn run<'a>(
        &'a self,
        _: &'a Cx<'a>,
        files: Resolved<'a, Self, Project>,
    ) -> impl Future<Output = anyhow::Result<()>> + Send + 'a {
        async move {
            tracing::debug!("{} {} collections ready", files.len(), self.hinting.as_str());
            Ok(())
        }
    }
}

/// Every release TTF of one variant.
pub struct TtfFontFiles {
    pub hinting: Hinting,
}

impl Rule<Project> for TtfFontFiles {
    const NAME: &'static str = "ttf-font-files";
    const KIND: TaskKind = TaskKind::Task;
    type Output = ();
    type Needs = Vec<Handle<Target>>;

    fn params(&self) -> Params {
        params![self.hinting.as_str()]
    }

    fn needs(&self, registry: &mut Registry<Project>) -> Result<Self::Needs, GraphError> {
        let env = registry.env();
        let config = &env.config;

        let mut fonts = Vec::new();
        for family in &config.family_order {
            for region in &config.subfamily_order {
                for style in &config.style_order {
                    fonts.push(registry.request(Prod::new(self.hinting, family, region, style))?);
                }
            }
        }

        Ok(fonts)
    }

    fn run<'a>(
        &'a self,
        _: &'a Cx<'a>,
        fonts: Resolved<'a, Self, Project>,
    ) -> impl Future<Output = anyhow::Result<()>> + Send + 'a {
        async move {
            tracing::debug!("{} {} fonts ready", fonts.len(), self.hinting.as_str());
            Ok(())
        }
    }
}

/// One collection holding every style of a variant.
pub struct SuperTtcFile {
    pub hinting: Hinting,
}

impl SuperTtcFile {
    pub fn path(&self, env: &Project) -> Utf8PathBuf {
        env.layout.out.join(".super-ttc").join(format!(
            "{}-Super{}.ttc",
            env.config.prefix,
            self.hinting.ttc_dir()
        ))
    }
}

impl Rule<Project> for SuperTtcFile {
    const NAME: &'static str = "super-ttc-file";
    const KIND: TaskKind = TaskKind::File;
    type Output = Target;
    type Needs = Vec<Handle<Target>>;

    fn params(&self) -> Params {
        params![self.hinting.as_str()]
    }

    fn target(&self, env: &Project) -> Option<Utf8PathBuf> {
        Some(self.path(env))
    }

    fn needs(&self, registry: &mut Registry<Project>) -> Result<Self::Needs, GraphError> {
        let env = registry.env();
        registry.request_all(
            env.config
                .style_order
                .iter()
                .map(|style| TtcFile::new(self.hinting, style)),
        )
    }

    fn run<'a>(
        &'a self,
        cx: &'a Cx<'a>,
        collections: Resolved<'a, Self, Project>,
    ) -> impl Future<Output = anyhow::Result<Target>> + Send + 'a {
        async move {
            let out = self.path(cx.env);
            prepare(&out).await?;

            let invocation = cx
                .env
                .tools
                .ttc_bundle
                .invoke()
                .arg("--verbose")
                .arg("-o")
                .path(&out)
                .args(collections.iter().map(|ttc| ttc.path().as_os_str()));

            cx.exec(invocation.current_dir(&cx.env.layout.root)).await?;
            Ok(Target::new(out))
        }
    }
}

/// A web font compressed from the hinted release TTF.
pub struct Woff2File {
    pub family: ArcStr,
    pub region: ArcStr,
    pub style: ArcStr,
}

impl Woff2File {
    pub fn new(family: impl AsRef<str>, region: impl AsRef<str>, style: impl AsRef<str>) -> Self {
        Self {
            family: family.as_ref().into(),
            region: region.as_ref().into(),
            style: style.as_ref().into(),
        }
    }

    fn path(&self, env: &Project) -> Utf8PathBuf {
        env.layout.out.join("WOFF2").join(format!(
            "{}.woff2",
            env.font_name(&self.family, &self.region, &self.style)
        ))
    }
}

impl Rule<Project> for Woff2File {
    const NAME: &'static str = "woff2-file";
    const KIND: TaskKind = TaskKind::File;
    type Output = Target;
    type Needs = Handle<Target>;

    fn params(&self) -> Params {
        params![&*self.family, &*self.region, &*self.style]
    }

    fn target(&self, env: &Project) -> Option<Utf8PathBuf> {
        Some(self.path(env))
    }

    fn needs(&self, registry: &mut Registry<Project>) -> Result<Self::Needs, GraphError> {
        registry.request(Prod::new(
            Hinting::Hinted,
            &*self.family,
            &*self.region,
            &*self.style,
        ))
    }

    fn run<'a>(
        &'a self,
        cx: &'a Cx<'a>,
        ttf: Resolved<'a, Self, Project>,
    ) -> impl Future<Output = anyhow::Result<Target>> + Send + 'a {
        async move {
            let out = self.path(cx.env);
            prepare(&out).await?;

            // The compressor always writes next to its input.
            let written = ttf.path().with_extension("woff2");
            cx.exec(cx.env.tools.woff2_compress.invoke().path(ttf.path()))
                .await?;

            remove(&out).await?;
            tokio::fs::rename(&written, &out).await?;
            Ok(Target::new(out))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Filter;
    use crate::engine::{Key, NodeRef};
    use crate::pipeline::tests::{project, project_with};

    #[test]
    fn test_ttc_collects_every_family_and_region_of_a_style() {
        let mut registry = Registry::new(project());
        let ttc = registry.request(TtcFile::new(Hinting::Unhinted, "Bold")).unwrap();

        assert_eq!(
            registry.target(ttc).unwrap().as_str(),
            "/work/sarasa/out/TTC-Unhinted/Sarasa-Bold.ttc"
        );

        let labels: Vec<&str> = registry
            .needs_of(ttc)
            .iter()
            .map(|&i| registry.label(NodeRef(i)))
            .collect();
        assert_eq!(
            labels,
            vec![
                "prod(unhinted, Gothic, SC, Bold)",
                "prod(unhinted, Gothic, J, Bold)",
                "prod(unhinted, Mono, SC, Bold)",
                "prod(unhinted, Mono, J, Bold)",
            ]
        );
    }

    #[test]
    fn test_super_ttc_shares_the_per_style_collections() {
        let mut registry = Registry::new(project());
        let super_ttc = registry.request(SuperTtcFile { hinting: Hinting::Hinted }).unwrap();
        registry.request(TtcFontFiles { hinting: Hinting::Hinted }).unwrap();

        assert_eq!(
            registry.target(super_ttc).unwrap().as_str(),
            "/work/sarasa/out/.super-ttc/Sarasa-SuperTTC.ttc"
        );
        assert_eq!(registry.needs_of(super_ttc).len(), 4);

        let files = Key::new(TaskKind::Task, "ttc-font-files", params!["hinted"]);
        let files = registry.lookup(&files).unwrap();
        assert_eq!(registry.needs_of(files), registry.needs_of(super_ttc));
    }

    #[test]
    fn test_ttf_files_follow_the_filter() {
        let project = project_with(Filter {
            families: Some(vec!["Mono".into()]),
            styles: Some(vec!["Italic".into()]),
            ..Filter::default()
        });
        let mut registry = Registry::new(project);
        let files = registry.request(TtfFontFiles { hinting: Hinting::Unhinted }).unwrap();

        let labels: Vec<&str> = registry
            .needs_of(files)
            .iter()
            .map(|&i| registry.label(NodeRef(i)))
            .collect();
        assert_eq!(
            labels,
            vec!["prod(unhinted, Mono, SC, Italic)", "prod(unhinted, Mono, J, Italic)"]
        );
    }

    #[test]
    fn test_woff2_is_made_from_the_hinted_font() {
        let mut registry = Registry::new(project());
        let woff2 = registry.request(Woff2File::new("Gothic", "J", "Regular")).unwrap();

        assert_eq!(
            registry.target(woff2).unwrap().as_str(),
            "/work/sarasa/out/WOFF2/SarasaGothicJ-Regular.woff2"
        );
        let prod = registry.needs_of(woff2)[0];
        assert_eq!(
            registry.label(NodeRef(prod)),
            "prod(hinted, Gothic, J, Regular)"
        );
    }
}
