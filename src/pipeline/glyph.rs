use std::future::Future;
use std::marker::PhantomData;

use camino::Utf8PathBuf;
use serde_json::{Value, json};

use crate::config::{Config, Flags};
use crate::core::ArcStr;
use crate::engine::{Handle, Params, Registry, Resolved, Rule, Target, TaskKind};
use crate::error::GraphError;
use crate::params;
use crate::pipeline::hint::{HintedFont, Piece};
use crate::pipeline::oracle::{CheckTool, ConfigOracle, Scripts, Version};
use crate::pipeline::source::{LatinSource, ShsClassicalOverride, ShsTtf};
use crate::pipeline::{Cx, Hinting, Project, prepare, run_script};

fn unknown_family(label: String, family: &str) -> GraphError {
    GraphError::Plan(label, anyhow::anyhow!("unknown family {family}"))
}

/// Merges the family flags into a script argument object.
fn with_flags(mut args: Value, flags: Flags) -> Value {
    if let (Value::Object(args), Ok(Value::Object(flags))) = (&mut args, serde_json::to_value(flags)) {
        args.extend(flags);
    }
    args
}

/// A glyph subset cut out of a region's CJK source.
pub trait Split: Send + Sync + 'static {
    const NAME: &'static str;
    /// Script under `make/`.
    const SCRIPT: &'static str;
    /// Whether the classical region takes glyphs from the override font.
    const CLASSICAL: bool = false;
}

pub struct KanjiSplit;
pub struct HangulSplit;
pub struct NonKanjiSplit;

impl Split for KanjiSplit {
    const NAME: &'static str = "kanji0";
    const SCRIPT: &'static str = "kanji/build.mjs";
    const CLASSICAL: bool = true;
}

impl Split for HangulSplit {
    const NAME: &'static str = "hangul0";
    const SCRIPT: &'static str = "hangul/build.mjs";
}

impl Split for NonKanjiSplit {
    const NAME: &'static str = "non-kanji0";
    const SCRIPT: &'static str = "non-kanji/build.mjs";
}

pub type Kanji0 = FromShs<KanjiSplit>;
pub type Hangul0 = FromShs<HangulSplit>;
pub type NonKanji0 = FromShs<NonKanjiSplit>;

/// `.build/<split>/<region>-<style>.ttf`
pub struct FromShs<S> {
    pub region: ArcStr,
    pub style: ArcStr,
    _split: PhantomData<fn() -> S>,
}

impl<S: Split> FromShs<S> {
    pub fn new(region: impl AsRef<str>, style: impl AsRef<str>) -> Self {
        Self {
            region: region.as_ref().into(),
            style: style.as_ref().into(),
            _split: PhantomData,
        }
    }

    fn path(&self, env: &Project) -> Utf8PathBuf {
        env.layout
            .build
            .join(S::NAME)
            .join(format!("{}-{}.ttf", self.region, self.style))
    }
}

impl<S: Split> Rule<Project> for FromShs<S> {
    const NAME: &'static str = S::NAME;
    const KIND: TaskKind = TaskKind::File;
    type Output = Target;
    type Needs = (Handle<()>, Handle<Target>, Option<Handle<Target>>);

    fn params(&self) -> Params {
        params![&*self.region, &*self.style]
    }

    fn target(&self, env: &Project) -> Option<Utf8PathBuf> {
        Some(self.path(env))
    }

    fn needs(&self, registry: &mut Registry<Project>) -> Result<Self::Needs, GraphError> {
        let env = registry.env();
        let classical = S::CLASSICAL && env.config.shs_source_map.has_classical_override(&self.region);

        let scripts = registry.request(Scripts)?;
        let main = registry.request(ShsTtf::new(&*self.region, &*self.style))?;
        let classical = match classical {
            true => Some(registry.request(ShsClassicalOverride {
                weight: self.style.clone(),
            })?),
            false => None,
        };

        Ok((scripts, main, classical))
    }

    fn run<'a>(
        &'a self,
        cx: &'a Cx<'a>,
        (_, main, classical): Resolved<'a, Self, Project>,
    ) -> impl Future<Output = anyhow::Result<Target>> + Send + 'a {
        async move {
            let out = self.path(cx.env);
            prepare(&out).await?;

            let mut args = json!({ "main": main.path(), "o": out });
            if S::CLASSICAL {
                args["classicalOverride"] = json!(classical.map(|t| t.path()));
            }

            run_script(cx, S::SCRIPT, args).await?;
            Ok(Target::new(out))
        }
    }
}

/// A punctuation block, built per family since its metrics follow the
/// family's latin glyphs.
pub trait Block: Send + Sync + 'static {
    const NAME: &'static str;
    const SCRIPT: &'static str;
}

pub struct WsBlock;
pub struct AsBlock;
pub struct FeMiscBlock;

impl Block for WsBlock {
    const NAME: &'static str = "ws0";
    const SCRIPT: &'static str = "punct/ws.mjs";
}

impl Block for AsBlock {
    const NAME: &'static str = "as0";
    const SCRIPT: &'static str = "punct/as.mjs";
}

impl Block for FeMiscBlock {
    const NAME: &'static str = "fe-misc0";
    const SCRIPT: &'static str = "punct/fe-misc.mjs";
}

pub type Ws0 = Punct<WsBlock>;
pub type As0 = Punct<AsBlock>;
pub type FeMisc0 = Punct<FeMiscBlock>;

/// `.build/<block>/<family>-<region>-<style>.ttf`
pub struct Punct<B> {
    pub family: ArcStr,
    pub region: ArcStr,
    pub style: ArcStr,
    _block: PhantomData<fn() -> B>,
}

impl<B: Block> Punct<B> {
    pub fn new(family: impl AsRef<str>, region: impl AsRef<str>, style: impl AsRef<str>) -> Self {
        Self {
            family: family.as_ref().into(),
            region: region.as_ref().into(),
            style: style.as_ref().into(),
            _block: PhantomData,
        }
    }

    fn path(&self, env: &Project) -> Utf8PathBuf {
        env.layout
            .build
            .join(B::NAME)
            .join(format!("{}-{}-{}.ttf", self.family, self.region, self.style))
    }
}

impl<B: Block> Rule<Project> for Punct<B> {
    const NAME: &'static str = B::NAME;
    const KIND: TaskKind = TaskKind::File;
    type Output = Target;
    type Needs = (Handle<Config>, Handle<()>, Handle<Target>, Handle<Target>);

    fn params(&self) -> Params {
        params![&*self.family, &*self.region, &*self.style]
    }

    fn target(&self, env: &Project) -> Option<Utf8PathBuf> {
        Some(self.path(env))
    }

    fn needs(&self, registry: &mut Registry<Project>) -> Result<Self::Needs, GraphError> {
        let env = registry.env();
        let family = env
            .config
            .family(&self.family)
            .ok_or_else(|| unknown_family(format!("{}({})", B::NAME, self.family), &self.family))?;

        Ok((
            registry.request(ConfigOracle)?,
            registry.request(Scripts)?,
            registry.request(NonKanji0::new(&*self.region, &*self.style))?,
            registry.request(LatinSource::new(&family.latin_group, &*self.style))?,
        ))
    }

    fn run<'a>(
        &'a self,
        cx: &'a Cx<'a>,
        (config, _, main, lgc): Resolved<'a, Self, Project>,
    ) -> impl Future<Output = anyhow::Result<Target>> + Send + 'a {
        async move {
            let out = self.path(cx.env);
            prepare(&out).await?;

            let flags = config
                .family(&self.family)
                .map(Flags::from)
                .unwrap_or_default();

            let args = json!({
                "family": &*self.family,
                "region": &*self.region,
                "style": &*self.style,
                "main": main.path(),
                "lgc": lgc.path(),
                "o": out,
            });

            run_script(cx, B::SCRIPT, with_flags(args, flags)).await?;
            Ok(Target::new(out))
        }
    }
}

/// Latin, punctuation and the remaining non-ideographic glyphs merged into
/// one font per family, region and style.
pub struct Pass1 {
    pub family: ArcStr,
    pub region: ArcStr,
    pub style: ArcStr,
}

impl Pass1 {
    pub fn new(family: impl AsRef<str>, region: impl AsRef<str>, style: impl AsRef<str>) -> Self {
        Self {
            family: family.as_ref().into(),
            region: region.as_ref().into(),
            style: style.as_ref().into(),
        }
    }

    fn path(&self, env: &Project) -> Utf8PathBuf {
        env.layout
            .build
            .join("pass1")
            .join(format!("{}-{}-{}.ttf", self.family, self.region, self.style))
    }
}

impl Rule<Project> for Pass1 {
    const NAME: &'static str = "pass1";
    const KIND: TaskKind = TaskKind::File;
    type Output = Target;
    type Needs = (
        Handle<Config>,
        Handle<()>,
        Handle<String>,
        Handle<Target>,
        Handle<Target>,
        Handle<Target>,
        Handle<Target>,
    );

    fn params(&self) -> Params {
        params![&*self.family, &*self.region, &*self.style]
    }

    fn target(&self, env: &Project) -> Option<Utf8PathBuf> {
        Some(self.path(env))
    }

    fn needs(&self, registry: &mut Registry<Project>) -> Result<Self::Needs, GraphError> {
        let env = registry.env();
        let family = env
            .config
            .family(&self.family)
            .ok_or_else(|| unknown_family(format!("pass1({})", self.family), &self.family))?;
        let upright = env.config.deitalized(&self.style);
        let (f, r) = (&*self.family, &*self.region);

        Ok((
            registry.request(ConfigOracle)?,
            registry.request(Scripts)?,
            registry.request(Version)?,
            registry.request(LatinSource::new(&family.latin_group, &*self.style))?,
            registry.request(As0::new(f, r, &upright))?,
            registry.request(Ws0::new(f, r, &upright))?,
            registry.request(FeMisc0::new(f, r, &upright))?,
        ))
    }

    fn run<'a>(
        &'a self,
        cx: &'a Cx<'a>,
        (config, _, version, latin, as0, ws0, fe_misc0): Resolved<'a, Self, Project>,
    ) -> impl Future<Output = anyhow::Result<Target>> + Send + 'a {
        async move {
            let out = self.path(cx.env);
            prepare(&out).await?;

            let family = config
                .family(&self.family)
                .ok_or_else(|| anyhow::anyhow!("unknown family {}", self.family))?;

            let args = json!({
                "main": latin.path(),
                "as": as0.path(),
                "ws": ws0.path(),
                "feMisc": fe_misc0.path(),
                "o": out,
                "family": &*self.family,
                "subfamily": &*self.region,
                "style": &*self.style,
                "italize": config.is_italic(&self.style),
                "version": version,
                "latinCfg": config.latin_group(&family.latin_group),
            });

            run_script(cx, "pass1/index.mjs", with_flags(args, Flags::from(family))).await?;
            Ok(Target::new(out))
        }
    }
}

/// [`Pass1`] run through the autohinter, as input for the hinting engine.
pub struct Pass1Hinted {
    pub family: ArcStr,
    pub region: ArcStr,
    pub style: ArcStr,
}

impl Pass1Hinted {
    pub fn new(family: impl AsRef<str>, region: impl AsRef<str>, style: impl AsRef<str>) -> Self {
        Self {
            family: family.as_ref().into(),
            region: region.as_ref().into(),
            style: style.as_ref().into(),
        }
    }

    fn path(&self, env: &Project) -> Utf8PathBuf {
        env.layout
            .build
            .join("pass1-hinted")
            .join(format!("{}-{}-{}.ttf", self.family, self.region, self.style))
    }
}

impl Rule<Project> for Pass1Hinted {
    const NAME: &'static str = "pass1-hinted";
    const KIND: TaskKind = TaskKind::File;
    type Output = Target;
    type Needs = (Handle<Target>, Handle<String>);

    fn params(&self) -> Params {
        params![&*self.family, &*self.region, &*self.style]
    }

    fn target(&self, env: &Project) -> Option<Utf8PathBuf> {
        Some(self.path(env))
    }

    fn needs(&self, registry: &mut Registry<Project>) -> Result<Self::Needs, GraphError> {
        Ok((
            registry.request(Pass1::new(&*self.family, &*self.region, &*self.style))?,
            registry.request(CheckTool("ttfautohint"))?,
        ))
    }

    fn run<'a>(
        &'a self,
        cx: &'a Cx<'a>,
        (pass1, _): Resolved<'a, Self, Project>,
    ) -> impl Future<Output = anyhow::Result<Target>> + Send + 'a {
        async move {
            let out = self.path(cx.env);
            prepare(&out).await?;
            cx.exec(cx.env.tools.ttfautohint.invoke().path(pass1.path()).path(&out))
                .await?;
            Ok(Target::new(out))
        }
    }
}

/// A release font: pass1 merged with the ideographs and hangul of its
/// upright weight, hinted or not.
pub struct Prod {
    pub hinting: Hinting,
    pub family: ArcStr,
    pub region: ArcStr,
    pub style: ArcStr,
}

impl Prod {
    pub fn new(
        hinting: Hinting,
        family: impl AsRef<str>,
        region: impl AsRef<str>,
        style: impl AsRef<str>,
    ) -> Self {
        Self {
            hinting,
            family: family.as_ref().into(),
            region: region.as_ref().into(),
            style: style.as_ref().into(),
        }
    }

    pub fn path(&self, env: &Project) -> Utf8PathBuf {
        env.layout.out.join(self.hinting.ttf_dir()).join(format!(
            "{}.ttf",
            env.font_name(&self.family, &self.region, &self.style)
        ))
    }
}

impl Rule<Project> for Prod {
    const NAME: &'static str = "prod";
    const KIND: TaskKind = TaskKind::File;
    type Output = Target;
    type Needs = (
        Handle<()>,
        Handle<String>,
        Handle<Target>,
        Handle<Target>,
        Handle<Target>,
    );

    fn params(&self) -> Params {
        params![
            self.hinting.as_str(),
            &*self.family,
            &*self.region,
            &*self.style
        ]
    }

    fn target(&self, env: &Project) -> Option<Utf8PathBuf> {
        Some(self.path(env))
    }

    fn needs(&self, registry: &mut Registry<Project>) -> Result<Self::Needs, GraphError> {
        let env = registry.env();
        let weight = env.config.deitalized(&self.style);
        let (f, r, s) = (&*self.family, &*self.region, &*self.style);

        let scripts = registry.request(Scripts)?;
        let version = registry.request(Version)?;

        let (main, kanji, hangul) = match self.hinting {
            Hinting::Hinted => (
                registry.request(HintedFont(Piece::pass1(&weight, f, r, s)))?,
                registry.request(HintedFont(Piece::hani(&weight, r, &weight)))?,
                registry.request(HintedFont(Piece::hang(&weight, r, &weight)))?,
            ),
            Hinting::Unhinted => (
                registry.request(Pass1::new(f, r, s))?,
                registry.request(Kanji0::new(r, &weight))?,
                registry.request(Hangul0::new(r, &weight))?,
            ),
        };

        Ok((scripts, version, main, kanji, hangul))
    }

    fn run<'a>(
        &'a self,
        cx: &'a Cx<'a>,
        (_, version, main, kanji, hangul): Resolved<'a, Self, Project>,
    ) -> impl Future<Output = anyhow::Result<Target>> + Send + 'a {
        async move {
            let out = self.path(cx.env);
            prepare(&out).await?;

            let args = json!({
                "main": main.path(),
                "kanji": kanji.path(),
                "hangul": hangul.path(),
                "o": out,
                "italize": cx.env.config.is_italic(&self.style),
                "version": version,
            });

            run_script(cx, "pass2/index.mjs", args).await?;
            Ok(Target::new(out))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::Key;
    use crate::pipeline::tests::project;

    #[test]
    fn test_flags_are_flattened_into_arguments() {
        let flags = Flags {
            mono: true,
            pwid: true,
            ..Flags::default()
        };

        let args = with_flags(json!({ "o": "x.ttf" }), flags);
        assert_eq!(args["o"], "x.ttf");
        assert_eq!(args["mono"], true);
        assert_eq!(args["pwid"], true);
        assert_eq!(args["goth"], false);
    }

    #[test]
    fn test_italic_pass1_reuses_upright_punctuation() {
        let mut registry = Registry::new(project());
        registry.request(Pass1::new("Gothic", "SC", "BoldItalic")).unwrap();
        registry.request(Pass1::new("Gothic", "SC", "Bold")).unwrap();

        let ws = Key::new(TaskKind::File, "ws0", params!["Gothic", "SC", "Bold"]);
        assert!(registry.lookup(&ws).is_some());

        let italic = Key::new(TaskKind::File, "ws0", params!["Gothic", "SC", "BoldItalic"]);
        assert!(registry.lookup(&italic).is_none());

        let latin = Key::new(TaskKind::File, "latin-source", params!["inter", "BoldItalic"]);
        assert!(registry.lookup(&latin).is_some());
    }

    #[test]
    fn test_classical_override_only_for_classical_region() {
        let mut registry = Registry::new(project());
        registry.request(Kanji0::new("SC", "Regular")).unwrap();
        registry.request(Kanji0::new("J", "Regular")).unwrap();
        registry.request(Hangul0::new("SC", "Regular")).unwrap();

        let sc = registry
            .lookup(&Key::new(TaskKind::File, "kanji0", params!["SC", "Regular"]))
            .unwrap();
        let j = registry
            .lookup(&Key::new(TaskKind::File, "kanji0", params!["J", "Regular"]))
            .unwrap();
        let hangul = registry
            .lookup(&Key::new(TaskKind::File, "hangul0", params!["SC", "Regular"]))
            .unwrap();

        assert_eq!(registry.needs_of(sc).len(), 3);
        assert_eq!(registry.needs_of(j).len(), 2);
        assert_eq!(registry.needs_of(hangul).len(), 2);
    }

    #[test]
    fn test_unhinted_prod_skips_hinting() {
        let mut registry = Registry::new(project());
        let prod = registry
            .request(Prod::new(Hinting::Unhinted, "Mono", "J", "Italic"))
            .unwrap();

        assert_eq!(
            registry.target(prod).unwrap().as_str(),
            "/work/sarasa/out/TTF-Unhinted/SarasaMonoJ-Italic.ttf"
        );

        let labels: Vec<_> = registry
            .needs_of(prod)
            .iter()
            .map(|&i| registry.label(crate::engine::NodeRef(i)).to_string())
            .collect();
        assert_eq!(
            labels,
            vec![
                "scripts",
                "version",
                "pass1(Mono, J, Italic)",
                "kanji0(J, Regular)",
                "hangul0(J, Regular)",
            ]
        );
    }
}
