//! Batched hinting.
//!
//! Each upright weight is hinted in one go: all of its fonts are fed to a
//! single `chlorophytum hint` call that writes one aggregate file, the
//! per-font hint files are picked out of it, and a single `instruct` call
//! turns them into hinted fonts. The hinting engine keeps a cache between
//! weights, so weights are processed strictly one after the other.

use std::future::Future;
use std::sync::Arc;

use camino::{Utf8Path, Utf8PathBuf};

use crate::config::Config;
use crate::core::ArcStr;
use crate::engine::{Handle, Params, Registry, Resolved, Rule, Stage, Target, TaskKind, WeightChain};
use crate::error::GraphError;
use crate::params;
use crate::pipeline::glyph::{Hangul0, Kanji0, Pass1Hinted};
use crate::pipeline::oracle::HintingJobs;
use crate::pipeline::source::SourceFile;
use crate::pipeline::{Cx, Layout, Project, expect_file, prepare};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Part {
    /// Latin and punctuation, one font per family, region and style.
    Pass1,
    /// Ideographs, one font per region.
    Hani,
    /// Hangul, one font per region.
    Hang,
}

impl Part {
    pub const fn as_str(self) -> &'static str {
        match self {
            Part::Pass1 => "pass1",
            Part::Hani => "hani",
            Part::Hang => "hang",
        }
    }
}

/// One font going through batched hinting.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Piece {
    pub part: Part,
    /// The upright weight whose batch this piece belongs to.
    pub weight: ArcStr,
    /// `[family,] region, style`
    pub names: Vec<ArcStr>,
}

impl Piece {
    pub fn pass1(weight: &str, family: &str, region: &str, style: &str) -> Self {
        Self {
            part: Part::Pass1,
            weight: weight.into(),
            names: vec![family.into(), region.into(), style.into()],
        }
    }

    pub fn hani(weight: &str, region: &str, style: &str) -> Self {
        Self {
            part: Part::Hani,
            weight: weight.into(),
            names: vec![region.into(), style.into()],
        }
    }

    pub fn hang(weight: &str, region: &str, style: &str) -> Self {
        Self {
            part: Part::Hang,
            weight: weight.into(),
            names: vec![region.into(), style.into()],
        }
    }

    fn params(&self) -> Params {
        let mut params = params![self.part.as_str(), &*self.weight];
        for name in &self.names {
            params.push(name);
        }
        params
    }

    pub fn stem(&self) -> String {
        self.names
            .iter()
            .map(|s| &**s)
            .collect::<Vec<_>>()
            .join("-")
    }

    fn dir(&self, layout: &Layout) -> Utf8PathBuf {
        layout
            .build
            .join(format!("hf-{}", self.weight))
            .join(self.part.as_str())
    }

    /// The piece's share of the aggregate hint data.
    pub fn hint_path(&self, layout: &Layout) -> Utf8PathBuf {
        self.dir(layout).join(format!("{}.hint.gz", self.stem()))
    }

    /// The hinted font.
    pub fn output_path(&self, layout: &Layout) -> Utf8PathBuf {
        self.dir(layout).join(format!("{}.ttf", self.stem()))
    }

    /// The unhinted font this piece starts from.
    fn input(&self, registry: &mut Registry<Project>) -> Result<Handle<Target>, GraphError> {
        match (self.part, self.names.as_slice()) {
            (Part::Pass1, [family, region, style]) => {
                registry.request(Pass1Hinted::new(&**family, &**region, &**style))
            }
            (Part::Hani, [region, style]) => registry.request(Kanji0::new(&**region, &**style)),
            (Part::Hang, [region, style]) => registry.request(Hangul0::new(&**region, &**style)),
            _ => Err(GraphError::Plan(
                format!("hint({})", self.stem()),
                anyhow::anyhow!("malformed {} piece", self.part.as_str()),
            )),
        }
    }
}

/// Everything one weight's hinting stage touches, listed once.
///
/// The three lists are index-aligned with every command line and every
/// list of needs built from them: the n-th input, the n-th hint file and
/// the n-th output always describe the same font.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HintBatch {
    pub pass1: Vec<Piece>,
    pub hani: Vec<Piece>,
    pub hang: Vec<Piece>,
}

impl HintBatch {
    pub fn plan(config: &Config, weight: &str) -> Self {
        let mut batch = Self::default();

        for region in &config.subfamily_order {
            batch.hani.push(Piece::hani(weight, region, weight));
            batch.hang.push(Piece::hang(weight, region, weight));
        }

        for family in &config.family_order {
            for region in &config.subfamily_order {
                for style in config.styles_of_weight(weight) {
                    batch.pass1.push(Piece::pass1(weight, family, region, style));
                }
            }
        }

        batch
    }

    /// The far-eastern pieces, ideographs first.
    pub fn fe(&self) -> impl Iterator<Item = &Piece> {
        self.hani.iter().chain(&self.hang)
    }

    pub fn all(&self) -> impl Iterator<Item = &Piece> {
        self.pass1.iter().chain(self.fe())
    }

    pub fn len(&self) -> usize {
        self.pass1.len() + self.hani.len() + self.hang.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn batch_of(env: &Project, weight: &str) -> Result<Arc<HintBatch>, GraphError> {
    env.hint_batch(weight).cloned().ok_or_else(|| {
        GraphError::Plan(
            format!("hint({weight})"),
            anyhow::anyhow!("{weight} is not an active upright weight"),
        )
    })
}

/// Per-piece files a batch step writes next to its own result.
fn side_files<'b, I>(
    env: &'b Project,
    weight: &str,
    pieces: impl FnOnce(&'b HintBatch) -> I,
    path: fn(&Piece, &Layout) -> Utf8PathBuf,
) -> Vec<Utf8PathBuf>
where
    I: Iterator<Item = &'b Piece>,
{
    match env.hint_batch(weight) {
        Some(batch) => pieces(&**batch).map(|piece| path(piece, &env.layout)).collect(),
        None => Vec::new(),
    }
}

fn hint_config(weight: &str) -> SourceFile {
    SourceFile::new(format!("hcfg/{weight}.json"))
}

fn inputs<'p>(
    registry: &mut Registry<Project>,
    pieces: impl Iterator<Item = &'p Piece>,
) -> Result<Vec<Handle<Target>>, GraphError> {
    pieces.map(|piece| piece.input(registry)).collect()
}

/// Runs `chlorophytum hint` over `(input, hint)` pairs into one aggregate.
async fn hint(
    cx: &Cx<'_>,
    config: &Utf8Path,
    out: &Utf8Path,
    jobs: usize,
    pairs: impl Iterator<Item = (&Piece, &Target)>,
) -> anyhow::Result<()> {
    let layout = &cx.env.layout;
    prepare(out).await?;

    let mut invocation = cx
        .env
        .tools
        .chlorophytum
        .invoke()
        .arg("hint")
        .arg("-c")
        .path(config)
        .arg("-h")
        .path(out)
        .arg("--jobs")
        .arg(jobs.to_string());

    for (piece, input) in pairs {
        let hint = piece.hint_path(layout);
        prepare(&hint).await?;
        invocation = invocation.path(input.path()).path(hint);
    }

    cx.exec(invocation.current_dir(&layout.root)).await?;
    Ok(())
}

/// Aggregate hinting of one weight's pass1 fonts.
pub struct HintPass1 {
    pub weight: ArcStr,
}

impl Rule<Project> for HintPass1 {
    const NAME: &'static str = "hint-pass1";
    const KIND: TaskKind = TaskKind::File;
    type Output = Target;
    type Needs = (Handle<usize>, Handle<Target>, Vec<Handle<Target>>);

    fn params(&self) -> Params {
        params![&*self.weight]
    }

    fn target(&self, env: &Project) -> Option<Utf8PathBuf> {
        Some(env.layout.build.join(".hc").join(format!("{}-pass1.gz", self.weight)))
    }

    fn produces(&self, env: &Project, _: &Target) -> Vec<Utf8PathBuf> {
        side_files(env, &self.weight, |batch| batch.pass1.iter(), Piece::hint_path)
    }

    fn needs(&self, registry: &mut Registry<Project>) -> Result<Self::Needs, GraphError> {
        let batch = batch_of(&registry.env(), &self.weight)?;
        Ok((
            registry.request(HintingJobs)?,
            registry.request(hint_config(&self.weight))?,
            inputs(registry, batch.pass1.iter())?,
        ))
    }

    fn run<'a>(
        &'a self,
        cx: &'a Cx<'a>,
        (jobs, config, inputs): Resolved<'a, Self, Project>,
    ) -> impl Future<Output = anyhow::Result<Target>> + Send + 'a {
        async move {
            let batch = batch_of(cx.env, &self.weight)?;
            let out = cx.env.layout.build.join(".hc").join(format!("{}-pass1.gz", self.weight));

            hint(cx, config.path(), &out, *jobs, batch.pass1.iter().zip(inputs)).await?;
            Ok(Target::new(out))
        }
    }
}

/// Aggregate hinting of one weight's ideographs and hangul.
pub struct HintFe {
    pub weight: ArcStr,
}

impl Rule<Project> for HintFe {
    const NAME: &'static str = "hint-fe";
    const KIND: TaskKind = TaskKind::File;
    type Output = Target;
    type Needs = (Handle<usize>, Handle<Target>, Vec<Handle<Target>>);

    fn params(&self) -> Params {
        params![&*self.weight]
    }

    fn target(&self, env: &Project) -> Option<Utf8PathBuf> {
        Some(env.layout.build.join(".hc").join(format!("{}-fe.gz", self.weight)))
    }

    fn produces(&self, env: &Project, _: &Target) -> Vec<Utf8PathBuf> {
        side_files(env, &self.weight, HintBatch::fe, Piece::hint_path)
    }

    fn needs(&self, registry: &mut Registry<Project>) -> Result<Self::Needs, GraphError> {
        let batch = batch_of(&registry.env(), &self.weight)?;
        Ok((
            registry.request(HintingJobs)?,
            registry.request(hint_config(&self.weight))?,
            inputs(registry, batch.fe())?,
        ))
    }

    fn run<'a>(
        &'a self,
        cx: &'a Cx<'a>,
        (jobs, config, inputs): Resolved<'a, Self, Project>,
    ) -> impl Future<Output = anyhow::Result<Target>> + Send + 'a {
        async move {
            let batch = batch_of(cx.env, &self.weight)?;
            let out = cx.env.layout.build.join(".hc").join(format!("{}-fe.gz", self.weight));

            hint(cx, config.path(), &out, *jobs, batch.fe().zip(inputs)).await?;
            Ok(Target::new(out))
        }
    }
}

/// A single font's hint file, redistributed from its weight's aggregate.
pub struct HintData(pub Piece);

impl Rule<Project> for HintData {
    const NAME: &'static str = "hint-data";
    const KIND: TaskKind = TaskKind::File;
    type Output = Target;
    type Needs = Handle<Target>;

    fn params(&self) -> Params {
        self.0.params()
    }

    fn target(&self, env: &Project) -> Option<Utf8PathBuf> {
        Some(self.0.hint_path(&env.layout))
    }

    fn needs(&self, registry: &mut Registry<Project>) -> Result<Self::Needs, GraphError> {
        let weight = self.0.weight.clone();
        match self.0.part {
            Part::Pass1 => registry.request(HintPass1 { weight }),
            Part::Hani | Part::Hang => registry.request(HintFe { weight }),
        }
    }

    fn run<'a>(
        &'a self,
        cx: &'a Cx<'a>,
        _: Resolved<'a, Self, Project>,
    ) -> impl Future<Output = anyhow::Result<Target>> + Send + 'a {
        async move { expect_file(self.0.hint_path(&cx.env.layout)) }
    }
}

/// Completes once both aggregates of a weight exist. This is the node the
/// next weight in the chain waits for.
pub struct GroupHint {
    pub weight: ArcStr,
}

impl Rule<Project> for GroupHint {
    const NAME: &'static str = "group-hint";
    const KIND: TaskKind = TaskKind::Task;
    type Output = ();
    type Needs = (Handle<Target>, Handle<Target>);

    fn params(&self) -> Params {
        params![&*self.weight]
    }

    fn needs(&self, registry: &mut Registry<Project>) -> Result<Self::Needs, GraphError> {
        Ok((
            registry.request(HintPass1 {
                weight: self.weight.clone(),
            })?,
            registry.request(HintFe {
                weight: self.weight.clone(),
            })?,
        ))
    }

    fn run<'a>(
        &'a self,
        _: &'a Cx<'a>,
        _: Resolved<'a, Self, Project>,
    ) -> impl Future<Output = anyhow::Result<()>> + Send + 'a {
        async move { Ok(()) }
    }
}

/// Applies one weight's hints with `chlorophytum instruct`.
pub struct GroupInstr {
    pub weight: ArcStr,
}

impl Rule<Project> for GroupInstr {
    const NAME: &'static str = "group-instr";
    const KIND: TaskKind = TaskKind::Task;
    type Output = usize;
    type Needs = (
        Handle<Target>,
        Handle<()>,
        Vec<Handle<Target>>,
        Vec<Handle<Target>>,
    );

    fn params(&self) -> Params {
        params![&*self.weight]
    }

    fn produces(&self, env: &Project, _: &usize) -> Vec<Utf8PathBuf> {
        side_files(env, &self.weight, HintBatch::all, Piece::output_path)
    }

    fn needs(&self, registry: &mut Registry<Project>) -> Result<Self::Needs, GraphError> {
        let batch = batch_of(&registry.env(), &self.weight)?;

        let config = registry.request(hint_config(&self.weight))?;
        let gate = registry.request(GroupHint {
            weight: self.weight.clone(),
        })?;
        let sources = inputs(registry, batch.all())?;
        let hints = batch
            .all()
            .map(|piece| registry.request(HintData(piece.clone())))
            .collect::<Result<Vec<_>, _>>()?;

        Ok((config, gate, sources, hints))
    }

    fn run<'a>(
        &'a self,
        cx: &'a Cx<'a>,
        (config, _, sources, hints): Resolved<'a, Self, Project>,
    ) -> impl Future<Output = anyhow::Result<usize>> + Send + 'a {
        async move {
            let layout = &cx.env.layout;
            let batch = batch_of(cx.env, &self.weight)?;

            let mut invocation = cx
                .env
                .tools
                .chlorophytum
                .invoke()
                .arg("instruct")
                .arg("-c")
                .path(config.path());

            for ((piece, source), hint) in batch.all().zip(sources).zip(hints) {
                let output = piece.output_path(layout);
                prepare(&output).await?;
                invocation = invocation.path(source.path()).path(hint.path()).path(output);
            }

            cx.exec(invocation.current_dir(&layout.root)).await?;
            Ok(batch.len())
        }
    }
}

/// Instructs every weight, after hinting them in chain order.
pub struct GroupInstrAll;

impl Rule<Project> for GroupInstrAll {
    const NAME: &'static str = "group-instr-all";
    const KIND: TaskKind = TaskKind::Task;
    type Output = ();
    type Needs = Vec<Handle<usize>>;

    fn params(&self) -> Params {
        params![]
    }

    fn needs(&self, registry: &mut Registry<Project>) -> Result<Self::Needs, GraphError> {
        let chain = WeightChain::new(registry.env().config.hint_weights());

        let stages = chain.link(registry, |registry, weight| {
            let pass1 = registry.request(HintPass1 {
                weight: weight.clone(),
            })?;
            let fe = registry.request(HintFe {
                weight: weight.clone(),
            })?;
            let gate = registry.request(GroupHint {
                weight: weight.clone(),
            })?;

            Ok(Stage {
                gate: gate.erase(),
                members: vec![pass1.erase(), fe.erase()],
            })
        })?;

        tracing::debug!("Hinting {} weights in order: {:?}", stages.len(), chain.weights());

        chain
            .weights()
            .iter()
            .map(|weight| {
                registry.request(GroupInstr {
                    weight: weight.clone(),
                })
            })
            .collect()
    }

    fn run<'a>(
        &'a self,
        _: &'a Cx<'a>,
        _: Resolved<'a, Self, Project>,
    ) -> impl Future<Output = anyhow::Result<()>> + Send + 'a {
        async move { Ok(()) }
    }
}

/// A hinted font, produced by its weight's [`GroupInstr`].
pub struct HintedFont(pub Piece);

impl Rule<Project> for HintedFont {
    const NAME: &'static str = "hinted-font";
    const KIND: TaskKind = TaskKind::File;
    type Output = Target;
    type Needs = Handle<()>;

    fn params(&self) -> Params {
        self.0.params()
    }

    fn target(&self, env: &Project) -> Option<Utf8PathBuf> {
        Some(self.0.output_path(&env.layout))
    }

    fn needs(&self, registry: &mut Registry<Project>) -> Result<Self::Needs, GraphError> {
        registry.request(GroupInstrAll)
    }

    fn run<'a>(
        &'a self,
        cx: &'a Cx<'a>,
        _: Resolved<'a, Self, Project>,
    ) -> impl Future<Output = anyhow::Result<Target>> + Send + 'a {
        async move { expect_file(self.0.output_path(&cx.env.layout)) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Filter;
    use crate::config::tests::sample;
    use crate::engine::{Key, NodeRef};
    use crate::pipeline::tests::{project, project_with};

    fn node(registry: &Registry<Project>, kind: TaskKind, name: &'static str, params: Params) -> NodeRef {
        registry
            .lookup(&Key::new(kind, name, params))
            .unwrap_or_else(|| panic!("no {name} node"))
    }

    #[test]
    fn test_batch_lists_are_aligned() {
        let batch = HintBatch::plan(&sample(), "Bold");
        let layout = Layout::new("/w");

        // 2 families x 2 regions x (Bold, BoldItalic)
        assert_eq!(batch.pass1.len(), 8);
        assert_eq!(batch.hani.len(), 2);
        assert_eq!(batch.hang.len(), 2);

        for piece in batch.all() {
            let hint = piece.hint_path(&layout);
            let output = piece.output_path(&layout);
            assert_eq!(hint.parent(), output.parent());
            assert_eq!(hint.file_name().unwrap(), format!("{}.hint.gz", piece.stem()));
            assert_eq!(output.file_name().unwrap(), format!("{}.ttf", piece.stem()));
        }

        assert_eq!(batch.pass1[1].stem(), "Gothic-SC-BoldItalic");
        assert_eq!(
            batch.hani[1].output_path(&layout),
            "/w/.build/hf-Bold/hani/J-Bold.ttf"
        );
    }

    #[test]
    fn test_aggregate_needs_follow_batch_order() {
        let mut registry = Registry::new(project());
        registry.request(HintPass1 { weight: "Bold".into() }).unwrap();
        registry.request(HintFe { weight: "Bold".into() }).unwrap();

        let env = registry.env();
        let batch = env.hint_batch("Bold").unwrap();

        let pass1 = node(&registry, TaskKind::File, "hint-pass1", params!["Bold"]);
        let labels: Vec<String> = registry.needs_of(pass1)[2..]
            .iter()
            .map(|&i| registry.label(NodeRef(i)).to_string())
            .collect();
        let expected: Vec<String> = batch
            .pass1
            .iter()
            .map(|p| format!("pass1-hinted({})", p.names.join(", ")))
            .collect();
        assert_eq!(labels, expected);

        let fe = node(&registry, TaskKind::File, "hint-fe", params!["Bold"]);
        let labels: Vec<String> = registry.needs_of(fe)[2..]
            .iter()
            .map(|&i| registry.label(NodeRef(i)).to_string())
            .collect();
        assert_eq!(
            labels,
            vec![
                "kanji0(SC, Bold)",
                "kanji0(J, Bold)",
                "hangul0(SC, Bold)",
                "hangul0(J, Bold)"
            ]
        );
    }

    #[test]
    fn test_batch_steps_declare_every_piece_file() {
        let env = project();
        let batch = env.hint_batch("Bold").unwrap().clone();
        let aggregate = Target::new(env.layout.build.join(".hc/Bold-fe.gz"));

        let hints = HintFe { weight: "Bold".into() }.produces(&env, &aggregate);
        let expected: Vec<Utf8PathBuf> = batch.fe().map(|p| p.hint_path(&env.layout)).collect();
        assert_eq!(hints, expected);

        let outputs = GroupInstr { weight: "Bold".into() }.produces(&env, &batch.len());
        assert_eq!(outputs.len(), batch.len());
        assert_eq!(outputs[0], batch.pass1[0].output_path(&env.layout));
        assert_eq!(outputs[batch.len() - 1], batch.hang[1].output_path(&env.layout));
    }

    #[test]
    fn test_per_piece_nodes_need_only_the_aggregate() {
        let mut registry = Registry::new(project());
        registry.request(GroupInstr { weight: "Regular".into() }).unwrap();

        let pass1 = node(&registry, TaskKind::File, "hint-pass1", params!["Regular"]);
        let fe = node(&registry, TaskKind::File, "hint-fe", params!["Regular"]);

        let piece = Piece::pass1("Regular", "Mono", "J", "Italic");
        let data = node(&registry, TaskKind::File, "hint-data", piece.params());
        assert_eq!(registry.needs_of(data), &[pass1.index()]);

        let piece = Piece::hang("Regular", "SC", "Regular");
        let data = node(&registry, TaskKind::File, "hint-data", piece.params());
        assert_eq!(registry.needs_of(data), &[fe.index()]);
    }

    #[test]
    fn test_weights_are_chained() {
        let mut registry = Registry::new(project());
        registry.request(GroupInstrAll).unwrap();

        let regular = node(&registry, TaskKind::Task, "group-hint", params!["Regular"]);
        let bold_pass1 = node(&registry, TaskKind::File, "hint-pass1", params!["Bold"]);
        let bold_fe = node(&registry, TaskKind::File, "hint-fe", params!["Bold"]);
        let regular_pass1 = node(&registry, TaskKind::File, "hint-pass1", params!["Regular"]);

        assert_eq!(registry.after_of(bold_pass1), &[regular.index()]);
        assert_eq!(registry.after_of(bold_fe), &[regular.index()]);
        assert!(registry.after_of(regular_pass1).is_empty());

        assert!(registry.finish().is_ok());
    }

    #[test]
    fn test_single_weight_has_no_chain() {
        let project = project_with(Filter {
            styles: Some(vec!["Italic".into()]),
            ..Filter::default()
        });
        let mut registry = Registry::new(project);
        registry.request(GroupInstrAll).unwrap();

        let pass1 = node(&registry, TaskKind::File, "hint-pass1", params!["Regular"]);
        assert!(registry.after_of(pass1).is_empty());

        let bold = Key::new(TaskKind::Task, "group-instr", params!["Bold"]);
        assert!(registry.lookup(&bold).is_none());
    }

    #[test]
    fn test_inactive_weight_is_a_planning_error() {
        let project = project_with(Filter {
            styles: Some(vec!["Regular".into()]),
            ..Filter::default()
        });
        let mut registry = Registry::new(project);
        let err = registry.request(HintPass1 { weight: "Bold".into() }).unwrap_err();
        assert!(matches!(err, GraphError::Plan(..)));
    }
}
