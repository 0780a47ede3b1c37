use std::any::{TypeId, type_name};
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

use camino::Utf8PathBuf;
use futures::future::BoxFuture;
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::core::{Blake3Hasher, Dynamic, Hash32, from_cbor, to_cbor};
use crate::engine::{Dependencies, Key, Params, Registry, TaskContext, TaskKind};
use crate::error::GraphError;

/// The resolved form of a rule's needs, as handed to [`Rule::run`].
pub type Resolved<'a, R, G> = <<R as Rule<G>>::Needs as Dependencies>::Output<'a>;

/// A parameterized unit of work.
///
/// A value implementing `Rule` is one *instance*: a rule name plus a tuple of
/// parameters. Requesting it from a [`Registry`] yields a node; requesting an
/// equal instance again yields the same node.
///
/// ```rust,ignore
/// struct Kanji0 { region: ArcStr, style: ArcStr }
///
/// impl Rule<Project> for Kanji0 {
///     const NAME: &'static str = "kanji0";
///     const KIND: TaskKind = TaskKind::File;
///     type Output = Target;
///     type Needs = (Handle<Target>, Handle<()>);
///
///     fn params(&self) -> Params { params![&*self.region, &*self.style] }
///     fn target(&self, env: &Project) -> Option<Utf8PathBuf> { ... }
///     fn needs(&self, reg: &mut Registry<Project>) -> Result<Self::Needs, GraphError> { ... }
///     fn run<'a>(&'a self, cx: &'a TaskContext<'a, Project>, needs: Resolved<'a, Self, Project>)
///         -> impl Future<Output = anyhow::Result<Target>> + Send + 'a { async move { ... } }
/// }
/// ```
pub trait Rule<G>: Send + Sync + Sized + 'static
where
    G: Send + Sync + 'static,
{
    /// Rule family name, part of every key produced by this rule.
    const NAME: &'static str;

    const KIND: TaskKind;

    type Output: Serialize + DeserializeOwned + Send + Sync + 'static;

    type Needs: Dependencies;

    fn params(&self) -> Params;

    /// Path of the produced artifact. Required for [`TaskKind::File`].
    fn target(&self, _env: &G) -> Option<Utf8PathBuf> {
        None
    }

    /// Files a result wrote as a side effect, for other nodes to pick up. A
    /// journaled result is only reused while all of them still exist.
    fn produces(&self, _env: &G, _output: &Self::Output) -> Vec<Utf8PathBuf> {
        Vec::new()
    }

    /// Bump to invalidate every journaled result of this rule after the
    /// recipe logic changed in a way its inputs do not show.
    fn revision(&self) -> u32 {
        0
    }

    /// Whether a journaled result may be reused. Phony and oracle rules can
    /// opt in; everything else opts out only for good reason.
    fn cached(&self) -> bool {
        Self::KIND.cached_by_default()
    }

    /// Declares what this instance needs. Called at most once per instance,
    /// the first time it is requested.
    fn needs(&self, registry: &mut Registry<G>) -> Result<Self::Needs, GraphError>;

    fn run<'a>(
        &'a self,
        cx: &'a TaskContext<'a, G>,
        needs: Resolved<'a, Self, G>,
    ) -> impl Future<Output = anyhow::Result<Self::Output>> + Send + 'a;
}

/// Type-erased view of a rule instance with its needs already declared.
pub(crate) trait Erased<G>: Send + Sync {
    fn dependencies(&self) -> Vec<petgraph::graph::NodeIndex>;

    fn cached(&self) -> bool;

    fn execute<'a>(
        &'a self,
        cx: &'a TaskContext<'a, G>,
        dependencies: &'a [Dynamic],
    ) -> BoxFuture<'a, anyhow::Result<Dynamic>>;

    fn encode(&self, output: &Dynamic) -> anyhow::Result<Vec<u8>>;

    fn decode(&self, bytes: &[u8]) -> anyhow::Result<Dynamic>;

    fn produces(&self, env: &G, output: &Dynamic) -> Vec<Utf8PathBuf>;
}

/// A rule together with its declared needs. This is where the type erasure
/// actually happens.
pub(crate) struct Bound<R, G>
where
    R: Rule<G>,
    G: Send + Sync + 'static,
{
    rule: R,
    needs: R::Needs,
    _env: PhantomData<fn(&G)>,
}

impl<R, G> Bound<R, G>
where
    R: Rule<G>,
    G: Send + Sync + 'static,
{
    pub(crate) fn new(rule: R, needs: R::Needs) -> Self {
        Self {
            rule,
            needs,
            _env: PhantomData,
        }
    }
}

impl<R, G> Erased<G> for Bound<R, G>
where
    R: Rule<G>,
    G: Send + Sync + 'static,
{
    fn dependencies(&self) -> Vec<petgraph::graph::NodeIndex> {
        self.needs.dependencies()
    }

    fn cached(&self) -> bool {
        self.rule.cached()
    }

    fn execute<'a>(
        &'a self,
        cx: &'a TaskContext<'a, G>,
        dependencies: &'a [Dynamic],
    ) -> BoxFuture<'a, anyhow::Result<Dynamic>> {
        let future = self.rule.run(cx, self.needs.resolve(dependencies));
        Box::pin(async move {
            let output = future.await?;
            Ok(Arc::new(output) as Dynamic)
        })
    }

    fn encode(&self, output: &Dynamic) -> anyhow::Result<Vec<u8>> {
        let output = output
            .downcast_ref::<R::Output>()
            .ok_or_else(|| anyhow::anyhow!("Output is not {}", type_name::<R::Output>()))?;
        to_cbor(output)
    }

    fn decode(&self, bytes: &[u8]) -> anyhow::Result<Dynamic> {
        Ok(Arc::new(from_cbor::<R::Output>(bytes)?))
    }

    fn produces(&self, env: &G, output: &Dynamic) -> Vec<Utf8PathBuf> {
        match output.downcast_ref::<R::Output>() {
            Some(output) => self.rule.produces(env, output),
            None => Vec::new(),
        }
    }
}

/// Static facts about a rule instance, captured when its node is created.
pub(crate) struct Signature {
    pub key: Key,
    pub target: Option<Utf8PathBuf>,
    pub output_type: TypeId,
    pub output_name: &'static str,
    pub fingerprint: Hash32,
}

impl Signature {
    pub(crate) fn of<R, G>(rule: &R, env: &G) -> Self
    where
        R: Rule<G>,
        G: Send + Sync + 'static,
    {
        let key = Key::new(R::KIND, R::NAME, rule.params());

        // Identity of the recipe logic: which rule, which instance, which
        // revision of it, built by which version of this crate.
        let fingerprint = Blake3Hasher::new()
            .chunk(type_name::<R>())
            .chunk(key.canonical())
            .chunk(rule.revision().to_le_bytes())
            .chunk(env!("CARGO_PKG_VERSION"))
            .finish32();

        Self {
            target: rule.target(env),
            output_type: TypeId::of::<R::Output>(),
            output_name: type_name::<R::Output>(),
            key,
            fingerprint,
        }
    }
}
