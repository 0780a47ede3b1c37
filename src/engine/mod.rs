mod chain;
mod diagnostics;
mod journal;
mod key;
mod registry;
mod rule;
mod runner;

use std::marker::PhantomData;

use camino::{Utf8Path, Utf8PathBuf};
use petgraph::graph::NodeIndex;
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tracing::Span;

use crate::core::Dynamic;
use crate::error::ToolError;
use crate::tool::Invocation;

pub use crate::engine::chain::{Stage, WeightChain};
pub use crate::engine::diagnostics::{Diagnostics, TaskExecution};
pub use crate::engine::journal::{Entry, FileMeta, Journal};
pub use crate::engine::key::{Key, Params, TaskKind};
pub use crate::engine::registry::{BuildGraph, Edge, Registry};
pub use crate::engine::rule::{Resolved, Rule};
pub use crate::engine::runner::{Outputs, RunOptions, Runner};

pub(crate) use crate::engine::rule::{Bound, Erased};

/// A type-safe reference to a node in the build graph.
///
/// A `Handle<T>` is a lightweight, copyable token for the future result of
/// type `T`. Requesting the same rule twice yields equal handles, so a node
/// shared by many dependents (a diamond) is computed only once per run.
#[derive(Debug, PartialEq, Eq, Hash)]
pub struct Handle<T> {
    pub(crate) index: NodeIndex,
    _phantom: PhantomData<fn() -> T>,
}

impl<T> Handle<T> {
    pub(crate) fn new(index: NodeIndex) -> Self {
        Self {
            index,
            _phantom: PhantomData,
        }
    }

    /// Returns the underlying `NodeIndex` of the node in the graph.
    pub fn index(&self) -> NodeIndex {
        self.index
    }

    /// Forgets the output type, e.g. to pass heterogeneous roots to a run.
    pub fn erase(&self) -> NodeRef {
        NodeRef(self.index)
    }
}

impl<T> Clone for Handle<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Handle<T> {}

/// An untyped reference to a node, used for build roots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeRef(pub(crate) NodeIndex);

impl NodeRef {
    pub fn index(&self) -> NodeIndex {
        self.0
    }
}

impl<T> From<Handle<T>> for NodeRef {
    fn from(handle: Handle<T>) -> Self {
        handle.erase()
    }
}

/// The artifact produced by a `File` node.
///
/// Recipes return the path they were asked to produce; the runner checks it
/// against the declared target and verifies the file exists.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Target {
    pub path: Utf8PathBuf,
}

impl Target {
    pub fn new(path: impl Into<Utf8PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Utf8Path {
        &self.path
    }

    pub fn dir(&self) -> &Utf8Path {
        self.path.parent().unwrap_or(Utf8Path::new("."))
    }

    /// File name including the extension.
    pub fn file_name(&self) -> &str {
        self.path.file_name().unwrap_or_default()
    }

    /// File name without the extension.
    pub fn stem(&self) -> &str {
        self.path.file_stem().unwrap_or_default()
    }
}

impl AsRef<Utf8Path> for Target {
    fn as_ref(&self) -> &Utf8Path {
        &self.path
    }
}

/// Everything a recipe can reach while it runs.
pub struct TaskContext<'a, G> {
    /// User-defined global data, shared by every node.
    pub env: &'a G,
    pub(crate) jobs: &'a Semaphore,
    pub(crate) label: &'a str,
    pub(crate) span: Span,
}

impl<'a, G> TaskContext<'a, G> {
    /// Runs an external process, waiting for a free job slot first.
    pub async fn exec(&self, invocation: Invocation) -> Result<(), ToolError> {
        tracing::debug!(parent: &self.span, "{}", invocation);
        invocation.run(self.jobs).await
    }

    /// Label of the running node, e.g. `pass1(Gothic, SC, Bold)`.
    pub fn label(&self) -> &str {
        self.label
    }

    pub fn span(&self) -> &Span {
        &self.span
    }
}

/// A collection of handles usable as the needs of a rule.
///
/// Implemented for `()`, [`Handle<T>`], `Option<D>`, `Vec<D>` and tuples of
/// up to twelve elements, so needs can be grouped the way the recipe wants
/// to consume them.
pub trait Dependencies: Send + Sync + 'static {
    /// The resulting type when all dependencies are resolved.
    /// For a tuple of [`Handle<T>`]s, this will be a tuple of `&'a T`s.
    type Output<'a>;

    /// Returns the [`NodeIndex`] for each dependency in the collection.
    fn dependencies(&self) -> Vec<NodeIndex>;

    /// Number of output slots this collection consumes.
    fn width(&self) -> usize {
        self.dependencies().len()
    }

    /// Takes a slice of type-erased dependency outputs and resolves them into a
    /// concrete `Output` type.
    ///
    /// # Panics
    /// This method will panic if the type-erased outputs cannot be downcast to
    /// their expected concrete types, indicating a severe logic error in the
    /// build system.
    fn resolve<'a>(&self, outputs: &'a [Dynamic]) -> Self::Output<'a>;
}

impl Dependencies for () {
    type Output<'a> = ();

    fn dependencies(&self) -> Vec<NodeIndex> {
        vec![]
    }

    fn resolve<'a>(&self, _: &'a [Dynamic]) -> Self::Output<'a> {}
}

impl<T> Dependencies for Handle<T>
where
    T: Send + Sync + 'static,
{
    type Output<'a> = &'a T;

    fn dependencies(&self) -> Vec<NodeIndex> {
        vec![self.index]
    }

    fn width(&self) -> usize {
        1
    }

    fn resolve<'a>(&self, outputs: &'a [Dynamic]) -> Self::Output<'a> {
        outputs[0]
            .downcast_ref::<T>()
            .expect("Type mismatch in dependency resolution")
    }
}

impl<D> Dependencies for Option<D>
where
    D: Dependencies,
{
    type Output<'a> = Option<D::Output<'a>>;

    fn dependencies(&self) -> Vec<NodeIndex> {
        self.as_ref().map(D::dependencies).unwrap_or_default()
    }

    fn resolve<'a>(&self, outputs: &'a [Dynamic]) -> Self::Output<'a> {
        self.as_ref().map(|deps| deps.resolve(outputs))
    }
}

impl<D> Dependencies for Vec<D>
where
    D: Dependencies,
{
    type Output<'a> = Vec<D::Output<'a>>;

    fn dependencies(&self) -> Vec<NodeIndex> {
        self.iter().flat_map(D::dependencies).collect()
    }

    fn resolve<'a>(&self, outputs: &'a [Dynamic]) -> Self::Output<'a> {
        let mut offset = 0;
        let mut result = Vec::with_capacity(self.len());

        for deps in self {
            let width = deps.width();
            result.push(deps.resolve(&outputs[offset..offset + width]));
            offset += width;
        }

        result
    }
}

macro_rules! impl_deps {
    ($($D:ident),*) => {
        #[allow(non_snake_case)]
        impl<$($D),*> Dependencies for ($($D,)*)
        where
            $($D: Dependencies),* {
            type Output<'a> = ($($D::Output<'a>,)*);

            fn dependencies(&self) -> Vec<NodeIndex> {
                let ($($D,)*) = self;
                let mut acc = Vec::new();
                $(acc.extend($D.dependencies());)*
                acc
            }

            fn resolve<'a>(&self, outputs: &'a [Dynamic]) -> Self::Output<'a> {
                let ($($D,)*) = self;
                let mut rest = outputs;

                let result = ($({
                    let (head, tail) = rest.split_at($D.width());
                    rest = tail;
                    $D.resolve(head)
                },)*);

                debug_assert!(rest.is_empty());
                result
            }
        }
    };
}

impl_deps!(A);
impl_deps!(A, B);
impl_deps!(A, B, C);
impl_deps!(A, B, C, D);
impl_deps!(A, B, C, D, E);
impl_deps!(A, B, C, D, E, F);
impl_deps!(A, B, C, D, E, F, G);
impl_deps!(A, B, C, D, E, F, G, H);
impl_deps!(A, B, C, D, E, F, G, H, I);
impl_deps!(A, B, C, D, E, F, G, H, I, J);
impl_deps!(A, B, C, D, E, F, G, H, I, J, K);
impl_deps!(A, B, C, D, E, F, G, H, I, J, K, L);

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    fn dynamic<T: Send + Sync + 'static>(value: T) -> Dynamic {
        Arc::new(value)
    }

    #[test]
    fn test_nested_needs_are_resolved_in_declaration_order() {
        let a: Handle<u32> = Handle::new(NodeIndex::new(0));
        let b: Handle<String> = Handle::new(NodeIndex::new(1));
        let c: Handle<u32> = Handle::new(NodeIndex::new(2));
        let needs = (a, vec![b, b], Some(c), None::<Handle<u32>>);

        assert_eq!(needs.dependencies().len(), 4);

        let outputs = vec![
            dynamic(7u32),
            dynamic("x".to_string()),
            dynamic("y".to_string()),
            dynamic(9u32),
        ];
        let (a, bs, c, d) = needs.resolve(&outputs);
        assert_eq!(*a, 7);
        assert_eq!(bs, vec!["x", "y"]);
        assert_eq!(c, Some(&9));
        assert_eq!(d, None);
    }

    #[test]
    fn test_target_parts() {
        let target = Target::new("out/TTF/SarasaGothicSC-Bold.ttf");
        assert_eq!(target.file_name(), "SarasaGothicSC-Bold.ttf");
        assert_eq!(target.stem(), "SarasaGothicSC-Bold");
        assert_eq!(target.dir(), "out/TTF");
    }
}
