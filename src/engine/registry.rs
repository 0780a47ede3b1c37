use std::any::TypeId;
use std::collections::HashMap;
use std::sync::Arc;

use camino::{Utf8Path, Utf8PathBuf};
use petgraph::Graph;
use petgraph::algo::has_path_connecting;
use petgraph::graph::NodeIndex;
use petgraph::visit::{Dfs, EdgeRef, Reversed};

use crate::core::Hash32;
use crate::engine::rule::Signature;
use crate::engine::{Bound, Erased, Handle, Key, NodeRef, Rule, TaskKind};
use crate::error::GraphError;

/// Kind of an edge in the build graph. Edges always point from the need to
/// the node that needs it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Edge {
    /// The dependent consumes the output of the need.
    Data,
    /// The dependent only has to start after the need completed.
    Order,
}

pub(crate) struct Slot<G> {
    pub key: Key,
    pub label: String,
    pub target: Option<Utf8PathBuf>,
    pub output_type: TypeId,
    pub output_name: &'static str,
    pub fingerprint: Hash32,
    /// `None` while the node's needs are still being declared.
    pub task: Option<Arc<dyn Erased<G>>>,
    /// Data needs, in the order the recipe consumes them.
    pub needs: Vec<NodeIndex>,
    /// Ordering-only needs.
    pub after: Vec<NodeIndex>,
}

impl<G> Slot<G> {
    pub(crate) fn kind(&self) -> TaskKind {
        self.key.kind()
    }
}

/// Builds the task graph by interning rule instances.
///
/// Every distinct `(kind, name, params)` becomes exactly one node. A rule's
/// needs are declared once, on its first request, and expanded depth-first;
/// asking for a node that is still being expanded means the declaration is
/// cyclic, which is rejected immediately with the offending path.
pub struct Registry<G: Send + Sync + 'static = ()> {
    env: Arc<G>,
    pub(crate) graph: Graph<Slot<G>, Edge>,
    nodes: HashMap<Key, NodeIndex>,
    targets: HashMap<Utf8PathBuf, NodeIndex>,
    expanding: Vec<NodeIndex>,
}

impl<G: Send + Sync + 'static> Registry<G> {
    pub fn new(env: G) -> Self {
        Self {
            env: Arc::new(env),
            graph: Graph::new(),
            nodes: HashMap::new(),
            targets: HashMap::new(),
            expanding: Vec::new(),
        }
    }

    /// Shared global data. Returned as an `Arc` so rules can keep reading it
    /// while requesting more nodes.
    pub fn env(&self) -> Arc<G> {
        self.env.clone()
    }

    /// Returns the node for this rule instance, creating and expanding it on
    /// the first request.
    pub fn request<R>(&mut self, rule: R) -> Result<Handle<R::Output>, GraphError>
    where
        R: Rule<G>,
    {
        let signature = Signature::of(&rule, &*self.env);

        if let Some(&index) = self.nodes.get(&signature.key) {
            let slot = &self.graph[index];

            if slot.output_type != signature.output_type {
                return Err(GraphError::KeyCollision {
                    key: signature.key.canonical().to_string(),
                    existing: slot.output_name,
                    requested: signature.output_name,
                });
            }

            if slot.task.is_none() {
                return Err(GraphError::Cycle(self.cycle_through(index)));
            }

            return Ok(Handle::new(index));
        }

        let label = signature.key.label();

        if R::KIND == TaskKind::File && signature.target.is_none() {
            return Err(GraphError::MissingTarget(label));
        }

        if let Some(path) = &signature.target
            && let Some(&other) = self.targets.get(path)
        {
            return Err(GraphError::TargetCollision {
                path: path.clone(),
                first: self.graph[other].label.clone(),
                second: label,
            });
        }

        let index = self.graph.add_node(Slot {
            key: signature.key.clone(),
            label,
            target: signature.target.clone(),
            output_type: signature.output_type,
            output_name: signature.output_name,
            fingerprint: signature.fingerprint,
            task: None,
            needs: Vec::new(),
            after: Vec::new(),
        });

        self.nodes.insert(signature.key, index);
        if let Some(path) = signature.target {
            self.targets.insert(path, index);
        }

        self.expanding.push(index);
        let needs = rule.needs(self);
        self.expanding.pop();
        let needs = needs?;

        let task: Arc<dyn Erased<G>> = Arc::new(Bound::new(rule, needs));
        let dependencies = task.dependencies();

        for &dependency in &dependencies {
            self.graph.add_edge(dependency, index, Edge::Data);
        }

        let slot = &mut self.graph[index];
        slot.needs = dependencies;
        slot.task = Some(task);

        Ok(Handle::new(index))
    }

    /// Requests every rule of an iterator, keeping their order.
    pub fn request_all<R, I>(&mut self, rules: I) -> Result<Vec<Handle<R::Output>>, GraphError>
    where
        R: Rule<G>,
        I: IntoIterator<Item = R>,
    {
        rules.into_iter().map(|rule| self.request(rule)).collect()
    }

    /// Adds an ordering-only need: `later` will not start before `earlier`
    /// completed. Rejected when `earlier` already (transitively) needs
    /// `later`, since that would close a cycle.
    pub fn order(
        &mut self,
        later: impl Into<NodeRef>,
        earlier: impl Into<NodeRef>,
    ) -> Result<(), GraphError> {
        let later = later.into().0;
        let earlier = earlier.into().0;

        if later == earlier || has_path_connecting(&self.graph, later, earlier, None) {
            return Err(GraphError::Cycle(vec![
                self.graph[earlier].label.clone(),
                self.graph[later].label.clone(),
                self.graph[earlier].label.clone(),
            ]));
        }

        if self.graph[later].after.contains(&earlier) {
            return Ok(());
        }

        self.graph.add_edge(earlier, later, Edge::Order);
        self.graph[later].after.push(earlier);
        Ok(())
    }

    /// Looks up an existing node by key without creating anything.
    pub fn lookup(&self, key: &Key) -> Option<NodeRef> {
        self.nodes.get(key).map(|&index| NodeRef(index))
    }

    pub fn len(&self) -> usize {
        self.graph.node_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    pub fn label(&self, node: impl Into<NodeRef>) -> &str {
        &self.graph[node.into().0].label
    }

    pub fn key(&self, node: impl Into<NodeRef>) -> &Key {
        &self.graph[node.into().0].key
    }

    pub fn target(&self, node: impl Into<NodeRef>) -> Option<&Utf8Path> {
        self.graph[node.into().0].target.as_deref()
    }

    /// Data needs of a node, in declaration order.
    pub fn needs_of(&self, node: impl Into<NodeRef>) -> &[NodeIndex] {
        &self.graph[node.into().0].needs
    }

    /// Ordering-only needs of a node.
    pub fn after_of(&self, node: impl Into<NodeRef>) -> &[NodeIndex] {
        &self.graph[node.into().0].after
    }

    /// Freezes the graph. The topological sort is a second line of defence
    /// behind the checks done while requesting.
    pub fn finish(self) -> Result<BuildGraph<G>, GraphError> {
        if let Some(&index) = self.expanding.last() {
            return Err(GraphError::Cycle(self.cycle_through(index)));
        }

        if let Err(cycle) = petgraph::algo::toposort(&self.graph, None) {
            let label = self.graph[cycle.node_id()].label.clone();
            return Err(GraphError::Cycle(vec![label.clone(), label]));
        }

        Ok(BuildGraph {
            env: self.env,
            graph: self.graph,
            nodes: self.nodes,
        })
    }

    fn cycle_through(&self, index: NodeIndex) -> Vec<String> {
        let start = self
            .expanding
            .iter()
            .position(|&i| i == index)
            .unwrap_or(0);

        self.expanding[start..]
            .iter()
            .chain(std::iter::once(&index))
            .map(|&i| self.graph[i].label.clone())
            .collect()
    }
}

/// A frozen, acyclic task graph ready to be executed by a
/// [`Runner`](crate::Runner).
pub struct BuildGraph<G: Send + Sync + 'static = ()> {
    env: Arc<G>,
    pub(crate) graph: Graph<Slot<G>, Edge>,
    nodes: HashMap<Key, NodeIndex>,
}

impl<G: Send + Sync + 'static> BuildGraph<G> {
    pub fn env(&self) -> &G {
        &self.env
    }

    pub fn len(&self) -> usize {
        self.graph.node_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    pub fn lookup(&self, key: &Key) -> Option<NodeRef> {
        self.nodes.get(key).map(|&index| NodeRef(index))
    }

    pub fn label(&self, node: impl Into<NodeRef>) -> &str {
        &self.graph[node.into().0].label
    }

    pub fn key(&self, node: impl Into<NodeRef>) -> &Key {
        &self.graph[node.into().0].key
    }

    /// Canonical keys of every node, used to prune the journal.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.nodes.keys().map(Key::canonical)
    }

    /// Every node the given roots transitively need, roots included.
    pub fn closure(&self, roots: &[NodeRef]) -> Vec<NodeIndex> {
        let reversed = Reversed(&self.graph);
        let mut seen = vec![false; self.graph.node_count()];
        let mut acc = Vec::new();

        for root in roots {
            let mut dfs = Dfs::new(reversed, root.0);
            while let Some(index) = dfs.next(reversed) {
                if !seen[index.index()] {
                    seen[index.index()] = true;
                    acc.push(index);
                }
            }
        }

        acc
    }

    /// Renders the planned graph as a Mermaid diagram. Ordering edges are
    /// drawn dotted.
    pub fn to_mermaid(&self) -> String {
        use std::fmt::Write;

        let mut f = String::from("graph LR\n");

        for index in self.graph.node_indices() {
            let slot = &self.graph[index];
            let name = slot.label.replace('"', "\\\"");
            let _ = writeln!(f, "    {}[\"{}\\n{}\"]", index.index(), name, slot.kind());
        }

        for edge in self.graph.edge_references() {
            let arrow = match edge.weight() {
                Edge::Data => "-->",
                Edge::Order => "-.->",
            };
            let _ = writeln!(
                f,
                "    {} {} {}",
                edge.source().index(),
                arrow,
                edge.target().index()
            );
        }

        f
    }
}

#[cfg(test)]
mod tests {
    use std::future::Future;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::engine::{Params, Resolved, TaskContext};
    use crate::params;

    #[derive(Default)]
    struct Env {
        expansions: AtomicUsize,
    }

    struct Leaf(&'static str);

    impl Rule<Env> for Leaf {
        const NAME: &'static str = "leaf";
        const KIND: TaskKind = TaskKind::Computed;
        type Output = String;
        type Needs = ();

        fn params(&self) -> Params {
            params![self.0]
        }

        fn needs(&self, registry: &mut Registry<Env>) -> Result<(), GraphError> {
            registry.env().expansions.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn run<'a>(
            &'a self,
            _: &'a TaskContext<'a, Env>,
            _: Resolved<'a, Self, Env>,
        ) -> impl Future<Output = anyhow::Result<String>> + Send + 'a {
            async move { Ok(self.0.to_string()) }
        }
    }

    /// Same name and params as `Leaf`, different output type.
    struct Impostor(&'static str);

    impl Rule<Env> for Impostor {
        const NAME: &'static str = "leaf";
        const KIND: TaskKind = TaskKind::Computed;
        type Output = u64;
        type Needs = ();

        fn params(&self) -> Params {
            params![self.0]
        }

        fn needs(&self, _: &mut Registry<Env>) -> Result<(), GraphError> {
            Ok(())
        }

        fn run<'a>(
            &'a self,
            _: &'a TaskContext<'a, Env>,
            _: Resolved<'a, Self, Env>,
        ) -> impl Future<Output = anyhow::Result<u64>> + Send + 'a {
            async move { Ok(0) }
        }
    }

    /// `Loop(n)` needs `Loop(n + 1)` modulo `len`, closing a cycle.
    struct Loop {
        n: usize,
        len: usize,
    }

    impl Rule<Env> for Loop {
        const NAME: &'static str = "loop";
        const KIND: TaskKind = TaskKind::Task;
        type Output = ();
        type Needs = Handle<()>;

        fn params(&self) -> Params {
            params![self.n.to_string()]
        }

        fn needs(&self, registry: &mut Registry<Env>) -> Result<Handle<()>, GraphError> {
            registry.request(Loop {
                n: (self.n + 1) % self.len,
                len: self.len,
            })
        }

        fn run<'a>(
            &'a self,
            _: &'a TaskContext<'a, Env>,
            _: Resolved<'a, Self, Env>,
        ) -> impl Future<Output = anyhow::Result<()>> + Send + 'a {
            async move { Ok(()) }
        }
    }

    struct Pair(&'static str, &'static str);

    impl Rule<Env> for Pair {
        const NAME: &'static str = "pair";
        const KIND: TaskKind = TaskKind::Task;
        type Output = ();
        type Needs = (Handle<String>, Handle<String>);

        fn params(&self) -> Params {
            params![self.0, self.1]
        }

        fn needs(&self, registry: &mut Registry<Env>) -> Result<Self::Needs, GraphError> {
            Ok((registry.request(Leaf(self.0))?, registry.request(Leaf(self.1))?))
        }

        fn run<'a>(
            &'a self,
            _: &'a TaskContext<'a, Env>,
            _: Resolved<'a, Self, Env>,
        ) -> impl Future<Output = anyhow::Result<()>> + Send + 'a {
            async move { Ok(()) }
        }
    }

    struct Artifact(&'static str, Option<&'static str>);

    impl Rule<Env> for Artifact {
        const NAME: &'static str = "artifact";
        const KIND: TaskKind = TaskKind::File;
        type Output = crate::engine::Target;
        type Needs = ();

        fn params(&self) -> Params {
            params![self.0]
        }

        fn target(&self, _: &Env) -> Option<Utf8PathBuf> {
            self.1.map(Utf8PathBuf::from)
        }

        fn needs(&self, _: &mut Registry<Env>) -> Result<(), GraphError> {
            Ok(())
        }

        fn run<'a>(
            &'a self,
            _: &'a TaskContext<'a, Env>,
            _: Resolved<'a, Self, Env>,
        ) -> impl Future<Output = anyhow::Result<crate::engine::Target>> + Send + 'a {
            async move { anyhow::bail!("not runnable") }
        }
    }

    #[test]
    fn test_same_params_return_same_node() {
        let mut registry = Registry::new(Env::default());
        let a = registry.request(Leaf("SC")).unwrap();
        let b = registry.request(Leaf("SC")).unwrap();
        let c = registry.request(Leaf("TC")).unwrap();

        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.env().expansions.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_shared_needs_are_interned() {
        let mut registry = Registry::new(Env::default());
        let p1 = registry.request(Pair("a", "b")).unwrap();
        let p2 = registry.request(Pair("b", "c")).unwrap();

        // a, b, c, and two pairs
        assert_eq!(registry.len(), 5);
        assert_eq!(registry.needs_of(p1)[1], registry.needs_of(p2)[0]);
    }

    #[test]
    fn test_key_reused_with_another_output_type_is_rejected() {
        let mut registry = Registry::new(Env::default());
        registry.request(Leaf("x")).unwrap();
        let err = registry.request(Impostor("x")).unwrap_err();
        assert!(matches!(err, GraphError::KeyCollision { .. }));
    }

    #[test]
    fn test_self_need_is_rejected() {
        let mut registry = Registry::new(Env::default());
        let err = registry.request(Loop { n: 0, len: 1 }).unwrap_err();
        match err {
            GraphError::Cycle(path) => assert_eq!(path, vec!["loop(0)", "loop(0)"]),
            other => panic!("unexpected error {other}"),
        }
    }

    #[test]
    fn test_transitive_cycle_is_rejected_with_path() {
        let mut registry = Registry::new(Env::default());
        let err = registry.request(Loop { n: 0, len: 3 }).unwrap_err();
        match err {
            GraphError::Cycle(path) => {
                assert_eq!(path, vec!["loop(0)", "loop(1)", "loop(2)", "loop(0)"])
            }
            other => panic!("unexpected error {other}"),
        }
    }

    #[test]
    fn test_file_nodes_need_unique_targets() {
        let mut registry = Registry::new(Env::default());
        registry.request(Artifact("a", Some("out/a.ttf"))).unwrap();

        let err = registry.request(Artifact("b", Some("out/a.ttf"))).unwrap_err();
        assert!(matches!(err, GraphError::TargetCollision { .. }));

        let err = registry.request(Artifact("c", None)).unwrap_err();
        assert!(matches!(err, GraphError::MissingTarget(_)));
    }

    #[test]
    fn test_order_edges_cannot_contradict_data_edges() {
        let mut registry = Registry::new(Env::default());
        let pair = registry.request(Pair("a", "b")).unwrap();
        let a = registry.request(Leaf("a")).unwrap();
        let z = registry.request(Leaf("z")).unwrap();

        // `pair` needs `a`, so `a` can't wait for `pair`.
        assert!(matches!(registry.order(a, pair), Err(GraphError::Cycle(_))));
        assert!(matches!(registry.order(a, a), Err(GraphError::Cycle(_))));

        registry.order(z, a).unwrap();
        registry.order(z, a).unwrap();
        assert_eq!(registry.after_of(z), &[a.index()]);

        // z now waits on a, so a can't wait on z either.
        assert!(registry.order(a, z).is_err());

        let graph = registry.finish().unwrap();
        assert_eq!(graph.closure(&[z.erase()]).len(), 2);
    }
}
