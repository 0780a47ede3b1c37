use crate::core::ArcStr;
use crate::engine::{NodeRef, Registry};
use crate::error::GraphError;

/// The nodes making up one weight's hinting stage.
///
/// `members` are the nodes that actually start work for the weight; `gate`
/// completes once the whole stage is done. The chain makes every member of
/// weight *i* wait for the gate of weight *i - 1*.
#[derive(Debug, Clone)]
pub struct Stage {
    pub gate: NodeRef,
    pub members: Vec<NodeRef>,
}

impl Stage {
    /// A stage consisting of a single node, which is its own gate.
    pub fn single(node: impl Into<NodeRef>) -> Self {
        let node = node.into();
        Self {
            gate: node,
            members: vec![node],
        }
    }
}

/// Strict processing order over weights.
///
/// Some stages cannot run in parallel across weights because each one reads
/// what the previous weight left behind. The chain only adds ordering edges,
/// no data flows along them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WeightChain {
    weights: Vec<ArcStr>,
}

impl WeightChain {
    pub fn new<S: AsRef<str>>(weights: impl IntoIterator<Item = S>) -> Self {
        let mut acc: Vec<ArcStr> = Vec::new();
        for weight in weights {
            let weight = weight.as_ref();
            if !acc.iter().any(|w| &**w == weight) {
                acc.push(ArcStr::from(weight));
            }
        }
        Self { weights: acc }
    }

    pub fn weights(&self) -> &[ArcStr] {
        &self.weights
    }

    /// Builds the stage of every weight and links consecutive stages.
    /// Returns the stages in chain order.
    pub fn link<G, F>(&self, registry: &mut Registry<G>, mut stage: F) -> Result<Vec<Stage>, GraphError>
    where
        G: Send + Sync + 'static,
        F: FnMut(&mut Registry<G>, &ArcStr) -> Result<Stage, GraphError>,
    {
        let mut stages: Vec<Stage> = Vec::with_capacity(self.weights.len());

        for weight in &self.weights {
            let current = stage(registry, weight)?;

            if let Some(previous) = stages.last() {
                for &member in &current.members {
                    registry.order(member, previous.gate)?;
                }
            }

            stages.push(current);
        }

        Ok(stages)
    }
}

#[cfg(test)]
mod tests {
    use std::future::Future;
    use std::sync::Mutex;
    use std::time::Duration;

    use super::*;
    use crate::engine::{
        Handle, Journal, Params, Resolved, Rule, RunOptions, Runner, TaskContext, TaskKind,
    };
    use crate::params;

    #[derive(Default)]
    struct Env {
        events: Mutex<Vec<String>>,
        inputs: Mutex<Vec<(String, u32)>>,
    }

    impl Env {
        fn log(&self, event: String) {
            self.events.lock().unwrap().push(event);
        }

        fn input(&self, weight: &str) -> u32 {
            self.inputs
                .lock()
                .unwrap()
                .iter()
                .find(|(w, _)| w == weight)
                .map(|(_, v)| *v)
                .unwrap_or(0)
        }
    }

    /// Observed per-weight input.
    struct Input(ArcStr);

    impl Rule<Env> for Input {
        const NAME: &'static str = "input";
        const KIND: TaskKind = TaskKind::Oracle;
        type Output = u32;
        type Needs = ();

        fn params(&self) -> Params {
            params![&*self.0]
        }

        fn needs(&self, _: &mut Registry<Env>) -> Result<(), GraphError> {
            Ok(())
        }

        fn run<'a>(
            &'a self,
            cx: &'a TaskContext<'a, Env>,
            _: Resolved<'a, Self, Env>,
        ) -> impl Future<Output = anyhow::Result<u32>> + Send + 'a {
            async move { Ok(cx.env.input(&self.0)) }
        }
    }

    struct Hint(ArcStr);

    impl Rule<Env> for Hint {
        const NAME: &'static str = "hint";
        const KIND: TaskKind = TaskKind::Computed;
        type Output = (String, u32);
        type Needs = Handle<u32>;

        fn params(&self) -> Params {
            params![&*self.0]
        }

        fn needs(&self, registry: &mut Registry<Env>) -> Result<Handle<u32>, GraphError> {
            registry.request(Input(self.0.clone()))
        }

        fn run<'a>(
            &'a self,
            cx: &'a TaskContext<'a, Env>,
            input: Resolved<'a, Self, Env>,
        ) -> impl Future<Output = anyhow::Result<(String, u32)>> + Send + 'a {
            async move {
                cx.env.log(format!("start {}", self.0));
                tokio::time::sleep(Duration::from_millis(20)).await;
                cx.env.log(format!("end {}", self.0));
                Ok((self.0.to_string(), *input))
            }
        }
    }

    fn plan(env: Env, chain: &WeightChain) -> (crate::engine::BuildGraph<Env>, Vec<NodeRef>) {
        let mut registry = Registry::new(env);

        // Request in reverse so creation order can't explain the result.
        let mut roots = Vec::new();
        for weight in chain.weights().iter().rev() {
            roots.push(registry.request(Hint(weight.clone())).unwrap().erase());
        }

        chain
            .link(&mut registry, |registry, weight| {
                Ok(Stage::single(registry.request(Hint(weight.clone()))?))
            })
            .unwrap();

        (registry.finish().unwrap(), roots)
    }

    fn chain() -> WeightChain {
        WeightChain::new(["Light", "Regular", "Bold"])
    }

    #[test]
    fn test_chain_keeps_declared_order() {
        let chain = WeightChain::new(["ExtraLight", "Light", "Light", "Regular"]);
        let weights: Vec<&str> = chain.weights().iter().map(|w| &**w).collect();
        assert_eq!(weights, vec!["ExtraLight", "Light", "Regular"]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_stages_run_in_weight_order() {
        let chain = chain();
        let (graph, roots) = plan(Env::default(), &chain);

        let runner = Runner::new(&graph, Journal::in_memory(), RunOptions::default());
        runner.run(&roots).await.unwrap();

        let events = graph.env().events.lock().unwrap().clone();
        assert_eq!(
            events,
            vec![
                "start Light",
                "end Light",
                "start Regular",
                "end Regular",
                "start Bold",
                "end Bold",
            ]
        );
    }

    #[tokio::test]
    async fn test_predecessor_change_invalidates_successor_only_if_its_result_changed() {
        let dir = tempfile::tempdir().unwrap();
        let path = camino::Utf8PathBuf::from_path_buf(dir.path().join("journal")).unwrap();
        let chain = chain();

        let (graph, roots) = plan(Env::default(), &chain);
        let runner = Runner::new(&graph, Journal::open(&path).unwrap(), RunOptions::default());
        runner.run(&roots).await.unwrap();
        drop(runner);

        // Light's input changes: Light re-runs, and Regular re-runs because it
        // is ordered after Light. Regular's own result is unchanged, so Bold
        // is reused.
        let env = Env::default();
        env.inputs.lock().unwrap().push(("Light".into(), 1));
        let (graph, roots) = plan(env, &chain);
        let runner = Runner::new(&graph, Journal::open(&path).unwrap(), RunOptions::default());
        runner.run(&roots).await.unwrap();

        let events = graph.env().events.lock().unwrap().clone();
        assert_eq!(
            events,
            vec!["start Light", "end Light", "start Regular", "end Regular"]
        );
    }
}
