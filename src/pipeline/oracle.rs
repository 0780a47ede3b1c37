use std::future::Future;

use anyhow::Context;
use camino::Utf8PathBuf;
use indexmap::IndexMap;
use rayon::iter::{IntoParallelIterator, ParallelIterator};
use serde::{Deserialize, Serialize};

use crate::config::{Config, read_version};
use crate::core::Hash32;
use crate::engine::{Handle, Params, Registry, Resolved, Rule, TaskKind};
use crate::error::GraphError;
use crate::params;
use crate::pipeline::{Cx, Project};

/// The configuration the build steps depend on.
pub struct ConfigOracle;

impl Rule<Project> for ConfigOracle {
    const NAME: &'static str = "config";
    const KIND: TaskKind = TaskKind::Oracle;
    type Output = Config;
    type Needs = ();

    fn params(&self) -> Params {
        params![]
    }

    fn needs(&self, _: &mut Registry<Project>) -> Result<(), GraphError> {
        Ok(())
    }

    fn run<'a>(
        &'a self,
        cx: &'a Cx<'a>,
        _: Resolved<'a, Self, Project>,
    ) -> impl Future<Output = anyhow::Result<Config>> + Send + 'a {
        async move { Ok(cx.env.observed_config()) }
    }
}

/// The version string stamped into every font, read from `package.json`.
pub struct Version;

impl Rule<Project> for Version {
    const NAME: &'static str = "version";
    const KIND: TaskKind = TaskKind::Oracle;
    type Output = String;
    type Needs = ();

    fn params(&self) -> Params {
        params![]
    }

    fn needs(&self, _: &mut Registry<Project>) -> Result<(), GraphError> {
        Ok(())
    }

    fn run<'a>(
        &'a self,
        cx: &'a Cx<'a>,
        _: Resolved<'a, Self, Project>,
    ) -> impl Future<Output = anyhow::Result<String>> + Send + 'a {
        async move { Ok(read_version(&cx.env.layout.root)?) }
    }
}

/// Pre-flight check for an external program. Resolves to its location, so
/// dependents only re-run when the program moved.
pub struct CheckTool(pub &'static str);

impl Rule<Project> for CheckTool {
    const NAME: &'static str = "check-tool";
    const KIND: TaskKind = TaskKind::Oracle;
    type Output = String;
    type Needs = ();

    fn params(&self) -> Params {
        params![self.0]
    }

    fn needs(&self, _: &mut Registry<Project>) -> Result<(), GraphError> {
        Ok(())
    }

    fn run<'a>(
        &'a self,
        cx: &'a Cx<'a>,
        _: Resolved<'a, Self, Project>,
    ) -> impl Future<Output = anyhow::Result<String>> + Send + 'a {
        async move {
            let tool = cx
                .env
                .tools
                .get(self.0)
                .with_context(|| format!("<{}> is not part of the toolchain", self.0))?;

            let path = tool.locate()?;
            tracing::debug!("Found <{}> at {}", self.0, path.display());
            Ok(path.display().to_string())
        }
    }
}

/// Parallelism handed to the hinting engine.
pub struct HintingJobs;

impl Rule<Project> for HintingJobs {
    const NAME: &'static str = "hinting-jobs";
    const KIND: TaskKind = TaskKind::Oracle;
    type Output = usize;
    type Needs = ();

    fn params(&self) -> Params {
        params![]
    }

    fn needs(&self, _: &mut Registry<Project>) -> Result<(), GraphError> {
        Ok(())
    }

    fn run<'a>(
        &'a self,
        _: &'a Cx<'a>,
        _: Resolved<'a, Self, Project>,
    ) -> impl Future<Output = anyhow::Result<usize>> + Send + 'a {
        async move {
            Ok(std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1))
        }
    }
}

/// One glyph script and the hash of its content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Script {
    pub path: String,
    pub hash: Hash32,
}

/// Every script under `make/`. Adding, removing or editing any of them
/// changes the result.
pub struct ScriptsStructure;

impl Rule<Project> for ScriptsStructure {
    const NAME: &'static str = "scripts-structure";
    const KIND: TaskKind = TaskKind::Oracle;
    type Output = Vec<Script>;
    type Needs = ();

    fn params(&self) -> Params {
        params![]
    }

    fn needs(&self, _: &mut Registry<Project>) -> Result<(), GraphError> {
        Ok(())
    }

    fn run<'a>(
        &'a self,
        cx: &'a Cx<'a>,
        _: Resolved<'a, Self, Project>,
    ) -> impl Future<Output = anyhow::Result<Vec<Script>>> + Send + 'a {
        let root = cx.env.layout.root.clone();
        let make = cx.env.layout.make.clone();

        async move {
            tokio::task::spawn_blocking(move || scan_scripts(&root, &make)).await?
        }
    }
}

fn scan_scripts(root: &camino::Utf8Path, make: &camino::Utf8Path) -> anyhow::Result<Vec<Script>> {
    let pattern = format!("{make}/**/*.mjs");

    let mut paths = Vec::new();
    for entry in glob::glob(&pattern)? {
        let path = Utf8PathBuf::try_from(entry?)?;
        paths.push(path);
    }
    paths.sort();

    paths
        .into_par_iter()
        .map(|path| {
            let hash = Hash32::hash_file(&path).with_context(|| format!("Couldn't hash {path}"))?;
            let path = path
                .strip_prefix(root)
                .map(|p| p.to_string())
                .unwrap_or_else(|_| path.to_string());
            Ok(Script { path, hash })
        })
        .collect()
}

/// Declared and installed versions of the Node packages the scripts use.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Packages {
    pub requirements: IndexMap<String, String>,
    pub actual: IndexMap<String, String>,
}

pub struct PackageDeps;

impl Rule<Project> for PackageDeps {
    const NAME: &'static str = "dependencies";
    const KIND: TaskKind = TaskKind::Oracle;
    type Output = Packages;
    type Needs = ();

    fn params(&self) -> Params {
        params![]
    }

    fn needs(&self, _: &mut Registry<Project>) -> Result<(), GraphError> {
        Ok(())
    }

    fn run<'a>(
        &'a self,
        cx: &'a Cx<'a>,
        _: Resolved<'a, Self, Project>,
    ) -> impl Future<Output = anyhow::Result<Packages>> + Send + 'a {
        async move {
            let root = &cx.env.layout.root;
            let manifest = read_manifest(&root.join("package.json")).await?;

            let requirements: IndexMap<String, String> = manifest
                .get("dependencies")
                .and_then(serde_json::Value::as_object)
                .map(|deps| {
                    deps.iter()
                        .map(|(k, v)| (k.clone(), v.as_str().unwrap_or_default().to_string()))
                        .collect()
                })
                .unwrap_or_default();

            let mut actual = IndexMap::new();
            for name in requirements.keys() {
                let path = root.join("node_modules").join(name).join("package.json");
                let installed = read_manifest(&path)
                    .await
                    .with_context(|| format!("Package '{name}' is not installed"))?;

                let version = installed
                    .get("version")
                    .and_then(serde_json::Value::as_str)
                    .with_context(|| format!("{path} has no version"))?;

                actual.insert(name.clone(), version.to_string());
            }

            Ok(Packages {
                requirements,
                actual,
            })
        }
    }
}

async fn read_manifest(path: &camino::Utf8Path) -> anyhow::Result<serde_json::Value> {
    let text = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("Couldn't read {path}"))?;
    Ok(serde_json::from_str(&text)?)
}

/// Joins everything the glyph scripts depend on into a single need.
pub struct Scripts;

impl Rule<Project> for Scripts {
    const NAME: &'static str = "scripts";
    const KIND: TaskKind = TaskKind::Task;
    type Output = ();
    type Needs = (Handle<Packages>, Handle<Vec<Script>>);

    fn params(&self) -> Params {
        params![]
    }

    fn needs(&self, registry: &mut Registry<Project>) -> Result<Self::Needs, GraphError> {
        Ok((
            registry.request(PackageDeps)?,
            registry.request(ScriptsStructure)?,
        ))
    }

    fn run<'a>(
        &'a self,
        _: &'a Cx<'a>,
        (_, scripts): Resolved<'a, Self, Project>,
    ) -> impl Future<Output = anyhow::Result<()>> + Send + 'a {
        async move {
            tracing::debug!("Glyph scripts: {}", scripts.len());
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;

    #[test]
    fn test_scan_scripts_is_sorted_and_relative() {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();
        let make = root.join("make");
        fs::create_dir_all(make.join("kanji")).unwrap();
        fs::create_dir_all(make.join("pass1")).unwrap();
        fs::write(make.join("pass1/index.mjs"), "export {}").unwrap();
        fs::write(make.join("kanji/build.mjs"), "export {}").unwrap();
        fs::write(make.join("kanji/notes.txt"), "ignored").unwrap();

        let scripts = scan_scripts(&root, &make).unwrap();
        let paths: Vec<_> = scripts.iter().map(|s| s.path.as_str()).collect();
        assert_eq!(paths, vec!["make/kanji/build.mjs", "make/pass1/index.mjs"]);
        assert_eq!(scripts[0].hash, scripts[1].hash);

        fs::write(make.join("pass1/index.mjs"), "export default 1").unwrap();
        let changed = scan_scripts(&root, &make).unwrap();
        assert_ne!(changed[1].hash, scripts[1].hash);
    }
}
