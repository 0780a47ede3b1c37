use std::process::ExitStatus;
use std::sync::Arc;

use camino::Utf8PathBuf;
use thiserror::Error;

/// Problems with the active build configuration. These are always reported
/// before a single node is created.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Couldn't read configuration file {0}:\n{1}")]
    Read(Utf8PathBuf, std::io::Error),

    #[error("Couldn't parse configuration file {0}:\n{1}")]
    Parse(Utf8PathBuf, serde_json::Error),

    #[error("The {axis} axis is empty after applying the filter [{filter}]")]
    EmptyAxis { axis: &'static str, filter: String },

    #[error("Family '{0}' is listed in familyOrder but has no entry in families")]
    UnknownFamily(String),

    #[error("Style '{0}' is listed in styleOrder but has no entry in styles")]
    UnknownStyle(String),

    #[error("Style '{0}' maps to upright style '{1}', which is missing or itself an alias")]
    UnknownUpright(String, String),

    #[error("Subfamily '{0}' has no source region prefix in shsSourceMap.region")]
    UnknownSubfamily(String),

    #[error("Couldn't determine the package version from {0}")]
    Version(Utf8PathBuf),
}

/// Errors raised while building the task graph, before anything runs.
#[derive(Debug, Error)]
pub enum GraphError {
    #[error("Cycle detected in task graph: {}", .0.join(" -> "))]
    Cycle(Vec<String>),

    #[error("Key '{key}' is already registered with output {existing}, requested with {requested}")]
    KeyCollision {
        key: String,
        existing: &'static str,
        requested: &'static str,
    },

    #[error("Target {path} is declared by both '{first}' and '{second}'")]
    TargetCollision {
        path: Utf8PathBuf,
        first: String,
        second: String,
    },

    #[error("File task '{0}' does not declare a target path")]
    MissingTarget(String),

    #[error("Couldn't plan '{0}':\n{1}")]
    Plan(String, anyhow::Error),

    #[error("Unknown target '{0}'")]
    UnknownTarget(String),
}

/// Failures of the external tool boundary.
#[derive(Debug, Error)]
pub enum ToolError {
    #[error("External dependency <{name}> could not be found: {source}")]
    Missing {
        name: String,
        #[source]
        source: which::Error,
    },

    #[error("Couldn't start <{0}>:\n{1}")]
    Spawn(String, std::io::Error),

    #[error("<{program}> exited with {status}\n{stderr}")]
    Exit {
        program: String,
        status: ExitStatus,
        stderr: String,
    },
}

#[derive(Debug, Error)]
pub enum JournalError {
    #[error("Journal {0}:\n{1}")]
    Io(Utf8PathBuf, std::io::Error),

    #[error("Couldn't encode journal record:\n{0}")]
    Encode(#[from] ciborium::ser::Error<std::io::Error>),
}

/// Why a single node did not complete. Shared between every dependent that
/// was waiting on it, hence always handed out as `Arc<TaskError>`.
#[derive(Debug, Error)]
pub enum TaskError {
    #[error("Task '{0}':\n{1:#}")]
    Recipe(String, anyhow::Error),

    #[error("Task '{node}' was skipped because '{need}' failed")]
    Dependency { node: String, need: String },

    #[error("Task '{0}' broke its contract: {1}")]
    Contract(String, String),

    #[error("Task '{0}' panicked: {1}")]
    Panic(String, String),

    #[error("Task '{0}' was not started because the build is stopping")]
    Aborted(String),
}

impl TaskError {
    /// True for errors that originate in the node itself rather than being
    /// inherited from one of its needs.
    pub fn is_origin(&self) -> bool {
        !matches!(self, TaskError::Dependency { .. } | TaskError::Aborted(_))
    }
}

#[derive(Debug, Error)]
pub enum KarakuriError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Graph(#[from] GraphError),

    #[error(transparent)]
    Journal(#[from] JournalError),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("Build failed with {} error(s):\n{}", .0.len(), render_failures(.0))]
    Failed(Vec<Arc<TaskError>>),
}

fn render_failures(failures: &[Arc<TaskError>]) -> String {
    failures
        .iter()
        .map(|e| format!("  - {e}"))
        .collect::<Vec<_>>()
        .join("\n")
}
