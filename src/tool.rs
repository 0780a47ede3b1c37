use std::ffi::OsString;
use std::fmt;
use std::path::PathBuf;
use std::process::Stdio;

use camino::{Utf8Path, Utf8PathBuf};
use tokio::process::Command;
use tokio::sync::Semaphore;

use crate::error::ToolError;

/// An external program, possibly launched through an interpreter
/// (`node node_modules/.../cli.js`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tool {
    name: &'static str,
    program: String,
    prefix: Vec<String>,
}

impl Tool {
    pub fn new(name: &'static str, program: impl Into<String>) -> Self {
        Self {
            name,
            program: program.into(),
            prefix: Vec::new(),
        }
    }

    /// Arguments placed before every invocation's own arguments.
    pub fn with_prefix<S: Into<String>>(mut self, prefix: impl IntoIterator<Item = S>) -> Self {
        self.prefix = prefix.into_iter().map(Into::into).collect();
        self
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    /// Pre-flight check that the program can be found at all.
    pub fn locate(&self) -> Result<PathBuf, ToolError> {
        which::which(&self.program).map_err(|source| ToolError::Missing {
            name: self.name.to_string(),
            source,
        })
    }

    pub fn invoke(&self) -> Invocation {
        Invocation {
            name: self.name,
            program: self.program.clone(),
            args: self.prefix.iter().map(OsString::from).collect(),
            cwd: None,
        }
    }
}

/// A single pending run of a [`Tool`].
#[derive(Debug, Clone)]
pub struct Invocation {
    name: &'static str,
    program: String,
    args: Vec<OsString>,
    cwd: Option<Utf8PathBuf>,
}

impl Invocation {
    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn path(self, path: impl AsRef<Utf8Path>) -> Self {
        self.arg(path.as_ref().as_str())
    }

    pub fn current_dir(mut self, dir: impl Into<Utf8PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    pub fn arguments(&self) -> &[OsString] {
        &self.args
    }

    /// Runs the process to completion once a job slot is free. Standard
    /// output is inherited, standard error is captured for the error report
    /// and replayed on success at debug level.
    pub async fn run(self, jobs: &Semaphore) -> Result<(), ToolError> {
        let _permit = jobs.acquire().await.ok();

        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::inherit())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        if let Some(cwd) = &self.cwd {
            command.current_dir(cwd);
        }

        let output = command.output().await.map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => ToolError::Missing {
                name: self.name.to_string(),
                source: which::Error::CannotFindBinaryPath,
            },
            _ => ToolError::Spawn(self.name.to_string(), e),
        })?;

        let stderr = String::from_utf8_lossy(&output.stderr).trim_end().to_string();

        if !output.status.success() {
            return Err(ToolError::Exit {
                program: self.to_string(),
                status: output.status,
                stderr,
            });
        }

        if !stderr.is_empty() {
            tracing::debug!("{}: {}", self.name, stderr);
        }

        Ok(())
    }
}

impl fmt::Display for Invocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.program)?;
        for arg in &self.args {
            write!(f, " {}", arg.to_string_lossy())?;
        }
        Ok(())
    }
}

/// Every external program the font pipeline calls.
#[derive(Debug, Clone)]
pub struct Toolchain {
    pub node: Tool,
    pub seven_zip: Tool,
    pub otc2otf: Tool,
    pub otf2ttf: Tool,
    pub ttfautohint: Tool,
    pub ttc_bundle: Tool,
    pub chlorophytum: Tool,
    pub woff2_compress: Tool,
}

impl Toolchain {
    /// Default programs, with `SEVEN_ZIP_PATH` and `TTFAUTOHINT_PATH`
    /// overriding the archiver and the autohinter. Node based tools are
    /// resolved against the project's `node_modules`.
    pub fn from_env(root: &Utf8Path) -> Self {
        let var = |name: &str, default: &str| {
            std::env::var(name)
                .ok()
                .filter(|v| !v.is_empty())
                .unwrap_or_else(|| default.to_string())
        };
        let modules = root.join("node_modules");

        Self {
            node: Tool::new("node", "node"),
            seven_zip: Tool::new("7z", var("SEVEN_ZIP_PATH", "7z")),
            otc2otf: Tool::new("otc2otf", "otc2otf"),
            otf2ttf: Tool::new("otf2ttf", "otf2ttf"),
            ttfautohint: Tool::new("ttfautohint", var("TTFAUTOHINT_PATH", "ttfautohint")),
            ttc_bundle: Tool::new("otb-ttc-bundle", "node").with_prefix([
                "--max-old-space-size=16384".to_string(),
                modules.join("otb-ttc-bundle/bin/otb-ttc-bundle").into_string(),
            ]),
            chlorophytum: Tool::new("chlorophytum", "node")
                .with_prefix([modules.join("@chlorophytum/cli/bin/_startup").into_string()]),
            woff2_compress: Tool::new("woff2_compress", "woff2_compress"),
        }
    }

    /// Finds a tool by its display name.
    pub fn get(&self, name: &str) -> Option<&Tool> {
        [
            &self.node,
            &self.seven_zip,
            &self.otc2otf,
            &self.otf2ttf,
            &self.ttfautohint,
            &self.ttc_bundle,
            &self.chlorophytum,
            &self.woff2_compress,
        ]
        .into_iter()
        .find(|tool| tool.name == name)
    }
}
