//! Release archives.
//!
//! The archiver runs inside the directory holding the archived fonts, so the
//! entries it records carry bare file names.

use std::fs::File;
use std::future::Future;
use std::io::{self, Write};

use anyhow::Context;
use camino::{Utf8Path, Utf8PathBuf};
use rayon::iter::{IntoParallelRefIterator, ParallelIterator};
use sha2::{Digest, Sha256};

use crate::config::Config;
use crate::core::ArcStr;
use crate::engine::{Handle, Params, Registry, Resolved, Rule, Target, TaskKind};
use crate::error::GraphError;
use crate::params;
use crate::pipeline::bundle::{SuperTtcFile, TtcFontFiles, TtfFontFiles};
use crate::pipeline::oracle::ConfigOracle;
use crate::pipeline::{Cx, Hinting, Project, prepare, remove};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Format {
    SevenZip,
    Zip,
}

impl Format {
    pub const fn extension(self) -> &'static str {
        match self {
            Format::SevenZip => "7z",
            Format::Zip => "zip",
        }
    }

    const fn args(self) -> [&'static str; 2] {
        match self {
            Format::SevenZip => ["-t7z", "-mx=9"],
            Format::Zip => ["-tzip", "-mx=9"],
        }
    }
}

/// What goes into an archive.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Scope {
    /// Every per-style collection.
    Ttc,
    /// The single collection of every style.
    SuperTtc,
    /// Every release TTF.
    AllFamilies,
    /// One family, all of its subfamilies.
    Family(ArcStr),
    /// One family and subfamily.
    Standalone(ArcStr, ArcStr),
}

impl Scope {
    fn params(&self, params: &mut Params) {
        match self {
            Scope::Ttc => params.push("ttc"),
            Scope::SuperTtc => params.push("super-ttc"),
            Scope::AllFamilies => params.push("ttf"),
            Scope::Family(family) => {
                params.push("family");
                params.push(family);
            }
            Scope::Standalone(family, subfamily) => {
                params.push("standalone");
                params.push(family);
                params.push(subfamily);
            }
        }
    }
}

pub struct Archive {
    pub format: Format,
    pub hinting: Hinting,
    pub scope: Scope,
    pub version: ArcStr,
}

impl Archive {
    pub fn new(format: Format, hinting: Hinting, scope: Scope, version: impl AsRef<str>) -> Self {
        Self {
            format,
            hinting,
            scope,
            version: version.as_ref().into(),
        }
    }

    pub fn path(&self, env: &Project) -> Utf8PathBuf {
        let prefix = &env.config.prefix;
        let ttc = self.hinting.ttc_dir();
        let ttf = self.hinting.ttf_dir();

        let stem = match &self.scope {
            Scope::Ttc => format!("{prefix}-{ttc}"),
            Scope::SuperTtc => format!("{prefix}-Super{ttc}"),
            Scope::AllFamilies => format!("{prefix}-{ttf}"),
            Scope::Family(family) => format!("{prefix}{family}-{ttf}"),
            Scope::Standalone(family, subfamily) => format!("{prefix}{family}{subfamily}-{ttf}"),
        };

        env.layout
            .out
            .join(format!("{stem}-{}.{}", self.version, self.format.extension()))
    }

    /// The directory the archiver runs in.
    fn content_dir(&self, env: &Project) -> Utf8PathBuf {
        let out = &env.layout.out;
        match self.scope {
            Scope::Ttc => out.join(self.hinting.ttc_dir()),
            Scope::SuperTtc => out.join(".super-ttc"),
            _ => out.join(self.hinting.ttf_dir()),
        }
    }
}

impl Rule<Project> for Archive {
    const NAME: &'static str = "archive";
    const KIND: TaskKind = TaskKind::File;
    type Output = Target;
    type Needs = (Handle<Config>, Option<Handle<()>>, Option<Handle<Target>>);

    fn params(&self) -> Params {
        let mut params = params![self.format.extension(), self.hinting.as_str()];
        self.scope.params(&mut params);
        params.push(&*self.version);
        params
    }

    fn target(&self, env: &Project) -> Option<Utf8PathBuf> {
        Some(self.path(env))
    }

    fn needs(&self, registry: &mut Registry<Project>) -> Result<Self::Needs, GraphError> {
        let config = registry.request(ConfigOracle)?;
        let hinting = self.hinting;

        match self.scope {
            Scope::Ttc => Ok((config, Some(registry.request(TtcFontFiles { hinting })?), None)),
            Scope::SuperTtc => Ok((config, None, Some(registry.request(SuperTtcFile { hinting })?))),
            _ => Ok((config, Some(registry.request(TtfFontFiles { hinting })?), None)),
        }
    }

    fn run<'a>(
        &'a self,
        cx: &'a Cx<'a>,
        (config, _, super_ttc): Resolved<'a, Self, Project>,
    ) -> impl Future<Output = anyhow::Result<Target>> + Send + 'a {
        async move {
            let out = self.path(cx.env);
            prepare(&out).await?;
            remove(&out).await?;

            let dir = self.content_dir(cx.env);
            let prefix = &config.prefix;

            match &self.scope {
                Scope::Ttc => self.compress(cx, &dir, &out, true, ["*.ttc".to_string()]).await?,
                Scope::SuperTtc => {
                    let file = super_ttc
                        .map(|ttc| ttc.file_name().to_string())
                        .context("super TTC was not built")?;
                    self.compress(cx, &dir, &out, true, [file]).await?
                }
                Scope::AllFamilies => {
                    for style in &config.style_order {
                        self.compress(cx, &dir, &out, true, [format!("*-{style}.ttf")])
                            .await?;
                    }
                }
                Scope::Family(family) => {
                    for style in &config.style_order {
                        let files = config
                            .subfamily_order
                            .iter()
                            .map(|region| format!("{prefix}{family}{region}-{style}.ttf"));
                        self.compress(cx, &dir, &out, false, files).await?;
                    }
                }
                Scope::Standalone(family, subfamily) => {
                    let files = [format!("{prefix}{family}{subfamily}-*.ttf")];
                    self.compress(cx, &dir, &out, false, files).await?
                }
            }

            Ok(Target::new(out))
        }
    }
}

impl Archive {
    /// Adds `inputs` to the archive at `out`. Repeated calls append.
    async fn compress(
        &self,
        cx: &Cx<'_>,
        dir: &Utf8Path,
        out: &Utf8Path,
        multithreaded: bool,
        inputs: impl IntoIterator<Item = String>,
    ) -> anyhow::Result<()> {
        let mut invocation = cx
            .env
            .tools
            .seven_zip
            .invoke()
            .arg("a")
            .args(self.format.args());

        if !multithreaded {
            invocation = invocation.arg("-mmt1");
        }

        let invocation = invocation.path(out).args(inputs).current_dir(dir);
        cx.exec(invocation).await?;
        Ok(())
    }
}

/// Writes `<sha256>  <file name>` lines for `files` into `dest`, in the
/// given order.
pub fn write_checksums(files: &[Utf8PathBuf], dest: &Utf8Path) -> anyhow::Result<()> {
    let lines = files
        .par_iter()
        .map(|path| {
            let mut hasher = Sha256::new();
            let mut file = File::open(path).with_context(|| format!("Couldn't open {path}"))?;
            io::copy(&mut file, &mut hasher)?;

            let name = path.file_name().unwrap_or(path.as_str());
            Ok(format!("{:x}  {name}", hasher.finalize()))
        })
        .collect::<anyhow::Result<Vec<_>>>()?;

    let mut out = File::create(dest).with_context(|| format!("Couldn't create {dest}"))?;
    for line in lines {
        writeln!(out, "{line}")?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;
    use crate::engine::{Key, NodeRef};
    use crate::pipeline::tests::project;

    fn archive_path(format: Format, hinting: Hinting, scope: Scope) -> String {
        let project = project();
        Archive::new(format, hinting, scope, "1.0.0")
            .path(&project)
            .to_string()
    }

    #[test]
    fn test_archive_names() {
        assert_eq!(
            archive_path(Format::SevenZip, Hinting::Hinted, Scope::Ttc),
            "/work/sarasa/out/Sarasa-TTC-1.0.0.7z"
        );
        assert_eq!(
            archive_path(Format::Zip, Hinting::Unhinted, Scope::SuperTtc),
            "/work/sarasa/out/Sarasa-SuperTTC-Unhinted-1.0.0.zip"
        );
        assert_eq!(
            archive_path(Format::SevenZip, Hinting::Unhinted, Scope::AllFamilies),
            "/work/sarasa/out/Sarasa-TTF-Unhinted-1.0.0.7z"
        );
        assert_eq!(
            archive_path(Format::Zip, Hinting::Hinted, Scope::Family("Mono".into())),
            "/work/sarasa/out/SarasaMono-TTF-1.0.0.zip"
        );
        assert_eq!(
            archive_path(
                Format::SevenZip,
                Hinting::Hinted,
                Scope::Standalone("Gothic".into(), "J".into())
            ),
            "/work/sarasa/out/SarasaGothicJ-TTF-1.0.0.7z"
        );
    }

    #[test]
    fn test_archives_need_their_content() {
        let mut registry = Registry::new(project());

        let ttc = registry
            .request(Archive::new(Format::Zip, Hinting::Hinted, Scope::Ttc, "1.0.0"))
            .unwrap();
        let standalone = registry
            .request(Archive::new(
                Format::SevenZip,
                Hinting::Unhinted,
                Scope::Standalone("Gothic".into(), "SC".into()),
                "1.0.0",
            ))
            .unwrap();

        let labels = |node: NodeRef| -> Vec<String> {
            registry
                .needs_of(node)
                .iter()
                .map(|&i| registry.label(NodeRef(i)).to_string())
                .collect()
        };
        assert_eq!(labels(ttc.erase()), vec!["config", "ttc-font-files(hinted)"]);
        assert_eq!(
            labels(standalone.erase()),
            vec!["config", "ttf-font-files(unhinted)"]
        );

        let key = Key::new(
            TaskKind::File,
            "archive",
            params!["7z", "unhinted", "standalone", "Gothic", "SC", "1.0.0"],
        );
        assert_eq!(registry.lookup(&key), Some(standalone.erase()));
    }

    #[test]
    fn test_checksums() {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();
        fs::write(root.join("a.7z"), "abc").unwrap();
        fs::write(root.join("b.zip"), "").unwrap();

        let dest = root.join("SHA-256.txt");
        write_checksums(&[root.join("a.7z"), root.join("b.zip")], &dest).unwrap();

        let text = fs::read_to_string(&dest).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(
            lines,
            vec![
                "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad  a.7z",
                "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855  b.zip",
            ]
        );
    }

    #[test]
    fn test_checksums_of_missing_file_fail() {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();
        let err = write_checksums(&[root.join("gone.7z")], &root.join("SHA-256.txt"));
        assert!(err.is_err());
    }
}
