//! Top level goals and the fan-out of release targets.

use std::fmt;
use std::future::Future;
use std::str::FromStr;

use camino::Utf8PathBuf;

use crate::config::Config;
use crate::engine::{BuildGraph, Handle, NodeRef, Params, Registry, Resolved, Rule, Target, TaskKind};
use crate::error::GraphError;
use crate::params;
use crate::pipeline::archive::{Archive, Format, Scope, write_checksums};
use crate::pipeline::bundle::{SuperTtcFile, TtcFontFiles, TtfFontFiles, Woff2File};
use crate::pipeline::oracle::Version;
use crate::pipeline::{Cx, Hinting, Project};

fn variants(registry: &Registry<Project>) -> &'static [Hinting] {
    Hinting::variants(registry.env().config.hinted_only())
}

/// Every release TTF.
pub struct Ttf;

impl Rule<Project> for Ttf {
    const NAME: &'static str = "ttf";
    const KIND: TaskKind = TaskKind::Phony;
    type Output = ();
    type Needs = Vec<Handle<()>>;

    fn params(&self) -> Params {
        params![]
    }

    fn needs(&self, registry: &mut Registry<Project>) -> Result<Self::Needs, GraphError> {
        registry.request_all(
            variants(registry)
                .iter()
                .map(|&hinting| TtfFontFiles { hinting }),
        )
    }

    fn run<'a>(
        &'a self,
        _: &'a Cx<'a>,
        _: Resolved<'a, Self, Project>,
    ) -> impl Future<Output = anyhow::Result<()>> + Send + 'a {
        async move { Ok(()) }
    }
}

/// Every per-style collection, after the TTFs they are made of.
pub struct Ttc;

impl Rule<Project> for Ttc {
    const NAME: &'static str = "ttc";
    const KIND: TaskKind = TaskKind::Phony;
    type Output = ();
    type Needs = (Handle<()>, Vec<Handle<()>>);

    fn params(&self) -> Params {
        params![]
    }

    fn needs(&self, registry: &mut Registry<Project>) -> Result<Self::Needs, GraphError> {
        let ttf = registry.request(Ttf)?;
        let ttc = registry.request_all(
            variants(registry)
                .iter()
                .map(|&hinting| TtcFontFiles { hinting }),
        )?;
        Ok((ttf, ttc))
    }

    fn run<'a>(
        &'a self,
        _: &'a Cx<'a>,
        _: Resolved<'a, Self, Project>,
    ) -> impl Future<Output = anyhow::Result<()>> + Send + 'a {
        async move { Ok(()) }
    }
}

pub struct SuperTtc;

impl Rule<Project> for SuperTtc {
    const NAME: &'static str = "super-ttc";
    const KIND: TaskKind = TaskKind::Phony;
    type Output = ();
    type Needs = Vec<Handle<Target>>;

    fn params(&self) -> Params {
        params![]
    }

    fn needs(&self, registry: &mut Registry<Project>) -> Result<Self::Needs, GraphError> {
        registry.request_all(
            variants(registry)
                .iter()
                .map(|&hinting| SuperTtcFile { hinting }),
        )
    }

    fn run<'a>(
        &'a self,
        _: &'a Cx<'a>,
        _: Resolved<'a, Self, Project>,
    ) -> impl Future<Output = anyhow::Result<()>> + Send + 'a {
        async move { Ok(()) }
    }
}

/// Web fonts for every family, region and style.
pub struct Woff2;

impl Rule<Project> for Woff2 {
    const NAME: &'static str = "woff2";
    const KIND: TaskKind = TaskKind::Phony;
    type Output = ();
    type Needs = Vec<Handle<Target>>;

    fn params(&self) -> Params {
        params![]
    }

    fn needs(&self, registry: &mut Registry<Project>) -> Result<Self::Needs, GraphError> {
        let env = registry.env();
        let config = &env.config;

        let mut fonts = Vec::new();
        for family in &config.family_order {
            for region in &config.subfamily_order {
                for style in &config.style_order {
                    fonts.push(registry.request(Woff2File::new(family, region, style))?);
                }
            }
        }

        Ok(fonts)
    }

    fn run<'a>(
        &'a self,
        _: &'a Cx<'a>,
        _: Resolved<'a, Self, Project>,
    ) -> impl Future<Output = anyhow::Result<()>> + Send + 'a {
        async move { Ok(()) }
    }
}

/// Every release archive of the active configuration, in release order:
/// collections first, then the TTF archives from broad to narrow.
pub fn archives(config: &Config, version: &str) -> Vec<Archive> {
    let variants = Hinting::variants(config.hinted_only());
    let formats = [Format::SevenZip, Format::Zip];
    let mut acc = Vec::new();

    for scope in [Scope::Ttc, Scope::SuperTtc] {
        for format in formats {
            for &hinting in variants {
                acc.push(Archive::new(format, hinting, scope.clone(), version));
            }
        }
    }

    for &hinting in variants {
        acc.push(Archive::new(Format::SevenZip, hinting, Scope::AllFamilies, version));
    }

    for family in &config.family_order {
        for format in formats {
            for &hinting in variants {
                let scope = Scope::Family(family.as_str().into());
                acc.push(Archive::new(format, hinting, scope, version));
            }
        }

        for subfamily in &config.subfamily_order {
            for &hinting in variants {
                let scope = Scope::Standalone(family.as_str().into(), subfamily.as_str().into());
                acc.push(Archive::new(Format::SevenZip, hinting, scope, version));
            }
        }
    }

    acc
}

pub struct Archives;

impl Rule<Project> for Archives {
    const NAME: &'static str = "archives";
    const KIND: TaskKind = TaskKind::Phony;
    type Output = Vec<Utf8PathBuf>;
    type Needs = Vec<Handle<Target>>;

    fn params(&self) -> Params {
        params![]
    }

    fn needs(&self, registry: &mut Registry<Project>) -> Result<Self::Needs, GraphError> {
        let env = registry.env();
        registry.request_all(archives(&env.config, &env.version))
    }

    fn run<'a>(
        &'a self,
        _: &'a Cx<'a>,
        packages: Resolved<'a, Self, Project>,
    ) -> impl Future<Output = anyhow::Result<Vec<Utf8PathBuf>>> + Send + 'a {
        async move { Ok(packages.into_iter().map(|p| p.path.clone()).collect()) }
    }
}

/// The whole release: fonts, collections, archives, release notes and the
/// checksum list.
pub struct All;

impl Rule<Project> for All {
    const NAME: &'static str = "all";
    const KIND: TaskKind = TaskKind::Phony;
    type Output = ();
    type Needs = (Handle<String>, Handle<()>, Handle<Vec<Utf8PathBuf>>);

    fn params(&self) -> Params {
        params![]
    }

    fn needs(&self, registry: &mut Registry<Project>) -> Result<Self::Needs, GraphError> {
        Ok((
            registry.request(Version)?,
            registry.request(Ttc)?,
            registry.request(Archives)?,
        ))
    }

    fn run<'a>(
        &'a self,
        cx: &'a Cx<'a>,
        (version, _, packages): Resolved<'a, Self, Project>,
    ) -> impl Future<Output = anyhow::Result<()>> + Send + 'a {
        async move {
            let layout = &cx.env.layout;

            let notes = layout.out.join(format!("release-notes-{version}.md"));
            let invocation = cx
                .env
                .tools
                .node
                .invoke()
                .path(layout.root.join("tools/generate-release-notes.mjs"))
                .arg(version.as_str())
                .path(&notes)
                .current_dir(&layout.root);
            cx.exec(invocation).await?;

            let files = packages.clone();
            let dest = layout.out.join("SHA-256.txt");
            tokio::task::spawn_blocking(move || write_checksums(&files, &dest)).await??;

            tracing::info!("Packaged {version} into {} archives", packages.len());
            Ok(())
        }
    }
}

/// Something the command line can ask for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Goal {
    All,
    Ttf,
    Ttc,
    SuperTtc,
    Woff2,
    Archives,
}

impl Goal {
    pub const ALL: [Goal; 6] = [
        Goal::All,
        Goal::Ttf,
        Goal::Ttc,
        Goal::SuperTtc,
        Goal::Woff2,
        Goal::Archives,
    ];

    pub const fn name(self) -> &'static str {
        match self {
            Goal::All => "all",
            Goal::Ttf => "ttf",
            Goal::Ttc => "ttc",
            Goal::SuperTtc => "super-ttc",
            Goal::Woff2 => "woff2",
            Goal::Archives => "archives",
        }
    }

    fn request(self, registry: &mut Registry<Project>) -> Result<NodeRef, GraphError> {
        Ok(match self {
            Goal::All => registry.request(All)?.erase(),
            Goal::Ttf => registry.request(Ttf)?.erase(),
            Goal::Ttc => registry.request(Ttc)?.erase(),
            Goal::SuperTtc => registry.request(SuperTtc)?.erase(),
            Goal::Woff2 => registry.request(Woff2)?.erase(),
            Goal::Archives => registry.request(Archives)?.erase(),
        })
    }
}

impl fmt::Display for Goal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Goal {
    type Err = GraphError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Goal::ALL
            .into_iter()
            .find(|goal| goal.name() == s)
            .ok_or_else(|| GraphError::UnknownTarget(s.to_string()))
    }
}

/// Builds the graph for `goals` and returns it with the matching roots.
pub fn plan(project: Project, goals: &[Goal]) -> Result<(BuildGraph<Project>, Vec<NodeRef>), GraphError> {
    let mut registry = Registry::new(project);

    let roots = goals
        .iter()
        .map(|goal| goal.request(&mut registry))
        .collect::<Result<Vec<_>, _>>()?;

    tracing::debug!("Planned {} nodes for {} goals", registry.len(), roots.len());
    Ok((registry.finish()?, roots))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Filter;
    use crate::config::tests::sample;
    use crate::engine::Key;
    use crate::pipeline::tests::{project, project_with};

    fn count(graph: &BuildGraph<Project>, kind: &str, name: &str) -> usize {
        let prefix = format!("{kind}:{name}:");
        graph.keys().filter(|key| key.starts_with(&prefix)).count()
    }

    #[test]
    fn test_goal_names() {
        assert_eq!("super-ttc".parse::<Goal>().unwrap(), Goal::SuperTtc);
        for goal in Goal::ALL {
            assert_eq!(goal.to_string().parse::<Goal>().unwrap(), goal);
        }
        assert!(matches!(
            "otf".parse::<Goal>(),
            Err(GraphError::UnknownTarget(name)) if name == "otf"
        ));
    }

    #[test]
    fn test_archive_fan_out() {
        let mut config = sample();
        config.build_options.hinted_only = Some(false);
        // 8 collection archives, 2 all-family, per family 4 + 2 per subfamily
        assert_eq!(archives(&config, "1.0.0").len(), 26);

        config.build_options.hinted_only = Some(true);
        let hinted = archives(&config, "1.0.0");
        assert_eq!(hinted.len(), 13);
        assert!(hinted.iter().all(|a| a.hinting == Hinting::Hinted));
        assert_eq!(hinted[0].scope, Scope::Ttc);
        assert_eq!(
            hinted.last().map(|a| &a.scope),
            Some(&Scope::Standalone("Mono".into(), "J".into()))
        );
    }

    #[test]
    fn test_all_plans_every_variant() {
        let (graph, roots) = plan(project(), &[Goal::All]).unwrap();
        assert_eq!(roots.len(), 1);

        // 2 families x 2 regions x 4 styles, hinted and unhinted
        assert_eq!(count(&graph, "file", "prod"), 32);
        assert_eq!(count(&graph, "file", "archive"), 26);
        assert_eq!(count(&graph, "task", "group-instr"), 2);
        assert_eq!(count(&graph, "file", "hinted-font"), 2 * 8 + 2 * 2 * 2);
    }

    #[test]
    fn test_family_filter_narrows_the_graph() {
        let project = project_with(Filter {
            families: Some(vec!["Mono".into()]),
            styles: Some(vec!["Bold".into()]),
            ..Filter::default()
        });
        let (graph, _) = plan(project, &[Goal::Ttf]).unwrap();

        assert_eq!(count(&graph, "file", "prod"), 4);
        assert_eq!(count(&graph, "file", "pass1"), 2);
        assert!(
            graph
                .keys()
                .all(|key| !key.contains("\"Gothic\"") && !key.contains("\"Regular\""))
        );
    }

    #[test]
    fn test_hinted_only_has_no_unhinted_nodes() {
        let project = project_with(Filter {
            hinted_only: true,
            ..Filter::default()
        });
        let (graph, _) = plan(project, &[Goal::All, Goal::SuperTtc]).unwrap();

        assert!(graph.keys().all(|key| !key.contains("unhinted")));
        assert_eq!(count(&graph, "file", "archive"), 13);
        assert_eq!(count(&graph, "file", "super-ttc-file"), 1);
    }

    #[test]
    fn test_woff2_only_touches_hinted_fonts() {
        let (graph, _) = plan(project(), &[Goal::Woff2]).unwrap();
        assert_eq!(count(&graph, "file", "woff2-file"), 16);
        assert_eq!(count(&graph, "file", "prod"), 16);

        let key = Key::new(
            TaskKind::File,
            "prod",
            params!["unhinted", "Gothic", "SC", "Regular"],
        );
        assert!(graph.lookup(&key).is_none());
    }

    #[test]
    fn test_goals_share_nodes() {
        let (graph, roots) = plan(project(), &[Goal::Ttc, Goal::Ttf, Goal::Ttc]).unwrap();
        assert_eq!(roots[0], roots[2]);
        assert_eq!(count(&graph, "phony", "ttf"), 1);
    }
}
