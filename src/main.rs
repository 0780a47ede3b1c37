use std::time::Instant;

use anyhow::Context;
use camino::{Utf8Path, Utf8PathBuf};
use clap::{Args, Parser, Subcommand};
use console::style;

use karakuri::pipeline::{Goal, Layout, Project, plan};
use karakuri::utils::as_overhead;
use karakuri::{Journal, RunOptions, Runner};

/// Incremental build of a CJK font family matrix.
#[derive(Parser, Debug)]
#[command(version, about)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    #[command(flatten)]
    global: Global,
}

#[derive(Args, Debug)]
struct Global {
    /// Project root holding `config.json` and `package.json`.
    #[arg(long, global = true, default_value = ".")]
    root: Utf8PathBuf,

    /// Maximum number of external processes running at once.
    #[arg(long, short, global = true)]
    jobs: Option<usize>,

    /// Stop starting new steps after the first failure.
    #[arg(long, global = true)]
    fail_fast: bool,

    /// Forget journal entries of steps no longer in the graph.
    #[arg(long, global = true)]
    prune: bool,

    /// Write a Mermaid diagram of the run to this file.
    #[arg(long, global = true)]
    report: Option<Utf8PathBuf>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Build targets: all, ttf, ttc, super-ttc, woff2, archives.
    Build {
        #[arg(default_value = "all")]
        targets: Vec<Goal>,
    },
    /// Forget every previous result, keeping the files.
    Clean,
    /// Delete the build and output directories along with the journal.
    FullClean,
    /// Print the planned graph as a Mermaid diagram.
    Graph {
        #[arg(default_value = "all")]
        targets: Vec<Goal>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    #[cfg(feature = "logging")]
    karakuri::utils::init_logging()?;

    let cli = Cli::parse();

    match cli.command {
        Command::Build { targets } => build(&cli.global, &targets).await,
        Command::Clean => clean(&Layout::new(cli.global.root.clone())),
        Command::FullClean => full_clean(&Layout::new(cli.global.root.clone())).await,
        Command::Graph { targets } => {
            let project = Project::load(cli.global.root.clone())?;
            let (graph, _) = plan(project, &targets)?;
            println!("{}", graph.to_mermaid());
            Ok(())
        }
    }
}

async fn build(global: &Global, targets: &[Goal]) -> anyhow::Result<()> {
    let s = Instant::now();
    eprintln!(
        "{} {}",
        style("Building").green().bold(),
        targets.iter().map(|goal| goal.name()).collect::<Vec<_>>().join(", ")
    );

    let project = Project::load(global.root.clone())?;
    let journal_path = project.layout.journal();

    let mut options = RunOptions::default();
    if let Some(jobs) = global.jobs.or(project.config.build_options.jobs) {
        options.jobs = jobs.max(1);
    }
    options.fail_fast = global.fail_fast;
    options.prune = global.prune;

    let (graph, roots) = plan(project, targets)?;
    tracing::info!("Planned {} steps", graph.len());

    if let Some(dir) = journal_path.parent() {
        tokio::fs::create_dir_all(dir).await?;
    }
    let journal = Journal::open(&journal_path)?;

    let runner = Runner::new(&graph, journal, options);
    let result = runner.run(&roots).await;
    let (_, diagnostics) = runner.finish();

    if let Some(report) = &global.report {
        tokio::fs::write(report, diagnostics.render_mermaid(&graph))
            .await
            .with_context(|| format!("Couldn't write the report to {report}"))?;
    }

    result?;
    eprintln!("{} {}", style("Done").green().bold(), as_overhead(s));
    Ok(())
}

fn clean(layout: &Layout) -> anyhow::Result<()> {
    if Journal::delete(&layout.journal())? {
        eprintln!("Removed {}", layout.journal());
    }
    Ok(())
}

async fn full_clean(layout: &Layout) -> anyhow::Result<()> {
    let s = Instant::now();
    remove_dir(&layout.build).await?;
    remove_dir(&layout.out).await?;
    clean(layout)?;
    eprintln!("Removed build outputs {}", as_overhead(s));
    Ok(())
}

async fn remove_dir(dir: &Utf8Path) -> std::io::Result<()> {
    match tokio::fs::remove_dir_all(dir).await {
        Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}
