//! depforge - staged builds of third-party C/C++ dependencies
#![allow(missing_docs)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::doc_markdown)]
//!
//! Downloads, verifies, extracts, patches, configures, compiles and installs
//! every target of a catalogue into one shared prefix. Each stage leaves a
//! marker behind, so re-running only does what is still missing.
//!
//! # Working root
//!
//! ```text
//! <root>/
//! ├── download/   # verified archives
//! ├── source/     # extracted trees
//! ├── build/      # build directories and step logs
//! ├── install/    # shared prefix
//! └── patch/      # optional <name>_<version>.patch files
//! ```

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::Parser;
use depforge_core::{Delegates, Layout, Pipeline, Registry, RunSummary, Settings, Stage};

/// Catalogue compiled into the binary.
pub const BUILTIN_CATALOGUE: &str = include_str!("../catalogue.toml");

#[derive(Debug, Parser)]
#[command(name = "depforge")]
#[command(
    author,
    version = env!("DEPFORGE_VERSION"),
    about = "Fetch, patch and build third-party dependencies into a shared prefix"
)]
pub struct Cli {
    /// Targets to process (default: every target in the catalogue)
    pub targets: Vec<String>,

    /// Working root holding download/, source/, build/ and install/
    #[arg(long, env = "DEPFORGE_ROOT", default_value = ".")]
    pub root: PathBuf,

    /// Catalogue file to use instead of the built-in one
    #[arg(long, env = "DEPFORGE_CATALOGUE")]
    pub catalogue: Option<PathBuf>,

    /// Directory holding <name>_<version>.patch files (default: <root>/patch)
    #[arg(long, env = "DEPFORGE_PATCH_DIR")]
    pub patch_dir: Option<PathBuf>,

    /// List catalogue targets and their completed stages, then exit
    #[arg(long)]
    pub list: bool,

    /// Debug logging; build tool output goes to the terminal
    #[arg(short, long)]
    pub verbose: bool,
}

/// Load the registry from `path`, or the built-in catalogue.
pub fn load_registry(path: Option<&Path>) -> Result<Registry> {
    match path {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read catalogue {}", path.display()))?;
            Registry::from_toml(&text)
                .with_context(|| format!("Invalid catalogue {}", path.display()))
        }
        None => Registry::from_toml(BUILTIN_CATALOGUE).context("Invalid built-in catalogue"),
    }
}

fn layout(cli: &Cli) -> Result<Layout> {
    let root = std::path::absolute(&cli.root)
        .with_context(|| format!("Invalid root {}", cli.root.display()))?;
    let mut layout = Layout::new(root);
    if let Some(patch_dir) = &cli.patch_dir {
        layout = layout.with_patch_root(std::path::absolute(patch_dir)?);
    }
    Ok(layout)
}

/// Execute the command line.
pub async fn run(cli: &Cli) -> Result<()> {
    let registry = load_registry(cli.catalogue.as_deref())?;
    let settings = Settings::from_env();
    let delegates = Delegates::system(&settings, cli.verbose);
    let pipeline = Pipeline::new(layout(cli)?, settings, delegates);

    if cli.list {
        return list(&pipeline, &registry);
    }

    // Fails on unknown names before anything touches the filesystem.
    let selection = registry.select(cli.targets.as_slice())?;
    tracing::debug!(
        root = %pipeline.layout().root().display(),
        targets = selection.targets.len(),
        "starting run"
    );

    let summary = pipeline.execute(&selection).await?;
    print_summary(&summary);
    Ok(())
}

fn list(pipeline: &Pipeline, registry: &Registry) -> Result<()> {
    let width = registry
        .targets()
        .iter()
        .map(|t| t.name().len())
        .max()
        .unwrap_or(0);

    for target in registry.targets() {
        let done = pipeline.completed_stages(target)?;
        let state = if done.contains(&Stage::Install) {
            "installed".to_string()
        } else if done.is_empty() {
            "-".to_string()
        } else {
            done.iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join(", ")
        };
        let name = target.name();
        let version = short(target.version());
        println!("{name:<width$}  {version:<12}  {state}");
    }
    Ok(())
}

/// Commit hashes are long; show the first 12 characters.
fn short(version: &str) -> &str {
    version.get(..12).unwrap_or(version)
}

fn print_summary(summary: &RunSummary) {
    for report in &summary.targets {
        let stages = report
            .stages
            .iter()
            .map(|(stage, outcome)| format!("{stage}={outcome}"))
            .collect::<Vec<_>>()
            .join(" ");
        let version = short(&report.version);
        println!("{} {version}: {stages}", report.name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_catalogue_loads() {
        let registry = load_registry(None).unwrap();
        let names: Vec<_> = registry.targets().iter().map(|t| t.name()).collect();
        assert_eq!(
            names,
            ["cereal", "cityhash", "cli11", "msgpack", "rapidcsv", "zstd"]
        );
        let zstd = registry.get("zstd").unwrap();
        assert_eq!(
            zstd.configure_subdir_template(),
            "zstd-{version}/build/cmake"
        );
    }

    #[test]
    fn cli_parses_targets_and_flags() {
        let cli = Cli::parse_from(["depforge", "--root", "/tmp/w", "-v", "zstd", "cereal"]);
        assert_eq!(cli.targets, ["zstd", "cereal"]);
        assert_eq!(cli.root, PathBuf::from("/tmp/w"));
        assert!(cli.verbose);
        assert!(!cli.list);
    }

    #[test]
    fn short_version_truncates_hashes() {
        assert_eq!(short("f5dc54147fcce12cefd16548c8e760d68ac04226"), "f5dc54147fcc");
        assert_eq!(short("1.5.5"), "1.5.5");
    }
}
