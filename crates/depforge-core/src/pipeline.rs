//! The six-stage pipeline.
//!
//! For every selected target, in registry order, the stages run in
//! [`Stage::ALL`] order. Each stage resolves its [`StageAction`]:
//!
//! - `Skip` succeeds without touching anything.
//! - `Override` runs the hook and returns its result; no marker is written.
//! - `Default` checks the stage marker, runs the built-in logic when the
//!   marker is missing, and writes the marker on success.
//!
//! A `Default` stage that actually ran invalidates the markers of every later
//! stage of the same target: a fresh extraction has not been patched, a fresh
//! configure has not been compiled.
//!
//! The first error aborts the run. Markers already written stay, so the next
//! invocation resumes where this one stopped.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use depforge_schema::Stage;
use tracing::{debug, info, warn};

use crate::builder::{Builder, BuilderError, CMakeBuilder, ConfigureRequest};
use crate::config::Settings;
use crate::error::ForgeError;
use crate::expand::Expander;
use crate::io::{
    ArchiveExtractor, DiffPatcher, ExtractError, Extractor, Patcher, Transports,
};
use crate::layout::Layout;
use crate::marker::{MarkerKey, MarkerStore};
use crate::registry::Run;
use crate::target::{StageAction, StageContext, Target};
use crate::verify::sha256_file_async;

/// macOS deployment target for configured builds.
pub const MACOS_DEPLOYMENT_TARGET: &str = "10.15";

/// External capabilities the built-in stages delegate to.
#[derive(Clone)]
pub struct Delegates {
    pub transports: Transports,
    pub extractor: Arc<dyn Extractor>,
    pub patcher: Arc<dyn Patcher>,
    pub builder: Arc<dyn Builder>,
}

impl fmt::Debug for Delegates {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delegates")
            .field("transports", &self.transports)
            .finish_non_exhaustive()
    }
}

impl Delegates {
    /// Real transports, archive extraction, unified-diff patching and CMake.
    pub fn system(settings: &Settings, verbose: bool) -> Self {
        Self {
            transports: Transports::system(settings),
            extractor: Arc::new(ArchiveExtractor),
            patcher: Arc::new(DiffPatcher::new()),
            builder: Arc::new(CMakeBuilder::new().with_verbose(verbose)),
        }
    }
}

/// How a stage was satisfied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StageOutcome {
    /// Built-in logic ran and the marker was written.
    Ran,
    /// Marker was present; nothing ran.
    Cached,
    /// Stage is configured to skip.
    Skipped,
    /// A caller-supplied hook ran.
    Overridden,
    /// Nothing to do (no patch file).
    Vacuous,
}

impl StageOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ran => "ran",
            Self::Cached => "cached",
            Self::Skipped => "skipped",
            Self::Overridden => "overridden",
            Self::Vacuous => "vacuous",
        }
    }
}

impl fmt::Display for StageOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Stage outcomes for one target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetReport {
    pub name: String,
    pub version: String,
    pub stages: Vec<(Stage, StageOutcome)>,
}

impl TargetReport {
    pub fn outcome(&self, stage: Stage) -> Option<StageOutcome> {
        self.stages
            .iter()
            .find(|(s, _)| *s == stage)
            .map(|(_, o)| *o)
    }
}

/// Result of a successful run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub targets: Vec<TargetReport>,
}

impl RunSummary {
    /// Number of stages with the given outcome across all targets.
    pub fn count(&self, outcome: StageOutcome) -> usize {
        self.targets
            .iter()
            .flat_map(|t| t.stages.iter())
            .filter(|(_, o)| *o == outcome)
            .count()
    }

    pub fn target(&self, name: &str) -> Option<&TargetReport> {
        self.targets.iter().find(|t| t.name == name)
    }
}

/// Baseline CMake options, before a target's own.
pub fn baseline_options(install_prefix: &Path, build_mode: &str) -> Vec<String> {
    let prefix = install_prefix.to_string_lossy();
    let link = platform_link_flags().join(";");
    let mut options = vec![
        "-DBUILD_SHARED_LIBS=OFF".to_string(),
        format!("-DCMAKE_BUILD_TYPE={build_mode}"),
        format!("-DCMAKE_EXE_LINKER_FLAGS={link}"),
        "-DCMAKE_FIND_PACKAGE_PREFER_CONFIG=TRUE".to_string(),
        format!("-DCMAKE_INSTALL_PREFIX={prefix}"),
        format!("-DCMAKE_PREFIX_PATH={prefix}"),
        format!("-DCMAKE_SHARED_LINKER_FLAGS={link}"),
        "-DPKG_CONFIG_USE_CMAKE_PREFIX_PATH=TRUE".to_string(),
    ];
    if cfg!(target_os = "macos") {
        options.push(format!(
            "-DCMAKE_OSX_DEPLOYMENT_TARGET={MACOS_DEPLOYMENT_TARGET}"
        ));
    }
    options
}

fn platform_link_flags() -> &'static [&'static str] {
    if cfg!(target_os = "linux") {
        &["-static-libstdc++"]
    } else {
        &[]
    }
}

/// Run a blocking delegate on the blocking pool.
async fn blocking<T, F>(what: &str, f: F) -> Result<T, ForgeError>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| ForgeError::io(what, std::io::Error::other(e)))
}

/// Executes runs against one working root.
#[derive(Debug)]
pub struct Pipeline {
    layout: Layout,
    settings: Settings,
    markers: MarkerStore,
    delegates: Delegates,
    check_artifacts: bool,
}

impl Pipeline {
    pub fn new(layout: Layout, settings: Settings, delegates: Delegates) -> Self {
        Self {
            layout,
            settings,
            markers: MarkerStore::new(),
            delegates,
            check_artifacts: true,
        }
    }

    /// Whether a marker counts only while its artifact still exists (default
    /// `true`). When disabled, markers are trusted unconditionally.
    pub fn with_artifact_checks(mut self, enabled: bool) -> Self {
        self.check_artifacts = enabled;
        self
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Run every selected target through the run's stages.
    ///
    /// # Errors
    ///
    /// The first stage failure; nothing after it runs.
    pub async fn execute(&self, run: &Run<'_>) -> Result<RunSummary, ForgeError> {
        let mut summary = RunSummary::default();
        for target in &run.targets {
            summary.targets.push(self.run_target(target, run.stages).await?);
        }
        Ok(summary)
    }

    /// Run `stages` for one target, in order.
    ///
    /// # Errors
    ///
    /// The first stage failure.
    pub async fn run_target(
        &self,
        target: &Target,
        stages: &[Stage],
    ) -> Result<TargetReport, ForgeError> {
        let mut report = TargetReport {
            name: target.name().to_string(),
            version: target.version().to_string(),
            stages: Vec::with_capacity(stages.len()),
        };
        for &stage in stages {
            let outcome = self.run_stage(target, stage).await?;
            report.stages.push((stage, outcome));
        }
        Ok(report)
    }

    /// Resolve and execute one stage.
    ///
    /// # Errors
    ///
    /// Stage-specific [`ForgeError`] variants, or the hook's error wrapped in
    /// [`ForgeError::Override`].
    pub async fn run_stage(
        &self,
        target: &Target,
        stage: Stage,
    ) -> Result<StageOutcome, ForgeError> {
        match target.action(stage) {
            StageAction::Skip => {
                debug!(name = target.name(), version = target.version(), %stage, "skipped");
                Ok(StageOutcome::Skipped)
            }
            StageAction::Override(hook) => {
                info!(name = target.name(), version = target.version(), %stage, "running override");
                let ctx = StageContext {
                    stage,
                    layout: &self.layout,
                    settings: &self.settings,
                    markers: &self.markers,
                };
                hook(target, &ctx).map_err(|source| ForgeError::Override {
                    target: target.to_string(),
                    stage,
                    source,
                })?;
                Ok(StageOutcome::Overridden)
            }
            StageAction::Default => {
                let outcome = match stage {
                    Stage::Fetch => self.fetch(target).await?,
                    Stage::Extract => self.extract(target).await?,
                    Stage::Patch => self.patch(target).await?,
                    Stage::Configure => self.configure(target).await?,
                    Stage::Compile => self.compile(target).await?,
                    Stage::Install => self.install(target).await?,
                };
                if outcome == StageOutcome::Ran {
                    self.invalidate_after(target, stage)?;
                }
                Ok(outcome)
            }
        }
    }

    /// Drop the markers of every stage after `stage`, so they re-run against
    /// the new upstream output.
    fn invalidate_after(&self, target: &Target, stage: Stage) -> Result<(), ForgeError> {
        for &later in &Stage::ALL[stage.index() + 1..] {
            let key = self.marker_key(target, later)?;
            if self.markers.is_done(&key) {
                debug!(name = target.name(), version = target.version(), stage = %later, "invalidated by {stage}");
                self.markers
                    .clear(&key)
                    .map_err(|e| ForgeError::io(format!("removing {}", key.path().display()), e))?;
            }
        }
        Ok(())
    }

    /// Marker for a stage of `target`.
    ///
    /// # Errors
    ///
    /// Expansion errors from the filename template (fetch stage only).
    pub fn marker_key(&self, target: &Target, stage: Stage) -> Result<MarkerKey, ForgeError> {
        let artifact = match stage {
            Stage::Fetch => self.download_path(target)?,
            stage => self.layout.target_dir(stage.root_kind(), target),
        };
        Ok(MarkerKey::new(artifact, stage))
    }

    /// Stages of `target` whose markers are present and trusted. Read-only.
    ///
    /// # Errors
    ///
    /// Expansion errors from the filename template.
    pub fn completed_stages(&self, target: &Target) -> Result<Vec<Stage>, ForgeError> {
        let mut done = Vec::new();
        for stage in Stage::ALL {
            if self.is_cached(&self.marker_key(target, stage)?) {
                done.push(stage);
            }
        }
        Ok(done)
    }

    /// Full option list for configuring `target`: baseline, then the target's own.
    pub fn configure_options(&self, target: &Target) -> Vec<String> {
        let mut options = baseline_options(&self.layout.install_prefix(), &self.settings.build_mode);
        options.extend(target.configure_options().iter().cloned());
        options
    }

    /// Directory holding the target's sources inside the extracted tree.
    ///
    /// # Errors
    ///
    /// Expansion errors from the source subdirectory template.
    pub fn source_dir(&self, target: &Target) -> Result<PathBuf, ForgeError> {
        let subdir = self.expander(target).source_subdir().map_err(expand_err(target))?;
        Ok(join_subdir(self.layout.extract_dir(target), &subdir))
    }

    /// Directory the configure step runs against.
    ///
    /// # Errors
    ///
    /// Expansion errors from the configure subdirectory template.
    pub fn configure_dir(&self, target: &Target) -> Result<PathBuf, ForgeError> {
        let subdir = self
            .expander(target)
            .configure_subdir()
            .map_err(expand_err(target))?;
        Ok(join_subdir(self.layout.extract_dir(target), &subdir))
    }

    fn expander<'a>(&'a self, target: &'a Target) -> Expander<'a> {
        Expander::new(target, &self.settings)
    }

    fn download_path(&self, target: &Target) -> Result<PathBuf, ForgeError> {
        let filename = self.expander(target).filename().map_err(expand_err(target))?;
        Ok(self.layout.download_path(target, &filename))
    }

    fn is_cached(&self, key: &MarkerKey) -> bool {
        if !self.markers.is_done(key) {
            return false;
        }
        if self.check_artifacts && !key.artifact().exists() {
            warn!(
                marker = %key.path().display(),
                artifact = %key.artifact().display(),
                "stale marker: artifact is missing, re-running {}",
                key.stage()
            );
            return false;
        }
        true
    }

    fn mark(&self, key: &MarkerKey) -> Result<(), ForgeError> {
        self.markers
            .mark_done(key)
            .map_err(|e| ForgeError::io(format!("writing {}", key.path().display()), e))
    }

    async fn fetch(&self, target: &Target) -> Result<StageOutcome, ForgeError> {
        let dest = self.download_path(target)?;
        let url = self.expander(target).url().map_err(expand_err(target))?;
        let key = self.marker_key(target, Stage::Fetch)?;
        if self.is_cached(&key) {
            return Ok(cached(target, Stage::Fetch));
        }

        info!(name = target.name(), version = target.version(), %url, "fetching");
        self.delegates
            .transports
            .fetch(&url, &dest)
            .await
            .map_err(|source| ForgeError::Fetch {
                target: target.to_string(),
                url: url.clone(),
                source,
            })?;

        let actual = sha256_file_async(&dest)
            .await
            .map_err(|e| ForgeError::io(format!("hashing {}", dest.display()), e))?;
        if !target.integrity_hash().matches(&actual) {
            tokio::fs::remove_file(&dest).await.ok();
            return Err(ForgeError::Integrity {
                target: target.to_string(),
                path: dest,
                expected: target.integrity_hash().to_string(),
                actual,
            });
        }

        self.mark(&key)?;
        Ok(StageOutcome::Ran)
    }

    async fn extract(&self, target: &Target) -> Result<StageOutcome, ForgeError> {
        let extract_dir = self.layout.extract_dir(target);
        let key = self.marker_key(target, Stage::Extract)?;
        if self.is_cached(&key) {
            return Ok(cached(target, Stage::Extract));
        }

        let archive = self.download_path(target)?;
        info!(name = target.name(), version = target.version(), archive = %archive.display(), "extracting");

        let extractor = Arc::clone(&self.delegates.extractor);
        let (src, dest) = (archive.clone(), extract_dir.clone());
        blocking("extract", move || extractor.extract(&src, &dest))
            .await?
            .map_err(|source| match source {
                ExtractError::UnsupportedFormat(_) => ForgeError::UnsupportedFormat {
                    target: target.to_string(),
                    path: archive.clone(),
                },
                source => ForgeError::Extract {
                    target: target.to_string(),
                    path: archive.clone(),
                    source,
                },
            })?;

        self.mark(&key)?;
        Ok(StageOutcome::Ran)
    }

    async fn patch(&self, target: &Target) -> Result<StageOutcome, ForgeError> {
        let patch_file = self.layout.patch_file(target);
        if !patch_file.is_file() {
            debug!(name = target.name(), version = target.version(), "no patch file");
            return Ok(StageOutcome::Vacuous);
        }

        let key = self.marker_key(target, Stage::Patch)?;
        if self.is_cached(&key) {
            return Ok(cached(target, Stage::Patch));
        }

        let source_dir = self.source_dir(target)?;
        info!(name = target.name(), version = target.version(), patch = %patch_file.display(), "patching");

        let patcher = Arc::clone(&self.delegates.patcher);
        let file = patch_file.clone();
        blocking("patch", move || patcher.apply(&file, &source_dir))
            .await?
            .map_err(|source| ForgeError::PatchApply {
                target: target.to_string(),
                patch: patch_file,
                source,
            })?;

        self.mark(&key)?;
        Ok(StageOutcome::Ran)
    }

    async fn configure(&self, target: &Target) -> Result<StageOutcome, ForgeError> {
        let build_dir = self.layout.build_dir(target);
        let key = self.marker_key(target, Stage::Configure)?;
        if self.is_cached(&key) {
            return Ok(cached(target, Stage::Configure));
        }

        let source_dir = self.configure_dir(target)?;
        let options = self.configure_options(target);
        let prefix = self.layout.install_prefix();
        info!(name = target.name(), version = target.version(), "configuring");
        debug!(?options, source = %source_dir.display(), "configure options");

        let builder = Arc::clone(&self.delegates.builder);
        blocking("configure", move || {
            builder.configure(&ConfigureRequest {
                source_dir: &source_dir,
                build_dir: &build_dir,
                install_prefix: &prefix,
                options: &options,
            })
        })
        .await?
        .map_err(|source| ForgeError::Configure {
            target: target.to_string(),
            source,
        })?;

        self.mark(&key)?;
        Ok(StageOutcome::Ran)
    }

    async fn compile(&self, target: &Target) -> Result<StageOutcome, ForgeError> {
        self.build_step(
            target,
            Stage::Compile,
            |builder, dir, mode| builder.build(dir, mode),
            |target, source| ForgeError::Build { target, source },
        )
        .await
    }

    async fn install(&self, target: &Target) -> Result<StageOutcome, ForgeError> {
        self.build_step(
            target,
            Stage::Install,
            |builder, dir, mode| builder.install(dir, mode),
            |target, source| ForgeError::Install { target, source },
        )
        .await
    }

    /// Shared shape of compile and install: marker check, one builder call
    /// against the build directory, marker write.
    async fn build_step<F>(
        &self,
        target: &Target,
        stage: Stage,
        step: F,
        wrap: fn(String, BuilderError) -> ForgeError,
    ) -> Result<StageOutcome, ForgeError>
    where
        F: FnOnce(&dyn Builder, &Path, &str) -> Result<(), BuilderError> + Send + 'static,
    {
        let build_dir = self.layout.build_dir(target);
        let key = self.marker_key(target, stage)?;
        if self.is_cached(&key) {
            return Ok(cached(target, stage));
        }

        info!(name = target.name(), version = target.version(), %stage, mode = %self.settings.build_mode, "running");
        let builder = Arc::clone(&self.delegates.builder);
        let mode = self.settings.build_mode.clone();
        blocking(stage.as_str(), move || step(builder.as_ref(), &build_dir, &mode))
            .await?
            .map_err(|source| wrap(target.to_string(), source))?;

        self.mark(&key)?;
        Ok(StageOutcome::Ran)
    }
}

fn cached(target: &Target, stage: Stage) -> StageOutcome {
    debug!(name = target.name(), version = target.version(), %stage, "already done");
    StageOutcome::Cached
}

fn expand_err(target: &Target) -> impl Fn(crate::expand::ExpandError) -> ForgeError + '_ {
    move |source| ForgeError::Expand {
        target: target.to_string(),
        source,
    }
}

fn join_subdir(base: PathBuf, subdir: &str) -> PathBuf {
    if subdir.is_empty() {
        base
    } else {
        base.join(subdir)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use depforge_schema::Sha256Digest;

    #[test]
    fn baseline_options_carry_prefix_and_mode() {
        let options = baseline_options(Path::new("/w/install"), "Debug");
        assert_eq!(options[0], "-DBUILD_SHARED_LIBS=OFF");
        assert!(options.contains(&"-DCMAKE_BUILD_TYPE=Debug".to_string()));
        assert!(options.contains(&"-DCMAKE_INSTALL_PREFIX=/w/install".to_string()));
        assert!(options.contains(&"-DCMAKE_PREFIX_PATH=/w/install".to_string()));
        assert!(options.contains(&"-DPKG_CONFIG_USE_CMAKE_PREFIX_PATH=TRUE".to_string()));
        if cfg!(target_os = "linux") {
            assert!(options.contains(&"-DCMAKE_EXE_LINKER_FLAGS=-static-libstdc++".to_string()));
        }
    }

    #[test]
    fn target_options_come_last() {
        let pipeline = Pipeline::new(
            Layout::new("/w"),
            Settings::default(),
            Delegates::system(&Settings::default(), false),
        );
        let target = Target::new(
            "a",
            "1",
            Sha256Digest::new("0".repeat(64)).unwrap(),
            "a.tar",
            "file:///a.tar",
        )
        .with_configure_options(["-DFOO=ON", "-DBAR=OFF"]);

        let options = pipeline.configure_options(&target);
        assert_eq!(&options[options.len() - 2..], ["-DFOO=ON", "-DBAR=OFF"]);
        assert!(options.contains(&"-DCMAKE_BUILD_TYPE=Release".to_string()));
    }

    #[test]
    fn subdirs_resolve_under_extract_dir() {
        let pipeline = Pipeline::new(
            Layout::new("/w"),
            Settings::default(),
            Delegates::system(&Settings::default(), false),
        );
        let target = Target::new(
            "zstd",
            "1.5.5",
            Sha256Digest::new("0".repeat(64)).unwrap(),
            "zstd-{version}.tar.gz",
            "https://example.com/{filename}",
        );
        assert_eq!(
            pipeline.source_dir(&target).unwrap(),
            PathBuf::from("/w/source/zstd/1.5.5")
        );

        let target = target
            .with_source_subdir("zstd-{version}")
            .with_configure_subdir("zstd-{version}/build/cmake");
        assert_eq!(
            pipeline.source_dir(&target).unwrap(),
            PathBuf::from("/w/source/zstd/1.5.5/zstd-1.5.5")
        );
        assert_eq!(
            pipeline.configure_dir(&target).unwrap(),
            PathBuf::from("/w/source/zstd/1.5.5/zstd-1.5.5/build/cmake")
        );
    }

    #[test]
    fn marker_keys_follow_layout() {
        let pipeline = Pipeline::new(
            Layout::new("/w"),
            Settings::default(),
            Delegates::system(&Settings::default(), false),
        );
        let target = Target::new(
            "cereal",
            "1.3.2",
            Sha256Digest::new("0".repeat(64)).unwrap(),
            "v{version}.tar.gz",
            "https://example.com/{filename}",
        );
        let path = |stage| pipeline.marker_key(&target, stage).unwrap().path();
        assert_eq!(
            path(Stage::Fetch),
            PathBuf::from("/w/download/cereal/1.3.2/v1.3.2.tar.gz.ok")
        );
        assert_eq!(
            path(Stage::Patch),
            PathBuf::from("/w/source/cereal/1.3.2.patch.ok")
        );
        assert_eq!(
            path(Stage::Install),
            PathBuf::from("/w/build/cereal/1.3.2.install.ok")
        );
    }
}
