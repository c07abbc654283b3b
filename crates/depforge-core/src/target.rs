//! Target descriptors: one third-party dependency and how each stage treats it.

use std::fmt;
use std::sync::Arc;

use depforge_schema::{Sha256Digest, Stage, TargetSpec};

use crate::config::Settings;
use crate::layout::Layout;
use crate::marker::MarkerStore;

/// Caller-supplied routine that replaces a stage's built-in logic.
///
/// The hook owns idempotency for its stage: the pipeline writes no marker
/// after it returns.
pub type StageHook = Arc<dyn Fn(&Target, &StageContext<'_>) -> anyhow::Result<()> + Send + Sync>;

/// What the pipeline does for one stage of one target.
#[derive(Clone, Default)]
pub enum StageAction {
    /// Run the built-in logic and write the stage marker on success.
    #[default]
    Default,
    /// Run the hook instead; its result is returned untouched.
    Override(StageHook),
    /// Do nothing; the stage is vacuously complete.
    Skip,
}

impl fmt::Debug for StageAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Default => f.write_str("Default"),
            Self::Override(_) => f.write_str("Override(..)"),
            Self::Skip => f.write_str("Skip"),
        }
    }
}

/// Read-only view of the run environment handed to override hooks.
#[derive(Debug, Clone, Copy)]
pub struct StageContext<'a> {
    /// Stage being overridden.
    pub stage: Stage,
    /// Working root layout.
    pub layout: &'a Layout,
    /// Process-wide settings.
    pub settings: &'a Settings,
    /// Marker store, for hooks that want their own idempotency.
    pub markers: &'a MarkerStore,
}

/// Immutable description of one dependency.
///
/// Construct with [`Target::new`] or [`Target::from_spec`], refine with the
/// `with_*` methods, then hand it to a [`Registry`](crate::Registry). Nothing
/// mutates a target after registration.
#[derive(Clone)]
pub struct Target {
    name: String,
    version: String,
    integrity_hash: Sha256Digest,
    filename_template: String,
    url_template: String,
    source_subdir_template: String,
    configure_subdir_template: Option<String>,
    configure_options: Vec<String>,
    actions: [StageAction; 6],
}

impl Target {
    /// Create a target with an empty source subdirectory, no configure
    /// options and default behaviour for every stage.
    pub fn new(
        name: impl Into<String>,
        version: impl Into<String>,
        integrity_hash: Sha256Digest,
        filename_template: impl Into<String>,
        url_template: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            integrity_hash,
            filename_template: filename_template.into(),
            url_template: url_template.into(),
            source_subdir_template: String::new(),
            configure_subdir_template: None,
            configure_options: Vec::new(),
            actions: std::array::from_fn(|_| StageAction::Default),
        }
    }

    /// Build a target from a catalogue record. Stages listed in `skip` get
    /// [`StageAction::Skip`].
    pub fn from_spec(spec: TargetSpec) -> Self {
        let mut target = Self::new(spec.name, spec.version, spec.sha256, spec.filename, spec.url)
            .with_source_subdir(spec.source_subdir)
            .with_configure_options(spec.configure_options);
        if let Some(subdir) = spec.configure_subdir {
            target = target.with_configure_subdir(subdir);
        }
        for stage in spec.skip {
            target = target.skip(stage);
        }
        target
    }

    /// Template for the directory inside the extracted archive holding the sources.
    pub fn with_source_subdir(mut self, template: impl Into<String>) -> Self {
        self.source_subdir_template = template.into();
        self
    }

    /// Template for the directory to configure from.
    pub fn with_configure_subdir(mut self, template: impl Into<String>) -> Self {
        self.configure_subdir_template = Some(template.into());
        self
    }

    /// Options appended after the baseline configure options.
    pub fn with_configure_options<I, S>(mut self, options: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.configure_options = options.into_iter().map(Into::into).collect();
        self
    }

    /// Set the behaviour of one stage.
    pub fn with_stage(mut self, stage: Stage, action: StageAction) -> Self {
        self.actions[stage.index()] = action;
        self
    }

    /// Shorthand for `with_stage(stage, StageAction::Skip)`.
    pub fn skip(self, stage: Stage) -> Self {
        self.with_stage(stage, StageAction::Skip)
    }

    /// Shorthand for `with_stage(stage, StageAction::Override(..))`.
    pub fn override_stage<F>(self, stage: Stage, hook: F) -> Self
    where
        F: Fn(&Target, &StageContext<'_>) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.with_stage(stage, StageAction::Override(Arc::new(hook)))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn integrity_hash(&self) -> &Sha256Digest {
        &self.integrity_hash
    }

    pub fn filename_template(&self) -> &str {
        &self.filename_template
    }

    pub fn url_template(&self) -> &str {
        &self.url_template
    }

    pub fn source_subdir_template(&self) -> &str {
        &self.source_subdir_template
    }

    /// Configure subdirectory template, falling back to the source subdirectory.
    pub fn configure_subdir_template(&self) -> &str {
        self.configure_subdir_template
            .as_deref()
            .unwrap_or(&self.source_subdir_template)
    }

    pub fn configure_options(&self) -> &[String] {
        &self.configure_options
    }

    /// Behaviour configured for `stage`.
    pub fn action(&self, stage: Stage) -> &StageAction {
        &self.actions[stage.index()]
    }
}

impl fmt::Debug for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Target")
            .field("name", &self.name)
            .field("version", &self.version)
            .field("url_template", &self.url_template)
            .field("actions", &self.actions)
            .finish_non_exhaustive()
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.name, self.version)
    }
}
