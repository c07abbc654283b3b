//! End-to-end pipeline behaviour with call-counting fake delegates.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use depforge_core::builder::{Builder, BuilderError, ConfigureRequest};
use depforge_core::expand::ExpandError;
use depforge_core::io::{DiffPatcher, ExtractError, PatchError, TransportError};
use depforge_core::{
    Delegates, Extractor, ForgeError, Layout, Patcher, Pipeline, Registry, Settings,
    Sha256Digest, Stage, StageOutcome, Target, Transport, Transports,
};
use sha2::{Digest, Sha256};
use tempfile::{TempDir, tempdir};

const ARCHIVE: &[u8] = b"pretend this is a tarball";

fn digest_of(bytes: &[u8]) -> Sha256Digest {
    Sha256Digest::new(hex::encode(Sha256::digest(bytes))).unwrap()
}

#[derive(Default)]
struct Calls {
    fetch: AtomicUsize,
    extract: AtomicUsize,
    patch: AtomicUsize,
    configure: AtomicUsize,
    build: AtomicUsize,
    install: AtomicUsize,
    options: Mutex<Vec<Vec<String>>>,
    fetched_urls: Mutex<Vec<String>>,
}

impl Calls {
    fn counts(&self) -> [usize; 6] {
        [
            self.fetch.load(Ordering::SeqCst),
            self.extract.load(Ordering::SeqCst),
            self.patch.load(Ordering::SeqCst),
            self.configure.load(Ordering::SeqCst),
            self.build.load(Ordering::SeqCst),
            self.install.load(Ordering::SeqCst),
        ]
    }
}

struct FakeTransport {
    calls: Arc<Calls>,
    body: Vec<u8>,
}

#[async_trait]
impl Transport for FakeTransport {
    async fn fetch(&self, url: &str, dest: &Path) -> Result<(), TransportError> {
        self.calls.fetch.fetch_add(1, Ordering::SeqCst);
        self.calls.fetched_urls.lock().unwrap().push(url.to_string());
        tokio::fs::write(dest, &self.body).await?;
        Ok(())
    }
}

struct FakeExtractor(Arc<Calls>);

impl Extractor for FakeExtractor {
    fn extract(&self, _archive: &Path, dest: &Path) -> Result<(), ExtractError> {
        self.0.extract.fetch_add(1, Ordering::SeqCst);
        std::fs::create_dir_all(dest.join("src"))?;
        std::fs::write(dest.join("src/CMakeLists.txt"), "project(x)\n")?;
        Ok(())
    }
}

struct FakePatcher(Arc<Calls>);

impl Patcher for FakePatcher {
    fn apply(&self, _patch_file: &Path, source_dir: &Path) -> Result<(), PatchError> {
        self.0.patch.fetch_add(1, Ordering::SeqCst);
        assert!(source_dir.is_dir(), "patched before extraction");
        Ok(())
    }
}

struct FakeBuilder {
    calls: Arc<Calls>,
    fail_build: bool,
}

impl Builder for FakeBuilder {
    fn configure(&self, request: &ConfigureRequest<'_>) -> Result<(), BuilderError> {
        self.calls.configure.fetch_add(1, Ordering::SeqCst);
        self.calls
            .options
            .lock()
            .unwrap()
            .push(request.options.to_vec());
        std::fs::create_dir_all(request.build_dir).unwrap();
        Ok(())
    }

    fn build(&self, _build_dir: &Path, _mode: &str) -> Result<(), BuilderError> {
        self.calls.build.fetch_add(1, Ordering::SeqCst);
        if self.fail_build {
            return Err(BuilderError::Failed {
                step: "fake build".into(),
                code: Some(2),
                output: "error: undefined reference to `main'".into(),
            });
        }
        Ok(())
    }

    fn install(&self, _build_dir: &Path, _mode: &str) -> Result<(), BuilderError> {
        self.calls.install.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

struct Harness {
    root: TempDir,
    calls: Arc<Calls>,
}

impl Harness {
    fn new() -> Self {
        Self {
            root: tempdir().unwrap(),
            calls: Arc::new(Calls::default()),
        }
    }

    fn path(&self, rel: &str) -> PathBuf {
        self.root.path().join(rel)
    }

    fn pipeline_with(&self, body: &[u8], fail_build: bool) -> Pipeline {
        let transport = FakeTransport {
            calls: Arc::clone(&self.calls),
            body: body.to_vec(),
        };
        let delegates = Delegates {
            transports: Transports::new().with("mem", transport),
            extractor: Arc::new(FakeExtractor(Arc::clone(&self.calls))),
            patcher: Arc::new(FakePatcher(Arc::clone(&self.calls))),
            builder: Arc::new(FakeBuilder {
                calls: Arc::clone(&self.calls),
                fail_build,
            }),
        };
        Pipeline::new(
            Layout::new(self.root.path()),
            Settings::default().with_bucket("deps"),
            delegates,
        )
    }

    fn pipeline(&self) -> Pipeline {
        self.pipeline_with(ARCHIVE, false)
    }

    /// Fake fetch, extract and build, but real unified-diff patching.
    fn pipeline_with_diff_patcher(&self) -> Pipeline {
        let transport = FakeTransport {
            calls: Arc::clone(&self.calls),
            body: ARCHIVE.to_vec(),
        };
        let delegates = Delegates {
            transports: Transports::new().with("mem", transport),
            extractor: Arc::new(FakeExtractor(Arc::clone(&self.calls))),
            patcher: Arc::new(DiffPatcher::new()),
            builder: Arc::new(FakeBuilder {
                calls: Arc::clone(&self.calls),
                fail_build: false,
            }),
        };
        Pipeline::new(
            Layout::new(self.root.path()),
            Settings::default().with_bucket("deps"),
            delegates,
        )
    }
}

fn target(name: &str) -> Target {
    Target::new(
        name,
        "1.0",
        digest_of(ARCHIVE),
        "{name}-{version}.tar.gz",
        "mem://{bucket}/{filename}",
    )
    .with_source_subdir("src")
}

#[tokio::test]
async fn first_run_does_everything_second_run_nothing() {
    let h = Harness::new();
    let registry = Registry::new(vec![
        target("a")
            .with_configure_options(["-DFOO=ON"])
            .skip(Stage::Patch),
    ])
    .unwrap();
    let pipeline = h.pipeline();

    let run = registry.select::<&str>(&[]).unwrap();
    let summary = pipeline.execute(&run).await.unwrap();

    assert_eq!(h.calls.counts(), [1, 1, 0, 1, 1, 1]);
    assert_eq!(summary.count(StageOutcome::Ran), 5);
    assert_eq!(
        summary.target("a").unwrap().outcome(Stage::Patch),
        Some(StageOutcome::Skipped)
    );

    let options = h.calls.options.lock().unwrap()[0].clone();
    assert_eq!(options.last().map(String::as_str), Some("-DFOO=ON"));
    assert!(options.contains(&"-DBUILD_SHARED_LIBS=OFF".to_string()));
    assert_eq!(
        h.calls.fetched_urls.lock().unwrap()[0],
        "mem://deps/a-1.0.tar.gz"
    );

    for marker in [
        "download/a/1.0/a-1.0.tar.gz.ok",
        "source/a/1.0.extract.ok",
        "build/a/1.0.configure.ok",
        "build/a/1.0.build.ok",
        "build/a/1.0.install.ok",
    ] {
        let path = h.path(marker);
        assert!(path.is_file(), "missing marker {marker}");
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 0);
    }
    assert!(!h.path("source/a/1.0.patch.ok").exists());

    let summary = pipeline.execute(&run).await.unwrap();
    assert_eq!(h.calls.counts(), [1, 1, 0, 1, 1, 1], "second run did work");
    assert_eq!(summary.count(StageOutcome::Cached), 5);
    assert_eq!(summary.count(StageOutcome::Ran), 0);
}

#[tokio::test]
async fn checksum_mismatch_withholds_marker_and_retries() {
    let h = Harness::new();
    let registry = Registry::new(vec![target("a")]).unwrap();
    let pipeline = h.pipeline_with(b"tampered", false);
    let run = registry.select(&["a"]).unwrap();

    let err = pipeline.execute(&run).await.unwrap_err();
    match &err {
        ForgeError::Integrity {
            expected, actual, ..
        } => {
            assert_eq!(expected, digest_of(ARCHIVE).as_str());
            assert_eq!(actual, digest_of(b"tampered").as_str());
        }
        other => panic!("expected integrity error, got {other:?}"),
    }
    assert_eq!(err.stage(), Some(Stage::Fetch));
    assert!(!h.path("download/a/1.0/a-1.0.tar.gz").exists());
    assert!(!h.path("download/a/1.0/a-1.0.tar.gz.ok").exists());
    assert_eq!(h.calls.counts(), [1, 0, 0, 0, 0, 0]);

    // a re-run tries the download again rather than trusting anything
    assert!(pipeline.execute(&run).await.is_err());
    assert_eq!(h.calls.fetch.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn unknown_target_fails_before_any_stage() {
    let h = Harness::new();
    let registry = Registry::new(vec![target("a"), target("b")]).unwrap();

    let err = registry.select(&["a", "nope"]).unwrap_err();
    assert!(matches!(err, ForgeError::UnknownTarget { ref name, .. } if name == "nope"));
    assert_eq!(h.calls.counts(), [0; 6]);
    assert_eq!(std::fs::read_dir(h.root.path()).unwrap().count(), 0);
}

#[tokio::test]
async fn selection_runs_only_the_named_target() {
    let h = Harness::new();
    let registry = Registry::new(vec![target("a"), target("b")]).unwrap();
    let pipeline = h.pipeline();

    let summary = pipeline
        .execute(&registry.select(&["b"]).unwrap())
        .await
        .unwrap();
    assert_eq!(summary.targets.len(), 1);
    assert_eq!(summary.targets[0].name, "b");
    assert!(h.path("build/b/1.0.install.ok").is_file());
    assert!(!h.path("download/a").exists());
    assert!(!h.path("build/a").exists());

    let summary = pipeline
        .execute(&registry.select::<&str>(&[]).unwrap())
        .await
        .unwrap();
    let names: Vec<_> = summary.targets.iter().map(|t| t.name.as_str()).collect();
    assert_eq!(names, ["a", "b"]);
    assert_eq!(
        summary.target("b").unwrap().outcome(Stage::Install),
        Some(StageOutcome::Cached)
    );
    assert_eq!(
        summary.target("a").unwrap().outcome(Stage::Install),
        Some(StageOutcome::Ran)
    );
}

#[tokio::test]
async fn narrowed_run_leaves_other_targets_alone() {
    let h = Harness::new();
    let registry = Registry::new(vec![target("a"), target("b")]).unwrap();
    let pipeline = h.pipeline();
    pipeline
        .execute(&registry.select::<&str>(&[]).unwrap())
        .await
        .unwrap();

    let a_markers = [
        "download/a/1.0/a-1.0.tar.gz.ok",
        "source/a/1.0.extract.ok",
        "build/a/1.0.configure.ok",
        "build/a/1.0.build.ok",
        "build/a/1.0.install.ok",
    ];
    let mtimes = |h: &Harness| -> Vec<_> {
        a_markers
            .iter()
            .map(|m| std::fs::metadata(h.path(m)).unwrap().modified().unwrap())
            .collect()
    };
    let before = mtimes(&h);

    // force real work for b so its stages run again
    std::fs::remove_dir_all(h.path("build/b/1.0")).unwrap();
    let summary = pipeline
        .execute(&registry.select(&["b"]).unwrap())
        .await
        .unwrap();

    assert_eq!(summary.targets.len(), 1);
    assert_eq!(
        summary.target("b").unwrap().outcome(Stage::Configure),
        Some(StageOutcome::Ran)
    );
    assert_eq!(mtimes(&h), before);
    assert_eq!(h.calls.counts(), [2, 2, 0, 3, 3, 3]);
}

#[tokio::test]
async fn override_replaces_stage_and_writes_no_marker() {
    let h = Harness::new();
    let hook_calls = Arc::new(AtomicUsize::new(0));
    let seen = Arc::clone(&hook_calls);
    let registry = Registry::new(vec![target("a").override_stage(
        Stage::Install,
        move |t, ctx| {
            seen.fetch_add(1, Ordering::SeqCst);
            assert_eq!(ctx.stage, Stage::Install);
            std::fs::create_dir_all(ctx.layout.install_prefix().join(t.name()))?;
            Ok(())
        },
    )])
    .unwrap();
    let pipeline = h.pipeline();
    let run = registry.select::<&str>(&[]).unwrap();

    let summary = pipeline.execute(&run).await.unwrap();
    assert_eq!(
        summary.target("a").unwrap().outcome(Stage::Install),
        Some(StageOutcome::Overridden)
    );
    assert_eq!(h.calls.install.load(Ordering::SeqCst), 0);
    assert!(!h.path("build/a/1.0.install.ok").exists());
    assert!(h.path("install/a").is_dir());

    // the hook owns idempotency, so it runs every time
    pipeline.execute(&run).await.unwrap();
    assert_eq!(hook_calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn failing_override_aborts_run() {
    let h = Harness::new();
    let registry = Registry::new(vec![
        target("a").override_stage(Stage::Extract, |_, _| anyhow::bail!("no unpacker")),
        target("b"),
    ])
    .unwrap();
    let pipeline = h.pipeline();

    let err = pipeline
        .execute(&registry.select::<&str>(&[]).unwrap())
        .await
        .unwrap_err();
    assert!(matches!(err, ForgeError::Override { stage: Stage::Extract, .. }));
    assert!(err.to_string().contains("no unpacker"));
    // b never started
    assert_eq!(h.calls.fetch.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn builder_failure_keeps_earlier_markers() {
    let h = Harness::new();
    let registry = Registry::new(vec![target("a")]).unwrap();
    let pipeline = h.pipeline_with(ARCHIVE, true);

    let err = pipeline
        .execute(&registry.select::<&str>(&[]).unwrap())
        .await
        .unwrap_err();
    assert!(matches!(err, ForgeError::Build { .. }));
    assert_eq!(
        err.tool_output(),
        Some("error: undefined reference to `main'")
    );
    assert!(h.path("build/a/1.0.configure.ok").is_file());
    assert!(!h.path("build/a/1.0.build.ok").exists());
    assert_eq!(h.calls.install.load(Ordering::SeqCst), 0);

    // fixed environment: resumes at compile
    let pipeline = h.pipeline();
    pipeline
        .execute(&registry.select::<&str>(&[]).unwrap())
        .await
        .unwrap();
    assert_eq!(h.calls.counts(), [1, 1, 0, 1, 2, 1]);
}

#[tokio::test]
async fn stale_marker_without_artifact_reruns_stage() {
    let h = Harness::new();
    let registry = Registry::new(vec![target("a")]).unwrap();
    let pipeline = h.pipeline();
    let run = registry.select::<&str>(&[]).unwrap();
    pipeline.execute(&run).await.unwrap();

    std::fs::remove_dir_all(h.path("build/a/1.0")).unwrap();
    let summary = pipeline.execute(&run).await.unwrap();

    assert_eq!(h.calls.counts(), [1, 1, 0, 2, 2, 2]);
    let report = summary.target("a").unwrap();
    assert_eq!(report.outcome(Stage::Fetch), Some(StageOutcome::Cached));
    assert_eq!(report.outcome(Stage::Configure), Some(StageOutcome::Ran));
    assert_eq!(report.outcome(Stage::Compile), Some(StageOutcome::Ran));
    assert_eq!(report.outcome(Stage::Install), Some(StageOutcome::Ran));
    assert!(h.path("build/a/1.0.install.ok").is_file());
}

#[tokio::test]
async fn rerun_stage_invalidates_later_markers() {
    let h = Harness::new();
    let registry = Registry::new(vec![target("a")]).unwrap();
    let t = registry.get("a").unwrap();
    let pipeline = h.pipeline();
    pipeline.execute(&registry.select::<&str>(&[]).unwrap()).await.unwrap();

    // configure marker lost while the build tree survives
    std::fs::remove_file(h.path("build/a/1.0.configure.ok")).unwrap();
    pipeline.run_target(t, &[Stage::Configure]).await.unwrap();

    assert!(h.path("build/a/1.0.configure.ok").is_file());
    assert!(!h.path("build/a/1.0.build.ok").exists());
    assert!(!h.path("build/a/1.0.install.ok").exists());
    assert!(h.path("source/a/1.0.extract.ok").is_file());
    assert_eq!(
        pipeline.completed_stages(t).unwrap(),
        [Stage::Fetch, Stage::Extract, Stage::Configure]
    );

    pipeline.execute(&registry.select::<&str>(&[]).unwrap()).await.unwrap();
    assert_eq!(h.calls.counts(), [1, 1, 0, 2, 2, 2]);
}

#[tokio::test]
async fn reextracted_tree_is_patched_again() {
    let h = Harness::new();
    let registry = Registry::new(vec![target("a")]).unwrap();
    let pipeline = h.pipeline_with_diff_patcher();
    let run = registry.select::<&str>(&[]).unwrap();

    std::fs::create_dir_all(h.path("patch")).unwrap();
    std::fs::write(
        h.path("patch/a_1.0.patch"),
        "--- CMakeLists.txt\n+++ CMakeLists.txt\n@@ -1 +1 @@\n-project(x)\n+project(patched)\n",
    )
    .unwrap();
    let cmake = h.path("source/a/1.0/src/CMakeLists.txt");

    pipeline.execute(&run).await.unwrap();
    assert_eq!(std::fs::read_to_string(&cmake).unwrap(), "project(patched)\n");

    std::fs::remove_dir_all(h.path("source/a/1.0")).unwrap();
    let summary = pipeline.execute(&run).await.unwrap();

    let report = summary.target("a").unwrap();
    assert_eq!(report.outcome(Stage::Extract), Some(StageOutcome::Ran));
    assert_eq!(report.outcome(Stage::Patch), Some(StageOutcome::Ran));
    assert_eq!(report.outcome(Stage::Configure), Some(StageOutcome::Ran));
    assert_eq!(std::fs::read_to_string(&cmake).unwrap(), "project(patched)\n");
    assert_eq!(h.calls.counts(), [1, 2, 0, 2, 2, 2]);
}

#[tokio::test]
async fn markers_trusted_blindly_when_checks_disabled() {
    let h = Harness::new();
    let registry = Registry::new(vec![target("a")]).unwrap();
    let run = registry.select::<&str>(&[]).unwrap();
    h.pipeline().execute(&run).await.unwrap();

    std::fs::remove_dir_all(h.path("build/a/1.0")).unwrap();
    h.pipeline()
        .with_artifact_checks(false)
        .execute(&run)
        .await
        .unwrap();
    assert_eq!(h.calls.counts(), [1, 1, 0, 1, 1, 1]);
}

#[tokio::test]
async fn patch_file_is_applied_once() {
    let h = Harness::new();
    let registry = Registry::new(vec![target("a")]).unwrap();
    let pipeline = h.pipeline();
    let run = registry.select::<&str>(&[]).unwrap();

    std::fs::create_dir_all(h.path("patch")).unwrap();
    std::fs::write(h.path("patch/a_1.0.patch"), "--- x\n+++ x\n").unwrap();

    let summary = pipeline.execute(&run).await.unwrap();
    assert_eq!(
        summary.target("a").unwrap().outcome(Stage::Patch),
        Some(StageOutcome::Ran)
    );
    assert!(h.path("source/a/1.0.patch.ok").is_file());

    pipeline.execute(&run).await.unwrap();
    assert_eq!(h.calls.patch.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn missing_patch_file_is_vacuous() {
    let h = Harness::new();
    let registry = Registry::new(vec![target("a")]).unwrap();
    let summary = h
        .pipeline()
        .execute(&registry.select::<&str>(&[]).unwrap())
        .await
        .unwrap();
    assert_eq!(
        summary.target("a").unwrap().outcome(Stage::Patch),
        Some(StageOutcome::Vacuous)
    );
    assert_eq!(h.calls.patch.load(Ordering::SeqCst), 0);
    assert!(!h.path("source/a/1.0.patch.ok").exists());
}

#[tokio::test]
async fn self_referential_template_fails_without_side_effects() {
    let h = Harness::new();
    let registry = Registry::new(vec![Target::new(
        "loop",
        "1",
        digest_of(ARCHIVE),
        "{filename}",
        "mem://x/{filename}",
    )])
    .unwrap();

    let err = h
        .pipeline()
        .execute(&registry.select::<&str>(&[]).unwrap())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        ForgeError::Expand {
            source: ExpandError::RecursionLimit { .. },
            ..
        }
    ));
    assert_eq!(h.calls.counts(), [0; 6]);
}

#[tokio::test]
async fn unregistered_scheme_is_a_fetch_error() {
    let h = Harness::new();
    let registry = Registry::new(vec![Target::new(
        "a",
        "1",
        digest_of(ARCHIVE),
        "a.tar.gz",
        "ftp://example.com/{filename}",
    )])
    .unwrap();

    let err = h
        .pipeline()
        .execute(&registry.select::<&str>(&[]).unwrap())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        ForgeError::Fetch {
            source: TransportError::UnsupportedScheme { .. },
            ..
        }
    ));
}

#[tokio::test]
async fn completed_stages_reflect_markers() {
    let h = Harness::new();
    let registry = Registry::new(vec![target("a")]).unwrap();
    let pipeline = h.pipeline();
    let t = registry.get("a").unwrap();

    assert!(pipeline.completed_stages(t).unwrap().is_empty());
    pipeline.run_target(t, &[Stage::Fetch, Stage::Extract]).await.unwrap();
    assert_eq!(
        pipeline.completed_stages(t).unwrap(),
        [Stage::Fetch, Stage::Extract]
    );
}
