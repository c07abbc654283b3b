//! Process-wide settings read from the environment.

/// Bucket identifier substituted for `{bucket}` in URL templates.
pub const BUCKET_ENV: &str = "GCLOUD_BUCKET";

/// Build mode passed to configure, build and install (`Release` when unset).
pub const BUILD_TYPE_ENV: &str = "CMAKE_BUILD_TYPE";

/// Base64-encoded service account JSON for `gs://` downloads.
pub const CREDENTIAL_ENV: &str = "GCLOUD_CREDENTIAL_BASE64";

/// Build mode used when [`BUILD_TYPE_ENV`] is not set.
pub const DEFAULT_BUILD_MODE: &str = "Release";

/// Settings shared by every target in a run.
#[derive(Clone, PartialEq, Eq)]
pub struct Settings {
    /// Value for `{bucket}` placeholders.
    pub bucket: Option<String>,
    /// Build mode (`Release`, `Debug`, ...).
    pub build_mode: String,
    /// Object storage credential, only needed for `gs://` URLs.
    pub object_store_credential: Option<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            bucket: None,
            build_mode: DEFAULT_BUILD_MODE.to_string(),
            object_store_credential: None,
        }
    }
}

impl std::fmt::Debug for Settings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Settings")
            .field("bucket", &self.bucket)
            .field("build_mode", &self.build_mode)
            .field(
                "object_store_credential",
                &self.object_store_credential.as_ref().map(|_| "<redacted>"),
            )
            .finish()
    }
}

impl Settings {
    /// Load settings from environment variables. Empty values count as unset.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load settings through an arbitrary lookup function.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        Self {
            bucket: get(BUCKET_ENV),
            build_mode: get(BUILD_TYPE_ENV).unwrap_or_else(|| DEFAULT_BUILD_MODE.to_string()),
            object_store_credential: get(CREDENTIAL_ENV),
        }
    }

    /// Builder-style override for the bucket.
    pub fn with_bucket(mut self, bucket: impl Into<String>) -> Self {
        self.bucket = Some(bucket.into());
        self
    }

    /// Builder-style override for the build mode.
    pub fn with_build_mode(mut self, mode: impl Into<String>) -> Self {
        self.build_mode = mode.into();
        self
    }
}
