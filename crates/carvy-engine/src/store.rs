//! Published artifact storage: existence lookup and write-once publish.

use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context};
use reqwest::blocking::Client as HttpClient;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE};
use reqwest::Url;
use serde_json::{json, Value};
use tempfile::NamedTempFile;
use tracing::{info, warn};

use crate::config::SupabaseConfig;
use crate::error::StoreError;
use crate::support::{error_chain_text, response_json_or_error, truncate_text, untimed_http_client};

pub const PNG_CONTENT_TYPE: &str = "image/png";

pub trait ArtifactStore: Send + Sync {
    fn name(&self) -> &str;

    /// `Ok(None)` means absent; `Err` means the backend could not answer.
    fn lookup(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// Stores `png` under `key` as `image/png` and returns its public URL.
    /// Never overwrites an existing object.
    fn publish(&self, key: &str, png: &[u8]) -> Result<String, StoreError>;
}

#[derive(Clone)]
pub struct ArtifactStoreClient {
    store: Arc<dyn ArtifactStore>,
}

impl ArtifactStoreClient {
    pub fn new(store: Arc<dyn ArtifactStore>) -> Self {
        Self { store }
    }

    pub fn backend_name(&self) -> &str {
        self.store.name()
    }

    /// Fails open: a backend that cannot answer reads as "not found" so a
    /// lookup outage never blocks producing the image.
    pub fn exists(&self, key: &str) -> Option<String> {
        match self.store.lookup(key) {
            Ok(found) => found,
            Err(err) => {
                warn!(op = "store.exists", %key, error = %err, "existence check failed; treating as absent");
                None
            }
        }
    }

    pub fn publish(&self, key: &str, png: &[u8]) -> Result<String, StoreError> {
        let url = self.store.publish(key, png)?;
        info!(op = "store.publish", %key, bytes = png.len(), %url, "artifact published");
        Ok(url)
    }
}

/// Supabase Storage over its REST API.
pub struct SupabaseStore {
    base: Url,
    service_key: String,
    bucket: String,
    http: HttpClient,
}

impl SupabaseStore {
    pub fn new(config: &SupabaseConfig) -> anyhow::Result<Self> {
        let base = Url::parse(config.url.trim())
            .with_context(|| format!("invalid SUPABASE_URL '{}'", config.url))?;
        if base.cannot_be_a_base() {
            bail!("SUPABASE_URL '{}' cannot carry a path", config.url);
        }
        Ok(Self {
            base,
            service_key: config.service_key.clone(),
            bucket: config.bucket.clone(),
            http: untimed_http_client()?,
        })
    }

    fn storage_url(&self, segments: &[&str]) -> Url {
        let mut url = self.base.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty();
            path.extend(["storage", "v1", "object"]);
            path.extend(segments);
        }
        url
    }

    pub fn public_url(&self, key: &str) -> String {
        self.storage_url(&["public", &self.bucket, key]).to_string()
    }

    fn list_folder(&self, prefix: &str, search: &str) -> anyhow::Result<Value> {
        let url = self.storage_url(&["list", &self.bucket]);
        let response = self
            .http
            .post(url.clone())
            .header(AUTHORIZATION, format!("Bearer {}", self.service_key))
            .header("apikey", &self.service_key)
            .json(&json!({
                "prefix": prefix,
                "search": search,
                "limit": 100,
                "offset": 0,
            }))
            .send()
            .with_context(|| format!("Supabase list request failed ({url})"))?;
        response_json_or_error("Supabase", response)
    }
}

impl ArtifactStore for SupabaseStore {
    fn name(&self) -> &str {
        "supabase"
    }

    fn lookup(&self, key: &str) -> Result<Option<String>, StoreError> {
        let (prefix, file_name) = match key.rsplit_once('/') {
            Some((folder, file_name)) => (folder, file_name),
            None => ("", key),
        };
        let listing = self
            .list_folder(prefix, file_name)
            .map_err(|err| StoreError::Transport {
                key: key.to_string(),
                message: error_chain_text(&err, 512),
            })?;
        if listing_contains(&listing, file_name) {
            Ok(Some(self.public_url(key)))
        } else {
            Ok(None)
        }
    }

    fn publish(&self, key: &str, png: &[u8]) -> Result<String, StoreError> {
        let url = self.storage_url(&[&self.bucket, key]);
        let response = self
            .http
            .post(url.clone())
            .header(AUTHORIZATION, format!("Bearer {}", self.service_key))
            .header("apikey", &self.service_key)
            .header(CONTENT_TYPE, PNG_CONTENT_TYPE)
            .header("x-upsert", "false")
            .body(png.to_vec())
            .send()
            .map_err(|err| StoreError::Transport {
                key: key.to_string(),
                message: format!("Supabase upload request failed ({url}): {err}"),
            })?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().unwrap_or_default();
            return Err(StoreError::Rejected {
                key: key.to_string(),
                status: status.as_u16(),
                message: truncate_text(&body, 512),
            });
        }
        Ok(self.public_url(key))
    }
}

/// True when a storage listing has an entry named exactly `name`.
pub fn listing_contains(listing: &Value, name: &str) -> bool {
    listing
        .as_array()
        .map(|entries| {
            entries
                .iter()
                .any(|entry| entry.get("name").and_then(Value::as_str) == Some(name))
        })
        .unwrap_or(false)
}

/// Directory-backed store for offline runs.
pub struct FsArtifactStore {
    root: PathBuf,
    public_base: Option<String>,
}

impl FsArtifactStore {
    pub fn new(root: impl Into<PathBuf>, public_base: Option<String>) -> anyhow::Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)
            .with_context(|| format!("failed to create {}", root.display()))?;
        Ok(Self {
            root,
            public_base: public_base
                .map(|base| base.trim_end_matches('/').to_string())
                .filter(|base| !base.is_empty()),
        })
    }

    fn object_path(&self, key: &str) -> Result<PathBuf, StoreError> {
        let unsafe_key = key.is_empty()
            || key == "."
            || key.contains("..")
            || key.contains('/')
            || key.contains('\\');
        if unsafe_key {
            return Err(StoreError::Rejected {
                key: key.to_string(),
                status: 400,
                message: "object name must be a plain file name".to_string(),
            });
        }
        Ok(self.root.join(key))
    }

    fn public_url(&self, key: &str, path: &Path) -> String {
        match &self.public_base {
            Some(base) => format!("{base}/{key}"),
            None => format!("file://{}", path.display()),
        }
    }
}

impl ArtifactStore for FsArtifactStore {
    fn name(&self) -> &str {
        "fs"
    }

    fn lookup(&self, key: &str) -> Result<Option<String>, StoreError> {
        let path = self.object_path(key)?;
        if path.is_file() {
            Ok(Some(self.public_url(key, &path)))
        } else {
            Ok(None)
        }
    }

    fn publish(&self, key: &str, png: &[u8]) -> Result<String, StoreError> {
        let path = self.object_path(key)?;
        let io_error = |source: std::io::Error| StoreError::Io {
            key: key.to_string(),
            source,
        };
        // the object only appears under `key` once fully written
        let mut staged = NamedTempFile::new_in(&self.root).map_err(io_error)?;
        staged.write_all(png).map_err(io_error)?;
        match staged.persist_noclobber(&path) {
            Ok(_) => Ok(self.public_url(key, &path)),
            Err(err) if err.error.kind() == ErrorKind::AlreadyExists => Err(StoreError::Rejected {
                key: key.to_string(),
                status: 409,
                message: "The resource already exists".to_string(),
            }),
            Err(err) => Err(io_error(err.error)),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use serde_json::json;

    use super::*;

    struct Unreachable {
        lookups: AtomicUsize,
    }

    impl ArtifactStore for Unreachable {
        fn name(&self) -> &str {
            "unreachable"
        }

        fn lookup(&self, key: &str) -> Result<Option<String>, StoreError> {
            self.lookups.fetch_add(1, Ordering::SeqCst);
            Err(StoreError::Transport {
                key: key.to_string(),
                message: "connection refused".to_string(),
            })
        }

        fn publish(&self, key: &str, _: &[u8]) -> Result<String, StoreError> {
            Err(StoreError::Transport {
                key: key.to_string(),
                message: "connection refused".to_string(),
            })
        }
    }

    fn supabase() -> anyhow::Result<SupabaseStore> {
        SupabaseStore::new(&SupabaseConfig {
            url: "https://demo.supabase.co/".to_string(),
            service_key: "service".to_string(),
            bucket: "images".to_string(),
        })
    }

    #[test]
    fn exists_fails_open_on_backend_outage() {
        let store = Arc::new(Unreachable {
            lookups: AtomicUsize::new(0),
        });
        let client = ArtifactStoreClient::new(store.clone());
        assert_eq!(client.exists("honda_civic_2023.png"), None);
        assert_eq!(store.lookups.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn publish_errors_propagate() {
        let client = ArtifactStoreClient::new(Arc::new(Unreachable {
            lookups: AtomicUsize::new(0),
        }));
        assert!(matches!(
            client.publish("x.png", b"png"),
            Err(StoreError::Transport { .. })
        ));
    }

    #[test]
    fn listing_match_is_exact() {
        let listing = json!([
            {"name": "honda_civic_2023.png", "id": "1"},
            {"name": "honda_civic_2023.png.bak", "id": "2"},
        ]);
        assert!(listing_contains(&listing, "honda_civic_2023.png"));
        assert!(!listing_contains(&listing, "honda_civic_2023"));
        assert!(!listing_contains(&json!({"error": "nope"}), "honda_civic_2023.png"));
    }

    #[test]
    fn supabase_public_url_points_at_bucket_object() -> anyhow::Result<()> {
        let store = supabase()?;
        assert_eq!(
            store.public_url("honda_civic_2023.png"),
            "https://demo.supabase.co/storage/v1/object/public/images/honda_civic_2023.png"
        );
        Ok(())
    }

    #[test]
    fn supabase_public_url_escapes_object_name() -> anyhow::Result<()> {
        let store = supabase()?;
        assert_eq!(
            store.public_url("my car.png"),
            "https://demo.supabase.co/storage/v1/object/public/images/my%20car.png"
        );
        Ok(())
    }

    #[test]
    fn supabase_rejects_unusable_base_url() {
        let config = SupabaseConfig {
            url: "not a url".to_string(),
            service_key: "service".to_string(),
            bucket: "images".to_string(),
        };
        assert!(SupabaseStore::new(&config).is_err());
    }

    #[test]
    fn fs_store_publishes_then_finds() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let store = FsArtifactStore::new(temp.path(), Some("https://cdn.test/images/".to_string()))?;
        assert_eq!(store.lookup("test.png")?, None);

        let url = store.publish("test.png", b"png-bytes")?;
        assert_eq!(url, "https://cdn.test/images/test.png");
        assert_eq!(store.lookup("test.png")?, Some(url));
        assert_eq!(std::fs::read(temp.path().join("test.png"))?, b"png-bytes".to_vec());
        Ok(())
    }

    #[test]
    fn fs_store_never_overwrites() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let store = FsArtifactStore::new(temp.path(), None)?;
        store.publish("test.png", b"first")?;
        match store.publish("test.png", b"second") {
            Err(StoreError::Rejected { status, .. }) => assert_eq!(status, 409),
            other => panic!("expected rejection, got {other:?}"),
        }
        assert_eq!(std::fs::read(temp.path().join("test.png"))?, b"first".to_vec());
        Ok(())
    }

    fn entries(dir: &Path) -> anyhow::Result<Vec<String>> {
        let mut names = Vec::new();
        for entry in std::fs::read_dir(dir)? {
            names.push(entry?.file_name().to_string_lossy().into_owned());
        }
        names.sort();
        Ok(names)
    }

    #[test]
    fn fs_store_leaves_only_published_objects() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let store = FsArtifactStore::new(temp.path(), None)?;
        store.publish("a.png", b"first")?;
        assert!(store.publish("a.png", b"second").is_err());
        store.publish("b.png", b"third")?;
        assert_eq!(entries(temp.path())?, vec!["a.png".to_string(), "b.png".to_string()]);
        Ok(())
    }

    #[test]
    fn fs_store_failed_publish_is_not_reported_as_cached() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let root = temp.path().join("bucket");
        let store = FsArtifactStore::new(&root, None)?;
        std::fs::remove_dir_all(&root)?;

        assert!(matches!(
            store.publish("test.png", b"png-bytes"),
            Err(StoreError::Io { .. })
        ));
        std::fs::create_dir_all(&root)?;
        assert_eq!(store.lookup("test.png")?, None);
        assert!(entries(&root)?.is_empty());
        Ok(())
    }

    #[test]
    fn fs_store_rejects_path_traversal() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let store = FsArtifactStore::new(temp.path().join("bucket"), None)?;
        assert!(store.publish("../escape.png", b"x").is_err());
        assert!(store.publish("nested/x.png", b"x").is_err());
        assert!(!temp.path().join("escape.png").exists());
        Ok(())
    }
}
