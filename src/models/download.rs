use crate::config::DownloadConfig;
use crate::error::{Result, TransportError, VaultError};
use crate::models::manifest::Manifest;
use crate::models::store::{Artifact, ArtifactStore};
use async_trait::async_trait;
use futures_util::StreamExt;
use indicatif::{ProgressBar, ProgressStyle};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::io::AsyncWriteExt;

/// Moves the bytes behind a URL into a local file
#[async_trait]
pub trait Transport: Send + Sync {
    /// Write the resource at `url` to `dest`, returning the byte count
    async fn fetch(&self, url: &str, dest: &Path) -> std::result::Result<u64, TransportError>;
}

/// Streaming HTTP(S) transport
pub struct HttpTransport {
    client: reqwest::Client,
    show_progress: bool,
}

impl std::fmt::Debug for HttpTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpTransport")
            .field("client", &"Client { ... }")
            .field("show_progress", &self.show_progress)
            .finish()
    }
}

impl HttpTransport {
    /// Create a transport from the download settings
    pub fn new(config: &DownloadConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(config.user_agent.clone())
            .build()
            .map_err(|e| VaultError::Config(format!("Failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            show_progress: config.show_progress,
        })
    }

    fn progress_bar(&self, total: Option<u64>, label: &str) -> ProgressBar {
        if !self.show_progress {
            return ProgressBar::hidden();
        }

        let bar = match total {
            Some(len) => ProgressBar::new(len),
            None => ProgressBar::new_spinner(),
        };
        if let Ok(style) = ProgressStyle::with_template(
            "{msg} [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({bytes_per_sec}, {eta})",
        ) {
            bar.set_style(style.progress_chars("=> "));
        }
        bar.set_message(label.to_string());
        bar
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn fetch(&self, url: &str, dest: &Path) -> std::result::Result<u64, TransportError> {
        let response = self.client.get(url).send().await?;

        let status = response.status();
        if !status.is_success() {
            return Err(TransportError::Status {
                status: status.as_u16(),
            });
        }

        let label = dest
            .file_name()
            .map_or_else(|| url.to_string(), |n| n.to_string_lossy().into_owned());
        let bar = self.progress_bar(response.content_length(), &label);

        let mut file = tokio::fs::File::create(dest).await?;
        let mut stream = response.bytes_stream();
        let mut downloaded = 0u64;

        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            file.write_all(&chunk).await?;
            downloaded += chunk.len() as u64;
            bar.inc(chunk.len() as u64);
        }

        file.flush().await?;
        file.sync_all().await?;
        bar.finish_and_clear();

        Ok(downloaded)
    }
}

/// Materializes artifacts into the store
///
/// Cache hits cost one `stat`. Misses download into a temporary file next to
/// the final path and rename it into place, so readers never observe a
/// partial file. Concurrent `ensure` calls for the same slot share one
/// download; different slots proceed in parallel.
pub struct Fetcher<T: Transport = HttpTransport> {
    store: Arc<ArtifactStore>,
    transport: T,
    config: DownloadConfig,
    slots: Mutex<HashMap<PathBuf, Arc<Slot>>>,
}

/// One cache path being fetched; callers queued on it read the settled outcome
#[derive(Default)]
struct Slot {
    settled: tokio::sync::Mutex<Option<std::result::Result<(), Arc<TransportError>>>>,
}

impl<T: Transport> Fetcher<T> {
    pub fn new(store: Arc<ArtifactStore>, transport: T, config: DownloadConfig) -> Self {
        Self {
            store,
            transport,
            config,
            slots: Mutex::new(HashMap::new()),
        }
    }

    #[must_use]
    pub fn store(&self) -> &ArtifactStore {
        &self.store
    }

    /// Ensure the artifact exists locally and return its path
    pub async fn ensure(&self, artifact: &Artifact) -> Result<PathBuf> {
        let path = self.store.resolve(artifact)?;
        if path.is_file() {
            tracing::debug!("Cache hit for {artifact}");
            return Ok(path);
        }

        let slot = self.slot(&path);
        let mut settled = slot.settled.lock().await;

        if let Some(outcome) = settled.as_ref() {
            tracing::debug!("{artifact} settled by a concurrent fetch");
            return match outcome {
                Ok(()) => Ok(path),
                Err(cause) => {
                    let cause = TransportError::Shared(Arc::clone(cause));
                    Err(fetch_error(artifact, cause))
                }
            };
        }

        // An earlier slot for this path may have finished before ours was created
        if path.is_file() {
            self.release(&path);
            return Ok(path);
        }

        let result = self.download(artifact, &path).await;
        self.release(&path);

        // Nobody can pick up the slot after release, so the count is only queued callers
        let queued = Arc::strong_count(&slot) > 1;
        match result {
            Ok(()) => {
                *settled = Some(Ok(()));
                Ok(path)
            }
            Err(cause) if queued => {
                let cause = Arc::new(cause);
                *settled = Some(Err(Arc::clone(&cause)));
                Err(fetch_error(artifact, TransportError::Shared(cause)))
            }
            Err(cause) => Err(fetch_error(artifact, cause)),
        }
    }

    /// Ensure every download of a manifest, in manifest order
    pub async fn ensure_all(&self, manifest: &Manifest) -> Result<Vec<PathBuf>> {
        let mut paths = Vec::with_capacity(manifest.downloads().len());
        for artifact in manifest.downloads() {
            paths.push(self.ensure(artifact).await?);
        }
        Ok(paths)
    }

    fn slot(&self, path: &Path) -> Arc<Slot> {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(slots.entry(path.to_path_buf()).or_default())
    }

    /// Forget a settled slot so the next sequential `ensure` starts fresh
    fn release(&self, path: &Path) {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        slots.remove(path);
    }

    async fn download(
        &self,
        artifact: &Artifact,
        path: &Path,
    ) -> std::result::Result<(), TransportError> {
        if self.config.offline {
            return Err(TransportError::Offline);
        }

        let dir = path.parent().ok_or_else(|| {
            std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("no parent directory for {}", path.display()),
            )
        })?;
        tokio::fs::create_dir_all(dir).await?;

        self.check_disk_space(dir)?;

        let file_name = path
            .file_name()
            .map_or_else(String::new, |n| n.to_string_lossy().into_owned());
        let staging = tempfile::Builder::new()
            .prefix(&format!(".{file_name}."))
            .suffix(".part")
            .tempfile_in(dir)?;

        tracing::info!("Downloading {artifact} from {}", artifact.url);

        // On error the staging file is dropped, which deletes it
        let bytes = self.transport.fetch(&artifact.url, staging.path()).await?;

        staging
            .persist(path)
            .map_err(|e| TransportError::Io(e.error))?;

        tracing::info!(
            "Downloaded {artifact} ({}) to {}",
            format_bytes(bytes),
            path.display()
        );
        Ok(())
    }

    /// Check that the cache filesystem keeps `min_free_space_mb` free
    fn check_disk_space(&self, dir: &Path) -> std::result::Result<(), TransportError> {
        if self.config.min_free_space_mb == 0 {
            return Ok(());
        }

        let stats = nix::sys::statvfs::statvfs(dir)
            .map_err(|e| TransportError::Io(std::io::Error::from(e)))?;

        #[allow(clippy::useless_conversion)]
        let available_bytes =
            u64::from(stats.blocks_available()) * u64::from(stats.fragment_size());
        let available_mb = available_bytes / (1_024 * 1_024);

        if available_mb < self.config.min_free_space_mb {
            return Err(TransportError::DiskSpace {
                required_mb: self.config.min_free_space_mb,
                available_mb,
            });
        }

        Ok(())
    }
}

fn fetch_error(artifact: &Artifact, cause: TransportError) -> VaultError {
    VaultError::Fetch {
        artifact: artifact.to_string(),
        cause,
    }
}

/// Format bytes as human-readable string
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{bytes} B")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PathsConfig;
    use crate::models::store::ArtifactClass;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tempfile::TempDir;

    /// Writes a fixed payload, or half of it and then fails
    struct FakeTransport {
        calls: AtomicUsize,
        fail: bool,
        delay: Duration,
    }

    impl FakeTransport {
        fn ok() -> Self {
            Self {
                calls: AtomicUsize::new(0),
                fail: false,
                delay: Duration::ZERO,
            }
        }

        fn failing() -> Self {
            Self {
                fail: true,
                ..Self::ok()
            }
        }
    }

    #[async_trait]
    impl Transport for FakeTransport {
        async fn fetch(&self, url: &str, dest: &Path) -> std::result::Result<u64, TransportError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;

            let payload = format!("payload from {url}");
            if self.fail {
                tokio::fs::write(dest, &payload.as_bytes()[..4]).await?;
                return Err(TransportError::Status { status: 503 });
            }
            tokio::fs::write(dest, payload.as_bytes()).await?;
            Ok(payload.len() as u64)
        }
    }

    fn fetcher_with(temp_dir: &TempDir, transport: FakeTransport) -> Fetcher<FakeTransport> {
        let store = ArtifactStore::new(&PathsConfig::rooted_at(temp_dir.path())).unwrap();
        let config = DownloadConfig {
            min_free_space_mb: 0,
            show_progress: false,
            ..DownloadConfig::default()
        };
        Fetcher::new(Arc::new(store), transport, config)
    }

    fn checkpoint(name: &str) -> Artifact {
        Artifact::new(
            ArtifactClass::Checkpoint,
            name,
            format!("https://example.invalid/{name}"),
        )
    }

    #[tokio::test]
    async fn test_cache_hit_makes_no_transport_call() {
        let temp_dir = TempDir::new().unwrap();
        let fetcher = fetcher_with(&temp_dir, FakeTransport::ok());

        let dir = temp_dir.path().join("checkpoints");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("X.safetensors"), b"already here").unwrap();

        let path = fetcher.ensure(&checkpoint("X.safetensors")).await.unwrap();
        assert_eq!(path, dir.join("X.safetensors"));
        assert_eq!(fetcher.transport.calls.load(Ordering::SeqCst), 0);
        assert_eq!(std::fs::read(&path).unwrap(), b"already here");
    }

    #[tokio::test]
    async fn test_miss_downloads_once() {
        let temp_dir = TempDir::new().unwrap();
        let fetcher = fetcher_with(&temp_dir, FakeTransport::ok());
        let artifact = checkpoint("X.safetensors");

        let path = fetcher.ensure(&artifact).await.unwrap();
        assert_eq!(
            std::fs::read_to_string(&path).unwrap(),
            "payload from https://example.invalid/X.safetensors"
        );

        fetcher.ensure(&artifact).await.unwrap();
        assert_eq!(fetcher.transport.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failed_download_leaves_no_file() {
        let temp_dir = TempDir::new().unwrap();
        let fetcher = fetcher_with(&temp_dir, FakeTransport::failing());
        let artifact = checkpoint("X.safetensors");

        let err = fetcher.ensure(&artifact).await.unwrap_err();
        assert!(matches!(
            err,
            VaultError::Fetch {
                cause: TransportError::Status { status: 503 },
                ..
            }
        ));

        let dir = temp_dir.path().join("checkpoints");
        assert!(!dir.join("X.safetensors").exists());
        assert_eq!(std::fs::read_dir(&dir).unwrap().count(), 0, "staging file left behind");

        // Retrying is safe
        assert!(fetcher.ensure(&artifact).await.is_err());
        assert_eq!(fetcher.transport.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_offline_miss_fails_without_transport() {
        let temp_dir = TempDir::new().unwrap();
        let mut fetcher = fetcher_with(&temp_dir, FakeTransport::ok());
        fetcher.config.offline = true;

        let err = fetcher.ensure(&checkpoint("X.safetensors")).await.unwrap_err();
        assert!(matches!(
            err,
            VaultError::Fetch {
                cause: TransportError::Offline,
                ..
            }
        ));
        assert_eq!(fetcher.transport.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_traversal_rejected_before_transport() {
        let temp_dir = TempDir::new().unwrap();
        let fetcher = fetcher_with(&temp_dir, FakeTransport::ok());

        let err = fetcher
            .ensure(&checkpoint("../../etc/passwd"))
            .await
            .unwrap_err();
        assert!(matches!(err, VaultError::PathTraversal { .. }));
        assert_eq!(fetcher.transport.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_ensure_shares_one_download() {
        let temp_dir = TempDir::new().unwrap();
        let transport = FakeTransport {
            delay: Duration::from_millis(50),
            ..FakeTransport::ok()
        };
        let fetcher = Arc::new(fetcher_with(&temp_dir, transport));
        let artifact = checkpoint("X.safetensors");

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let fetcher = Arc::clone(&fetcher);
                let artifact = artifact.clone();
                tokio::spawn(async move { fetcher.ensure(&artifact).await })
            })
            .collect();

        for handle in handles {
            handle.await.unwrap().unwrap();
        }
        assert_eq!(fetcher.transport.calls.load(Ordering::SeqCst), 1);
        assert!(fetcher.slots.lock().unwrap().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_callers_share_a_failure() {
        let temp_dir = TempDir::new().unwrap();
        let transport = FakeTransport {
            delay: Duration::from_millis(50),
            ..FakeTransport::failing()
        };
        let fetcher = Arc::new(fetcher_with(&temp_dir, transport));
        let artifact = checkpoint("X.safetensors");

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let fetcher = Arc::clone(&fetcher);
                let artifact = artifact.clone();
                tokio::spawn(async move { fetcher.ensure(&artifact).await })
            })
            .collect();

        for handle in handles {
            let err = handle.await.unwrap().unwrap_err();
            assert!(err.to_string().contains("503"), "unexpected error: {err}");
        }
        assert_eq!(fetcher.transport.calls.load(Ordering::SeqCst), 1);
        assert!(fetcher.slots.lock().unwrap().is_empty());

        // A later caller tries again
        assert!(fetcher.ensure(&artifact).await.is_err());
        assert_eq!(fetcher.transport.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_cache_write_failure_names_the_artifact() {
        let temp_dir = TempDir::new().unwrap();
        let fetcher = fetcher_with(&temp_dir, FakeTransport::ok());
        // A file where the class directory should be
        std::fs::write(temp_dir.path().join("checkpoints"), b"not a directory").unwrap();

        let err = fetcher.ensure(&checkpoint("X.safetensors")).await.unwrap_err();
        assert!(matches!(
            &err,
            VaultError::Fetch {
                artifact,
                cause: TransportError::Io(_),
            } if artifact == "checkpoint 'X.safetensors'"
        ));
        assert_eq!(fetcher.transport.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(0), "0 B");
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(1024), "1.00 KB");
        assert_eq!(format_bytes(1536), "1.50 KB");
        assert_eq!(format_bytes(1_048_576), "1.00 MB");
        assert_eq!(format_bytes(1_073_741_824), "1.00 GB");
        assert_eq!(format_bytes(6_938_040_682), "6.46 GB");
    }
}
