//! VM image synchronization.
//!
//! Ensures every rootfs and kernel referenced by the desired services is
//! present locally and matches the source revision. A sidecar
//! `<path>.etag` file holds the last-known source revision so unchanged
//! files are skipped; downloads land in `<path>.tmp` and are renamed into
//! place after an fsync.

use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use firework_spec::ServiceDescriptor;
use tracing::{debug, info};

/// Source of images, keyed by file name.
#[async_trait]
pub trait ImageSource: Send + Sync {
    /// Current content-revision token for a key, or `None` when the source
    /// does not have it. Cheap (HEAD-style) call.
    async fn revision(&self, key: &str) -> Result<Option<String>>;

    /// Download the object into `dest`.
    async fn fetch(&self, key: &str, dest: &Path) -> Result<()>;
}

/// Image source backed by a local mirror directory. Revision tokens are
/// derived from file size and mtime, which is cheap and changes whenever
/// the mirror is refreshed.
pub struct DirImageSource {
    root: PathBuf,
}

impl DirImageSource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait]
impl ImageSource for DirImageSource {
    async fn revision(&self, key: &str) -> Result<Option<String>> {
        let path = self.root.join(key);
        let meta = match tokio::fs::metadata(&path).await {
            Ok(meta) => meta,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e).context("reading image metadata"),
        };

        let mtime = meta
            .modified()
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_secs())
            .unwrap_or_default();
        Ok(Some(format!("{}-{mtime}", meta.len())))
    }

    async fn fetch(&self, key: &str, dest: &Path) -> Result<()> {
        tokio::fs::copy(self.root.join(key), dest)
            .await
            .with_context(|| format!("copying image {key}"))?;
        Ok(())
    }
}

/// Keeps the local image cache in sync with a source.
pub struct Syncer {
    source: Box<dyn ImageSource>,
    images_dir: PathBuf,
}

impl Syncer {
    pub fn new(source: Box<dyn ImageSource>, images_dir: impl Into<PathBuf>) -> Self {
        Self {
            source,
            images_dir: images_dir.into(),
        }
    }

    /// Ensure all images referenced by the services are present and up to
    /// date. Each unique path is synced once.
    pub async fn sync(&self, services: &[ServiceDescriptor]) -> Result<()> {
        let paths = collect_image_paths(services);
        if paths.is_empty() {
            return Ok(());
        }

        tokio::fs::create_dir_all(&self.images_dir)
            .await
            .context("creating images dir")?;

        for path in paths {
            let key = Path::new(&path)
                .file_name()
                .and_then(|f| f.to_str())
                .unwrap_or(path.as_str())
                .to_string();
            let local_path = self.images_dir.join(&key);

            self.sync_one(&key, &local_path)
                .await
                .with_context(|| format!("syncing {key}"))?;
        }
        Ok(())
    }

    /// Download a single object when the local copy is missing or stale.
    async fn sync_one(&self, key: &str, local_path: &Path) -> Result<()> {
        let etag_path = sidecar_path(local_path);

        let Some(remote_etag) = self.source.revision(key).await? else {
            // Not in the source. A local copy (e.g. baked into the host
            // image) is used silently; else try the kernel-alias rule.
            if tokio::fs::try_exists(local_path).await.unwrap_or(false) {
                debug!(key = %key, "not in source, using local copy");
                return Ok(());
            }
            if let Some(target) = ensure_local_kernel_alias(local_path, key)? {
                debug!(key = %key, target = %target.display(), "not in source, using local kernel alias");
                return Ok(());
            }
            bail!("image {key} not found in source and no local copy exists");
        };

        if let Ok(local_etag) = tokio::fs::read_to_string(&etag_path).await {
            if local_etag == remote_etag {
                debug!(key = %key, "image up to date, skipping");
                return Ok(());
            }
        }

        info!(key = %key, etag = %remote_etag, "downloading image");

        let tmp_path = local_path.with_extension(extension_with(local_path, "tmp"));
        if let Err(e) = self.source.fetch(key, &tmp_path).await {
            let _ = tokio::fs::remove_file(&tmp_path).await;
            return Err(e);
        }

        // Flush before the rename so a crash cannot leave a torn image
        // behind the final name.
        let file = std::fs::File::open(&tmp_path).context("opening downloaded image")?;
        file.sync_all().context("syncing downloaded image")?;
        drop(file);

        tokio::fs::rename(&tmp_path, local_path)
            .await
            .with_context(|| format!("renaming to {}", local_path.display()))?;

        tokio::fs::write(&etag_path, remote_etag.as_bytes())
            .await
            .context("writing etag sidecar")?;

        Ok(())
    }
}

fn sidecar_path(local_path: &Path) -> PathBuf {
    local_path.with_extension(extension_with(local_path, "etag"))
}

/// Append a suffix to the existing extension ("rootfs.ext4" + "etag" →
/// "rootfs.ext4.etag").
fn extension_with(path: &Path, suffix: &str) -> String {
    match path.extension().and_then(|e| e.to_str()) {
        Some(ext) => format!("{ext}.{suffix}"),
        None => suffix.to_string(),
    }
}

/// Deduplicated image and kernel paths from all services, in first-seen
/// order.
fn collect_image_paths(services: &[ServiceDescriptor]) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    let mut paths = Vec::new();

    for svc in services {
        for p in [&svc.image, &svc.kernel] {
            if !p.is_empty() && seen.insert(p.clone()) {
                paths.push(p.clone());
            }
        }
    }
    paths
}

/// Resolve `vmlinux-<major>.<minor>` as an alias for the newest local
/// `<path>.*` candidate: symlink when possible, copy as a fallback.
/// Returns the resolved target, or `None` when the key is not an alias or
/// no candidate exists.
fn ensure_local_kernel_alias(local_path: &Path, key: &str) -> Result<Option<PathBuf>> {
    let Some(version) = key.strip_prefix("vmlinux-") else {
        return Ok(None);
    };
    if version.split('.').count() != 2 {
        return Ok(None);
    }

    let dir = local_path.parent().unwrap_or(Path::new("."));
    let prefix = format!("{key}.");

    let mut candidates: Vec<(PathBuf, std::time::SystemTime)> = std::fs::read_dir(dir)
        .ok()
        .into_iter()
        .flatten()
        .filter_map(|e| e.ok())
        .filter(|e| {
            e.file_name()
                .to_str()
                .map(|n| n.starts_with(&prefix))
                .unwrap_or(false)
        })
        .filter_map(|e| {
            let modified = e.metadata().ok()?.modified().ok()?;
            Some((e.path(), modified))
        })
        .collect();

    if candidates.is_empty() {
        return Ok(None);
    }
    candidates.sort_by(|a, b| b.1.cmp(&a.1));
    let target = candidates[0].0.clone();

    let _ = std::fs::remove_file(local_path);

    let link_target = target
        .file_name()
        .map(PathBuf::from)
        .unwrap_or_else(|| target.clone());
    if std::os::unix::fs::symlink(&link_target, local_path).is_ok() {
        return Ok(Some(target));
    }

    std::fs::copy(&target, local_path).context("copying kernel alias target")?;
    Ok(Some(target))
}
