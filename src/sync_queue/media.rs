//! Renderable handles for stored media.
//!
//! A handle materializes a blob as a file in the cache directory and exposes
//! it as a `file://` URL. Handles stay valid until released; asking again for
//! a blob with a live handle returns the same handle.

use super::job_store::JobStore;
use anyhow::{bail, Context, Result};
use serde::Serialize;
use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MediaHandle {
    pub blob_id: String,
    pub job_id: String,
    pub mime_type: String,
    pub path: PathBuf,
    pub url: String,
}

pub struct MediaManager {
    store: Arc<dyn JobStore>,
    cache_dir: PathBuf,
    handles: Mutex<HashMap<String, MediaHandle>>,
}

impl MediaManager {
    /// Create a manager writing into `cache_dir`, created if missing.
    pub fn new<P: AsRef<Path>>(store: Arc<dyn JobStore>, cache_dir: P) -> Result<Self> {
        std::fs::create_dir_all(cache_dir.as_ref()).with_context(|| {
            format!("Failed to create media cache dir {:?}", cache_dir.as_ref())
        })?;
        let cache_dir = cache_dir.as_ref().canonicalize()?;
        Ok(Self {
            store,
            cache_dir,
            handles: Mutex::new(HashMap::new()),
        })
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    /// Get a handle for a blob, reusing a live one.
    pub fn create_url(&self, blob_id: &str) -> Result<MediaHandle> {
        let mut handles = self.handles.lock().unwrap();
        if let Some(handle) = handles.get(blob_id) {
            if handle.path.exists() {
                return Ok(handle.clone());
            }
            warn!("Media file for {} disappeared, materializing again", blob_id);
        }

        let Some(blob) = self.store.get_media(blob_id)? else {
            bail!("Media blob {} not found", blob_id);
        };

        let extension = infer::get(&blob.data)
            .map(|kind| kind.extension())
            .unwrap_or("bin");
        let path = self.cache_dir.join(format!("{}.{}", blob.id, extension));
        std::fs::write(&path, &blob.data)
            .with_context(|| format!("Failed to write media file {:?}", path))?;

        let handle = MediaHandle {
            url: format!("file://{}", path.display()),
            blob_id: blob.id.clone(),
            job_id: blob.job_id,
            mime_type: blob.mime_type,
            path,
        };
        debug!(
            "Created media handle {} ({:#})",
            handle.url,
            byte_unit::Byte::from(blob.size_bytes)
        );
        handles.insert(blob.id, handle.clone());
        Ok(handle)
    }

    /// Handles for several blobs, in the order given. Fails on the first
    /// missing blob without releasing handles already created.
    pub fn create_urls(&self, blob_ids: &[String]) -> Result<Vec<MediaHandle>> {
        blob_ids.iter().map(|id| self.create_url(id)).collect()
    }

    /// Release a handle. Returns false if it was not live.
    pub fn cleanup_url(&self, handle: &MediaHandle) -> Result<bool> {
        self.release(&handle.blob_id)
    }

    pub fn cleanup_urls(&self, handles: &[MediaHandle]) -> Result<usize> {
        let mut released = 0;
        for handle in handles {
            if self.cleanup_url(handle)? {
                released += 1;
            }
        }
        Ok(released)
    }

    /// Release every handle belonging to a job.
    pub fn cleanup_job(&self, job_id: &str) -> Result<usize> {
        let blob_ids: Vec<String> = self
            .handles
            .lock()
            .unwrap()
            .values()
            .filter(|h| h.job_id == job_id)
            .map(|h| h.blob_id.clone())
            .collect();
        let mut released = 0;
        for blob_id in blob_ids {
            if self.release(&blob_id)? {
                released += 1;
            }
        }
        Ok(released)
    }

    /// Release every live handle. Files that cannot be removed are logged and
    /// their handles stay tracked for a later attempt; the others are still
    /// released. Returns the number of handles released.
    pub fn cleanup_all(&self) -> Result<usize> {
        let mut handles = self.handles.lock().unwrap();
        let mut released = 0;
        handles.retain(|_, handle| match remove_file(&handle.path) {
            Ok(()) => {
                released += 1;
                false
            }
            Err(e) => {
                warn!("Keeping media handle {}: {:#}", handle.url, e);
                true
            }
        });
        debug!("Released {} media handles", released);
        Ok(released)
    }

    pub fn live_handles(&self) -> usize {
        self.handles.lock().unwrap().len()
    }

    fn release(&self, blob_id: &str) -> Result<bool> {
        let removed = self.handles.lock().unwrap().remove(blob_id);
        match removed {
            Some(handle) => {
                remove_file(&handle.path)?;
                debug!("Released media handle {}", handle.url);
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

fn remove_file(path: &Path) -> Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e).with_context(|| format!("Failed to remove media file {:?}", path)),
    }
}
