//! Display surfaces: where rendered frames end up.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use viewlink_core::error::{Result, ViewlinkError};
use viewlink_core::protocol;
use viewlink_core::types::FrameSource;

/// Runs once after a surface has finished loading a frame.
pub type LoadCallback = Box<dyn FnOnce() + Send + 'static>;

/// A display element showing one viewport's frames.
#[async_trait]
pub trait Surface: Send + Sync + 'static {
    /// Replace the displayed frame with `source`.
    ///
    /// `on_load` runs after the new frame has loaded, or once a newer frame
    /// has replaced it first. A frame that fails to load never runs it.
    async fn load(&self, source: FrameSource, on_load: Option<LoadCallback>);
}

/// Keeps every source it is given; loading completes instantly.
#[derive(Default)]
pub struct MemorySurface {
    sources: Mutex<Vec<FrameSource>>,
}

impl MemorySurface {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn sources(&self) -> Vec<FrameSource> {
        self.sources.lock().await.clone()
    }

    pub async fn current(&self) -> Option<FrameSource> {
        self.sources.lock().await.last().cloned()
    }

    pub async fn load_count(&self) -> usize {
        self.sources.lock().await.len()
    }
}

#[async_trait]
impl Surface for MemorySurface {
    async fn load(&self, source: FrameSource, on_load: Option<LoadCallback>) {
        self.sources.lock().await.push(source);
        if let Some(on_load) = on_load {
            on_load();
        }
    }
}

/// Writes each loaded frame to a file, fetching URL sources over HTTP.
///
/// Loads are ticketed in call order. A frame whose fetch finishes after a
/// later load has already been written is discarded.
pub struct FileSurface {
    path: PathBuf,
    client: reqwest::Client,
    frames: AtomicU64,
    tickets: AtomicU64,
    /// Ticket of the frame currently in the file.
    written: Mutex<u64>,
}

impl FileSurface {
    /// `path` may start with `~`. `timeout` bounds each frame fetch.
    pub fn new(path: impl AsRef<str>, timeout: Duration) -> Result<Self> {
        let expanded = shellexpand::tilde(path.as_ref());
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ViewlinkError::Http(e.to_string()))?;
        Ok(Self {
            path: PathBuf::from(expanded.as_ref()),
            client,
            frames: AtomicU64::new(0),
            tickets: AtomicU64::new(0),
            written: Mutex::new(0),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Number of frames written so far.
    pub fn frames_written(&self) -> u64 {
        self.frames.load(Ordering::SeqCst)
    }

    async fn resolve(&self, source: &FrameSource) -> Result<Bytes> {
        match source {
            FrameSource::Data(data) => Ok(Bytes::from(protocol::decode_data_url(data)?)),
            FrameSource::Url(url) => {
                let resp = self
                    .client
                    .get(url.as_str())
                    .send()
                    .await
                    .map_err(|e| ViewlinkError::Http(e.to_string()))?;
                let status = resp.status();
                if !status.is_success() {
                    return Err(ViewlinkError::Status {
                        url: url.clone(),
                        status: status.as_u16(),
                        reason: status.canonical_reason().unwrap_or("").to_string(),
                    });
                }
                resp.bytes()
                    .await
                    .map_err(|e| ViewlinkError::Http(e.to_string()))
            }
        }
    }
}

#[async_trait]
impl Surface for FileSurface {
    async fn load(&self, source: FrameSource, on_load: Option<LoadCallback>) {
        let ticket = self.tickets.fetch_add(1, Ordering::SeqCst) + 1;
        let bytes = match self.resolve(&source).await {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(error = %e, "Frame failed to load");
                return;
            }
        };

        let mut written = self.written.lock().await;
        if *written > ticket {
            debug!(path = %self.path.display(), ticket, newer = *written, "Discarding stale frame");
            drop(written);
            if let Some(on_load) = on_load {
                on_load();
            }
            return;
        }
        if let Err(e) = tokio::fs::write(&self.path, &bytes).await {
            warn!(path = %self.path.display(), error = %e, "Could not write frame");
            return;
        }
        *written = ticket;
        drop(written);
        let n = self.frames.fetch_add(1, Ordering::SeqCst) + 1;
        debug!(path = %self.path.display(), bytes = bytes.len(), frame = n, "Frame written");
        if let Some(on_load) = on_load {
            on_load();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::AtomicBool;

    use super::*;

    #[tokio::test]
    async fn test_memory_surface_runs_callback() {
        let surface = MemorySurface::new();
        let loaded = Arc::new(AtomicBool::new(false));
        let flag = loaded.clone();
        surface
            .load(
                FrameSource::Url("http://localhost/image?1".into()),
                Some(Box::new(move || flag.store(true, Ordering::SeqCst))),
            )
            .await;
        assert!(loaded.load(Ordering::SeqCst));
        assert_eq!(surface.load_count().await, 1);
    }

    #[tokio::test]
    async fn test_file_surface_decodes_data_url() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("frame.jpg");
        let surface = FileSurface::new(path.to_str().unwrap(), Duration::from_secs(5)).unwrap();
        surface
            .load(FrameSource::Data("data:image/jpeg;base64,/9j/".into()), None)
            .await;
        assert_eq!(std::fs::read(&path).unwrap(), vec![0xff, 0xd8, 0xff]);
        assert_eq!(surface.frames_written(), 1);
    }

    #[tokio::test]
    async fn test_file_surface_bad_data_skips_callback() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f.png");
        let surface = FileSurface::new(path.to_str().unwrap(), Duration::from_secs(5)).unwrap();
        let loaded = Arc::new(AtomicBool::new(false));
        let flag = loaded.clone();
        surface
            .load(
                FrameSource::Data("not a data url".into()),
                Some(Box::new(move || flag.store(true, Ordering::SeqCst))),
            )
            .await;
        assert!(!loaded.load(Ordering::SeqCst));
        assert_eq!(surface.frames_written(), 0);
    }
}
