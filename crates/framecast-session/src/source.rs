//! Frame Source Adapter contract and the built-in sources.
//!
//! A source is opened once by its session (`open`) and then drained one frame
//! at a time (`next`) from the session's pacer task only.

use std::path::PathBuf;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};

use framecast_core::{RelayError, SessionMode};

/// What to open: the session mode plus mode-specific inputs.
#[derive(Clone, Debug, PartialEq)]
pub struct SourceDescriptor {
    pub mode: SessionMode,
    /// Frame manifest for `video` mode.
    pub video_path: Option<PathBuf>,
    /// Frame count for the synthetic modes.
    pub total_frames: Option<u64>,
}

/// Stream properties reported by `open`.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SourceInfo {
    pub width: u32,
    pub height: u32,
    /// Frames per second the source was produced at; `0.0` if unknown.
    pub native_rate: f64,
    pub total_count: u64,
}

#[async_trait]
pub trait FrameSource: Send {
    async fn open(&mut self, descriptor: &SourceDescriptor) -> Result<SourceInfo, RelayError>;

    /// Next frame payload, or `None` at end of sequence.
    async fn next(&mut self) -> Result<Option<Value>, RelayError>;
}

/// Picks a concrete [`FrameSource`] for a session mode.
pub trait SourceResolver: Send + Sync {
    fn resolve(&self, mode: SessionMode) -> Box<dyn FrameSource>;
}

/// Resolver for the built-in sources.
#[derive(Clone, Debug)]
pub struct BuiltinResolver {
    pub default_test_frames: u64,
    pub frame_test_rate: f64,
}

impl Default for BuiltinResolver {
    fn default() -> Self {
        Self {
            default_test_frames: 100,
            frame_test_rate: 30.0,
        }
    }
}

impl SourceResolver for BuiltinResolver {
    fn resolve(&self, mode: SessionMode) -> Box<dyn FrameSource> {
        match mode {
            SessionMode::Video => Box::new(ManifestSource::default()),
            SessionMode::FrameTest => Box::new(SyntheticSource::frames(
                self.default_test_frames,
                self.frame_test_rate,
            )),
            SessionMode::SecondTest => Box::new(SyntheticSource::seconds(self.default_test_frames)),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Synthetic sources
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum SyntheticKind {
    Frames,
    Seconds,
}

/// Generated payloads for the `frame-test` and `second-test` modes.
#[derive(Debug)]
pub struct SyntheticSource {
    kind: SyntheticKind,
    total: u64,
    rate: f64,
    emitted: u64,
}

impl SyntheticSource {
    pub fn frames(default_total: u64, rate: f64) -> Self {
        Self {
            kind: SyntheticKind::Frames,
            total: default_total,
            rate,
            emitted: 0,
        }
    }

    /// One payload per second of simulated time.
    pub fn seconds(default_total: u64) -> Self {
        Self {
            kind: SyntheticKind::Seconds,
            total: default_total,
            rate: 1.0,
            emitted: 0,
        }
    }
}

#[async_trait]
impl FrameSource for SyntheticSource {
    async fn open(&mut self, descriptor: &SourceDescriptor) -> Result<SourceInfo, RelayError> {
        if let Some(total) = descriptor.total_frames {
            self.total = total;
        }
        self.emitted = 0;
        Ok(SourceInfo {
            width: 0,
            height: 0,
            native_rate: self.rate,
            total_count: self.total,
        })
    }

    async fn next(&mut self) -> Result<Option<Value>, RelayError> {
        if self.emitted >= self.total {
            return Ok(None);
        }
        self.emitted += 1;
        let n = self.emitted;
        #[allow(clippy::cast_precision_loss)]
        let payload = match self.kind {
            SyntheticKind::Frames => json!({
                "index": n,
                "value": ((n as f64) * 0.1).sin(),
            }),
            SyntheticKind::Seconds => json!({
                "second": n,
                "elapsed_ms": n * 1000,
            }),
        };
        Ok(Some(payload))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Manifest source
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct Manifest {
    #[serde(default)]
    width: u32,
    #[serde(default)]
    height: u32,
    #[serde(default)]
    fps: f64,
    frames: Vec<Value>,
}

/// Reads a JSON manifest `{width, height, fps, frames: [...]}` of pre-rendered
/// frames. Each entry of `frames` is relayed verbatim as `image_data`.
#[derive(Debug, Default)]
pub struct ManifestSource {
    frames: std::vec::IntoIter<Value>,
}

#[async_trait]
impl FrameSource for ManifestSource {
    async fn open(&mut self, descriptor: &SourceDescriptor) -> Result<SourceInfo, RelayError> {
        let path = descriptor
            .video_path
            .as_ref()
            .ok_or_else(|| RelayError::InvalidRequest("video mode requires video_path".into()))?;
        let raw = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| RelayError::SourceFailed(format!("{}: {e}", path.display())))?;
        let manifest: Manifest = serde_json::from_str(&raw)
            .map_err(|e| RelayError::SourceFailed(format!("{}: {e}", path.display())))?;

        let info = SourceInfo {
            width: manifest.width,
            height: manifest.height,
            native_rate: manifest.fps.max(0.0),
            total_count: manifest.frames.len() as u64,
        };
        self.frames = manifest.frames.into_iter();
        Ok(info)
    }

    async fn next(&mut self) -> Result<Option<Value>, RelayError> {
        Ok(self.frames.next())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn descriptor(mode: SessionMode) -> SourceDescriptor {
        SourceDescriptor {
            mode,
            video_path: None,
            total_frames: None,
        }
    }

    #[tokio::test]
    async fn synthetic_frames_count_up_then_end() {
        let mut source = SyntheticSource::frames(3, 30.0);
        let info = source
            .open(&SourceDescriptor {
                total_frames: Some(2),
                ..descriptor(SessionMode::FrameTest)
            })
            .await
            .unwrap();
        assert_eq!(info.total_count, 2);
        assert_eq!(info.native_rate, 30.0);

        assert_eq!(source.next().await.unwrap().unwrap()["index"], 1);
        assert_eq!(source.next().await.unwrap().unwrap()["index"], 2);
        assert!(source.next().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn synthetic_seconds_run_at_one_hz() {
        let mut source = SyntheticSource::seconds(5);
        let info = source.open(&descriptor(SessionMode::SecondTest)).await.unwrap();
        assert_eq!(info.native_rate, 1.0);
        assert_eq!(info.total_count, 5);
        let first = source.next().await.unwrap().unwrap();
        assert_eq!(first["second"], 1);
        assert_eq!(first["elapsed_ms"], 1000);
    }

    #[tokio::test]
    async fn manifest_source_reads_frames() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"width":640,"height":480,"fps":10,"frames":["a","b"]}}"#).unwrap();

        let mut source = ManifestSource::default();
        let info = source
            .open(&SourceDescriptor {
                mode: SessionMode::Video,
                video_path: Some(file.path().to_path_buf()),
                total_frames: None,
            })
            .await
            .unwrap();
        assert_eq!(info.width, 640);
        assert_eq!(info.height, 480);
        assert_eq!(info.native_rate, 10.0);
        assert_eq!(info.total_count, 2);
        assert_eq!(source.next().await.unwrap().unwrap(), "a");
        assert_eq!(source.next().await.unwrap().unwrap(), "b");
        assert!(source.next().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn manifest_without_path_is_invalid_request() {
        let mut source = ManifestSource::default();
        let err = source.open(&descriptor(SessionMode::Video)).await.unwrap_err();
        assert_eq!(err.error_kind(), "invalid_request");
    }

    #[tokio::test]
    async fn missing_manifest_is_source_failure() {
        let mut source = ManifestSource::default();
        let err = source
            .open(&SourceDescriptor {
                mode: SessionMode::Video,
                video_path: Some("/nonexistent/frames.json".into()),
                total_frames: None,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::SourceFailed(_)));
    }

    #[test]
    fn builtin_resolver_covers_all_modes() {
        let resolver = BuiltinResolver::default();
        for mode in [SessionMode::Video, SessionMode::FrameTest, SessionMode::SecondTest] {
            let _source = resolver.resolve(mode);
        }
    }
}
