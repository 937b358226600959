//! Local media acquisition and release.
//!
//! The controller owns at most one live [`MediaResource`] per client. A
//! device backend sits behind the [`MediaBackend`] trait so the call engine
//! and its tests never touch a concrete capture API; [`DummyCapture`] is
//! the deterministic backend used for loopback runs and failure injection.
//!
//! Release is a scoped-resource contract: it runs on explicit release, on
//! every call-terminating path in the engine, and unconditionally when the
//! last handle drops. Leaking an open camera or microphone is a
//! user-visible privacy defect.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use tracing::debug;
use uuid::Uuid;

use deskcall_common::{Error, Result};

/// Kind of a captured track.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackKind {
    Audio,
    Video,
}

/// What to request from the device layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MediaConstraints {
    pub audio: bool,
    pub video: bool,
    pub width: u16,
    pub height: u16,
}

impl MediaConstraints {
    pub fn audio_video() -> Self {
        Self {
            audio: true,
            video: true,
            width: 1280,
            height: 720,
        }
    }

    pub fn audio_only() -> Self {
        Self {
            audio: true,
            video: false,
            width: 0,
            height: 0,
        }
    }
}

/// Device layer seam. Opens tracks or fails with `MediaUnavailable`.
pub trait MediaBackend: Send + Sync {
    fn open_tracks(&self, constraints: &MediaConstraints) -> Result<Vec<TrackKind>>;
}

/// Backend that fabricates tracks without touching hardware. Constructed
/// failing, it deterministically simulates a denied permission prompt.
pub struct DummyCapture {
    failure: Option<String>,
}

impl DummyCapture {
    pub fn new() -> Self {
        Self { failure: None }
    }

    pub fn failing(reason: impl Into<String>) -> Self {
        Self {
            failure: Some(reason.into()),
        }
    }
}

impl Default for DummyCapture {
    fn default() -> Self {
        Self::new()
    }
}

impl MediaBackend for DummyCapture {
    fn open_tracks(&self, constraints: &MediaConstraints) -> Result<Vec<TrackKind>> {
        if let Some(reason) = &self.failure {
            return Err(Error::media_unavailable(reason));
        }
        let mut tracks = Vec::new();
        if constraints.audio {
            tracks.push(TrackKind::Audio);
        }
        if constraints.video {
            tracks.push(TrackKind::Video);
        }
        if tracks.is_empty() {
            return Err(Error::media_unavailable("no tracks requested"));
        }
        Ok(tracks)
    }
}

#[derive(Debug)]
struct TrackState {
    kind: TrackKind,
    enabled: bool,
    stopped: bool,
}

/// Exclusively owned camera/microphone handle for the lifetime of a call.
#[derive(Debug)]
pub struct MediaResource {
    id: Uuid,
    tracks: Mutex<Vec<TrackState>>,
    released: AtomicBool,
}

impl MediaResource {
    fn new(kinds: Vec<TrackKind>) -> Self {
        Self {
            id: Uuid::new_v4(),
            tracks: Mutex::new(
                kinds
                    .into_iter()
                    .map(|kind| TrackState {
                        kind,
                        enabled: true,
                        stopped: false,
                    })
                    .collect(),
            ),
            released: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Enable or disable the camera without reacquiring the device.
    pub fn toggle_video(&self, enabled: bool) -> Result<()> {
        self.toggle(TrackKind::Video, enabled)
    }

    /// Mute or unmute the microphone without reacquiring the device.
    pub fn toggle_audio(&self, enabled: bool) -> Result<()> {
        self.toggle(TrackKind::Audio, enabled)
    }

    fn toggle(&self, kind: TrackKind, enabled: bool) -> Result<()> {
        if self.is_released() {
            return Err(Error::media_unavailable("resource already released"));
        }
        let mut tracks = self.tracks.lock().expect("track lock");
        for track in tracks.iter_mut().filter(|t| t.kind == kind && !t.stopped) {
            track.enabled = enabled;
        }
        Ok(())
    }

    /// Stop all tracks. Idempotent: the second call is a no-op.
    pub fn release(&self) {
        if self.released.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut tracks = self.tracks.lock().expect("track lock");
        for track in tracks.iter_mut() {
            track.enabled = false;
            track.stopped = true;
        }
        debug!("media resource {} released", self.id);
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::SeqCst)
    }

    /// Tracks that are not stopped. Zero after release.
    pub fn active_tracks(&self) -> usize {
        self.tracks
            .lock()
            .expect("track lock")
            .iter()
            .filter(|t| !t.stopped)
            .count()
    }

    /// Whether a live track of the given kind is currently enabled.
    pub fn is_enabled(&self, kind: TrackKind) -> bool {
        self.tracks
            .lock()
            .expect("track lock")
            .iter()
            .any(|t| t.kind == kind && !t.stopped && t.enabled)
    }
}

impl Drop for MediaResource {
    fn drop(&mut self) {
        self.release();
    }
}

/// Acquires and releases the client's single camera/microphone pair.
pub struct MediaController {
    backend: Arc<dyn MediaBackend>,
    active: Mutex<Weak<MediaResource>>,
}

impl MediaController {
    pub fn new(backend: Arc<dyn MediaBackend>) -> Self {
        Self {
            backend,
            active: Mutex::new(Weak::new()),
        }
    }

    /// Request camera+microphone per the constraints.
    ///
    /// Fails with `CallAlreadyActive` while a previous resource is still
    /// live; the device is never silently reacquired.
    pub fn acquire(&self, constraints: &MediaConstraints) -> Result<Arc<MediaResource>> {
        let mut active = self.active.lock().expect("controller lock");
        if let Some(existing) = active.upgrade() {
            if !existing.is_released() {
                return Err(Error::CallAlreadyActive);
            }
        }
        let kinds = self.backend.open_tracks(constraints)?;
        let resource = Arc::new(MediaResource::new(kinds));
        *active = Arc::downgrade(&resource);
        debug!("media resource {} acquired", resource.id());
        Ok(resource)
    }

    /// Stop all tracks of a resource. Safe to call any number of times.
    pub fn release(&self, resource: &MediaResource) {
        resource.release();
    }

    /// Active (not stopped) tracks of the current resource, if any.
    pub fn active_track_count(&self) -> usize {
        self.active
            .lock()
            .expect("controller lock")
            .upgrade()
            .map(|r| r.active_tracks())
            .unwrap_or(0)
    }
}
