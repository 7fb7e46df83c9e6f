use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader, Lines};
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use uuid::Uuid;

pub type FrameSender = UnboundedSender<FrameEvent>;
pub type FrameReceiver = UnboundedReceiver<FrameEvent>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, thiserror::Error)]
#[serde(tag = "error")]
pub enum CameraError {
    #[error("camera permission denied")]
    PermissionDenied,
    #[error("camera failed to start: {message}")]
    InitFailure { message: String },
}

/// What the capability reports for each captured frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameEvent {
    /// The stream is live.
    Ready,
    Decoded(String),
    /// A frame without a readable QR code.
    NoCode,
    Failed(CameraError),
}

#[derive(Debug, Clone, PartialEq)]
pub struct CameraConfig {
    pub facing_mode: String,
    pub fps: u32,
    pub qrbox: (u32, u32),
    pub aspect_ratio: f32,
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            facing_mode: "environment".to_string(),
            fps: 10,
            qrbox: (250, 250),
            aspect_ratio: 1.0,
        }
    }
}

/// One acquisition of the camera.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CameraHandle(Uuid);

impl CameraHandle {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for CameraHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for CameraHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Exclusive camera access. Frames are pushed to `frames` until the
/// acquisition is paused or stopped.
pub trait Camera {
    fn start(
        &mut self,
        config: &CameraConfig,
        frames: FrameSender,
    ) -> Result<CameraHandle, CameraError>;

    fn pause(&mut self, handle: &CameraHandle);

    /// Stopping an unknown or already stopped handle is a no-op.
    fn stop(&mut self, handle: CameraHandle) -> Result<(), CameraError>;
}

struct Acquisition {
    handle: CameraHandle,
    paused: Arc<AtomicBool>,
    task: JoinHandle<()>,
}

type SharedLines<R> = Arc<Mutex<Lines<BufReader<R>>>>;

/// Treats every line read from `R` as one captured frame: a non-blank line is
/// decoded text, a blank line is a frame with no QR code in it.
///
/// The reader outlives acquisitions. Each acquisition ends after its first
/// decoded frame, so the next line is left for the next scan.
pub struct LineCamera<R> {
    lines: SharedLines<R>,
    active: Option<Acquisition>,
}

impl<R> LineCamera<R>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    pub fn new(reader: R) -> Self {
        Self {
            lines: Arc::new(Mutex::new(BufReader::new(reader).lines())),
            active: None,
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.is_some()
    }
}

impl<R> Camera for LineCamera<R>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    fn start(
        &mut self,
        config: &CameraConfig,
        frames: FrameSender,
    ) -> Result<CameraHandle, CameraError> {
        if let Some(active) = &self.active {
            if !active.task.is_finished() {
                return Err(CameraError::InitFailure {
                    message: "camera already in use".to_string(),
                });
            }
        }
        let runtime = tokio::runtime::Handle::try_current().map_err(|err| {
            CameraError::InitFailure {
                message: err.to_string(),
            }
        })?;

        let handle = CameraHandle::new();
        let paused = Arc::new(AtomicBool::new(false));
        let task = runtime.spawn(read_frames(
            Arc::clone(&self.lines),
            frames,
            Arc::clone(&paused),
        ));
        log::debug!(
            "Line camera {} started ({} mode, {} fps)",
            handle,
            config.facing_mode,
            config.fps
        );
        self.active = Some(Acquisition {
            handle,
            paused,
            task,
        });
        Ok(handle)
    }

    fn pause(&mut self, handle: &CameraHandle) {
        if let Some(active) = self.active.as_ref().filter(|a| a.handle == *handle) {
            active.paused.store(true, Ordering::SeqCst);
        }
    }

    fn stop(&mut self, handle: CameraHandle) -> Result<(), CameraError> {
        match self.active.take() {
            Some(active) if active.handle == handle => {
                active.task.abort();
                log::debug!("Line camera {} stopped", handle);
            }
            other => self.active = other,
        }
        Ok(())
    }
}

async fn read_frames<R>(lines: SharedLines<R>, frames: FrameSender, paused: Arc<AtomicBool>)
where
    R: AsyncRead + Unpin,
{
    if frames.send(FrameEvent::Ready).is_err() {
        return;
    }
    let mut lines = lines.lock().await;
    loop {
        if paused.load(Ordering::SeqCst) {
            break;
        }
        match lines.next_line().await {
            Ok(Some(line)) => {
                let text = line.trim();
                if text.is_empty() {
                    if frames.send(FrameEvent::NoCode).is_err() {
                        break;
                    }
                } else {
                    let _ = frames.send(FrameEvent::Decoded(text.to_string()));
                    break;
                }
            }
            Ok(None) => break,
            Err(err) => {
                let _ = frames.send(FrameEvent::Failed(CameraError::InitFailure {
                    message: err.to_string(),
                }));
                break;
            }
        }
    }
}
