//! Scan session: one camera acquisition, at most one decision.
//!
//! ```text
//! Idle ──start──▶ Starting ──ready──▶ Scanning ──payload──▶ Decoding ──▶ Deciding
//!   ▲                │                   │                     │            │
//!   │               stop                stop                   ▼            ▼
//!   └────────────────┴───────────────────┴──────reset──── Result(Authorized | Denied | Error)
//! ```
//!
//! The camera handle lives in an `Option` and is released by `take()`, so every
//! path out of `Starting`/`Scanning` (decision, failure, manual stop, drop)
//! stops the camera exactly once.

use std::fmt;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::camera::{Camera, CameraConfig, CameraError, CameraHandle, FrameEvent, FrameReceiver};
use crate::codec::{self, Validity};
use crate::directory::StudentLookup;
use crate::models::{AccessType, QrCodeData, Student, StudentStatus};

pub type AuthorizedScan = Box<dyn FnMut(&Student, AccessType) + Send>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, thiserror::Error)]
#[serde(tag = "reason", rename_all = "camelCase")]
pub enum DenialReason {
    #[error("expired")]
    Expired,
    #[error("student not found")]
    StudentNotFound,
    #[error("student status is {status}")]
    Status { status: StudentStatus },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, thiserror::Error)]
#[serde(tag = "error")]
pub enum ScanError {
    #[error("camera permission denied")]
    CameraPermissionDenied,
    #[error("camera failed to start: {message}")]
    CameraInitFailure { message: String },
    #[error("invalid QR")]
    MalformedPayload { message: String },
    #[error("student lookup failed: {message}")]
    Lookup { message: String },
}

impl From<CameraError> for ScanError {
    fn from(err: CameraError) -> Self {
        match err {
            CameraError::PermissionDenied => ScanError::CameraPermissionDenied,
            CameraError::InitFailure { message } => ScanError::CameraInitFailure { message },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "camelCase")]
pub enum ScanOutcome {
    Authorized {
        student: Student,
        payload: QrCodeData,
    },
    Denied {
        #[serde(flatten)]
        reason: DenialReason,
        payload: QrCodeData,
        student: Option<Student>,
    },
    Error {
        #[serde(flatten)]
        error: ScanError,
    },
}

impl ScanOutcome {
    pub fn is_authorized(&self) -> bool {
        matches!(self, ScanOutcome::Authorized { .. })
    }

    pub fn message(&self) -> String {
        match self {
            ScanOutcome::Authorized { student, .. } => format!("{} authorized", student.name),
            ScanOutcome::Denied { reason, .. } => format!("access denied: {}", reason),
            ScanOutcome::Error { error } => error.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanState {
    Idle,
    Starting,
    Scanning,
    Decoding,
    Deciding,
    Result(ScanOutcome),
}

impl ScanState {
    pub fn is_active(&self) -> bool {
        matches!(self, ScanState::Starting | ScanState::Scanning)
    }
}

impl fmt::Display for ScanState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScanState::Idle => f.write_str("idle"),
            ScanState::Starting => f.write_str("starting"),
            ScanState::Scanning => f.write_str("scanning"),
            ScanState::Decoding => f.write_str("decoding"),
            ScanState::Deciding => f.write_str("deciding"),
            ScanState::Result(ScanOutcome::Authorized { .. }) => f.write_str("authorized"),
            ScanState::Result(ScanOutcome::Denied { .. }) => f.write_str("denied"),
            ScanState::Result(ScanOutcome::Error { .. }) => f.write_str("error"),
        }
    }
}

pub struct ScanSession<C: Camera, L: StudentLookup> {
    id: Uuid,
    camera: C,
    lookup: L,
    config: CameraConfig,
    access_type: AccessType,
    state: ScanState,
    handle: Option<CameraHandle>,
    frames: Option<FrameReceiver>,
    payload: Option<QrCodeData>,
    on_authorized: Option<AuthorizedScan>,
}

impl<C: Camera, L: StudentLookup> ScanSession<C, L> {
    pub fn new(camera: C, lookup: L, config: CameraConfig, access_type: AccessType) -> Self {
        Self {
            id: Uuid::new_v4(),
            camera,
            lookup,
            config,
            access_type,
            state: ScanState::Idle,
            handle: None,
            frames: None,
            payload: None,
            on_authorized: None,
        }
    }

    /// Invoked once per authorized decision, before the session settles in `Result`.
    pub fn on_authorized<F>(mut self, callback: F) -> Self
    where
        F: FnMut(&Student, AccessType) + Send + 'static,
    {
        self.on_authorized = Some(Box::new(callback));
        self
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn state(&self) -> &ScanState {
        &self.state
    }

    pub fn outcome(&self) -> Option<&ScanOutcome> {
        match &self.state {
            ScanState::Result(outcome) => Some(outcome),
            _ => None,
        }
    }

    /// The payload read during this session, if any got that far.
    pub fn payload(&self) -> Option<&QrCodeData> {
        self.payload.as_ref()
    }

    pub fn access_type(&self) -> AccessType {
        self.access_type
    }

    pub fn set_access_type(&mut self, access_type: AccessType) {
        self.access_type = access_type;
    }

    pub fn camera(&self) -> &C {
        &self.camera
    }

    pub fn lookup(&self) -> &L {
        &self.lookup
    }

    /// Acquires the camera. A previous acquisition is always released first.
    pub fn start(&mut self) -> Result<(), ScanError> {
        self.release();
        self.payload = None;
        self.transition(ScanState::Starting);

        let (tx, rx) = mpsc::unbounded_channel();
        match self.camera.start(&self.config, tx) {
            Ok(handle) => {
                log::info!("[scan {}] camera acquired ({})", self.id, self.access_type);
                self.handle = Some(handle);
                self.frames = Some(rx);
                Ok(())
            }
            Err(err) => {
                let error = ScanError::from(err);
                log::warn!("[scan {}] {}", self.id, error);
                self.settle(ScanOutcome::Error {
                    error: error.clone(),
                });
                Err(error)
            }
        }
    }

    /// Feeds one camera event into the machine. Returns the outcome once one exists.
    pub fn handle_event(&mut self, event: FrameEvent) -> Option<&ScanOutcome> {
        match event {
            FrameEvent::Ready => {
                if self.state == ScanState::Starting {
                    self.transition(ScanState::Scanning);
                }
            }
            FrameEvent::NoCode => {
                log::trace!("[scan {}] frame without QR code", self.id);
            }
            FrameEvent::Decoded(text) => {
                if self.state.is_active() {
                    if self.state == ScanState::Starting {
                        self.transition(ScanState::Scanning);
                    }
                    self.process(&text);
                } else {
                    log::trace!("[scan {}] ignoring frame while {}", self.id, self.state);
                }
            }
            FrameEvent::Failed(err) => {
                if self.state.is_active() {
                    let error = ScanError::from(err);
                    log::warn!("[scan {}] {}", self.id, error);
                    self.release();
                    self.settle(ScanOutcome::Error { error });
                }
            }
        }
        self.outcome()
    }

    /// Handles every frame already delivered without waiting for more.
    pub fn pump(&mut self) -> Option<&ScanOutcome> {
        while self.state.is_active() {
            let event = match self.frames.as_mut().map(|rx| rx.try_recv()) {
                Some(Ok(event)) => event,
                Some(Err(mpsc::error::TryRecvError::Empty)) | None => break,
                Some(Err(mpsc::error::TryRecvError::Disconnected)) => {
                    self.stream_closed();
                    break;
                }
            };
            self.handle_event(event);
        }
        self.outcome()
    }

    /// Waits for frames until a decision is reached. `None` when the session is
    /// not scanning (never started, stopped, or already decided).
    pub async fn next_outcome(&mut self) -> Option<ScanOutcome> {
        while self.state.is_active() {
            let event = match self.frames.as_mut() {
                Some(rx) => rx.recv().await,
                None => None,
            };
            match event {
                Some(event) => {
                    self.handle_event(event);
                }
                None => self.stream_closed(),
            }
        }
        self.outcome().cloned()
    }

    /// Manual stop. Releases the camera, drops any payload and decision, and
    /// returns to `Idle` from any state.
    pub fn stop(&mut self) {
        if self.state != ScanState::Idle {
            log::info!("[scan {}] stopped while {}", self.id, self.state);
        }
        self.release();
        self.payload = None;
        self.transition(ScanState::Idle);
    }

    pub fn reset(&mut self) {
        self.stop();
    }

    fn process(&mut self, text: &str) {
        if let Some(handle) = &self.handle {
            self.camera.pause(handle);
        }
        self.transition(ScanState::Decoding);

        let payload = match codec::decode(text) {
            Ok(payload) => payload,
            Err(err) => {
                log::warn!("[scan {}] rejected payload: {}", self.id, err);
                self.release();
                self.settle(ScanOutcome::Error {
                    error: ScanError::MalformedPayload {
                        message: err.to_string(),
                    },
                });
                return;
            }
        };
        self.payload = Some(payload.clone());

        if codec::check_expiry(&payload, Utc::now()) == Validity::Expired {
            self.release();
            self.settle(ScanOutcome::Denied {
                reason: DenialReason::Expired,
                payload,
                student: None,
            });
            return;
        }

        self.transition(ScanState::Deciding);
        let outcome = match self.lookup.student_by_id(&payload.id) {
            Err(err) => ScanOutcome::Error {
                error: ScanError::Lookup {
                    message: err.to_string(),
                },
            },
            Ok(None) => ScanOutcome::Denied {
                reason: DenialReason::StudentNotFound,
                payload,
                student: None,
            },
            Ok(Some(student)) if student.is_active() => {
                if let Some(callback) = self.on_authorized.as_mut() {
                    callback(&student, self.access_type);
                }
                ScanOutcome::Authorized { student, payload }
            }
            Ok(Some(student)) => ScanOutcome::Denied {
                reason: DenialReason::Status {
                    status: student.status,
                },
                payload,
                student: Some(student),
            },
        };
        self.release();
        self.settle(outcome);
    }

    fn stream_closed(&mut self) {
        let error = ScanError::CameraInitFailure {
            message: "frame stream closed".to_string(),
        };
        log::warn!("[scan {}] {}", self.id, error);
        self.release();
        self.settle(ScanOutcome::Error { error });
    }

    fn settle(&mut self, outcome: ScanOutcome) {
        log::info!("[scan {}] {}", self.id, outcome.message());
        self.transition(ScanState::Result(outcome));
    }

    fn transition(&mut self, next: ScanState) {
        log::debug!("[scan {}] {} -> {}", self.id, self.state, next);
        self.state = next;
    }

    fn release(&mut self) {
        self.frames = None;
        if let Some(handle) = self.handle.take() {
            if let Err(err) = self.camera.stop(handle) {
                log::warn!("[scan {}] failed to release camera: {}", self.id, err);
            }
        }
    }
}

impl<C: Camera, L: StudentLookup> Drop for ScanSession<C, L> {
    fn drop(&mut self) {
        self.release();
    }
}
