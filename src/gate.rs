use crate::camera::{Camera, CameraConfig};
use crate::directory::Directory;
use crate::ledger::Ledger;
use crate::models::{AccessType, NewAccess};
use crate::scanner::{ScanOutcome, ScanSession};

/// A checkpoint: a scan session whose authorized decisions land in the ledger.
pub struct Gate<C: Camera> {
    session: ScanSession<C, Directory>,
    ledger: Ledger,
    audit_denied: bool,
}

impl<C: Camera> Gate<C> {
    pub fn new(
        camera: C,
        directory: Directory,
        ledger: Ledger,
        config: CameraConfig,
        access_type: AccessType,
    ) -> Self {
        let writer = ledger.clone();
        let session = ScanSession::new(camera, directory, config, access_type).on_authorized(
            move |student, access_type| {
                let access = NewAccess {
                    student_id: student.id.clone(),
                    student_name: student.name.clone(),
                    access_type,
                    authorized: true,
                };
                if let Err(err) = writer.append(access) {
                    log::error!("Could not record {} for {}: {}", access_type, student.id, err);
                }
            },
        );
        Self {
            session,
            ledger,
            audit_denied: false,
        }
    }

    /// Also record denied scans as unauthorized accesses.
    pub fn audit_denied(mut self, enabled: bool) -> Self {
        self.audit_denied = enabled;
        self
    }

    pub fn set_access_type(&mut self, access_type: AccessType) {
        self.session.set_access_type(access_type);
    }

    pub fn session(&self) -> &ScanSession<C, Directory> {
        &self.session
    }

    pub fn session_mut(&mut self) -> &mut ScanSession<C, Directory> {
        &mut self.session
    }

    /// Runs one scan from camera start to decision and leaves the session idle.
    pub async fn scan_once(&mut self) -> Option<ScanOutcome> {
        let outcome = match self.session.start() {
            Ok(()) => self.session.next_outcome().await,
            Err(_) => self.session.outcome().cloned(),
        };
        if let Some(outcome) = &outcome {
            self.audit(outcome);
        }
        self.session.reset();
        outcome
    }

    fn audit(&self, outcome: &ScanOutcome) {
        if !self.audit_denied {
            return;
        }
        if let ScanOutcome::Denied {
            payload, student, ..
        } = outcome
        {
            let (student_id, student_name) = match student {
                Some(student) => (student.id.clone(), student.name.clone()),
                None => (payload.id.clone(), payload.name.clone()),
            };
            let access = NewAccess {
                student_id,
                student_name,
                access_type: self.session.access_type(),
                authorized: false,
            };
            if let Err(err) = self.ledger.append(access) {
                log::error!("Could not record denied scan: {}", err);
            }
        }
    }
}
