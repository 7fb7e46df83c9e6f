use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StudentStatus {
    Active,
    Inactive,
    Suspended,
}

impl StudentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StudentStatus::Active => "active",
            StudentStatus::Inactive => "inactive",
            StudentStatus::Suspended => "suspended",
        }
    }
}

impl fmt::Display for StudentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for StudentStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(StudentStatus::Active),
            "inactive" => Ok(StudentStatus::Inactive),
            "suspended" => Ok(StudentStatus::Suspended),
            other => Err(format!("unknown student status `{}`", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Student {
    pub id: String,
    pub name: String,
    pub registration: String,
    pub course: String,
    pub status: StudentStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub photo: Option<String>,
    pub grade: String,
    pub created_at: DateTime<Utc>,
}

impl Student {
    pub fn is_active(&self) -> bool {
        self.status == StudentStatus::Active
    }
}

/// Fields supplied when registering a student. `id` and `createdAt` are assigned by the directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewStudent {
    pub name: String,
    pub registration: String,
    pub course: String,
    pub grade: String,
    pub status: StudentStatus,
    #[serde(default)]
    pub photo: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StudentPatch {
    pub name: Option<String>,
    pub registration: Option<String>,
    pub course: Option<String>,
    pub grade: Option<String>,
    pub status: Option<StudentStatus>,
    pub photo: Option<String>,
}

impl StudentPatch {
    pub fn apply(self, student: &mut Student) {
        if let Some(name) = self.name {
            student.name = name;
        }
        if let Some(registration) = self.registration {
            student.registration = registration;
        }
        if let Some(course) = self.course {
            student.course = course;
        }
        if let Some(grade) = self.grade {
            student.grade = grade;
        }
        if let Some(status) = self.status {
            student.status = status;
        }
        if let Some(photo) = self.photo {
            student.photo = Some(photo);
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccessType {
    Entry,
    Exit,
}

impl fmt::Display for AccessType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AccessType::Entry => f.write_str("entry"),
            AccessType::Exit => f.write_str("exit"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccessRecord {
    pub id: String,
    pub student_id: String,
    pub student_name: String,
    pub timestamp: DateTime<Utc>,
    pub access_type: AccessType,
    pub authorized: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewAccess {
    pub student_id: String,
    pub student_name: String,
    pub access_type: AccessType,
    pub authorized: bool,
}

/// Identity claim carried inside a QR code. A snapshot, never a live reference.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QrCodeData {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub registration: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub valid_until: Option<DateTime<Utc>>,
}
