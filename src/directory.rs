use chrono::{TimeZone, Utc};

use crate::err::{Error, Result};
use crate::io::{load_collection, save_collection, Sequence, SharedStorage};
use crate::models::{NewStudent, Student, StudentPatch, StudentStatus};

pub const STUDENTS_KEY: &str = "escola_qr_students";

/// Read access the scan session needs from the roster.
pub trait StudentLookup {
    fn student_by_id(&self, id: &str) -> Result<Option<Student>>;
}

/// The persisted student roster. Every call reads the stored blob and every
/// mutation writes the whole collection back.
#[derive(Clone)]
pub struct Directory {
    storage: SharedStorage,
    sequence: Sequence,
}

impl Directory {
    pub fn new(storage: SharedStorage) -> Self {
        Self {
            storage,
            sequence: Sequence::for_collection(STUDENTS_KEY),
        }
    }

    pub fn list(&self) -> Result<Vec<Student>> {
        load_collection(&*self.storage, STUDENTS_KEY)
    }

    pub fn get_by_id(&self, id: &str) -> Result<Option<Student>> {
        Ok(self.list()?.into_iter().find(|student| student.id == id))
    }

    pub fn get_by_registration(&self, registration: &str) -> Result<Option<Student>> {
        Ok(self
            .list()?
            .into_iter()
            .find(|student| student.registration == registration))
    }

    pub fn create(&self, fields: NewStudent) -> Result<Student> {
        let fields = validate(fields)?;
        let mut students = self.list()?;
        if students
            .iter()
            .any(|student| student.registration == fields.registration)
        {
            return Err(Error::DuplicateRegistration {
                registration: fields.registration,
            });
        }

        let id = self
            .sequence
            .next(&*self.storage, students.iter().map(|s| s.id.as_str()))?;
        let student = Student {
            id,
            name: fields.name,
            registration: fields.registration,
            course: fields.course,
            status: fields.status,
            photo: fields.photo,
            grade: fields.grade,
            created_at: Utc::now(),
        };
        students.push(student.clone());
        save_collection(&*self.storage, STUDENTS_KEY, &students)?;
        log::info!(
            "Registered student {} ({}) with id {}",
            student.name,
            student.registration,
            student.id
        );
        Ok(student)
    }

    pub fn update(&self, id: &str, patch: StudentPatch) -> Result<Option<Student>> {
        let patch = validate_patch(patch)?;
        let mut students = self.list()?;
        let index = match students.iter().position(|student| student.id == id) {
            Some(index) => index,
            None => return Ok(None),
        };

        if let Some(registration) = &patch.registration {
            if students
                .iter()
                .any(|other| other.id != id && &other.registration == registration)
            {
                return Err(Error::DuplicateRegistration {
                    registration: registration.clone(),
                });
            }
        }

        patch.apply(&mut students[index]);
        let updated = students[index].clone();
        save_collection(&*self.storage, STUDENTS_KEY, &students)?;
        log::info!("Updated student {}", id);
        Ok(Some(updated))
    }

    pub fn delete(&self, id: &str) -> Result<bool> {
        let students = self.list()?;
        let before = students.len();
        let remaining: Vec<Student> = students
            .into_iter()
            .filter(|student| student.id != id)
            .collect();
        if remaining.len() == before {
            return Ok(false);
        }
        save_collection(&*self.storage, STUDENTS_KEY, &remaining)?;
        log::info!("Removed student {}", id);
        Ok(true)
    }

    /// Installs `students` only when no roster has ever been stored.
    pub fn seed_if_empty(&self, students: Vec<Student>) -> Result<bool> {
        if self.storage.read(STUDENTS_KEY)?.is_some() {
            return Ok(false);
        }
        let highest = students
            .iter()
            .filter_map(|student| student.id.parse::<u64>().ok())
            .max()
            .unwrap_or(0);
        save_collection(&*self.storage, STUDENTS_KEY, &students)?;
        self.sequence.advance_to(
            &*self.storage,
            students.iter().map(|s| s.id.as_str()),
            highest,
        )?;
        log::info!("Seeded roster with {} students", students.len());
        Ok(true)
    }
}

impl StudentLookup for Directory {
    fn student_by_id(&self, id: &str) -> Result<Option<Student>> {
        self.get_by_id(id)
    }
}

fn validate(mut fields: NewStudent) -> Result<NewStudent> {
    fields.name = fields.name.trim().to_string();
    fields.registration = fields.registration.trim().to_string();
    fields.course = fields.course.trim().to_string();
    fields.grade = fields.grade.trim().to_string();
    for (field, value) in [
        ("name", &fields.name),
        ("registration", &fields.registration),
        ("course", &fields.course),
        ("grade", &fields.grade),
    ] {
        if value.is_empty() {
            return Err(Error::invalid(format!("`{}` must not be empty", field)));
        }
    }
    Ok(fields)
}

fn validate_patch(mut patch: StudentPatch) -> Result<StudentPatch> {
    for (field, value) in [
        ("name", &mut patch.name),
        ("registration", &mut patch.registration),
        ("course", &mut patch.course),
        ("grade", &mut patch.grade),
    ] {
        if let Some(value) = value {
            *value = value.trim().to_string();
            if value.is_empty() {
                return Err(Error::invalid(format!("`{}` must not be empty", field)));
            }
        }
    }
    Ok(patch)
}

/// The five students the front-end ships with on first launch.
pub fn demo_roster() -> Vec<Student> {
    let entry = |id: &str,
                 name: &str,
                 registration: &str,
                 course: &str,
                 status: StudentStatus,
                 img: u8,
                 grade: &str,
                 (y, m, d): (i32, u32, u32)| Student {
        id: id.to_string(),
        name: name.to_string(),
        registration: registration.to_string(),
        course: course.to_string(),
        status,
        photo: Some(format!("https://i.pravatar.cc/150?img={}", img)),
        grade: grade.to_string(),
        created_at: Utc
            .with_ymd_and_hms(y, m, d, 0, 0, 0)
            .single()
            .unwrap_or_else(Utc::now),
    };
    vec![
        entry(
            "1",
            "João Silva",
            "20210001",
            "Engenharia de Software",
            StudentStatus::Active,
            1,
            "3° ano",
            (2021, 2, 15),
        ),
        entry(
            "2",
            "Maria Oliveira",
            "20210002",
            "Ciência da Computação",
            StudentStatus::Active,
            5,
            "2° ano",
            (2021, 2, 15),
        ),
        entry(
            "3",
            "Pedro Santos",
            "20190015",
            "Sistemas de Informação",
            StudentStatus::Active,
            3,
            "4° ano",
            (2019, 2, 10),
        ),
        entry(
            "4",
            "Ana Souza",
            "20220045",
            "Engenharia de Software",
            StudentStatus::Active,
            4,
            "1° ano",
            (2022, 2, 15),
        ),
        entry(
            "5",
            "Lucas Ferreira",
            "20200078",
            "Ciência da Computação",
            StudentStatus::Suspended,
            7,
            "3° ano",
            (2020, 2, 18),
        ),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::{MemoryStorage, Storage};
    use std::sync::Arc;

    fn ana(status: StudentStatus) -> NewStudent {
        NewStudent {
            name: "Ana".to_string(),
            registration: "999".to_string(),
            course: "CS".to_string(),
            grade: "1".to_string(),
            status,
            photo: None,
        }
    }

    #[test]
    fn create_assigns_id_and_timestamp() {
        let directory = Directory::new(MemoryStorage::shared());
        let before = Utc::now();
        let student = directory.create(ana(StudentStatus::Active)).unwrap();
        assert_eq!(student.id, "1");
        assert!(student.created_at >= before);
        assert_eq!(directory.get_by_id("1").unwrap(), Some(student.clone()));
        assert_eq!(directory.get_by_registration("999").unwrap(), Some(student));
    }

    #[test]
    fn duplicate_registration_leaves_roster_untouched() {
        let storage = MemoryStorage::shared();
        let directory = Directory::new(storage.clone());
        directory.create(ana(StudentStatus::Active)).unwrap();
        let blob = storage.read(STUDENTS_KEY).unwrap();

        let mut other = ana(StudentStatus::Inactive);
        other.name = "Outra".to_string();
        let err = directory.create(other).unwrap_err();
        assert!(matches!(
            err,
            Error::DuplicateRegistration { ref registration } if registration == "999"
        ));
        assert_eq!(storage.read(STUDENTS_KEY).unwrap(), blob);
        assert_eq!(directory.list().unwrap().len(), 1);
    }

    #[test]
    fn blank_fields_are_rejected() {
        let directory = Directory::new(MemoryStorage::shared());
        let mut fields = ana(StudentStatus::Active);
        fields.course = "  ".to_string();
        assert!(matches!(
            directory.create(fields),
            Err(Error::InvalidPayload { .. })
        ));
        assert!(directory.list().unwrap().is_empty());
    }

    #[test]
    fn ids_are_not_reused_after_delete() {
        let directory = Directory::new(MemoryStorage::shared());
        let first = directory.create(ana(StudentStatus::Active)).unwrap();
        assert!(directory.delete(&first.id).unwrap());
        assert!(!directory.delete(&first.id).unwrap());

        let second = directory.create(ana(StudentStatus::Active)).unwrap();
        assert_eq!(second.id, "2");
    }

    #[test]
    fn update_keeps_identity_fields() {
        let directory = Directory::new(MemoryStorage::shared());
        let created = directory.create(ana(StudentStatus::Active)).unwrap();
        let updated = directory
            .update(
                &created.id,
                StudentPatch {
                    status: Some(StudentStatus::Suspended),
                    name: Some("Ana Maria".to_string()),
                    ..Default::default()
                },
            )
            .unwrap()
            .unwrap();
        assert_eq!(updated.id, created.id);
        assert_eq!(updated.created_at, created.created_at);
        assert_eq!(updated.status, StudentStatus::Suspended);
        assert_eq!(updated.name, "Ana Maria");
        assert_eq!(
            directory.update("404", StudentPatch::default()).unwrap(),
            None
        );
    }

    #[test]
    fn update_cannot_steal_a_registration() {
        let directory = Directory::new(MemoryStorage::shared());
        directory.create(ana(StudentStatus::Active)).unwrap();
        let mut other = ana(StudentStatus::Active);
        other.registration = "1000".to_string();
        let other = directory.create(other).unwrap();

        let err = directory
            .update(
                &other.id,
                StudentPatch {
                    registration: Some("999".to_string()),
                    ..Default::default()
                },
            )
            .unwrap_err();
        assert!(matches!(err, Error::DuplicateRegistration { .. }));
    }

    #[test]
    fn update_trims_before_checking_registrations() {
        let directory = Directory::new(MemoryStorage::shared());
        directory.create(ana(StudentStatus::Active)).unwrap();
        let mut other = ana(StudentStatus::Active);
        other.registration = "1000".to_string();
        let other = directory.create(other).unwrap();

        let err = directory
            .update(
                &other.id,
                StudentPatch {
                    registration: Some(" 999 ".to_string()),
                    ..Default::default()
                },
            )
            .unwrap_err();
        assert!(matches!(
            err,
            Error::DuplicateRegistration { ref registration } if registration == "999"
        ));

        let renamed = directory
            .update(
                &other.id,
                StudentPatch {
                    registration: Some(" 1001 ".to_string()),
                    name: Some("  Bia ".to_string()),
                    ..Default::default()
                },
            )
            .unwrap()
            .unwrap();
        assert_eq!(renamed.registration, "1001");
        assert_eq!(renamed.name, "Bia");
        assert!(matches!(
            directory.update(
                &other.id,
                StudentPatch {
                    grade: Some("   ".to_string()),
                    ..Default::default()
                },
            ),
            Err(Error::InvalidPayload { .. })
        ));
    }

    #[test]
    fn restored_roster_with_higher_ids_gets_fresh_ids() {
        let storage = MemoryStorage::shared();
        let directory = Directory::new(storage.clone());
        let first = directory.create(ana(StudentStatus::Active)).unwrap();
        assert_eq!(first.id, "1");

        let mut restored = first.clone();
        restored.id = "2".to_string();
        restored.registration = "1000".to_string();
        save_collection(&*storage, STUDENTS_KEY, &[first, restored]).unwrap();

        let mut fields = ana(StudentStatus::Active);
        fields.registration = "1001".to_string();
        let created = directory.create(fields).unwrap();
        assert_eq!(created.id, "3");
        let ids: Vec<String> = directory.list().unwrap().into_iter().map(|s| s.id).collect();
        assert_eq!(ids, ["1", "2", "3"]);
    }

    #[test]
    fn seeding_only_happens_once() {
        let directory = Directory::new(MemoryStorage::shared());
        assert!(directory.seed_if_empty(demo_roster()).unwrap());
        assert!(!directory.seed_if_empty(Vec::new()).unwrap());
        assert_eq!(directory.list().unwrap().len(), 5);

        let created = directory.create(ana(StudentStatus::Active)).unwrap();
        assert_eq!(created.id, "6");
    }

    #[test]
    fn reads_blobs_written_by_the_front_end() {
        let storage = Arc::new(MemoryStorage::new());
        storage
            .write(
                STUDENTS_KEY,
                r#"[{"id":"4","name":"Ana Souza","registration":"20220045","course":"ES","status":"active","grade":"1° ano","createdAt":"2022-02-15T00:00:00.000Z"}]"#,
            )
            .unwrap();
        let directory = Directory::new(storage);
        let student = directory.get_by_registration("20220045").unwrap().unwrap();
        assert_eq!(
            student.created_at,
            Utc.with_ymd_and_hms(2022, 2, 15, 0, 0, 0).unwrap()
        );
        let next = directory.create(ana(StudentStatus::Active)).unwrap();
        assert_eq!(next.id, "5");
    }
}
