use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Duration, Utc};
use qrcode::render::{svg, unicode};
use qrcode::{EcLevel, QrCode};

use crate::err::{Error, Result};
use crate::models::{QrCodeData, Student};

pub const DEFAULT_VALIDITY_DAYS: i64 = 365;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Validity {
    Valid,
    Expired,
}

/// Issues QR payloads valid for a fixed window from the moment of issue.
#[derive(Debug, Clone, Copy)]
pub struct QrCodec {
    validity: Duration,
}

impl Default for QrCodec {
    fn default() -> Self {
        Self::new(Duration::days(DEFAULT_VALIDITY_DAYS))
    }
}

impl QrCodec {
    pub fn new(validity: Duration) -> Self {
        Self { validity }
    }

    pub fn validity(&self) -> Duration {
        self.validity
    }

    pub fn issue(&self, student: &Student, now: DateTime<Utc>) -> QrCodeData {
        QrCodeData {
            id: student.id.clone(),
            registration: student.registration.clone(),
            name: student.name.clone(),
            valid_until: Some(now + self.validity),
        }
    }

    /// Every call stamps a fresh `validUntil`, so two encodings of the same
    /// student are not byte-identical.
    pub fn encode(&self, student: &Student) -> Result<String> {
        let data = self.issue(student, Utc::now());
        Ok(serde_json::to_string(&data)?)
    }
}

pub fn decode(raw: &str) -> Result<QrCodeData> {
    let data: QrCodeData = serde_json::from_str(raw.trim()).map_err(|err| Error::MalformedPayload {
        message: err.to_string(),
    })?;
    for (field, value) in [
        ("id", &data.id),
        ("registration", &data.registration),
        ("name", &data.name),
    ] {
        if value.trim().is_empty() {
            return Err(Error::MalformedPayload {
                message: format!("missing `{}`", field),
            });
        }
    }
    Ok(data)
}

/// A payload without `validUntil` counts as expired.
pub fn check_expiry(payload: &QrCodeData, now: DateTime<Utc>) -> Validity {
    match payload.valid_until {
        Some(valid_until) if now < valid_until => Validity::Valid,
        _ => Validity::Expired,
    }
}

/// Smallest side, in pixels, of a rendered image.
pub const IMAGE_SIZE: u32 = 200;

/// The QR symbol carrying `payload`, at the highest error-correction level.
pub fn symbol(payload: &str) -> Result<QrCode> {
    Ok(QrCode::with_error_correction_level(payload, EcLevel::H)?)
}

pub fn render_svg(code: &QrCode) -> String {
    code.render::<svg::Color>()
        .min_dimensions(IMAGE_SIZE, IMAGE_SIZE)
        .quiet_zone(true)
        .build()
}

/// Block characters for a dark terminal.
pub fn render_terminal(code: &QrCode) -> String {
    code.render::<unicode::Dense1x2>()
        .dark_color(unicode::Dense1x2::Light)
        .light_color(unicode::Dense1x2::Dark)
        .build()
}

/// Renders `payload` into `<dir>/qrcode-<registration>.svg`.
pub fn write_image(dir: &Path, registration: &str, payload: &str) -> Result<PathBuf> {
    let name: String = registration
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
        .collect();
    let path = dir.join(format!("qrcode-{}.svg", name));
    fs::write(&path, render_svg(&symbol(payload)?))?;
    log::info!("Wrote QR image {}", path.display());
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::StudentStatus;

    fn ana() -> Student {
        Student {
            id: "6".to_string(),
            name: "Ana".to_string(),
            registration: "999".to_string(),
            course: "CS".to_string(),
            status: StudentStatus::Active,
            photo: None,
            grade: "1".to_string(),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn decode_recovers_encoded_identity() {
        let before = Utc::now();
        let raw = QrCodec::default().encode(&ana()).unwrap();
        let data = decode(&raw).unwrap();
        assert_eq!(data.id, "6");
        assert_eq!(data.registration, "999");
        assert_eq!(data.name, "Ana");
        assert!(data.valid_until.unwrap() > before);
        assert_eq!(check_expiry(&data, Utc::now()), Validity::Valid);
    }

    #[test]
    fn wire_format_uses_camel_case_iso_dates() {
        let now = Utc::now();
        let data = QrCodec::default().issue(&ana(), now);
        let json: serde_json::Value = serde_json::to_value(&data).unwrap();
        let until = json["validUntil"].as_str().unwrap();
        assert_eq!(
            DateTime::parse_from_rfc3339(until).unwrap(),
            now + Duration::days(365)
        );
    }

    #[test]
    fn expiry_is_strict() {
        let now = Utc::now();
        let mut data = QrCodec::default().issue(&ana(), now);
        data.valid_until = Some(now);
        assert_eq!(check_expiry(&data, now), Validity::Expired);
        data.valid_until = Some(now + Duration::milliseconds(1));
        assert_eq!(check_expiry(&data, now), Validity::Valid);
    }

    #[test]
    fn missing_valid_until_is_expired() {
        let data = decode(r#"{"id":"1","registration":"20210001","name":"João"}"#).unwrap();
        assert_eq!(data.valid_until, None);
        assert_eq!(check_expiry(&data, Utc::now()), Validity::Expired);
    }

    #[test]
    fn rejects_non_json_and_incomplete_payloads() {
        assert!(matches!(decode("hello"), Err(Error::MalformedPayload { .. })));
        assert!(matches!(
            decode(r#"{"id":"1","name":"x"}"#),
            Err(Error::MalformedPayload { .. })
        ));
        assert!(matches!(
            decode(r#"{"id":" ","registration":"1","name":"x"}"#),
            Err(Error::MalformedPayload { .. })
        ));
        assert!(matches!(
            decode(r#"{"id":1,"registration":"1","name":"x"}"#),
            Err(Error::MalformedPayload { .. })
        ));
        assert!(matches!(
            decode(r#"{"id":"1","registration":"1","name":"x","validUntil":"soon"}"#),
            Err(Error::MalformedPayload { .. })
        ));
    }

    #[test]
    fn encodings_differ_over_time() {
        let codec = QrCodec::default();
        let student = ana();
        let first = codec.issue(&student, Utc::now());
        let second = codec.issue(&student, Utc::now() + Duration::seconds(1));
        assert_ne!(first, second);
    }

    #[test]
    fn symbol_is_a_readable_qr_matrix() {
        let raw = QrCodec::default().encode(&ana()).unwrap();
        let code = symbol(&raw).unwrap();
        assert_eq!(code.error_correction_level(), EcLevel::H);
        let width = code.width();
        assert!(width >= 21 && (width - 17) % 4 == 0);
        assert_eq!(code.to_colors().len(), width * width);

        // finder pattern in the top-left corner
        assert_eq!(code[(0, 0)], qrcode::Color::Dark);
        assert_eq!(code[(1, 1)], qrcode::Color::Light);
        assert_eq!(code[(3, 3)], qrcode::Color::Dark);
        assert_eq!(code[(7, 7)], qrcode::Color::Light);

        assert!(render_terminal(&code).lines().count() > width / 2);
    }

    #[test]
    fn image_is_written_per_registration() {
        let dir = tempfile::tempdir().unwrap();
        let raw = QrCodec::default().encode(&ana()).unwrap();
        let path = write_image(dir.path(), "999", &raw).unwrap();
        assert_eq!(path, dir.path().join("qrcode-999.svg"));

        let svg = std::fs::read_to_string(&path).unwrap();
        assert!(svg.contains("<svg"));
        assert_eq!(svg, render_svg(&symbol(&raw).unwrap()));

        let odd = write_image(dir.path(), "../20/21", &raw).unwrap();
        assert_eq!(odd, dir.path().join("qrcode-___20_21.svg"));
    }
}
