use chrono::{DateTime, Duration, Utc};
use pbkdf2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use pbkdf2::Pbkdf2;
use rand::{thread_rng, Rng};
use rand_core::OsRng;
use serde::{Deserialize, Serialize, Serializer};
use sha2::{Digest, Sha256};
use std::ops::Add;

use crate::err::{Error, Result};
use crate::io::{load_collection, save_collection, SharedStorage};

pub const SESSIONS_KEY: &str = "escola_qr_operator_sessions";

#[derive(Debug, Clone, Eq, Ord, PartialOrd, PartialEq)]
pub enum AuthResult {
    Success,
    SessionExpired,
    InvalidSession,
}

impl Serialize for AuthResult {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&format!("{:?}", self))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Admin,
    Gatekeeper,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Admin => "admin",
            Role::Gatekeeper => "gatekeeper",
        }
    }

    /// Admins may do anything a gatekeeper may.
    pub fn permits(&self, required: Role) -> bool {
        matches!((self, required), (Role::Admin, _) | (Role::Gatekeeper, Role::Gatekeeper))
    }
}

#[derive(Debug, Clone)]
pub struct Operator {
    pub username: String,
    pub display_name: String,
    pub role: Role,
    pub password_hash: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperatorSession {
    pub token: String,
    pub username: String,
    pub display_name: String,
    pub role: Role,
    pub expires_at: DateTime<Utc>,
}

pub fn hash_password(password: &str) -> Result<String> {
    if password.is_empty() {
        return Err(Error::AuthenticationFailure {
            message: "Provided password was empty!".to_string(),
        });
    }
    Ok(Pbkdf2
        .hash_password(password.as_bytes(), &SaltString::generate(&mut OsRng))
        .map_err(|err| Error::InternalError {
            kind: "PasswordHashError",
            message: err.to_string(),
        })?
        .to_string())
}

fn verify_password(password: &str, password_hash: &str) -> Result<bool> {
    let hash = PasswordHash::new(password_hash).map_err(|err| Error::InternalError {
        kind: "PasswordHashError",
        message: err.to_string(),
    })?;
    Ok(Pbkdf2.verify_password(password.as_bytes(), &hash).is_ok())
}

fn new_token() -> String {
    let ssid_bytes: [u8; 32] = thread_rng().gen();
    let mut hasher: Sha256 = Digest::new();
    hasher.update(ssid_bytes);
    hex::encode(hasher.finalize())
}

/// Operator accounts plus their persisted login sessions.
#[derive(Clone)]
pub struct Authenticator {
    storage: SharedStorage,
    operators: Vec<Operator>,
    ttl: Duration,
}

impl Authenticator {
    pub fn new(storage: SharedStorage, operators: Vec<Operator>, ttl: Duration) -> Self {
        Self {
            storage,
            operators,
            ttl,
        }
    }

    /// The two accounts the front-end shipped with. `admin_hash` and
    /// `gatekeeper_hash` replace the built-in passwords when given.
    pub fn default_operators(
        admin_hash: Option<String>,
        gatekeeper_hash: Option<String>,
    ) -> Result<Vec<Operator>> {
        let admin_hash = match admin_hash {
            Some(hash) => hash,
            None => {
                log::warn!("Using the built-in password for operator `admin`");
                hash_password("admin123")?
            }
        };
        let gatekeeper_hash = match gatekeeper_hash {
            Some(hash) => hash,
            None => {
                log::warn!("Using the built-in password for operator `porteiro`");
                hash_password("porteiro123")?
            }
        };
        Ok(vec![
            Operator {
                username: "admin".to_string(),
                display_name: "Administrador".to_string(),
                role: Role::Admin,
                password_hash: admin_hash,
            },
            Operator {
                username: "porteiro".to_string(),
                display_name: "Porteiro".to_string(),
                role: Role::Gatekeeper,
                password_hash: gatekeeper_hash,
            },
        ])
    }

    fn sessions(&self) -> Result<Vec<OperatorSession>> {
        load_collection(&*self.storage, SESSIONS_KEY)
    }

    fn save_sessions(&self, sessions: &[OperatorSession]) -> Result<()> {
        if sessions.is_empty() {
            return self.storage.remove(SESSIONS_KEY);
        }
        save_collection(&*self.storage, SESSIONS_KEY, sessions)
    }

    pub fn login(&self, username: &str, password: &str, role: Role) -> Result<OperatorSession> {
        if password.is_empty() {
            return Err(Error::AuthenticationFailure {
                message: "`password` parameter was empty".to_string(),
            });
        }
        let operator = self
            .operators
            .iter()
            .find(|operator| operator.username == username)
            .ok_or_else(|| Error::AuthenticationFailure {
                message: format!("Operator `{}` does not exist!", username),
            })?;
        if !verify_password(password, &operator.password_hash)? {
            return Err(Error::AuthenticationFailure {
                message: "Passwords do not match!".to_string(),
            });
        }
        if operator.role != role {
            return Err(Error::AuthenticationFailure {
                message: format!("Operator `{}` is not a {}", username, role.as_str()),
            });
        }

        let now = Utc::now();
        let mut sessions = self.sessions()?;
        sessions.retain(|session| session.expires_at > now);
        if let Some(existing) = sessions.iter().find(|s| s.username == operator.username) {
            // already authenticated
            return Ok(existing.clone());
        }

        let session = OperatorSession {
            token: new_token(),
            username: operator.username.clone(),
            display_name: operator.display_name.clone(),
            role: operator.role,
            expires_at: now.add(self.ttl),
        };
        sessions.push(session.clone());
        self.save_sessions(&sessions)?;
        log::info!("Operator {} logged in as {}", operator.username, role.as_str());
        Ok(session)
    }

    pub fn ensure_authenticated(&self, token: Option<&str>) -> Result<AuthResult> {
        let token = match token {
            Some(token) if !token.is_empty() => token,
            _ => return Ok(AuthResult::InvalidSession),
        };
        let mut sessions = self.sessions()?;
        let session = match sessions.iter().position(|s| s.token == token) {
            Some(index) => index,
            None => return Ok(AuthResult::InvalidSession),
        };
        if Utc::now().gt(&sessions[session].expires_at) {
            sessions.remove(session);
            self.save_sessions(&sessions)?;
            return Ok(AuthResult::SessionExpired);
        }
        Ok(AuthResult::Success)
    }

    /// Resolves `token` to a live session whose role permits `required`.
    pub fn authorize(&self, token: Option<&str>, required: Role) -> Result<OperatorSession> {
        match self.ensure_authenticated(token)? {
            AuthResult::Success => {}
            AuthResult::SessionExpired => return Err(Error::SessionExpired),
            AuthResult::InvalidSession => return Err(Error::InvalidSession),
        }
        let session = self
            .sessions()?
            .into_iter()
            .find(|s| Some(s.token.as_str()) == token)
            .ok_or(Error::InvalidSession)?;
        if !session.role.permits(required) {
            return Err(Error::PermissionDenied {
                required: required.as_str(),
            });
        }
        Ok(session)
    }

    pub fn logout(&self, token: &str) -> Result<bool> {
        let mut sessions = self.sessions()?;
        let before = sessions.len();
        sessions.retain(|session| session.token != token);
        if sessions.len() == before {
            return Ok(false);
        }
        self.save_sessions(&sessions)?;
        Ok(true)
    }
}
