//! Student access control around QR identity codes: a persisted roster, an
//! append-only access log, the QR payload codec and the scan session that
//! turns one camera read into an admit-or-deny decision.

pub mod auth;
pub mod camera;
pub mod codec;
pub mod config;
pub mod directory;
pub mod err;
pub mod gate;
pub mod io;
pub mod ledger;
pub mod models;
pub mod scanner;

pub use crate::err::{Error, Result};
