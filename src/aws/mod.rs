use chrono::{DateTime, Utc};

pub mod credentials;
pub mod sts;

/// Temporary credentials as returned by STS. Held in memory only; the
/// credentials file is the single place they are persisted to.
#[derive(Debug, Clone, PartialEq)]
pub struct Credentials {
    pub access_key_id: String,
    pub secret_access_key: String,
    pub session_token: String,
    pub expiration: Option<DateTime<Utc>>,
}
