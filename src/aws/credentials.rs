use std::error::Error;
use std::fmt::{self, Display, Formatter};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use ini::Ini;
use log::{debug, trace};
use tokio::sync::Mutex;

use super::Credentials;

#[derive(Debug)]
pub enum CredentialsFileError {
    NoHomeDir,
    Io(io::Error),
    Ini(ini::Error),
}

impl Display for CredentialsFileError {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        match self {
            CredentialsFileError::NoHomeDir => {
                f.write_str("could not determine the home directory")
            }
            CredentialsFileError::Io(e) => write!(f, "credentials file error: {}", e),
            CredentialsFileError::Ini(e) => write!(f, "could not parse credentials file: {}", e),
        }
    }
}

impl Error for CredentialsFileError {}

impl From<io::Error> for CredentialsFileError {
    fn from(e: io::Error) -> Self {
        CredentialsFileError::Io(e)
    }
}

impl From<ini::Error> for CredentialsFileError {
    fn from(e: ini::Error) -> Self {
        CredentialsFileError::Ini(e)
    }
}

/// Upserts the three credential keys of `profile` into the store at `path`.
///
/// The file is parsed in full and rewritten in full: unrelated sections and
/// any extra keys inside the touched section survive each call, so several
/// profiles can be written one after another into the same file. A missing
/// file is treated as an empty store; a missing parent directory is created.
pub fn save_profile(
    path: &Path,
    profile: &str,
    credentials: &Credentials,
) -> Result<(), CredentialsFileError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    let mut store = if path.exists() {
        Ini::load_from_file(path)?
    } else {
        debug!("no credentials file at {}, starting empty", path.display());
        Ini::new()
    };

    store
        .with_section(Some(profile))
        .set("aws_access_key_id", &credentials.access_key_id)
        .set("aws_secret_access_key", &credentials.secret_access_key)
        .set("aws_session_token", &credentials.session_token);

    store.write_to_file(path)?;

    trace!("save_profile.wrote profile={} path={}", profile, path.display());

    Ok(())
}

/// Handle on the shared credentials file. Writers from concurrently running
/// role exchanges are serialized behind one lock so that the read-modify-write
/// cycles cannot lose each other's updates.
pub struct CredentialsFile {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl CredentialsFile {
    pub fn new(path: PathBuf) -> Self {
        CredentialsFile {
            path,
            write_lock: Mutex::new(()),
        }
    }

    /// The conventional `$HOME/.aws/credentials` location.
    pub fn default_location() -> Result<Self, CredentialsFileError> {
        let home = dirs::home_dir().ok_or(CredentialsFileError::NoHomeDir)?;

        Ok(Self::new(home.join(".aws").join("credentials")))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn save_profile(
        &self,
        profile: &str,
        credentials: &Credentials,
    ) -> Result<(), CredentialsFileError> {
        let _guard = self.write_lock.lock().await;

        save_profile(&self.path, profile, credentials)
    }
}
