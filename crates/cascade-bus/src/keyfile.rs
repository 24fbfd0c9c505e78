//! Keyfiles identify the broker and tenant a process acts as.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::BusError;

/// Broker location and account identity, loaded from a JSON keyfile.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyFile {
    nats_url: String,
    account_id: String,
}

impl KeyFile {
    #[must_use]
    pub fn new(nats_url: impl Into<String>, account_id: impl Into<String>) -> Self {
        Self {
            nats_url: nats_url.into(),
            account_id: account_id.into(),
        }
    }

    /// Load a keyfile from disk.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::Keyfile`] when the file cannot be read or parsed.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, BusError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .map_err(|err| BusError::Keyfile(format!("{}: {err}", path.display())))?;

        serde_json::from_str(&content)
            .map_err(|err| BusError::Keyfile(format!("{}: {err}", path.display())))
    }

    #[must_use]
    pub fn nats_url(&self) -> &str {
        &self.nats_url
    }

    #[must_use]
    pub fn account_id(&self) -> &str {
        &self.account_id
    }
}
