//! Versioned scoring rubric.

use std::path::Path;

use sha2::{Digest, Sha256};

use crate::error::ConfigError;

/// Rubric text plus its content hash. Any edit to the text changes the version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rubric {
    text: String,
    version: String,
}

impl Rubric {
    pub fn from_text(text: impl Into<String>) -> Self {
        let text = text.into();
        let digest = Sha256::digest(text.as_bytes());
        let mut version = hex::encode(digest);
        version.truncate(16);
        Self { text, version }
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => ConfigError::MissingRequired {
                key: "scoring.rubric_path".into(),
                hint: format!("rubric file {} does not exist", path.display()),
            },
            _ => ConfigError::Io(e),
        })?;
        Ok(Self::from_text(text))
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    /// First 16 hex chars of the SHA-256 of the text.
    pub fn version(&self) -> &str {
        &self.version
    }
}
