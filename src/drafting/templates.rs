//! Vetted reply templates, one per account and score bucket.

use std::collections::HashMap;
use std::path::PathBuf;

use crate::error::DraftError;

enum Source {
    Dir(PathBuf),
    Memory(HashMap<(String, String), String>),
}

/// Looks up `{dir}/{account}/{bucket}.md`, or an in-memory table.
pub struct TemplateStore {
    source: Source,
}

impl TemplateStore {
    pub fn from_dir(dir: impl Into<PathBuf>) -> Self {
        Self {
            source: Source::Dir(dir.into()),
        }
    }

    pub fn in_memory() -> Self {
        Self {
            source: Source::Memory(HashMap::new()),
        }
    }

    /// Add a template to an in-memory store. No effect on a directory store.
    pub fn with_template(mut self, account: &str, bucket: &str, text: &str) -> Self {
        if let Source::Memory(map) = &mut self.source {
            map.insert((account.to_string(), bucket.to_string()), text.to_string());
        }
        self
    }

    pub fn get(&self, account: &str, bucket: &str) -> Result<String, DraftError> {
        let missing = || DraftError::TemplateMissing {
            account: account.to_string(),
            bucket: bucket.to_string(),
        };
        if !is_safe_segment(account) || !is_safe_segment(bucket) {
            return Err(missing());
        }

        let text = match &self.source {
            Source::Memory(map) => map
                .get(&(account.to_string(), bucket.to_string()))
                .cloned()
                .ok_or_else(missing)?,
            Source::Dir(dir) => {
                let path = dir.join(account).join(format!("{bucket}.md"));
                match std::fs::read_to_string(&path) {
                    Ok(text) => text,
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Err(missing()),
                    Err(e) => return Err(DraftError::Io(e)),
                }
            }
        };
        if text.trim().is_empty() {
            return Err(missing());
        }
        Ok(text)
    }
}

fn is_safe_segment(s: &str) -> bool {
    !s.is_empty()
        && s != "."
        && s != ".."
        && s.chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')
}
