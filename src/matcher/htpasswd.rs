//! htpasswd-style password files for basic-auth conditions.
//!
//! Supported entry formats: plaintext and `{SHA}` (base64 of the raw
//! SHA-1 digest). Anything else fails at load time so a misconfigured
//! file is caught at startup rather than silently rejecting every user.

use std::collections::HashMap;
use std::path::Path;

use base64::Engine;
use sha1::{Digest, Sha1};

use crate::error::{GantryError, GantryResult};

/// A loaded password file
#[derive(Debug, Clone, Default)]
pub struct PasswdFile {
    entries: HashMap<String, String>,
}

impl PasswdFile {
    /// Load from disk. Blank lines and `#` comments are skipped.
    pub fn load<P: AsRef<Path>>(path: P) -> GantryResult<PasswdFile> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            GantryError::config(format!(
                "cannot read password file {}: {}",
                path.as_ref().display(),
                e
            ))
        })?;
        Self::parse(&content).map_err(|e| match e {
            GantryError::Config { message } => GantryError::config(format!(
                "{}: {}",
                path.as_ref().display(),
                message
            )),
            other => other,
        })
    }

    /// Parse htpasswd content
    pub fn parse(content: &str) -> GantryResult<PasswdFile> {
        let mut entries = HashMap::new();
        for (lineno, line) in content.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let (user, hash) = line.split_once(':').ok_or_else(|| {
                GantryError::config(format!("line {}: missing colon", lineno + 1))
            })?;
            if hash.starts_with("$apr1$") || hash.starts_with("$2y$") || hash.starts_with("$2b$")
            {
                return Err(GantryError::config(format!(
                    "line {}: unsupported password hash format",
                    lineno + 1
                )));
            }
            entries.insert(user.to_string(), hash.to_string());
        }
        Ok(PasswdFile { entries })
    }

    /// Verify a user/password pair
    pub fn verify(&self, user: &str, password: &str) -> bool {
        let stored = match self.entries.get(user) {
            Some(s) => s,
            None => return false,
        };
        if let Some(b64) = stored.strip_prefix("{SHA}") {
            let digest = Sha1::digest(password.as_bytes());
            let computed = base64::engine::general_purpose::STANDARD.encode(digest);
            return constant_eq(computed.as_bytes(), b64.as_bytes());
        }
        constant_eq(stored.as_bytes(), password.as_bytes())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Compare without early exit on the first differing byte
fn constant_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b.iter()).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}
