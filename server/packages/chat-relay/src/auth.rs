//! API keys accepted by the token guard.
//!
//! Keys live one per line in a plain text file; blank lines and lines
//! starting with `#` are ignored. Changes made through the management routes
//! are written back to the file, leaving other lines untouched. An empty
//! store means authentication is off.

use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use chat_relay_error::RelayError;

pub const MIN_KEY_LEN: usize = 8;

#[derive(Debug, Default)]
pub struct ApiKeyStore {
    path: Option<PathBuf>,
    keys: RwLock<Vec<String>>,
}

impl ApiKeyStore {
    /// A store that is never written to disk.
    pub fn in_memory<I>(keys: I) -> Self
    where
        I: IntoIterator<Item = String>,
    {
        let store = Self::default();
        for key in keys {
            store.remember(key);
        }
        store
    }

    /// Loads the key file at `path`. A missing file is an empty store that
    /// will be created on the first added key.
    pub fn load(path: PathBuf) -> io::Result<Self> {
        let keys = match std::fs::read_to_string(&path) {
            Ok(contents) => parse_keys(&contents),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Vec::new(),
            Err(err) => return Err(err),
        };
        tracing::info!(path = %path.display(), count = keys.len(), "loaded api keys");
        Ok(Self {
            path: Some(path),
            keys: RwLock::new(keys),
        })
    }

    fn read(&self) -> RwLockReadGuard<'_, Vec<String>> {
        self.keys
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Vec<String>> {
        self.keys
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn is_enabled(&self) -> bool {
        !self.read().is_empty()
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    pub fn keys(&self) -> Vec<String> {
        self.read().clone()
    }

    pub fn verify(&self, candidate: &str) -> bool {
        let candidate = candidate.trim();
        !candidate.is_empty() && self.read().iter().any(|key| key == candidate)
    }

    /// Accepts `key` for this process only.
    pub fn remember(&self, key: String) {
        let key = key.trim().to_string();
        if key.is_empty() {
            return;
        }
        let mut keys = self.write();
        if !keys.contains(&key) {
            keys.push(key);
        }
    }

    /// Adds and persists `key`. Returns the new key count.
    pub fn add(&self, key: &str) -> Result<usize, RelayError> {
        let key = key.trim();
        if key.chars().count() < MIN_KEY_LEN {
            return Err(RelayError::invalid_request(format!(
                "api key must be at least {MIN_KEY_LEN} characters"
            )));
        }
        let mut keys = self.write();
        if keys.iter().any(|existing| existing == key) {
            return Err(RelayError::invalid_request("api key already exists"));
        }
        if let Some(path) = &self.path {
            append_key(path, key).map_err(|err| file_error(path, err))?;
        }
        keys.push(key.to_string());
        tracing::info!(key = %mask(key), count = keys.len(), "api key added");
        Ok(keys.len())
    }

    /// Removes and un-persists `key`. Returns the new key count.
    pub fn remove(&self, key: &str) -> Result<usize, RelayError> {
        let key = key.trim();
        if key.is_empty() {
            return Err(RelayError::invalid_request("api key must not be empty"));
        }
        let mut keys = self.write();
        let Some(position) = keys.iter().position(|existing| existing == key) else {
            return Err(RelayError::KeyNotFound);
        };
        if let Some(path) = &self.path {
            strip_key(path, key).map_err(|err| file_error(path, err))?;
        }
        keys.remove(position);
        tracing::info!(key = %mask(key), count = keys.len(), "api key removed");
        Ok(keys.len())
    }
}

fn parse_keys(contents: &str) -> Vec<String> {
    let mut keys: Vec<String> = Vec::new();
    for line in contents.lines().map(str::trim) {
        if line.is_empty() || line.starts_with('#') || keys.iter().any(|key| key == line) {
            continue;
        }
        keys.push(line.to_string());
    }
    keys
}

fn append_key(path: &Path, key: &str) -> io::Result<()> {
    let existing = match std::fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(err) if err.kind() == io::ErrorKind::NotFound => String::new(),
        Err(err) => return Err(err),
    };
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)?;
    if !existing.is_empty() && !existing.ends_with('\n') {
        file.write_all(b"\n")?;
    }
    writeln!(file, "{key}")
}

fn strip_key(path: &Path, key: &str) -> io::Result<()> {
    let contents = match std::fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(err) => return Err(err),
    };
    let kept: String = contents
        .lines()
        .filter(|line| line.trim() != key)
        .map(|line| format!("{line}\n"))
        .collect();
    std::fs::write(path, kept)
}

fn file_error(path: &Path, err: io::Error) -> RelayError {
    tracing::error!(path = %path.display(), error = %err, "failed to update api key file");
    RelayError::internal(format!("failed to update api key file: {err}"))
}

/// First and last four characters, for logs.
pub fn mask(key: &str) -> String {
    let chars: Vec<char> = key.chars().collect();
    if chars.len() <= MIN_KEY_LEN {
        return "****".to_string();
    }
    let head: String = chars[..4].iter().collect();
    let tail: String = chars[chars.len() - 4..].iter().collect();
    format!("{head}...{tail}")
}
