use std::fs;
use std::path::PathBuf;
use std::sync::Mutex;

use crate::error::Result;
use crate::security::path_policy::expand_path;

fn normalize_command(command: &str) -> String {
    command.trim().to_lowercase()
}

/// File-backed set of commands the user has permanently allowlisted via
/// an `AllowAlways` decision. Entries are case-insensitive, trimmed, and
/// de-duplicated on load and on `add`.
pub struct ApprovalStore {
    path: PathBuf,
    entries: Mutex<Vec<String>>,
}

impl ApprovalStore {
    pub fn new(path: impl AsRef<str>) -> Self {
        Self {
            path: PathBuf::from(expand_path(path.as_ref())),
            entries: Mutex::new(Vec::new()),
        }
    }

    pub fn from_path(path: PathBuf) -> Self {
        Self {
            path,
            entries: Mutex::new(Vec::new()),
        }
    }

    pub fn load(&self) -> Result<()> {
        let mut entries = self.entries.lock().expect("approval store mutex poisoned");
        entries.clear();

        let contents = match fs::read_to_string(&self.path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };

        for line in contents.lines() {
            let normalized = normalize_command(line);
            if normalized.is_empty() {
                continue;
            }
            if !entries.contains(&normalized) {
                entries.push(normalized);
            }
        }
        Ok(())
    }

    pub fn save(&self) -> Result<()> {
        let entries = self.entries.lock().expect("approval store mutex poisoned");
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut contents = String::new();
        for entry in entries.iter() {
            contents.push_str(entry);
            contents.push('\n');
        }

        let tmp_path = self.path.with_extension("tmp");
        fs::write(&tmp_path, contents)?;
        fs::rename(&tmp_path, &self.path)?;
        Ok(())
    }

    pub fn contains(&self, command: &str) -> bool {
        let normalized = normalize_command(command);
        if normalized.is_empty() {
            return false;
        }
        let entries = self.entries.lock().expect("approval store mutex poisoned");
        entries.contains(&normalized)
    }

    pub fn entries(&self) -> Vec<String> {
        self.entries
            .lock()
            .expect("approval store mutex poisoned")
            .clone()
    }

    pub fn add(&self, command: &str) {
        let normalized = normalize_command(command);
        if normalized.is_empty() {
            return;
        }
        let mut entries = self.entries.lock().expect("approval store mutex poisoned");
        if !entries.contains(&normalized) {
            entries.push(normalized);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn add_then_save_then_load_round_trips() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("allowlist.txt");

        let store = ApprovalStore::from_path(path.clone());
        store.load().unwrap();
        store.add("  Ls -la  ");
        store.add("ls -la");
        assert_eq!(store.entries().len(), 1);
        store.save().unwrap();

        let reloaded = ApprovalStore::from_path(path);
        reloaded.load().unwrap();
        assert!(reloaded.contains("LS -LA"));
    }

    #[test]
    fn load_missing_file_is_not_an_error() {
        let dir = TempDir::new().unwrap();
        let store = ApprovalStore::from_path(dir.path().join("missing.txt"));
        assert!(store.load().is_ok());
        assert!(store.entries().is_empty());
    }
}
