//! Known subjects. Each subject is a directory under the data directory, and
//! that directory holds all of the subject's session logs.

use crate::error::LoggerError;
use crate::session::validate_subject_id;

use log::info;
use std::{
    fs, io,
    path::PathBuf,
};

/// Lists and creates subject ids.
pub trait SubjectRegistry {
    /// Every known subject, sorted.
    fn subjects(&self) -> Result<Vec<String>, LoggerError>;

    /// Registers a new subject. Fails on an invalid or existing id.
    fn add(&mut self, subject_id: &str) -> Result<(), LoggerError>;
}

/// A [`SubjectRegistry`] backed by the sub-directories of a data directory.
#[derive(Debug, Clone)]
pub struct DirectoryRegistry {
    root: PathBuf,
}

impl DirectoryRegistry {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// The directory a subject's logs go in.
    pub fn subject_dir(&self, subject_id: &str) -> PathBuf {
        self.root.join(subject_id)
    }
}

impl SubjectRegistry for DirectoryRegistry {
    fn subjects(&self) -> Result<Vec<String>, LoggerError> {
        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut subjects = Vec::new();
        for entry in entries {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                if let Some(name) = entry.file_name().to_str() {
                    subjects.push(name.to_owned());
                }
            }
        }
        subjects.sort();
        Ok(subjects)
    }

    fn add(&mut self, subject_id: &str) -> Result<(), LoggerError> {
        validate_subject_id(subject_id)?;
        let dir = self.subject_dir(subject_id);
        if dir.exists() {
            return Err(LoggerError::InvalidConfig(format!(
                "subject {} already exists",
                subject_id
            )));
        }
        fs::create_dir_all(&dir)?;
        info!("Added subject {}", subject_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subjects_are_directories() {
        let dir = tempfile::tempdir().unwrap();
        let mut registry = DirectoryRegistry::new(dir.path().join("data"));
        assert!(registry.subjects().unwrap().is_empty());

        registry.add("m2").unwrap();
        registry.add("m1").unwrap();
        fs::write(dir.path().join("data").join("stray.csv"), "").unwrap();

        assert_eq!(registry.subjects().unwrap(), vec!["m1", "m2"]);
    }

    #[test]
    fn bad_ids_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut registry = DirectoryRegistry::new(dir.path());
        registry.add("m1").unwrap();

        for bad in ["m1", "", "../m3", "a/b"] {
            assert!(
                matches!(registry.add(bad), Err(LoggerError::InvalidConfig(_))),
                "{:?} was accepted",
                bad
            );
        }
        assert_eq!(registry.subjects().unwrap(), vec!["m1"]);
    }
}
