//! Append-only line storage for the distributed transaction log.
//!
//! The log layer treats lines as opaque: encoding and replay semantics live
//! in `tpc::log`, storage only persists and returns lines in order.

use crate::error::Result;

use std::io::Write as _;
use std::path::{Path, PathBuf};

/// An append-only line store. Uses a trait object in the log, to allow
/// runtime selection of the engine and avoid generics throughout the
/// protocol code.
pub trait Storage: Send {
    /// Appends a single line, making it durable before returning.
    fn append(&mut self, line: &str) -> Result<()>;

    /// Returns all stored lines, in append order.
    fn read_all(&self) -> Result<Vec<String>>;
}

/// An in-memory line store, primarily for testing.
pub struct Memory {
    lines: Vec<String>,
}

impl Memory {
    pub fn new() -> Self {
        Self { lines: Vec::new() }
    }
}

impl Storage for Memory {
    fn append(&mut self, line: &str) -> Result<()> {
        self.lines.push(line.to_owned());
        Ok(())
    }

    fn read_all(&self) -> Result<Vec<String>> {
        Ok(self.lines.clone())
    }
}

/// A file-backed line store. Each append writes one line and fsyncs it, so
/// that every logged entry survives a crash.
pub struct File {
    path: PathBuf,
    file: std::fs::File,
}

impl File {
    /// Opens (or creates) the store at the given path.
    pub fn new(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        let file = std::fs::OpenOptions::new().append(true).create(true).open(&path)?;
        Ok(Self { path, file })
    }
}

impl Storage for File {
    fn append(&mut self, line: &str) -> Result<()> {
        writeln!(self.file, "{line}")?;
        self.file.sync_all()?;
        Ok(())
    }

    fn read_all(&self) -> Result<Vec<String>> {
        let contents = std::fs::read_to_string(&self.path)?;
        Ok(contents.lines().map(String::from).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn memory_append_read() -> Result<()> {
        let mut engine = Memory::new();
        assert_eq!(engine.read_all()?, Vec::<String>::new());
        engine.append("first")?;
        engine.append("second")?;
        assert_eq!(engine.read_all()?, vec!["first".to_owned(), "second".to_owned()]);
        Ok(())
    }

    #[test]
    fn file_append_read() -> Result<()> {
        let dir = tempfile::TempDir::with_prefix("trikv")?;
        let path = dir.path().join("dtlog");
        let mut engine = File::new(&path)?;
        engine.append("first")?;
        engine.append("second")?;
        assert_eq!(engine.read_all()?, vec!["first".to_owned(), "second".to_owned()]);

        // Reopening preserves the contents.
        drop(engine);
        let engine = File::new(&path)?;
        assert_eq!(engine.read_all()?, vec!["first".to_owned(), "second".to_owned()]);
        Ok(())
    }
}
