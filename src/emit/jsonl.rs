use std::fs::{File, OpenOptions, create_dir_all};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use crate::emit::Emitter;
use crate::errors::EmitError;
use crate::snapshot::Snapshot;

/// Appends one JSON array per snapshot to a file, one per line.
pub struct JsonlEmitter {
    path: PathBuf,
    writer: BufWriter<File>,
}

impl JsonlEmitter {
    /// Open `path` for appending, creating parent directories as needed.
    ///
    /// # Errors
    /// Returns an error if the file or its parent directory cannot be created.
    pub fn append(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            create_dir_all(parent).with_context(|| format!("create {}", parent.display()))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("open {}", path.display()))?;
        Ok(Self {
            path,
            writer: BufWriter::new(file),
        })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Emitter for JsonlEmitter {
    fn publish(&mut self, snapshot: &Snapshot) -> Result<(), EmitError> {
        serde_json::to_writer(&mut self.writer, snapshot)?;
        self.writer.write_all(b"\n")?;
        self.writer.flush()?;
        Ok(())
    }

    fn name(&self) -> &'static str {
        "jsonl"
    }

    fn flush(&mut self) -> Result<(), EmitError> {
        self.writer.flush()?;
        self.writer.get_ref().sync_data()?;
        Ok(())
    }
}
