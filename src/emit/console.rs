use std::io::{self, Stdout, Write};

use chrono::Local;

use crate::emit::Emitter;
use crate::errors::EmitError;
use crate::snapshot::Snapshot;

const RULE: &str = "-------------------------------------------";

/// Human-readable mirror of each snapshot.
///
/// Prints a `Time:` banner followed by the first `max_entries` words as `(word,count)`, and
/// `...` when the snapshot holds more. With `raw_json` set, the wire payload is printed instead.
pub struct ConsoleEmitter<W: Write + Send = Stdout> {
    out: W,
    max_entries: usize,
    raw_json: bool,
}

impl ConsoleEmitter<Stdout> {
    #[must_use]
    pub fn stdout() -> Self {
        Self::new(io::stdout())
    }
}

impl<W: Write + Send> ConsoleEmitter<W> {
    pub fn new(out: W) -> Self {
        Self {
            out,
            max_entries: 10,
            raw_json: false,
        }
    }

    #[must_use]
    pub fn max_entries(mut self, n: usize) -> Self {
        self.max_entries = n;
        self
    }

    #[must_use]
    pub fn raw_json(mut self, raw: bool) -> Self {
        self.raw_json = raw;
        self
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}

impl<W: Write + Send> Emitter for ConsoleEmitter<W> {
    fn publish(&mut self, snapshot: &Snapshot) -> Result<(), EmitError> {
        if self.raw_json {
            writeln!(self.out, "{}", snapshot.to_json()?)?;
            return Ok(());
        }
        writeln!(self.out, "{RULE}")?;
        writeln!(
            self.out,
            "Time: {} (batch {})",
            Local::now().format("%Y-%m-%d %H:%M:%S"),
            snapshot.batch_id()
        )?;
        writeln!(self.out, "{RULE}")?;
        for (word, count) in snapshot.iter().take(self.max_entries) {
            writeln!(self.out, "({word},{count})")?;
        }
        if snapshot.len() > self.max_entries {
            writeln!(self.out, "...")?;
        }
        writeln!(self.out)?;
        self.out.flush()?;
        Ok(())
    }

    fn name(&self) -> &'static str {
        "console"
    }

    fn flush(&mut self) -> Result<(), EmitError> {
        Ok(self.out.flush()?)
    }
}
