//! Per-session diagnostic log ("variance file").
//!
//! Tab-separated, gnuplot friendly: two `#` header lines followed by one row
//! per health check. Rows are written through a [`VarRecord`] guard that
//! terminates and flushes the row when dropped, so a health check that bails
//! out early still leaves its (shorter) row in the file.

use std::fmt::Display;
use std::fs::File;
use std::io::Write;
use std::path::Path;

use anyhow::{Context, Result};
use csv::{Writer, WriterBuilder};
use tracing::warn;

use crate::health::statistics::AXIS_NAMES;

/// Which optional column groups are present in each row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VarLogColumns {
    /// `mbt_range` column.
    pub dynamic_range: bool,
    /// `pose_*` columns.
    pub pose: bool,
    /// Number of `checkpoint_<i>` columns (0 when checkpoints are not logged).
    pub checkpoints: usize,
}

impl VarLogColumns {
    /// Column names, in row order.
    pub fn header(&self) -> Vec<String> {
        let mut names = vec!["#iteration".to_string()];
        names.extend(AXIS_NAMES.iter().map(|axis| format!("var_{axis}")));
        if self.dynamic_range {
            names.push("mbt_range".to_string());
        }
        if self.pose {
            for name in ["tx", "ty", "tz", "rx", "ry", "rz"] {
                names.push(format!("pose_{name}"));
            }
        }
        for i in 0..self.checkpoints {
            names.push(format!("checkpoint_{i}"));
        }
        names
    }
}

/// Append-only diagnostic log.
pub struct VarLog<W: Write = File> {
    writer: Writer<W>,
    columns: VarLogColumns,
    rows: u64,
}

impl VarLog<File> {
    /// Create (truncate) the log file and write its header.
    pub fn create<P: AsRef<Path>>(path: P, columns: VarLogColumns) -> Result<Self> {
        let path = path.as_ref();
        let file = File::create(path)
            .with_context(|| format!("Failed to create variance file {:?}", path))?;
        Self::from_writer(file, columns)
    }
}

impl<W: Write> VarLog<W> {
    pub fn from_writer(inner: W, columns: VarLogColumns) -> Result<Self> {
        let mut writer = WriterBuilder::new()
            .delimiter(b'\t')
            .has_headers(false)
            .flexible(true)
            .from_writer(inner);

        writer.write_record(["#These are variances from the model based tracker in gnuplot format"])?;
        writer.write_record(columns.header())?;
        writer.flush()?;

        Ok(Self {
            writer,
            columns,
            rows: 0,
        })
    }

    pub fn columns(&self) -> &VarLogColumns {
        &self.columns
    }

    /// Number of rows written so far.
    pub fn rows(&self) -> u64 {
        self.rows
    }

    /// Start a new row.
    pub fn record(&mut self) -> VarRecord<'_, W> {
        VarRecord {
            log: self,
            fields: 0,
            failed: false,
        }
    }

    /// Flush and return the underlying writer.
    pub fn into_inner(self) -> Result<W> {
        self.writer
            .into_inner()
            .map_err(|e| anyhow::anyhow!("Failed to flush variance file: {}", e.error()))
    }
}

/// One row of the diagnostic log; finished on drop.
pub struct VarRecord<'a, W: Write = File> {
    log: &'a mut VarLog<W>,
    fields: usize,
    failed: bool,
}

impl<W: Write> VarRecord<'_, W> {
    pub fn write<T: Display>(&mut self, value: T) {
        if self.failed {
            return;
        }
        if let Err(e) = self.log.writer.write_field(value.to_string()) {
            warn!("Failed to write variance field: {}", e);
            self.failed = true;
            return;
        }
        self.fields += 1;
    }

    pub fn fields(&self) -> usize {
        self.fields
    }
}

impl<W: Write> Drop for VarRecord<'_, W> {
    fn drop(&mut self) {
        let finished = self
            .log
            .writer
            .write_record(None::<&[u8]>)
            .and_then(|_| self.log.writer.flush().map_err(csv::Error::from));
        match finished {
            Ok(()) => self.log.rows += 1,
            Err(e) => warn!("Failed to finish variance row: {}", e),
        }
    }
}
