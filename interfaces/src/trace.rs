//! PDU Trace
//!
//! One JSON object per line for every PDU that crossed a [`RadioLink`].
//!
//! [`RadioLink`]: crate::link::RadioLink

use crate::link::LinkOutcome;
use crate::InterfaceError;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

/// Trace record of a single PDU
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PduTrace {
    /// Simulation time in milliseconds
    pub t_ms: u64,
    /// Link name
    pub link: String,
    /// PDU size in bytes
    pub len: usize,
    /// Decoded header
    pub summary: String,
    pub outcome: LinkOutcome,
}

/// JSON-lines writer for [`PduTrace`] records
pub struct TraceWriter<W: Write> {
    out: W,
    records: u64,
}

impl TraceWriter<BufWriter<File>> {
    /// Create (or truncate) a trace file
    pub fn create(path: impl AsRef<Path>) -> Result<Self, InterfaceError> {
        let file = File::create(path)?;
        Ok(Self::new(BufWriter::new(file)))
    }
}

impl<W: Write> TraceWriter<W> {
    pub fn new(out: W) -> Self {
        Self { out, records: 0 }
    }

    pub fn write(&mut self, record: &PduTrace) -> Result<(), InterfaceError> {
        serde_json::to_writer(&mut self.out, record)?;
        self.out.write_all(b"\n")?;
        self.records += 1;
        Ok(())
    }

    pub fn flush(&mut self) -> Result<(), InterfaceError> {
        self.out.flush()?;
        Ok(())
    }

    /// Records written so far
    pub fn records(&self) -> u64 {
        self.records
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_json_lines() {
        let mut writer = TraceWriter::new(Vec::new());
        for t_ms in 0..2 {
            writer
                .write(&PduTrace {
                    t_ms,
                    link: "dl".to_string(),
                    len: 3,
                    summary: "[DATA SN=0]".to_string(),
                    outcome: LinkOutcome::Dropped,
                })
                .unwrap();
        }
        assert_eq!(writer.records(), 2);

        let text = String::from_utf8(writer.into_inner()).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].contains("\"outcome\":\"dropped\""));

        let record: PduTrace = serde_json::from_str(lines[1]).unwrap();
        assert_eq!(record.t_ms, 1);
        assert_eq!(record.link, "dl");
    }
}
