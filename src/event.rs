use crate::channel::Decision;
use crate::error::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::Path;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event_type", rename_all = "snake_case")]
pub enum ReportEvent {
    Decision(DecisionRecord),
    Exec(ExecRecord),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecisionRecord {
    pub timestamp: DateTime<Utc>,
    pub pid: i32,
    pub emulation: String,
    pub syscall: String,
    pub verdict: Verdict,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Verdict {
    Permit,
    Deny { errno: i32 },
}

impl From<Decision> for Verdict {
    fn from(decision: Decision) -> Self {
        match decision {
            Decision::Permit => Verdict::Permit,
            Decision::Deny(errno) => Verdict::Deny { errno },
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecRecord {
    pub timestamp: DateTime<Utc>,
    pub pid: i32,
    pub path: String,
}

/// JSONL sink - one JSON object per line.
pub struct EventSink {
    writer: BufWriter<Box<dyn Write>>,
}

impl EventSink {
    pub fn stdout() -> Self {
        Self {
            writer: BufWriter::new(Box::new(io::stdout())),
        }
    }

    pub fn file(path: &Path) -> Result<Self> {
        let file = File::create(path)?;
        Ok(Self {
            writer: BufWriter::new(Box::new(file)),
        })
    }

    pub fn emit(&mut self, event: &ReportEvent) -> Result<()> {
        serde_json::to_writer(&mut self.writer, event).map_err(io::Error::from)?;
        self.writer.write_all(b"\n")?;
        Ok(())
    }

    pub fn flush(&mut self) -> Result<()> {
        self.writer.flush()?;
        Ok(())
    }
}
