//! Copy container output from a pod journal into CRI log files.
//!
//! Each journal record written by an app carries the app name
//! (`<attempt>-<name>`) as its syslog identifier. Records are appended to
//! `<cri dir>/<name>_<attempt>.log` as `<RFC3339 nanos> <stream> <message>`.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::Value;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;

/// App name prefix of rktlet's own helper apps.
pub const INTERNAL_APP_PREFIX: &str = "rktletinternal-";

#[derive(Error, Debug)]
pub enum Journal2CriError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("journalctl exited: {0}")]
    JournalExited(String),
}

pub type Result<T> = std::result::Result<T, Journal2CriError>;

/// Output stream a record was written to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamType {
    Stdout,
    Stderr,
}

impl StreamType {
    pub fn as_str(&self) -> &'static str {
        match self {
            StreamType::Stdout => "stdout",
            StreamType::Stderr => "stderr",
        }
    }

    fn parse(transport: &str) -> Option<Self> {
        match transport {
            "stdout" => Some(StreamType::Stdout),
            "stderr" => Some(StreamType::Stderr),
            _ => None,
        }
    }
}

/// One CRI log record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CriEntry {
    pub app_name: String,
    pub app_attempt: u32,
    pub message: String,
    pub stream: StreamType,
    pub timestamp: DateTime<Utc>,
}

impl CriEntry {
    /// `<name>_<attempt>.log`
    pub fn file_name(&self) -> String {
        format!("{}_{}.log", self.app_name, self.app_attempt)
    }

    /// Log line including the trailing newline.
    pub fn format_line(&self) -> String {
        format!(
            "{} {} {}\n",
            self.timestamp.to_rfc3339_opts(SecondsFormat::Nanos, true),
            self.stream.as_str(),
            self.message
        )
    }
}

fn field<'a>(fields: &'a HashMap<String, Value>, name: &str) -> Option<&'a str> {
    fields.get(name).and_then(Value::as_str)
}

/// Convert a journal JSON record into a CRI entry.
///
/// Records from non-app sources, internal apps and unknown transports are skipped.
pub fn process_entry(fields: &HashMap<String, Value>) -> Option<CriEntry> {
    let identifier = field(fields, "SYSLOG_IDENTIFIER")?;
    if identifier.starts_with(INTERNAL_APP_PREFIX) {
        return None;
    }

    let (attempt, name) = identifier.split_once('-')?;
    let app_attempt = match attempt.parse::<u32>() {
        Ok(n) => n,
        Err(e) => {
            tracing::debug!(identifier = %identifier, error = %e, "Unparseable app attempt");
            return None;
        }
    };
    let app_name = name.trim_start_matches('-');
    if app_name.is_empty() {
        tracing::debug!(identifier = %identifier, "Empty app name");
        return None;
    }

    let transport = field(fields, "_TRANSPORT").unwrap_or_default();
    let Some(stream) = StreamType::parse(transport) else {
        tracing::debug!(transport = %transport, "Unrecognized output stream");
        return None;
    };

    let micros: i64 = field(fields, "__REALTIME_TIMESTAMP")?.parse().ok()?;
    let timestamp = DateTime::from_timestamp_micros(micros)?;

    Some(CriEntry {
        app_name: app_name.to_string(),
        app_attempt,
        message: field(fields, "MESSAGE").unwrap_or_default().to_string(),
        stream,
        timestamp,
    })
}

/// Appends entries to CRI log files, keeping each file open once used.
pub struct LogWriter {
    dir: PathBuf,
    files: HashMap<String, File>,
}

impl LogWriter {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            files: HashMap::new(),
        }
    }

    pub fn write_entry(&mut self, entry: &CriEntry) -> std::io::Result<()> {
        let name = entry.file_name();
        if !self.files.contains_key(&name) {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(self.dir.join(&name))?;
            self.files.insert(name.clone(), file);
        }
        if let Some(file) = self.files.get_mut(&name) {
            file.write_all(entry.format_line().as_bytes())?;
        }
        Ok(())
    }
}

/// Follow the journal in `journal_dir` with `journalctl`, writing entries under `cri_dir`.
///
/// Runs until journalctl exits.
pub async fn follow(journalctl: &Path, journal_dir: &Path, cri_dir: &Path) -> Result<()> {
    let mut child = Command::new(journalctl)
        .arg("-D")
        .arg(journal_dir)
        .args(["--follow", "--no-tail", "--output=json"])
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .spawn()?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| Journal2CriError::JournalExited("no stdout".to_string()))?;

    tracing::info!(journal = %journal_dir.display(), logs = %cri_dir.display(), "Following journal");

    let mut writer = LogWriter::new(cri_dir);
    let mut lines = BufReader::new(stdout).lines();
    while let Some(line) = lines.next_line().await? {
        let fields: HashMap<String, Value> = match serde_json::from_str(&line) {
            Ok(fields) => fields,
            Err(e) => {
                tracing::warn!(error = %e, "Skipping malformed journal record");
                continue;
            }
        };
        if let Some(entry) = process_entry(&fields) {
            if let Err(e) = writer.write_entry(&entry) {
                tracing::warn!(file = %entry.file_name(), error = %e, "Could not append log entry");
            }
        }
    }

    let status = child.wait().await?;
    Err(Journal2CriError::JournalExited(status.to_string()))
}
