use anyhow::{Context, Result};
use chrono::{Local, Utc};
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;

/// Sink for human-readable status and event lines.
pub trait Logger: Send + Sync {
    fn info(&self, _msg: &str) {}
    fn error(&self, _context: &str, _msg: &str) {}
    /// Bytes moved so far for a bulk transfer labelled `label`.
    fn progress(&self, _label: &str, _done: u64, _total: u64) {}
}

pub struct NoopLogger;
impl Logger for NoopLogger {}

/// Timestamped lines on stderr
pub struct ConsoleLogger;

impl Logger for ConsoleLogger {
    fn info(&self, msg: &str) {
        eprintln!("[{}] {}", Local::now().format("%H:%M:%S"), msg);
    }
    fn error(&self, context: &str, msg: &str) {
        eprintln!("[{}] Error: {}: {}", Local::now().format("%H:%M:%S"), context, msg);
    }
}

/// Server event log: one `<rfc3339> <LEVEL> <text>` line per event, appended.
pub struct TextLogger {
    file: Mutex<File>,
}

impl TextLogger {
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        match path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => std::fs::create_dir_all(dir)
                .with_context(|| format!("create log directory {}", dir.display()))?,
            _ => {}
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            file: Mutex::new(file),
        })
    }

    fn record(&self, level: &str, text: &str) {
        let stamp = Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true);
        let _ = writeln!(self.file.lock(), "{stamp} {level:<5} {text}");
    }
}

impl Logger for TextLogger {
    fn info(&self, msg: &str) {
        self.record("INFO", msg);
    }
    fn error(&self, context: &str, msg: &str) {
        self.record("ERROR", &format!("{context}: {msg}"));
    }
}

/// Keeps every line in memory, for a log view that polls it.
#[derive(Default)]
pub struct MemoryLogger {
    lines: Mutex<Vec<String>>,
}

impl MemoryLogger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lines(&self) -> Vec<String> {
        self.lines.lock().clone()
    }

    pub fn contains(&self, needle: &str) -> bool {
        self.lines.lock().iter().any(|l| l.contains(needle))
    }
}

impl Logger for MemoryLogger {
    fn info(&self, msg: &str) {
        self.lines.lock().push(msg.to_string());
    }
    fn error(&self, context: &str, msg: &str) {
        self.lines.lock().push(format!("Error: {}: {}", context, msg));
    }
}

/// Fan one event out to several sinks.
pub struct TeeLogger {
    sinks: Vec<std::sync::Arc<dyn Logger>>,
}

impl TeeLogger {
    pub fn new(sinks: Vec<std::sync::Arc<dyn Logger>>) -> Self {
        Self { sinks }
    }
}

impl Logger for TeeLogger {
    fn info(&self, msg: &str) {
        for s in &self.sinks {
            s.info(msg);
        }
    }
    fn error(&self, context: &str, msg: &str) {
        for s in &self.sinks {
            s.error(context, msg);
        }
    }
    fn progress(&self, label: &str, done: u64, total: u64) {
        for s in &self.sinks {
            s.progress(label, done, total);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_text_logger_appends_timestamped_lines() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("logs/server.log");
        let log = TextLogger::new(&path).unwrap();
        log.info("alice connected.");
        log.error("upload", "disk full");
        let text = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].ends_with(" INFO  alice connected."), "{}", lines[0]);
        assert!(lines[1].ends_with(" ERROR upload: disk full"), "{}", lines[1]);
        let stamp = lines[0].split(' ').next().unwrap();
        assert!(chrono::DateTime::parse_from_rfc3339(stamp).is_ok(), "{stamp}");
    }

    #[test]
    fn test_tee_reaches_every_sink() {
        let a = Arc::new(MemoryLogger::new());
        let b = Arc::new(MemoryLogger::new());
        let noop: Arc<dyn Logger> = Arc::new(NoopLogger);
        let tee = TeeLogger::new(vec![
            a.clone() as Arc<dyn Logger>,
            b.clone() as Arc<dyn Logger>,
            noop,
        ]);
        tee.info("bob disconnected.");
        assert!(a.contains("bob disconnected."));
        assert_eq!(b.lines(), vec!["bob disconnected.".to_string()]);
    }
}
