// com2tcp - Logging
// Timestamped console/file logger handed to every component

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::sync::{Arc, Mutex};

pub const LOG_ERROR: u8 = 3;
pub const LOG_WARN: u8 = 4;
pub const LOG_NOTICE: u8 = 5;
pub const LOG_INFO: u8 = 6;
pub const LOG_DEBUG: u8 = 7;

/// Destination for log lines. Levels follow syslog numbering (0 = EMERG .. 9 = VERBOSE).
pub trait LogSink: Send + Sync {
    fn log(&self, message: &str, level: u8);
}

pub fn level_name(level: u8) -> &'static str {
    match level {
        0 => "EMERG", 1 => "ALERT", 2 => "CRIT", 3 => "ERROR", 4 => "WARN",
        5 => "NOTICE", 6 => "INFO", 7 => "DEBUG", 8 => "TRACE", 9 => "VERBOSE",
        _ => "UNKNOWN",
    }
}

pub struct Logger {
    file: Option<Arc<Mutex<File>>>,
    log_level: u8,
    log_to_console: bool,
}

impl Logger {
    pub fn new(logfile: Option<String>, log_level: u8, log_to_console: bool) -> Result<Self, Box<dyn std::error::Error>> {
        let file = if let Some(path) = logfile {
            let f = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .map_err(|e| format!("Failed to open log file '{}': {}", path, e))?;
            Some(Arc::new(Mutex::new(f)))
        } else {
            None
        };
        Ok(Logger { file, log_level, log_to_console })
    }

    pub fn format_line(message: &str, level: u8) -> String {
        let timestamp = chrono::Local::now().format("%Y-%m-%d %H:%M:%S");
        format!("[{}] [{}] {}\n", timestamp, level_name(level), message)
    }
}

impl LogSink for Logger {
    fn log(&self, message: &str, level: u8) {
        if level > self.log_level {
            return;
        }
        let log_line = Self::format_line(message, level);
        if self.log_to_console {
            print!("{}", log_line);
        }
        if let Some(ref file) = self.file {
            if let Ok(mut f) = file.lock() {
                let _ = f.write_all(log_line.as_bytes());
            }
        }
    }
}

/// Sink that keeps every line in memory, for tests.
#[cfg(test)]
#[derive(Default)]
pub struct MemorySink {
    lines: Mutex<Vec<(u8, String)>>,
}

#[cfg(test)]
impl MemorySink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn lines(&self) -> Vec<String> {
        self.lines.lock().unwrap().iter().map(|(_, l)| l.clone()).collect()
    }

    pub fn contains(&self, needle: &str) -> bool {
        self.lines().iter().any(|l| l.contains(needle))
    }
}

#[cfg(test)]
impl LogSink for MemorySink {
    fn log(&self, message: &str, level: u8) {
        self.lines.lock().unwrap().push((level, message.to_string()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_line() {
        let line = Logger::format_line("COM3@9600: Open", LOG_NOTICE);
        assert!(line.contains("[NOTICE] COM3@9600: Open"));
        assert!(line.ends_with('\n'));
    }

    #[test]
    fn test_level_filter_and_file() {
        let path = std::env::temp_dir().join(format!("com2tcp-log-{}.log", std::process::id()));
        let _ = std::fs::remove_file(&path);
        let logger = Logger::new(Some(path.to_string_lossy().into_owned()), LOG_NOTICE, false).unwrap();
        logger.log("kept", LOG_NOTICE);
        logger.log("dropped", LOG_DEBUG);

        let contents = std::fs::read_to_string(&path).unwrap();
        assert!(contents.contains("kept"));
        assert!(!contents.contains("dropped"));
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn test_memory_sink() {
        let sink = MemorySink::new();
        sink.log("hello", LOG_INFO);
        assert!(sink.contains("hello"));
    }
}
