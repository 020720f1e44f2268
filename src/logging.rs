use log::{Level, Metadata, Record, SetLoggerError};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, OnceLock, PoisonError};
use chrono::Local;

/// Entries kept for the operator view; older ones are dropped first
pub const LOG_CAPACITY: usize = 100;

static LOGGER: OnceLock<OperatorLogger> = OnceLock::new();

#[derive(Debug, Serialize, Clone, PartialEq)]
pub struct LogMessage {
    pub level: String,
    pub message: String,
    pub timestamp: String,
}

/// Bounded, shared ring of recent log lines
#[derive(Debug, Clone)]
pub struct OperatorLog {
    entries: Arc<Mutex<VecDeque<LogMessage>>>,
    capacity: usize,
}

impl Default for OperatorLog {
    fn default() -> Self {
        Self::with_capacity(LOG_CAPACITY)
    }
}

impl OperatorLog {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: Arc::new(Mutex::new(VecDeque::with_capacity(capacity))),
            capacity,
        }
    }

    pub fn push(&self, entry: LogMessage) {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        if entries.len() == self.capacity {
            entries.pop_back();
        }
        entries.push_front(entry);
    }

    /// Newest entry first
    pub fn snapshot(&self) -> Vec<LogMessage> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect()
    }

    pub fn clear(&self) {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner).clear();
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

pub struct OperatorLogger {
    log: OperatorLog,
    level: Level,
}

impl OperatorLogger {
    pub fn new(log: OperatorLog, level: Level) -> Self {
        Self { log, level }
    }

    /// Installs the global logger and returns the ring it records into.
    pub fn init(level: Level) -> Result<OperatorLog, SetLoggerError> {
        let logger = LOGGER.get_or_init(|| OperatorLogger::new(OperatorLog::default(), level));
        log::set_logger(logger).map(|()| log::set_max_level(level.to_level_filter()))?;
        Ok(logger.log.clone())
    }

    fn record_log(&self, record: &Record) {
        self.log.push(LogMessage {
            level: record.level().to_string(),
            message: record.args().to_string(),
            timestamp: Local::now().to_rfc3339(),
        });
    }
}

impl log::Log for OperatorLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.level
    }

    fn log(&self, record: &Record) {
        if self.enabled(record.metadata()) {
            eprintln!("[{}] {}", record.level(), record.args());
            self.record_log(record);
        }
    }

    fn flush(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use log::Log;

    fn entry(message: &str) -> LogMessage {
        LogMessage {
            level: "INFO".to_string(),
            message: message.to_string(),
            timestamp: String::new(),
        }
    }

    #[test]
    fn ring_keeps_newest_entries_first() {
        let log = OperatorLog::with_capacity(3);
        for i in 0..5 {
            log.push(entry(&i.to_string()));
        }

        let messages: Vec<_> = log.snapshot().into_iter().map(|e| e.message).collect();
        assert_eq!(messages, vec!["4", "3", "2"]);

        log.clear();
        assert!(log.is_empty());
    }

    #[test]
    fn logger_filters_by_level() {
        let log = OperatorLog::default();
        let logger = OperatorLogger::new(log.clone(), Level::Info);

        logger.log(
            &Record::builder()
                .level(Level::Debug)
                .args(format_args!("hidden"))
                .build(),
        );
        logger.log(
            &Record::builder()
                .level(Level::Warn)
                .args(format_args!("shown"))
                .build(),
        );

        let entries = log.snapshot();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].level, "WARN");
        assert_eq!(entries[0].message, "shown");
    }
}
