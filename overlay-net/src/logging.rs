//! Structured log records sent over the overlay.
//!
//! [`Handle::log`] turns a message into a [`LogRecord`] and either hands it
//! to a locally registered redirect or sends it as a fire-and-forget REQUEST
//! on the well-known [`LOG_TOPIC`].  Logging never fails from the caller's
//! point of view: send errors are reported through the `log` crate and
//! otherwise dropped.

use {
    crate::{
        handle::Handle,
        message::Envelope,
        payload::Payload,
        port::{PortKind, Transport},
    },
    log::warn,
    serde::{Deserialize, Serialize},
    std::{
        fmt,
        time::{SystemTime, UNIX_EPOCH},
    },
};

/// Topic log records are sent to.
pub const LOG_TOPIC: &str = "cmb.log";

/// Facility used until [`Handle::set_facility`] is called.
pub const DEFAULT_FACILITY: &str = "unknown";

/// Syslog severity levels, encoded by number on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "i32", try_from = "i32")]
pub enum LogLevel {
    Emerg = 0,
    Alert = 1,
    Crit = 2,
    Err = 3,
    Warning = 4,
    Notice = 5,
    Info = 6,
    Debug = 7,
}

impl From<LogLevel> for i32 {
    fn from(level: LogLevel) -> Self {
        level as i32
    }
}

impl TryFrom<i32> for LogLevel {
    type Error = String;

    fn try_from(value: i32) -> Result<Self, Self::Error> {
        Ok(match value {
            0 => Self::Emerg,
            1 => Self::Alert,
            2 => Self::Crit,
            3 => Self::Err,
            4 => Self::Warning,
            5 => Self::Notice,
            6 => Self::Info,
            7 => Self::Debug,
            other => return Err(format!("invalid log level {other}")),
        })
    }
}

impl From<LogLevel> for log::Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Emerg | LogLevel::Alert | LogLevel::Crit | LogLevel::Err => log::Level::Error,
            LogLevel::Warning => log::Level::Warn,
            LogLevel::Notice | LogLevel::Info => log::Level::Info,
            LogLevel::Debug => log::Level::Debug,
        }
    }
}

/// One structured log record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogRecord {
    pub facility: String,
    pub level: LogLevel,
    pub rank: u32,
    pub timestamp_sec: u64,
    pub timestamp_usec: u32,
    pub message: String,
}

impl LogRecord {
    /// Build a record stamped with the current wall-clock time.
    pub fn now(facility: &str, level: LogLevel, rank: u32, message: String) -> Self {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        Self {
            facility: facility.to_string(),
            level,
            rank,
            timestamp_sec: now.as_secs(),
            timestamp_usec: now.subsec_micros(),
            message,
        }
    }
}

impl fmt::Display for LogRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}: {}", self.rank, self.facility, self.message)
    }
}

/// Callback receiving redirected log records.
pub type LogRedirect = Box<dyn FnMut(&LogRecord) + Send>;

/// Per-handle logging state.
pub(crate) struct LogContext {
    facility: String,
    redirect: Option<LogRedirect>,
}

impl fmt::Debug for LogContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LogContext")
            .field("facility", &self.facility)
            .field("redirected", &self.redirect.is_some())
            .finish()
    }
}

impl Default for LogContext {
    fn default() -> Self {
        Self {
            facility: DEFAULT_FACILITY.to_string(),
            redirect: None,
        }
    }
}

/// A redirect that writes records through the `log` crate.
pub fn forward_to_log() -> LogRedirect {
    Box::new(|record: &LogRecord| {
        log::log!(
            target: "overlay",
            log::Level::from(record.level),
            "{}",
            record
        );
    })
}

impl<T: Transport> Handle<T> {
    /// Facility stamped on subsequent records.
    pub fn facility(&self) -> &str {
        &self.log.facility
    }

    pub fn set_facility(&mut self, facility: &str) {
        self.log.facility = facility.to_string();
    }

    /// Deliver records to `redirect` instead of sending them.
    pub fn set_redirect(&mut self, redirect: LogRedirect) {
        self.log.redirect = Some(redirect);
    }

    pub fn clear_redirect(&mut self) {
        self.log.redirect = None;
    }

    /// Log `message` at `level`.
    pub fn log(&mut self, level: LogLevel, message: impl Into<String>) {
        let record = LogRecord::now(&self.log.facility, level, self.rank(), message.into());
        self.log_record(&record);
    }

    /// Log at error severity, appending the description of the last
    /// recorded error number.
    pub fn log_error(&mut self, message: impl fmt::Display) {
        let errnum = self.last_errnum().unwrap_or(0);
        let description = std::io::Error::from_raw_os_error(errnum);
        self.log(LogLevel::Err, format!("{message}: {description}"));
    }

    /// Redirect or send an already built record.
    pub fn log_record(&mut self, record: &LogRecord) {
        if let Some(redirect) = self.log.redirect.as_mut() {
            redirect(record);
            return;
        }
        let payload = match Payload::from_serialize(record) {
            Ok(payload) => payload,
            Err(e) => {
                warn!("unable to encode log record: {}", e);
                return;
            }
        };
        let envelope = Envelope::request(LOG_TOPIC, Some(payload));
        if let Err(e) = self.transport.send(PortKind::UpstreamRequest, &envelope) {
            warn!("dropping log record: {}", e);
        }
    }
}
