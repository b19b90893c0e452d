use std::fmt::{self, Display};
use std::io;
use std::sync::Arc;

use chrono::Local;

/// Upper bound, in bytes, on a rendered message. Longer messages are cut to
/// at most `MAX_MESSAGE_LEN - 1` bytes on a character boundary, silently.
pub const MAX_MESSAGE_LEN: usize = 1024;

/// Destination for finished diagnostic lines.
///
/// The logger takes no lock of its own: when several threads share one
/// logger, interleaving is whatever the sink makes of it.
pub trait LogSink: Send + Sync {
    fn write_line(&self, line: &str);
}

/// Default sink, one line per record to stdout.
pub struct StdoutSink;

impl LogSink for StdoutSink {
    fn write_line(&self, line: &str) {
        println!("{}", line);
    }
}

/// Which side of a client/server pair a log line originated from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Server,
    Client,
}

impl Role {
    pub fn tag(self) -> &'static str {
        match self {
            Role::Server => "s",
            Role::Client => "c",
        }
    }
}

/// Call-site location, captured by the `diag!` / `diag_err!` macros.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Location {
    pub module: &'static str,
    pub line: u32,
}

impl Location {
    pub const fn new(module: &'static str, line: u32) -> Self {
        Self { module, line }
    }
}

impl Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.module, self.line)
    }
}

/// Single-line diagnostic logger.
///
/// Line shapes:
///
/// ```text
/// [s][2024-01-02 03:04:05.678][mycrate::setup:42] message
/// [s][2024-01-02 03:04:05.678][mycrate::setup:42][errno: 19, errstr: ...] message
/// ```
///
/// The timestamp is local time with millisecond resolution. Emission never
/// fails observably; oversized messages degrade by truncation.
#[derive(Clone)]
pub struct DiagLogger {
    role: Role,
    sink: Arc<dyn LogSink>,
}

impl DiagLogger {
    pub fn new(role: Role, sink: Arc<dyn LogSink>) -> Self {
        Self { role, sink }
    }

    pub fn stdout(role: Role) -> Self {
        Self::new(role, Arc::new(StdoutSink))
    }

    pub fn role(&self) -> Role {
        self.role
    }

    /// Emit a plain diagnostic line. Prefer the `diag!` macro, which fills
    /// in the location.
    pub fn log(&self, location: Location, args: fmt::Arguments<'_>) {
        self.emit(location, None, args);
    }

    /// Emit an error line carrying the OS error code and description taken
    /// from `err`. The failing operation's error is passed explicitly, so
    /// there is no shared errno to clobber between the failure and the log
    /// call. Prefer the `diag_err!` macro.
    pub fn log_err(&self, location: Location, err: &io::Error, args: fmt::Arguments<'_>) {
        self.emit(location, Some(err), args);
    }

    fn emit(&self, location: Location, err: Option<&io::Error>, args: fmt::Arguments<'_>) {
        let message = truncate_message(args.to_string());
        let timestamp = Local::now().format("%Y-%m-%d %H:%M:%S%.3f");
        let line = match err {
            Some(err) => format!(
                "[{}][{}][{}][errno: {}, errstr: {}] {}",
                self.role.tag(),
                timestamp,
                location,
                err.raw_os_error().unwrap_or(0),
                err,
                message,
            ),
            None => format!(
                "[{}][{}][{}] {}",
                self.role.tag(),
                timestamp,
                location,
                message,
            ),
        };
        self.sink.write_line(&line);
    }
}

fn truncate_message(mut message: String) -> String {
    if message.len() >= MAX_MESSAGE_LEN {
        let mut cut = MAX_MESSAGE_LEN - 1;
        while !message.is_char_boundary(cut) {
            cut -= 1;
        }
        message.truncate(cut);
    }
    message
}

/// Log a formatted diagnostic line, capturing the call site.
#[macro_export]
macro_rules! diag {
    ($logger:expr, $($arg:tt)*) => {
        $logger.log(
            $crate::logger::Location::new(module_path!(), line!()),
            format_args!($($arg)*),
        )
    };
}

/// Log a formatted error line for a failed operation. `$err` is the
/// `std::io::Error` returned by the operation being reported.
#[macro_export]
macro_rules! diag_err {
    ($logger:expr, $err:expr, $($arg:tt)*) => {
        $logger.log_err(
            $crate::logger::Location::new(module_path!(), line!()),
            $err,
            format_args!($($arg)*),
        )
    };
}

#[cfg(test)]
pub(crate) struct MemorySink {
    lines: std::sync::Mutex<Vec<String>>,
}

#[cfg(test)]
impl MemorySink {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            lines: std::sync::Mutex::new(Vec::new()),
        })
    }

    pub(crate) fn lines(&self) -> Vec<String> {
        self.lines.lock().unwrap().clone()
    }
}

#[cfg(test)]
impl LogSink for MemorySink {
    fn write_line(&self, line: &str) {
        self.lines.lock().unwrap().push(line.to_owned());
    }
}
