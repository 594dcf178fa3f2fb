use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::sync::Mutex;
use std::time::Duration;

use anyhow::Context;
use chrono::Local;

use crate::cache::FileCache;
use crate::path::PathPolicy;

/// Host details advertised to clients: the configured hostname and the
/// forward port, which may differ from the bound port behind a port
/// forward.
#[derive(Debug, Clone)]
pub struct ConnHost {
    pub name: String,
    pub bind_port: String,
    pub fwd_port: String,
}

impl ConnHost {
    /// Port placed in menu lines and the CGI environment.
    pub fn port(&self) -> &str {
        &self.fwd_port
    }
}

/// Where to put a log stream.
#[derive(Debug)]
pub enum LogSink {
    Disabled,
    Stderr,
    File(Mutex<BufWriter<File>>),
}

/// One of the two server logs (system or access). Lines carry an optional
/// local timestamp and an optional caller-supplied prefix (the client
/// address on access lines).
#[derive(Debug)]
pub struct Logger {
    sink: LogSink,
    timestamp: bool,
    prefix: bool,
}

impl Logger {
    pub fn new(sink: LogSink, timestamp: bool, prefix: bool) -> Self {
        Logger {
            sink,
            timestamp,
            prefix,
        }
    }

    pub fn disabled() -> Self {
        Logger::new(LogSink::Disabled, false, false)
    }

    pub fn stderr(timestamp: bool, prefix: bool) -> Self {
        Logger::new(LogSink::Stderr, timestamp, prefix)
    }

    /// Append-open a log file sink.
    pub fn file(path: &str, timestamp: bool, prefix: bool) -> anyhow::Result<Self> {
        let file = OpenOptions::new()
            .append(true)
            .create(true)
            .open(path)
            .with_context(|| format!("failed to open log file {}", path))?;
        Ok(Logger::new(
            LogSink::File(Mutex::new(BufWriter::new(file))),
            timestamp,
            prefix,
        ))
    }

    pub fn info(&self, prefix: &str, message: &str) {
        self.log(prefix, message);
    }

    pub fn error(&self, prefix: &str, message: &str) {
        self.log(prefix, &format!("error: {}", message));
    }

    fn log(&self, prefix: &str, message: &str) {
        if matches!(self.sink, LogSink::Disabled) {
            return;
        }
        let mut line = String::new();
        if self.timestamp {
            line.push_str(&Local::now().format("[%d/%b/%Y:%H:%M:%S %z] ").to_string());
        }
        if self.prefix && !prefix.is_empty() {
            line.push_str(prefix);
        }
        line.push_str(message);
        line.push('\n');
        match &self.sink {
            LogSink::Disabled => {}
            LogSink::Stderr => {
                eprint!("{}", line);
            }
            LogSink::File(file) => {
                let mut file = file.lock().expect("log file lock poisoned");
                let _ = file.write_all(line.as_bytes()).and_then(|_| file.flush());
            }
        }
    }
}

/// Global server configuration: set once at startup, read-only thereafter.
/// Workers share it behind an Arc; the file cache inside carries the only
/// mutable state.
#[derive(Debug)]
pub struct ServerConfig {
    /* Filesystem */
    pub root: String,
    pub host: ConnHost,
    pub policy: PathPolicy,
    pub cache: FileCache,

    /* Content */
    pub page_width: usize,
    pub charset: String,
    pub footer: Vec<u8>,

    /* Logging */
    pub sys_log: Logger,
    pub acc_log: Logger,

    /* Executable support */
    pub cgi_enabled: bool,
    pub http_compat_cgi: bool,
    pub cgi_bin_dir: String,
    pub cgi_env: Vec<(String, String)>,
    pub max_exec_time: Duration,

    /* Buffer sizes and socket deadlines */
    pub socket_write_buf: usize,
    pub socket_read_buf: usize,
    pub socket_read_max: usize,
    pub skip_prefix_buf: usize,
    pub socket_read_timeout: Duration,
    pub socket_write_timeout: Duration,
}

impl ServerConfig {
    pub fn hostname(&self) -> &str {
        &self.host.name
    }

    pub fn port(&self) -> &str {
        self.host.port()
    }
}

#[cfg(test)]
impl ServerConfig {
    /// A quiet config rooted at `root` with CGI on, shared by unit tests.
    pub(crate) fn for_tests(root: &str) -> ServerConfig {
        ServerConfig {
            root: root.to_string(),
            host: ConnHost {
                name: "localhost".to_string(),
                bind_port: "70".to_string(),
                fwd_port: "70".to_string(),
            },
            policy: PathPolicy::new(),
            cache: FileCache::new(64, 1024 * 1024),
            page_width: 80,
            charset: "utf-8".to_string(),
            footer: crate::gopher::format_footer("", true, 80),
            sys_log: Logger::disabled(),
            acc_log: Logger::disabled(),
            cgi_enabled: true,
            http_compat_cgi: false,
            cgi_bin_dir: "cgi-bin".to_string(),
            cgi_env: Vec::new(),
            max_exec_time: Duration::from_secs(3),
            socket_write_buf: 4096,
            socket_read_buf: 1024,
            socket_read_max: 4096,
            skip_prefix_buf: 4096,
            socket_read_timeout: Duration::from_secs(5),
            socket_write_timeout: Duration::from_secs(30),
        }
    }
}
