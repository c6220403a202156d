//! Process surface: daemonization, pid file, and log-sink selection.
//!
//! The sink policy follows the configuration: a `logfile` gets an
//! append-mode file writer, otherwise a configured `pidfile` implies a
//! background daemon and logs go to syslog over `/dev/log`, otherwise
//! everything stays on stdout.

use std::fs::OpenOptions;
use std::io;
use std::os::unix::net::UnixDatagram;
use std::path::Path;
use std::sync::Mutex;

use tracing::{Level, Metadata};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::MakeWriter;

use crate::config::Config;
use crate::error::{Error, Result};

const SYSLOG_PATH: &str = "/dev/log";

/// `LOG_DAEMON` facility, pre-shifted for the priority field.
const FACILITY_DAEMON: u8 = 3 << 3;

/// Detaches from the controlling terminal and writes the pid file.
///
/// Must run before the async runtime exists; forking a process that
/// already has runtime threads would lose them in the child.
pub fn daemonize(pidfile: &Path) -> Result<()> {
    daemonize::Daemonize::new()
        .pid_file(pidfile)
        .chown_pid_file(true)
        .working_directory("/")
        .start()
        .map_err(|err| Error::Daemon(err.to_string()))?;
    Ok(())
}

/// Installs the global tracing subscriber according to the configured
/// log level and sink.
pub fn init_logging(config: &Config) -> Result<()> {
    let filter = EnvFilter::new(config.loglevel.as_filter());

    if let Some(logfile) = &config.logfile {
        match OpenOptions::new().create(true).append(true).open(logfile) {
            Ok(file) => {
                tracing_subscriber::fmt()
                    .with_env_filter(filter)
                    .with_ansi(false)
                    .with_writer(Mutex::new(file))
                    .init();
            }
            Err(err) => {
                eprintln!(
                    "leased: couldn't open {} for logging, using console: {}",
                    logfile.display(),
                    err
                );
                tracing_subscriber::fmt().with_env_filter(filter).init();
            }
        }
    } else if config.pidfile.is_some() {
        let writer = SyslogMakeWriter::connect(SYSLOG_PATH)?;
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_ansi(false)
            .without_time()
            .with_target(false)
            .with_writer(writer)
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    Ok(())
}

fn severity(level: &Level) -> u8 {
    if *level == Level::ERROR {
        2
    } else if *level == Level::WARN {
        4
    } else if *level == Level::INFO {
        6
    } else {
        7
    }
}

/// Sends each formatted event as one RFC 3164 datagram to `/dev/log`.
pub struct SyslogMakeWriter {
    socket: UnixDatagram,
    tag: String,
}

impl SyslogMakeWriter {
    pub fn connect(path: &str) -> Result<Self> {
        let socket = UnixDatagram::unbound()?;
        socket.connect(path)?;
        Ok(Self {
            socket,
            tag: format!("leased[{}]", std::process::id()),
        })
    }
}

pub struct SyslogWriter<'a> {
    socket: &'a UnixDatagram,
    tag: &'a str,
    priority: u8,
    buffer: Vec<u8>,
}

impl io::Write for SyslogWriter<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.buffer.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Drop for SyslogWriter<'_> {
    fn drop(&mut self) {
        let text = String::from_utf8_lossy(&self.buffer);
        let message = format!("<{}>{}: {}", self.priority, self.tag, text.trim_end());
        // A full or missing syslog socket must not take the server down.
        let _ = self.socket.send(message.as_bytes());
    }
}

impl<'a> MakeWriter<'a> for SyslogMakeWriter {
    type Writer = SyslogWriter<'a>;

    fn make_writer(&'a self) -> Self::Writer {
        SyslogWriter {
            socket: &self.socket,
            tag: &self.tag,
            priority: FACILITY_DAEMON | 6,
            buffer: Vec::new(),
        }
    }

    fn make_writer_for(&'a self, meta: &Metadata<'_>) -> Self::Writer {
        SyslogWriter {
            socket: &self.socket,
            tag: &self.tag,
            priority: FACILITY_DAEMON | severity(meta.level()),
            buffer: Vec::new(),
        }
    }
}
