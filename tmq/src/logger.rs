use std::fs::{File, OpenOptions};
use std::io::{self, Stdout, Write};

use anyhow::anyhow;
use slog::{o, Drain};

use crate::conf::logging::To;
use crate::conf::Settings;
use crate::Result;

pub use slog::Logger;

/// Builds the root logger from the `[log]` section and routes the `log` facade into it.
pub fn init(settings: &Settings) -> Result<Logger> {
    let level = settings.log.level.inner();
    let logger = config_logger(settings.log.filename(), settings.log.to, level);
    logger_init(logger.clone(), level)?;
    Ok(logger)
}

/// Installs a `log` bridge forwarding every record to `logger`.
pub fn logger_init(logger: Logger, level: slog::Level) -> Result<()> {
    log::set_boxed_logger(Box::new(LoggerEx(logger)))
        .map_err(|e| anyhow!("set logger error, {:?}", e))?;
    log::set_max_level(slog_log_to_level(level).to_level_filter());
    Ok(())
}

struct LoggerEx(Logger);

impl log::Log for LoggerEx {
    fn enabled(&self, _metadata: &log::Metadata) -> bool {
        true
    }

    fn log(&self, r: &log::Record) {
        let level = log_to_slog_level(r.metadata().level());
        let args = r.args();
        let target = r.target();
        let location = &record_as_location(r);
        let s = slog::RecordStatic { location, level, tag: target };

        self.0.log(&slog::Record::new(&s, args, slog::b!()))
    }

    fn flush(&self) {}
}

fn log_to_slog_level(level: log::Level) -> slog::Level {
    match level {
        log::Level::Trace => slog::Level::Trace,
        log::Level::Debug => slog::Level::Debug,
        log::Level::Info => slog::Level::Info,
        log::Level::Warn => slog::Level::Warning,
        log::Level::Error => slog::Level::Error,
    }
}

fn slog_log_to_level(level: slog::Level) -> log::Level {
    match level {
        slog::Level::Trace => log::Level::Trace,
        slog::Level::Debug => log::Level::Debug,
        slog::Level::Info => log::Level::Info,
        slog::Level::Warning => log::Level::Warn,
        slog::Level::Error => log::Level::Error,
        slog::Level::Critical => log::Level::Error,
    }
}

fn record_as_location(r: &log::Record) -> slog::RecordLocation {
    let module = r.module_path_static().unwrap_or("<unknown>");
    let file = r.file_static().unwrap_or("<unknown>");
    let line = r.line().unwrap_or_default();

    slog::RecordLocation { file, line, column: 0, function: "", module }
}

fn timestamp_local(io: &mut dyn io::Write) -> io::Result<()> {
    write!(io, "{}", chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f"))
}

pub fn config_logger(filename: String, to: To, level: slog::Level) -> Logger {
    let decorator = slog_term::PlainDecorator::new(WriteFilter::new(filename, to));
    let drain = slog_term::FullFormat::new(decorator).use_custom_timestamp(timestamp_local).build().fuse();

    let drain = slog::LevelFilter::new(drain, level).fuse();

    let drain = slog_async::Async::new(drain)
        .chan_size(4096 * 4)
        .overflow_strategy(slog_async::OverflowStrategy::DropAndReport)
        .build()
        .fuse();

    Logger::root(drain, o!())
}

struct WriteFilter {
    filename: String,
    to: To,

    file: Option<File>,
    console: Stdout,
}

impl WriteFilter {
    fn new(filename: String, to: To) -> Self {
        Self { filename, to, file: None, console: io::stdout() }
    }

    fn file(&mut self) -> io::Result<&mut File> {
        if self.file.is_none() {
            self.file = Some(open_file(&self.filename)?);
        }
        self.file.as_mut().ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "log file is not open"))
    }
}

impl io::Write for WriteFilter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.to.console() {
            self.console.write_all(buf)?;
        }
        if self.to.file() {
            self.file()?.write_all(buf)?;
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        if self.to.console() {
            self.console.flush()?;
        }
        if self.to.file() {
            self.file()?.flush()?;
        }
        Ok(())
    }
}

fn open_file(filename: &str) -> io::Result<File> {
    OpenOptions::new().create(true).append(true).open(filename).map_err(|e| {
        io::Error::new(e.kind(), format!("logger file config error, filename: {}, {:?}", filename, e))
    })
}
