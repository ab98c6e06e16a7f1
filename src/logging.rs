use crate::config::{LogFormat, LogLevel, LogOutputType, LogTarget, LoggingConfig};
use chrono::{DateTime, Utc};
use log::{LevelFilter, Metadata, Record};
use serde_json::json;
use std::fs::OpenOptions;
use std::io::{BufWriter, Write};
use std::sync::Mutex;

/// Logger writing to several stdout/file targets, each with its own level.
pub struct GatewayLogger {
    targets: Vec<LogTarget>,
    format: LogFormat,
    default_level: LevelFilter,
    writers: Vec<Mutex<BufWriter<Box<dyn Write + Send>>>>,
}

impl GatewayLogger {
    pub fn new(config: LoggingConfig) -> Result<Self, Box<dyn std::error::Error>> {
        let format = config.format.unwrap_or_default();
        let default_level = config.level.unwrap_or_default().to_level_filter();
        let targets = config.targets.unwrap_or_default();

        let mut writers = Vec::with_capacity(targets.len());
        for target in &targets {
            let writer: Box<dyn Write + Send> = match target.output_type {
                LogOutputType::Stdout => Box::new(std::io::stdout()),
                LogOutputType::File => {
                    let path = target.path.as_ref().ok_or("File output type requires path")?;
                    Box::new(OpenOptions::new().create(true).append(true).open(path)?)
                }
            };
            writers.push(Mutex::new(BufWriter::new(writer)));
        }

        Ok(Self {
            targets,
            format,
            default_level,
            writers,
        })
    }

    pub fn init(config: LoggingConfig) -> Result<(), Box<dyn std::error::Error>> {
        let logger = Self::new(config)?;
        let max_level = logger.max_level();
        log::set_boxed_logger(Box::new(logger))?;
        log::set_max_level(max_level);
        Ok(())
    }

    fn target_level(&self, target: &LogTarget) -> LevelFilter {
        target.level.map(LogLevel::to_level_filter).unwrap_or(self.default_level)
    }

    fn max_level(&self) -> LevelFilter {
        self.targets
            .iter()
            .map(|t| self.target_level(t))
            .max()
            .unwrap_or(LevelFilter::Off)
    }

    fn format_text(&self, record: &Record) -> String {
        let timestamp: DateTime<Utc> = Utc::now();
        format!(
            "{} [{}] [{}] {}",
            timestamp.format("%Y-%m-%d %H:%M:%S%.3f"),
            record.level().as_str(),
            record.target(),
            record.args()
        )
    }

    fn format_json(&self, record: &Record) -> String {
        let timestamp: DateTime<Utc> = Utc::now();
        let log_entry = json!({
            "timestamp": timestamp.format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string(),
            "level": record.level().as_str().to_lowercase(),
            "target": record.target(),
            "module": record.module_path().unwrap_or("unknown"),
            "line": record.line().unwrap_or(0),
            "message": record.args().to_string(),
        });
        log_entry.to_string()
    }

    pub fn format(&self, record: &Record) -> String {
        match self.format {
            LogFormat::Text => self.format_text(record),
            LogFormat::Json => self.format_json(record),
        }
    }
}

impl log::Log for GatewayLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        self.targets
            .iter()
            .any(|target| metadata.level() <= self.target_level(target))
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }

        let message = self.format(record);
        for (target, writer) in self.targets.iter().zip(&self.writers) {
            if record.level() <= self.target_level(target) {
                if let Ok(mut writer) = writer.lock() {
                    let _ = writeln!(writer, "{}", message);
                    let _ = writer.flush();
                }
            }
        }
    }

    fn flush(&self) {
        for writer in &self.writers {
            if let Ok(mut w) = writer.lock() {
                let _ = w.flush();
            }
        }
    }
}

/// Installs the configured logger, or env_logger (`RUST_LOG`, default `info`)
/// when no logging block is present.
pub fn init(config: Option<LoggingConfig>) -> Result<(), Box<dyn std::error::Error>> {
    match config {
        Some(config) if config.targets.as_ref().is_some_and(|t| !t.is_empty()) => GatewayLogger::init(config),
        Some(config) => init_fallback(config.level.unwrap_or_default(), config.format.unwrap_or_default()),
        None => init_fallback(LogLevel::Info, LogFormat::Text),
    }
}

pub fn init_fallback(level: LogLevel, format: LogFormat) -> Result<(), Box<dyn std::error::Error>> {
    let mut builder = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level.to_string()));
    if format == LogFormat::Json {
        builder.format(|buf, record| {
            let entry = json!({
                "timestamp": Utc::now().format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string(),
                "level": record.level().as_str().to_lowercase(),
                "target": record.target(),
                "message": record.args().to_string(),
            });
            writeln!(buf, "{}", entry)
        });
    }
    builder.try_init()?;
    Ok(())
}

pub fn parse_log_level(s: &str) -> Result<LogLevel, String> {
    match s.to_lowercase().as_str() {
        "trace" => Ok(LogLevel::Trace),
        "debug" => Ok(LogLevel::Debug),
        "info" => Ok(LogLevel::Info),
        "warn" => Ok(LogLevel::Warn),
        "error" => Ok(LogLevel::Error),
        _ => Err(format!("Invalid log level: {}. Must be one of: trace, debug, info, warn, error", s)),
    }
}
