use crate::config::HubConfig;
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tracing_subscriber::{fmt::writer::BoxMakeWriter, EnvFilter};

pub const LOG_FILE_NAME: &str = "wooagent-hub.log";

pub struct LogGuard {
    file: Option<Arc<Mutex<File>>>,
}

/// Installs the global subscriber. `RUST_LOG` wins over everything else.
pub fn init_logging(config: &HubConfig) -> Option<LogGuard> {
    let level = resolve_level(config.debug, std::env::var("WOOAGENT_LOG_LEVEL").ok());
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let guard = match open_log_file(&config.log_dir) {
        Ok(guard) => guard,
        Err(err) => {
            eprintln!("log_file_error: {err}");
            LogGuard { file: None }
        }
    };
    let file = guard.file.clone();
    let make_writer = BoxMakeWriter::new(move || MultiWriter::new(file.clone()));
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(make_writer)
        .finish();
    if tracing::subscriber::set_global_default(subscriber).is_err() {
        return None;
    }
    Some(guard)
}

fn resolve_level(debug: bool, env_level: Option<String>) -> String {
    match env_level.filter(|level| !level.trim().is_empty()) {
        Some(level) => level,
        None if debug => "debug".to_string(),
        None => "info".to_string(),
    }
}

/// Tees diagnostics to stdout and the optional log file.
struct MultiWriter {
    stdout: io::Stdout,
    file: Option<Arc<Mutex<File>>>,
}

impl MultiWriter {
    fn new(file: Option<Arc<Mutex<File>>>) -> Self {
        Self {
            stdout: io::stdout(),
            file,
        }
    }
}

impl Write for MultiWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let _ = self.stdout.write_all(buf);
        if let Some(file) = &self.file {
            if let Ok(mut file) = file.lock() {
                let _ = file.write_all(buf);
            }
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        let _ = self.stdout.flush();
        if let Some(file) = &self.file {
            if let Ok(mut file) = file.lock() {
                let _ = file.flush();
            }
        }
        Ok(())
    }
}

fn open_log_file(log_dir: &str) -> io::Result<LogGuard> {
    if log_dir.trim().is_empty() {
        return Ok(LogGuard { file: None });
    }
    let dir = PathBuf::from(log_dir);
    std::fs::create_dir_all(&dir)?;
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(dir.join(LOG_FILE_NAME))?;
    Ok(LogGuard {
        file: Some(Arc::new(Mutex::new(file))),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn env_level_beats_debug_flag() {
        assert_eq!(resolve_level(true, Some("warn".to_string())), "warn");
        assert_eq!(resolve_level(true, None), "debug");
        assert_eq!(resolve_level(false, Some(" ".to_string())), "info");
    }

    #[test]
    fn multi_writer_appends_to_file() {
        let dir = TempDir::new().expect("tempdir");
        let log_dir = dir.path().join("diag");
        let guard = open_log_file(log_dir.to_str().expect("utf8 path")).expect("open");
        let mut writer = MultiWriter::new(guard.file.clone());
        writer.write_all(b"first\n").expect("write");
        writer.write_all(b"second\n").expect("write");
        writer.flush().expect("flush");
        let contents = std::fs::read_to_string(log_dir.join(LOG_FILE_NAME)).expect("read");
        assert_eq!(contents, "first\nsecond\n");
    }

    #[test]
    fn empty_log_dir_disables_file_output() {
        let guard = open_log_file("").expect("open");
        assert!(guard.file.is_none());
    }
}
