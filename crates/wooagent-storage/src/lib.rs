use std::collections::VecDeque;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;
use wooagent_core::{LogEntry, LogQuery, TraceAggregator, TraceGroup};

pub const COMBINED_LOG_FILE: &str = "combined.log";
pub const ERROR_LOG_FILE: &str = "error.log";
pub const DEFAULT_RECENT_CAPACITY: usize = 1000;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl StorageError {
    fn io(path: &Path, source: io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub dir: PathBuf,
    pub recent_capacity: usize,
}

impl StoreConfig {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            recent_capacity: DEFAULT_RECENT_CAPACITY,
        }
    }

    pub fn combined_path(&self) -> PathBuf {
        self.dir.join(COMBINED_LOG_FILE)
    }

    pub fn error_path(&self) -> PathBuf {
        self.dir.join(ERROR_LOG_FILE)
    }
}

/// Result of one ingest: the stored entry, the trace group it touched, and any
/// persistence failure. The entry stays in memory even when the write failed.
#[derive(Debug)]
pub struct IngestOutcome {
    pub entry: LogEntry,
    pub trace: Option<TraceGroup>,
    pub persist_error: Option<StorageError>,
}

/// Recent-log ring, trace map and the two append-only NDJSON files.
///
/// Not synchronized: callers serialize access through a single owner.
pub struct LogStore {
    config: StoreConfig,
    recent: VecDeque<LogEntry>,
    traces: TraceAggregator,
    combined: File,
    errors: File,
}

impl LogStore {
    pub fn open(config: StoreConfig) -> Result<Self, StorageError> {
        fs::create_dir_all(&config.dir).map_err(|err| StorageError::io(&config.dir, err))?;
        let capacity = config.recent_capacity.max(1);
        let combined_path = config.combined_path();
        let error_path = config.error_path();

        let recent = load_tail(&combined_path, capacity)?;
        let mut traces = TraceAggregator::new();
        traces.bulk_ingest(&recent);

        let combined = open_append(&combined_path)?;
        let errors = open_append(&error_path)?;
        Ok(Self {
            config: StoreConfig {
                recent_capacity: capacity,
                ..config
            },
            recent,
            traces,
            combined,
            errors,
        })
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub fn ingest(&mut self, entry: LogEntry) -> IngestOutcome {
        let persist_error = self.persist(&entry).err();

        if self.recent.len() >= self.config.recent_capacity {
            self.recent.pop_front();
        }
        self.recent.push_back(entry.clone());
        let trace = self.traces.ingest(&entry).cloned();

        IngestOutcome {
            entry,
            trace,
            persist_error,
        }
    }

    /// Most-recent-first view over the in-memory ring.
    pub fn recent(&self, limit: usize) -> Vec<LogEntry> {
        self.recent.iter().rev().take(limit).cloned().collect()
    }

    pub fn recent_len(&self) -> usize {
        self.recent.len()
    }

    /// Filters the persisted records. Returns the last `limit` matches,
    /// most-recent-first. Malformed lines are skipped.
    pub fn query(&self, filter: &LogQuery) -> Result<Vec<LogEntry>, StorageError> {
        let path = if filter.reads_error_file() {
            self.config.error_path()
        } else {
            self.config.combined_path()
        };
        let limit = filter.effective_limit();
        if limit == 0 {
            return Ok(Vec::new());
        }

        let mut window = VecDeque::with_capacity(limit.min(DEFAULT_RECENT_CAPACITY));
        for entry in read_entries(&path)? {
            if !filter.matches(&entry) {
                continue;
            }
            if window.len() == limit {
                window.pop_front();
            }
            window.push_back(entry);
        }
        Ok(window.into_iter().rev().collect())
    }

    pub fn get_trace(&self, trace_id: &str) -> Option<TraceGroup> {
        self.traces.get_group(trace_id).cloned()
    }

    pub fn list_traces(&self, active_only: bool) -> Vec<TraceGroup> {
        if active_only {
            self.traces.list_active_groups()
        } else {
            self.traces.list_all()
        }
    }

    pub fn trace_count(&self) -> usize {
        self.traces.len()
    }

    pub fn clear_traces(&mut self) -> usize {
        let cleared = self.traces.len();
        self.traces.clear();
        cleared
    }

    fn persist(&mut self, entry: &LogEntry) -> Result<(), StorageError> {
        let mut line = serde_json::to_string(entry)?;
        line.push('\n');
        self.combined
            .write_all(line.as_bytes())
            .map_err(|err| StorageError::io(&self.config.combined_path(), err))?;
        if entry.is_error() {
            self.errors
                .write_all(line.as_bytes())
                .map_err(|err| StorageError::io(&self.config.error_path(), err))?;
        }
        Ok(())
    }
}

fn open_append(path: &Path) -> Result<File, StorageError> {
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|err| StorageError::io(path, err))
}

fn read_entries(path: &Path) -> Result<impl Iterator<Item = LogEntry>, StorageError> {
    // Raw byte lines: a torn multibyte write must only cost its own line.
    let lines: Box<dyn Iterator<Item = io::Result<Vec<u8>>>> = match File::open(path) {
        Ok(file) => Box::new(BufReader::new(file).split(b'\n')),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Box::new(std::iter::empty()),
        Err(err) => return Err(StorageError::io(path, err)),
    };
    Ok(lines
        .map_while(Result::ok)
        .filter(|line| !line.iter().all(u8::is_ascii_whitespace))
        .filter_map(|line| serde_json::from_slice::<LogEntry>(&line).ok()))
}

fn load_tail(path: &Path, capacity: usize) -> Result<VecDeque<LogEntry>, StorageError> {
    let mut tail = VecDeque::with_capacity(capacity);
    for entry in read_entries(path)? {
        if tail.len() == capacity {
            tail.pop_front();
        }
        tail.push_back(entry);
    }
    Ok(tail)
}
