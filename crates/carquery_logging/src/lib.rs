//! Tracing setup shared by carquery binaries.
//!
//! Events go to a size-rotated file under `$CARQUERY_HOME/logs` and to
//! stderr. `RUST_LOG` overrides the default filter for both.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

const DEFAULT_LOG_FILTER: &str = "carquery=info,carquery_sql=info,carquery_db=info";
const MAX_LOG_FILES: usize = 5;
const MAX_LOG_FILE_SIZE: u64 = 10 * 1024 * 1024;

pub struct LogConfig<'a> {
    pub app_name: &'a str,
    /// Mirror the file filter on stderr instead of showing warnings only.
    pub verbose: bool,
}

/// Install the global subscriber.
pub fn init_logging(config: LogConfig<'_>) -> Result<()> {
    let dir = ensure_logs_dir()?;
    let writer = RotatingWriter::open(&dir, config.app_name, MAX_LOG_FILES, MAX_LOG_FILE_SIZE)
        .with_context(|| format!("Failed to open log file in {}", dir.display()))?;

    let file_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    let stderr_filter = if config.verbose {
        file_filter.clone()
    } else {
        EnvFilter::new("warn")
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_filter(file_filter),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(io::stderr)
                .with_target(false)
                .with_filter(stderr_filter),
        )
        .try_init()
        .context("Failed to install tracing subscriber")?;
    Ok(())
}

/// `$CARQUERY_HOME`, else `~/.carquery`.
pub fn carquery_home() -> Result<PathBuf> {
    if let Ok(dir) = std::env::var("CARQUERY_HOME") {
        return Ok(PathBuf::from(dir));
    }
    dirs::home_dir()
        .map(|home| home.join(".carquery"))
        .context("Could not determine home directory")
}

pub fn logs_dir() -> Result<PathBuf> {
    Ok(carquery_home()?.join("logs"))
}

pub fn ensure_logs_dir() -> Result<PathBuf> {
    let dir = logs_dir()?;
    fs::create_dir_all(&dir)
        .with_context(|| format!("Failed to create logs directory: {}", dir.display()))?;
    Ok(dir)
}

/// Append-only log file that shifts `name.log` to `name.log.1`, `.1` to `.2`
/// and so on once it would grow past `max_size`.
struct RotatingFile {
    dir: PathBuf,
    stem: String,
    keep: usize,
    max_size: u64,
    file: Option<File>,
    written: u64,
}

impl RotatingFile {
    fn open(dir: &Path, app_name: &str, keep: usize, max_size: u64) -> io::Result<Self> {
        fs::create_dir_all(dir)?;
        let mut log = Self {
            dir: dir.to_path_buf(),
            stem: file_stem(app_name),
            keep: keep.max(1),
            max_size,
            file: None,
            written: 0,
        };
        log.reopen()?;
        if log.written > log.max_size {
            log.rotate()?;
        }
        Ok(log)
    }

    fn path(&self, generation: usize) -> PathBuf {
        match generation {
            0 => self.dir.join(format!("{}.log", self.stem)),
            n => self.dir.join(format!("{}.log.{}", self.stem, n)),
        }
    }

    fn reopen(&mut self) -> io::Result<()> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.path(0))?;
        self.written = file.metadata()?.len();
        self.file = Some(file);
        Ok(())
    }

    fn rotate(&mut self) -> io::Result<()> {
        if let Some(mut file) = self.file.take() {
            file.flush()?;
        }
        let oldest = self.keep - 1;
        if oldest > 0 {
            let doomed = self.path(oldest);
            if doomed.exists() {
                fs::remove_file(doomed)?;
            }
            for generation in (0..oldest).rev() {
                let from = self.path(generation);
                if from.exists() {
                    fs::rename(&from, self.path(generation + 1))?;
                }
            }
        } else {
            File::create(self.path(0))?;
        }
        self.reopen()
    }
}

impl Write for RotatingFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.written > 0 && self.written + buf.len() as u64 > self.max_size {
            self.rotate()?;
        }
        let file = self
            .file
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "log file unavailable"))?;
        let n = file.write(buf)?;
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        match self.file.as_mut() {
            Some(file) => file.flush(),
            None => Ok(()),
        }
    }
}

/// Cloneable handle so every event shares one open file.
#[derive(Clone)]
struct RotatingWriter(Arc<Mutex<RotatingFile>>);

impl RotatingWriter {
    fn open(dir: &Path, app_name: &str, keep: usize, max_size: u64) -> io::Result<Self> {
        let file = RotatingFile::open(dir, app_name, keep, max_size)?;
        Ok(Self(Arc::new(Mutex::new(file))))
    }

    fn with_file<T>(&self, f: impl FnOnce(&mut RotatingFile) -> io::Result<T>) -> io::Result<T> {
        let mut guard = self
            .0
            .lock()
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "log writer lock poisoned"))?;
        f(&mut *guard)
    }
}

impl Write for RotatingWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.with_file(|file| file.write(buf))
    }

    fn flush(&mut self) -> io::Result<()> {
        self.with_file(|file| file.flush())
    }
}

impl<'a> MakeWriter<'a> for RotatingWriter {
    type Writer = RotatingWriter;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

fn file_stem(app_name: &str) -> String {
    app_name
        .chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() || ch == '-' || ch == '_' {
                ch
            } else {
                '_'
            }
        })
        .collect()
}
