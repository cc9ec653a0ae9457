use crate::settings::Config;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, SystemTime};
use tracing_subscriber::{fmt::writer::BoxMakeWriter, EnvFilter};

const LOG_PREFIX: &str = "sdash-";

/// Keeps the log file open for the life of the process.
pub struct LogGuard {
    file: Option<Arc<Mutex<File>>>,
    pub path: Option<PathBuf>,
}

/// Installs the global subscriber. Stdout belongs to the terminal UI, so
/// records go to a per-process file and optionally to stderr.
pub fn init_logging(config: &Config) -> Option<LogGuard> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));
    let pruned = prune_old_logs(
        &config.log_dir,
        Duration::from_secs(u64::from(config.log_retention_days) * 24 * 60 * 60),
        SystemTime::now(),
    );
    let writer = match open_log_file(&config.log_dir) {
        Ok(log_guard) => log_guard,
        Err(err) => {
            eprintln!("log_file_error: {err}");
            LogGuard {
                file: None,
                path: None,
            }
        }
    };
    let file = writer.file.clone();
    let to_stderr = config.log_stdout;
    let make_writer = BoxMakeWriter::new(move || MultiWriter::new(file.clone(), to_stderr));
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_ansi(false)
        .with_writer(make_writer)
        .finish();
    if tracing::subscriber::set_global_default(subscriber).is_err() {
        return None;
    }
    if pruned > 0 {
        tracing::debug!("log_files_pruned: {pruned}");
    }
    Some(writer)
}

struct MultiWriter {
    stderr: Option<io::Stderr>,
    file: Option<Arc<Mutex<File>>>,
}

impl MultiWriter {
    fn new(file: Option<Arc<Mutex<File>>>, to_stderr: bool) -> Self {
        Self {
            stderr: to_stderr.then(io::stderr),
            file,
        }
    }
}

impl Write for MultiWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if let Some(stderr) = &mut self.stderr {
            let _ = stderr.write_all(buf);
        }
        if let Some(file) = &self.file {
            let mut file = file.lock().unwrap_or_else(PoisonError::into_inner);
            let _ = file.write_all(buf);
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        if let Some(stderr) = &mut self.stderr {
            let _ = stderr.flush();
        }
        if let Some(file) = &self.file {
            let mut file = file.lock().unwrap_or_else(PoisonError::into_inner);
            let _ = file.flush();
        }
        Ok(())
    }
}

fn open_log_file(log_dir: &Path) -> io::Result<LogGuard> {
    if log_dir.as_os_str().is_empty() {
        return Ok(LogGuard {
            file: None,
            path: None,
        });
    }
    fs::create_dir_all(log_dir)?;
    let stamp = chrono::Local::now().format("%Y%m%d-%H%M%S");
    let path = log_dir.join(format!("{LOG_PREFIX}{stamp}-{}.log", std::process::id()));
    let file = OpenOptions::new().create(true).append(true).open(&path)?;
    Ok(LogGuard {
        file: Some(Arc::new(Mutex::new(file))),
        path: Some(path),
    })
}

/// Deletes this program's log files last modified more than `retention`
/// before `now`. Returns how many were removed.
pub fn prune_old_logs(log_dir: &Path, retention: Duration, now: SystemTime) -> usize {
    let Ok(entries) = fs::read_dir(log_dir) else {
        return 0;
    };
    let mut removed = 0;
    for entry in entries.flatten() {
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if !name.starts_with(LOG_PREFIX) || !name.ends_with(".log") {
            continue;
        }
        let modified = match entry.metadata().and_then(|meta| meta.modified()) {
            Ok(modified) => modified,
            Err(_) => continue,
        };
        let age = now.duration_since(modified).unwrap_or_default();
        if age > retention && fs::remove_file(entry.path()).is_ok() {
            removed += 1;
        }
    }
    removed
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const DAY: Duration = Duration::from_secs(24 * 60 * 60);

    #[test]
    fn pruning_only_touches_old_sdash_logs() {
        let dir = TempDir::new().unwrap();
        for name in ["sdash-old.log", "sdash-new.log", "other.log", "sdash-notes.txt"] {
            fs::write(dir.path().join(name), "x").unwrap();
        }
        let later = SystemTime::now() + 10 * DAY;
        // Everything was written just now, so ten days later all are stale.
        assert_eq!(prune_old_logs(dir.path(), 7 * DAY, later), 2);
        assert!(dir.path().join("other.log").exists());
        assert!(dir.path().join("sdash-notes.txt").exists());
        assert!(!dir.path().join("sdash-old.log").exists());
    }

    #[test]
    fn recent_logs_survive() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("sdash-a.log"), "x").unwrap();
        assert_eq!(prune_old_logs(dir.path(), 7 * DAY, SystemTime::now()), 0);
        assert_eq!(prune_old_logs(&dir.path().join("missing"), DAY, SystemTime::now()), 0);
    }

    #[test]
    fn log_file_is_created_in_the_directory() {
        let dir = TempDir::new().unwrap();
        let nested = dir.path().join("logs");
        let guard = open_log_file(&nested).unwrap();
        let path = guard.path.expect("log path");
        assert!(path.starts_with(&nested));
        assert!(path.exists());
        let name = path.file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.starts_with("sdash-") && name.ends_with(".log"));
    }
}
