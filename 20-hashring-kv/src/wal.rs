//! Append-only write-ahead log.
//!
//! Records use the text form from [`crate::command`], one per line. The log
//! is the only durable state a node has: on startup it is replayed into an
//! empty [`KvStore`](crate::store::KvStore), and nothing is ever compacted,
//! so recovery time grows with the total number of mutations ever logged.
//!
//! # Recovery rules
//!
//! - Lines are parsed independently. A malformed line is skipped with a
//!   warning and never partially applied.
//! - A final line without its newline is a write torn by a crash. It is not
//!   applied, and the file is truncated back to the last complete record so
//!   later appends start on a clean line.
//!
//! An append that fails partway is rolled back the same way before the
//! writer lock is released. If the rollback itself fails, every later append
//! retries it first and fails until it succeeds.

use std::collections::HashSet;
use std::fs::{File, OpenOptions};
use std::io::{self, BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, OnceLock, PoisonError};

use tracing::{debug, warn};

use crate::command::Mutation;
use crate::error::{DecodeError, WalError};
use crate::store::ReplayTarget;

/// How far an append is pushed before the call returns.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SyncPolicy {
    /// `fdatasync` after every record; survives power loss.
    #[default]
    Data,
    /// Hand the record to the OS only; survives a process crash but not a
    /// machine crash.
    Flush,
}

/// Outcome of a [`WriteAheadLog::replay`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplayStats {
    /// Records applied to the target.
    pub applied: usize,
    /// Complete lines that failed to decode.
    pub skipped: usize,
    /// Bytes of a torn final record that were cut from the file.
    pub truncated_bytes: u64,
}

/// Durable, serialized log of mutations backed by a single file.
///
/// At most one `WriteAheadLog` per file may be alive in a process; a second
/// [`open`](WriteAheadLog::open) of the same path fails with
/// [`WalError::AlreadyOpen`] until the first is dropped.
#[derive(Debug)]
pub struct WriteAheadLog {
    path: PathBuf,
    sync: SyncPolicy,
    writer: Mutex<LogWriter>,
    _claim: PathClaim,
}

impl WriteAheadLog {
    /// Opens `path` for appending, creating the file if needed.
    pub fn open(path: impl AsRef<Path>, sync: SyncPolicy) -> Result<Self, WalError> {
        let path = path.as_ref().to_path_buf();
        let open_err = |source| WalError::Open {
            path: path.clone(),
            source,
        };
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(open_err)?;
        let writer = LogWriter::new(file).map_err(open_err)?;
        let canonical = path.canonicalize().map_err(open_err)?;
        let claim = PathClaim::acquire(canonical).ok_or_else(|| WalError::AlreadyOpen {
            path: path.clone(),
        })?;

        debug!(path = %path.display(), ?sync, "opened write-ahead log");
        Ok(Self {
            path,
            sync,
            writer: Mutex::new(writer),
            _claim: claim,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn sync_policy(&self) -> SyncPolicy {
        self.sync
    }

    /// Durably records `PUT key value`.
    pub fn log_put(&self, key: &str, value: &str) -> Result<(), WalError> {
        self.append(&Mutation::put(key, value))
    }

    /// Durably records `REMOVE key`.
    pub fn log_remove(&self, key: &str) -> Result<(), WalError> {
        self.append(&Mutation::remove(key))
    }

    pub fn append(&self, mutation: &Mutation) -> Result<(), WalError> {
        self.append_then(mutation, || ())
    }

    /// Durably records `mutation`, then runs `apply` before releasing the
    /// writer lock.
    ///
    /// Every caller that mutates state through this method observes the same
    /// order in memory as on disk, which is what makes replay reproduce the
    /// live state. `apply` does not run if the append fails.
    pub fn append_then<R>(
        &self,
        mutation: &Mutation,
        apply: impl FnOnce() -> R,
    ) -> Result<R, WalError> {
        let line = mutation.encode();
        let mut writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        writer
            .append(line.as_bytes(), self.sync)
            .map_err(|source| WalError::Append {
                path: self.path.clone(),
                source,
            })?;
        Ok(apply())
    }

    /// Replays every complete record, in file order, into `target`.
    ///
    /// Appends are blocked for the duration of the replay.
    pub fn replay<T: ReplayTarget + ?Sized>(&self, target: &T) -> Result<ReplayStats, WalError> {
        let mut writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        let replay_err = |source| WalError::Replay {
            path: self.path.clone(),
            source,
        };

        let mut reader = BufReader::new(File::open(&self.path).map_err(replay_err)?);
        let mut stats = ReplayStats::default();
        let mut buf = Vec::new();
        let mut offset: u64 = 0;
        let mut line_no = 0usize;

        loop {
            buf.clear();
            let read = reader.read_until(b'\n', &mut buf).map_err(replay_err)?;
            if read == 0 {
                break;
            }
            line_no += 1;

            if buf.last() != Some(&b'\n') {
                warn!(
                    path = %self.path.display(),
                    line = line_no,
                    bytes = read,
                    "discarding torn record at end of log"
                );
                writer.file.set_len(offset).map_err(replay_err)?;
                writer.file.sync_all().map_err(replay_err)?;
                stats.truncated_bytes = read as u64;
                break;
            }
            offset += read as u64;

            let decoded = std::str::from_utf8(&buf)
                .map_err(|err| err.to_string())
                .and_then(|line| match Mutation::decode(line) {
                    Err(DecodeError::Empty) => Ok(None),
                    other => other.map(Some).map_err(|err| err.to_string()),
                });
            match decoded {
                Ok(Some(mutation)) => {
                    mutation.apply(target);
                    stats.applied += 1;
                }
                Ok(None) => {}
                Err(error) => {
                    warn!(
                        path = %self.path.display(),
                        line = line_no,
                        %error,
                        "skipping malformed log record"
                    );
                    stats.skipped += 1;
                }
            }
        }

        writer.committed = offset;
        writer.torn = false;

        debug!(
            path = %self.path.display(),
            applied = stats.applied,
            skipped = stats.skipped,
            truncated_bytes = stats.truncated_bytes,
            "replayed write-ahead log"
        );
        Ok(stats)
    }
}

/// File operations the writer needs on top of [`Write`].
trait LogFile: Write {
    fn size(&self) -> io::Result<u64>;
    fn truncate(&mut self, len: u64) -> io::Result<()>;
    fn sync(&mut self, policy: SyncPolicy) -> io::Result<()>;
}

impl LogFile for File {
    fn size(&self) -> io::Result<u64> {
        Ok(self.metadata()?.len())
    }

    fn truncate(&mut self, len: u64) -> io::Result<()> {
        self.set_len(len)
    }

    fn sync(&mut self, policy: SyncPolicy) -> io::Result<()> {
        match policy {
            SyncPolicy::Data => self.sync_data(),
            SyncPolicy::Flush => self.flush(),
        }
    }
}

/// Write side of the log.
#[derive(Debug)]
struct LogWriter<F = File> {
    file: F,
    /// File length up to the end of the last complete record.
    committed: u64,
    /// A failed append left bytes past `committed` that are not yet removed.
    torn: bool,
}

impl<F: LogFile> LogWriter<F> {
    fn new(file: F) -> io::Result<Self> {
        let committed = file.size()?;
        Ok(Self {
            file,
            committed,
            torn: false,
        })
    }

    /// Appends one complete record, or leaves the file at `committed`.
    fn append(&mut self, record: &[u8], policy: SyncPolicy) -> io::Result<()> {
        if self.torn {
            self.file.truncate(self.committed)?;
            self.torn = false;
        }

        let written = self
            .file
            .write_all(record)
            .and_then(|()| self.file.sync(policy));
        if let Err(error) = written {
            match self.file.truncate(self.committed) {
                Ok(()) => {}
                Err(rollback) => {
                    warn!(
                        %rollback,
                        committed = self.committed,
                        "failed to roll back partial record"
                    );
                    self.torn = true;
                }
            }
            return Err(error);
        }
        self.committed += record.len() as u64;
        Ok(())
    }
}

fn open_paths() -> &'static Mutex<HashSet<PathBuf>> {
    static OPEN: OnceLock<Mutex<HashSet<PathBuf>>> = OnceLock::new();
    OPEN.get_or_init(Default::default)
}

/// Process-wide marker that a log file is owned by a live `WriteAheadLog`.
#[derive(Debug)]
struct PathClaim(PathBuf);

impl PathClaim {
    fn acquire(path: PathBuf) -> Option<Self> {
        let mut open = open_paths().lock().unwrap_or_else(PoisonError::into_inner);
        if open.insert(path.clone()) {
            Some(PathClaim(path))
        } else {
            None
        }
    }
}

impl Drop for PathClaim {
    fn drop(&mut self) {
        open_paths()
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.0);
    }
}
