//! Artifact directory lock.
//!
//! One run at a time may touch an artifact directory. The lock is a JSON file
//! at `<artifact_dir>/.lock`. It is written in full to a private temp file and
//! published with a hard link, which fails if a lock already exists, so readers
//! never see a partly written lock and two racing processes cannot both win.
//!
//! Taking over a stale lock goes through a second guard file,
//! `<artifact_dir>/.lock.takeover`, published the same way. Only the guard
//! holder may remove a stale lock, and only if the file still holds exactly
//! the bytes that were judged stale.

use chrono::{DateTime, Utc};
use mythic_error::{JsonError, MythicResult, StorageError, StorageErrorKind};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

const LOCK_FILE: &str = ".lock";
const TAKEOVER_FILE: &str = ".lock.takeover";
const ACQUIRE_ATTEMPTS: usize = 50;
const TAKEOVER_WAIT: Duration = Duration::from_millis(10);

/// Who holds a lock.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, derive_getters::Getters)]
pub struct LockInfo {
    /// Run holding the lock
    run_id: String,
    /// Process id of the holder
    pid: u32,
    /// Host the holder runs on
    hostname: String,
    /// When the lock was taken
    acquired_at: DateTime<Utc>,
}

impl LockInfo {
    fn current(run_id: &str) -> Self {
        Self {
            run_id: run_id.to_string(),
            pid: std::process::id(),
            hostname: current_hostname(),
            acquired_at: Utc::now(),
        }
    }

    /// Whether the holder is known to be gone.
    ///
    /// Only a holder on this host can be checked; remote holders are assumed alive.
    pub fn is_stale(&self) -> bool {
        self.hostname == current_hostname() && !process_running(self.pid)
    }
}

/// Result of trying to take the lock.
#[derive(Debug)]
pub enum LockOutcome {
    /// The caller now holds the lock
    Acquired(RunLock),
    /// Another live run holds it
    Held(LockInfo),
}

/// Guard for a held lock.
///
/// Call [`RunLock::release`] on every exit path. If the guard is dropped
/// without being released (a cancelled future, a panic), `Drop` removes the
/// lock file instead.
#[derive(Debug)]
pub struct RunLock {
    path: PathBuf,
    info: LockInfo,
    released: bool,
}

impl RunLock {
    /// Owner metadata written to the lock file.
    pub fn info(&self) -> &LockInfo {
        &self.info
    }

    /// Remove the lock file. Calling this more than once is a no-op.
    ///
    /// The file is left alone if it now names a different run.
    pub fn release(&mut self) -> MythicResult<()> {
        if self.released {
            return Ok(());
        }
        self.released = true;
        remove_if_owned(&self.path, &self.info.run_id)?;
        info!(run_id = %self.info.run_id, "Released run lock");
        Ok(())
    }
}

impl Drop for RunLock {
    fn drop(&mut self) {
        if !self.released {
            warn!(run_id = %self.info.run_id, "Run lock dropped without release, removing");
            let _ = remove_if_owned(&self.path, &self.info.run_id);
        }
    }
}

fn current_hostname() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown".to_string())
}

#[cfg(target_os = "linux")]
fn process_running(pid: u32) -> bool {
    Path::new("/proc").join(pid.to_string()).exists()
}

#[cfg(not(target_os = "linux"))]
fn process_running(_pid: u32) -> bool {
    true
}

fn lock_path(artifact_dir: &Path) -> PathBuf {
    artifact_dir.join(LOCK_FILE)
}

fn write_error(path: &Path, e: std::io::Error) -> StorageError {
    StorageError::new(StorageErrorKind::FileWrite(format!("{}: {}", path.display(), e)))
}

/// What a lock-style file currently holds.
enum Observed {
    Missing,
    Holder { info: LockInfo, bytes: Vec<u8> },
    Corrupt { bytes: Vec<u8>, reason: String },
}

fn observe(path: &Path) -> MythicResult<Observed> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Observed::Missing),
        Err(e) => {
            return Err(StorageError::new(StorageErrorKind::FileRead(format!(
                "{}: {}",
                path.display(),
                e
            )))
            .into());
        }
    };
    Ok(match serde_json::from_slice(&bytes) {
        Ok(info) => Observed::Holder { info, bytes },
        Err(e) => Observed::Corrupt {
            bytes,
            reason: e.to_string(),
        },
    })
}

/// Read the lock file. A file that exists but cannot be parsed reads as `Err`.
fn read_lock(path: &Path) -> MythicResult<Option<LockInfo>> {
    match observe(path)? {
        Observed::Missing => Ok(None),
        Observed::Holder { info, .. } => Ok(Some(info)),
        Observed::Corrupt { reason, .. } => {
            Err(JsonError::in_document(path, format!("Corrupt lock file: {}", reason)).into())
        }
    }
}

fn encode(info: &LockInfo) -> MythicResult<Vec<u8>> {
    serde_json::to_vec_pretty(info)
        .map_err(|e| JsonError::new(format!("Failed to encode lock: {}", e)).into())
}

fn remove_file(path: &Path) -> MythicResult<bool> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(StorageError::new(StorageErrorKind::FileWrite(format!(
            "remove {}: {}",
            path.display(),
            e
        )))
        .into()),
    }
}

fn remove_if_owned(path: &Path, run_id: &str) -> MythicResult<bool> {
    match read_lock(path) {
        Ok(Some(existing)) if existing.run_id != run_id => {
            warn!(
                run_id,
                holder = %existing.run_id,
                "Not releasing lock owned by another run"
            );
            Ok(false)
        }
        Ok(None) => Ok(true),
        _ => {
            remove_file(path)?;
            Ok(true)
        }
    }
}

/// A temp file next to `path`, unique to this call.
fn temp_sibling(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(format!(".{}.tmp", uuid::Uuid::new_v4().simple()));
    PathBuf::from(name)
}

fn write_synced(path: &Path, data: &[u8]) -> MythicResult<()> {
    fs::File::create(path)
        .and_then(|mut file| {
            file.write_all(data)?;
            file.sync_all()
        })
        .map_err(|e| write_error(path, e).into())
}

/// Publish `data` at `path` unless a file is already there.
///
/// Returns `false` if one exists. The file appears with its full contents or
/// not at all.
fn publish(path: &Path, data: &[u8]) -> MythicResult<bool> {
    let temp = temp_sibling(path);
    write_synced(&temp, data)?;
    let linked = fs::hard_link(&temp, path);
    let _ = fs::remove_file(&temp);
    match linked {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Ok(false),
        Err(e) => Err(write_error(path, e).into()),
    }
}

/// Remove the file at `path` if it still holds exactly `seen`.
///
/// Callers hold the takeover guard, and a fresh lock is only ever published
/// onto an empty path, so the file cannot change between the check and the
/// removal.
fn remove_if_unchanged(path: &Path, seen: &[u8]) -> MythicResult<bool> {
    match fs::read(path) {
        Ok(current) if current == seen => remove_file(path),
        Ok(_) => Ok(false),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(StorageError::new(StorageErrorKind::FileRead(format!(
            "{}: {}",
            path.display(),
            e
        )))
        .into()),
    }
}

/// Remove the stale lock at `path`, whose contents were `seen`.
///
/// Returns `false` if another process is already taking it over.
fn take_over(path: &Path, seen: &[u8], taker: &LockInfo) -> MythicResult<bool> {
    let guard = path.with_file_name(TAKEOVER_FILE);
    if !publish(&guard, &encode(taker)?)? {
        // A taker that died mid-takeover leaves its guard behind
        if let Observed::Holder { info, bytes } = observe(&guard)?
            && info.is_stale()
        {
            warn!(holder = %info.run_id, pid = info.pid, "Clearing abandoned takeover guard");
            remove_if_unchanged(&guard, &bytes)?;
        }
        return Ok(false);
    }

    let removed = remove_if_unchanged(path, seen);
    remove_file(&guard)?;
    removed?;
    Ok(true)
}

/// Replace the lock contents with `data`. Only used by the run already holding it.
fn overwrite(path: &Path, data: &[u8]) -> MythicResult<()> {
    let temp = temp_sibling(path);
    write_synced(&temp, data)?;
    fs::rename(&temp, path).map_err(|e| {
        let _ = fs::remove_file(&temp);
        write_error(path, e).into()
    })
}

/// Take the lock for `run_id`.
///
/// Never blocks on a live holder: it is reported as [`LockOutcome::Held`].
/// A lock already held by the same run id is refreshed and re-acquired, which
/// is how a resumed run gets back in. Locks left by dead processes on this
/// host, and lock files that cannot be parsed, are taken over. While another
/// process is mid-takeover this waits briefly and looks again.
///
/// This does blocking filesystem I/O; async callers run it on a blocking
/// thread.
///
/// # Errors
///
/// Returns an error only for filesystem failures.
#[tracing::instrument(skip(artifact_dir), fields(dir = %artifact_dir.display()))]
pub fn acquire_lock(artifact_dir: &Path, run_id: &str) -> MythicResult<LockOutcome> {
    fs::create_dir_all(artifact_dir).map_err(|e| {
        StorageError::new(StorageErrorKind::DirectoryCreation(format!(
            "{}: {}",
            artifact_dir.display(),
            e
        )))
    })?;

    let path = lock_path(artifact_dir);
    let info = LockInfo::current(run_id);
    let payload = encode(&info)?;

    for _ in 0..ACQUIRE_ATTEMPTS {
        if publish(&path, &payload)? {
            info!(pid = info.pid, hostname = %info.hostname, "Acquired run lock");
            return Ok(LockOutcome::Acquired(RunLock {
                path,
                info,
                released: false,
            }));
        }

        let taken_over = match observe(&path)? {
            Observed::Holder { info: existing, .. } if existing.run_id == run_id => {
                debug!("Lock already held by this run, refreshing");
                overwrite(&path, &payload)?;
                return Ok(LockOutcome::Acquired(RunLock {
                    path,
                    info,
                    released: false,
                }));
            }
            Observed::Holder {
                info: existing,
                bytes,
            } if existing.is_stale() => {
                warn!(holder = %existing.run_id, pid = existing.pid, "Taking over stale lock");
                take_over(&path, &bytes, &info)?
            }
            Observed::Holder { info: existing, .. } => {
                info!(holder = %existing.run_id, pid = existing.pid, "Lock held by another run");
                return Ok(LockOutcome::Held(existing));
            }
            // Released between our publish attempt and the read
            Observed::Missing => true,
            Observed::Corrupt { bytes, reason } => {
                warn!(error = %reason, "Unreadable lock file, treating as stale");
                take_over(&path, &bytes, &info)?
            }
        };
        if !taken_over {
            std::thread::sleep(TAKEOVER_WAIT);
        }
    }

    match read_lock(&path) {
        Ok(Some(existing)) => Ok(LockOutcome::Held(existing)),
        _ => Err(StorageError::new(StorageErrorKind::FileWrite(format!(
            "could not acquire {}",
            path.display()
        )))
        .into()),
    }
}

/// Release the lock if `run_id` holds it.
///
/// Returns `false` when another run holds the lock. A missing lock counts as released.
pub fn release_lock(artifact_dir: &Path, run_id: &str) -> MythicResult<bool> {
    remove_if_owned(&lock_path(artifact_dir), run_id)
}

/// Current holder of the lock, if any.
///
/// # Errors
///
/// Returns an error if the lock file exists but cannot be read or parsed.
pub fn check_lock(artifact_dir: &Path) -> MythicResult<Option<LockInfo>> {
    read_lock(&lock_path(artifact_dir))
}

/// Remove the lock regardless of owner. Returns whether a file was removed.
pub fn force_release_lock(artifact_dir: &Path) -> MythicResult<bool> {
    let removed = remove_file(&lock_path(artifact_dir))?;
    if removed {
        warn!(dir = %artifact_dir.display(), "Force-released run lock");
    }
    Ok(removed)
}
