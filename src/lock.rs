use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::error::BidsError;
use crate::fs_util::fs_err;

pub const LOCK_FILE_NAME: &str = ".run.lock";
const POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Exclusive claim on a session directory of the rawdata tree.
///
/// Run numbers are derived from what is already on disk, so two jobs writing
/// into the same `sub-*/ses-*` directory must not allocate concurrently. The
/// lock is a file created with `create_new`; it is removed on drop. A lock
/// whose stamp is older than the timeout and whose owner process is gone is
/// treated as left behind by a crash and taken over.
#[derive(Debug)]
pub struct RunLock {
    path: PathBuf,
}

impl RunLock {
    pub fn acquire(dir: &Path, timeout: Duration) -> Result<Self, BidsError> {
        fs::create_dir_all(dir).map_err(|err| fs_err("create dir", dir, err))?;
        let path = dir.join(LOCK_FILE_NAME);
        let start = Instant::now();
        let mut announced = false;
        loop {
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(mut file) => {
                    let stamp = format!(
                        "pid={} acquired={}\n",
                        std::process::id(),
                        Utc::now().to_rfc3339()
                    );
                    file.write_all(stamp.as_bytes())
                        .map_err(|err| fs_err("write", &path, err))?;
                    debug!(lock = %path.display(), "run lock acquired");
                    return Ok(Self { path });
                }
                Err(err) if err.kind() == ErrorKind::AlreadyExists => {
                    if is_stale(&path, timeout) {
                        warn!(lock = %path.display(), "removing stale run lock");
                        match fs::remove_file(&path) {
                            Ok(()) => continue,
                            Err(err) if err.kind() == ErrorKind::NotFound => continue,
                            Err(err) => return Err(fs_err("remove", &path, err)),
                        }
                    }
                    if start.elapsed() >= timeout {
                        return Err(BidsError::LockTimeout(path));
                    }
                    if !announced {
                        info!(lock = %path.display(), "waiting for run lock");
                        announced = true;
                    }
                    thread::sleep(POLL_INTERVAL);
                }
                Err(err) => return Err(fs_err("create", &path, err)),
            }
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// `pid=<pid> acquired=<rfc3339>` as written by [`RunLock::acquire`].
fn parse_stamp(content: &str) -> Option<(u32, DateTime<Utc>)> {
    let mut pid = None;
    let mut acquired = None;
    for field in content.split_whitespace() {
        if let Some(value) = field.strip_prefix("pid=") {
            pid = value.parse::<u32>().ok();
        } else if let Some(value) = field.strip_prefix("acquired=") {
            acquired = DateTime::parse_from_rfc3339(value)
                .ok()
                .map(|time| time.with_timezone(&Utc));
        }
    }
    Some((pid?, acquired?))
}

fn is_stale(path: &Path, timeout: Duration) -> bool {
    let Ok(content) = fs::read_to_string(path) else {
        return false;
    };
    let Some((pid, acquired)) = parse_stamp(&content) else {
        return false;
    };
    let Ok(timeout) = chrono::Duration::from_std(timeout) else {
        return false;
    };
    Utc::now() - acquired > timeout && !process_alive(pid)
}

#[cfg(target_os = "linux")]
fn process_alive(pid: u32) -> bool {
    Path::new("/proc").join(pid.to_string()).exists()
}

// Without a process table to consult, an expired stamp is enough.
#[cfg(not(target_os = "linux"))]
fn process_alive(_pid: u32) -> bool {
    false
}

impl Drop for RunLock {
    fn drop(&mut self) {
        if let Err(err) = fs::remove_file(&self.path) {
            warn!(lock = %self.path.display(), error = %err, "failed to release run lock");
        }
    }
}
