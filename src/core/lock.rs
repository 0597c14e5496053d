//! Process-singleton guard. The external scheduler can and will launch
//! overlapping invocations; whoever holds the pid file runs plugins, everyone
//! else exits without side effects.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use tracing::{info, warn};

use crate::platform::{NativePlatform, Platform};

pub const LOCK_FILE_NAME: &str = "vigil_agent.pid";

/// A pid file older than this belongs to a process presumed hung.
const STALE_AFTER: Duration = Duration::from_secs(25 * 60);

#[derive(Debug)]
pub enum Acquisition {
    Acquired(ProcessLock),
    /// Another live instance owns the marker.
    Held(u32),
}

/// Exclusive marker, released on drop so abnormal exits clean up too.
#[derive(Debug)]
pub struct ProcessLock {
    path: PathBuf,
}

impl Drop for ProcessLock {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            warn!("Unable to remove pid file: {}", e);
        }
    }
}

/// Tries to create the pid file exclusively. On conflict, a dead owner or a
/// stale marker is cleared and acquisition retried once; a live owner wins.
pub fn acquire(dir: &Path) -> Result<Acquisition> {
    fs::create_dir_all(dir).with_context(|| format!("could not create {}", dir.display()))?;
    let path = dir.join(LOCK_FILE_NAME);

    for attempt in 0..2 {
        match fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
        {
            Ok(mut file) => {
                writeln!(file, "{}", std::process::id())?;
                return Ok(Acquisition::Acquired(ProcessLock { path }));
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                let owner = fs::read_to_string(&path)
                    .ok()
                    .and_then(|s| s.trim().parse::<u32>().ok());
                let alive = owner.map(NativePlatform::process_alive).unwrap_or(false);
                let stale = fs::metadata(&path)
                    .and_then(|m| m.modified())
                    .ok()
                    .and_then(|m| m.elapsed().ok())
                    .map(|age| age > STALE_AFTER)
                    .unwrap_or(false);

                if alive && !stale {
                    return Ok(Acquisition::Held(owner.unwrap_or(0)));
                }
                if alive && stale {
                    // owner has been at it for 25 minutes; assume it hung
                    if let Some(pid) = owner {
                        info!("Trying to KILL an old process (pid {})...", pid);
                        let _ = NativePlatform::kill_process(pid);
                    }
                }
                if attempt == 0 {
                    info!("Stale pid file found. Clearing it and retrying...");
                    let _ = fs::remove_file(&path);
                }
            }
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("could not create pid file at {}", path.display()));
            }
        }
    }
    bail!("could not acquire pid file at {}", path.display())
}
