use std::path::{Path, PathBuf};

/// Platform-specific operations abstracted behind a common interface.
/// Each OS provides its own `NativePlatform` implementation so call sites
/// remain free of `#[cfg]` blocks.
pub trait Platform {
    /// Root data directory. Unix: `~/.vigil`, Windows: `%APPDATA%\vigil`.
    fn data_dir() -> PathBuf;

    /// Set restrictive *directory* permissions (0o700 on Unix, no-op on Windows).
    fn restrict_dir_permissions(path: &Path);

    /// Set restrictive *file* permissions (0o600 on Unix, no-op on Windows).
    fn restrict_file_permissions(path: &Path);

    /// True when a process with this pid is still alive.
    fn process_alive(pid: u32) -> bool;

    /// Forcibly terminate a process presumed hung.
    fn kill_process(pid: u32) -> std::io::Result<std::process::Output>;
}

pub(crate) fn resolve_data_dir(default: PathBuf) -> PathBuf {
    match std::env::var("VIGIL_DATA_DIR") {
        Ok(dir) if !dir.is_empty() => PathBuf::from(dir),
        _ => default,
    }
}

#[cfg(unix)]
mod unix;
#[cfg(unix)]
pub use unix::NativePlatform;

#[cfg(windows)]
mod windows;
#[cfg(windows)]
pub use windows::NativePlatform;
