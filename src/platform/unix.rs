use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use super::{Platform, resolve_data_dir};

pub struct NativePlatform;

impl Platform for NativePlatform {
    fn data_dir() -> PathBuf {
        resolve_data_dir(
            dirs::home_dir()
                .expect("Could not find home directory")
                .join(".vigil"),
        )
    }

    fn restrict_dir_permissions(path: &Path) {
        let _ = std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o700));
    }

    fn restrict_file_permissions(path: &Path) {
        let _ = std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600));
    }

    fn process_alive(pid: u32) -> bool {
        std::process::Command::new("kill")
            .arg("-0")
            .arg(pid.to_string())
            .output()
            .map(|out| out.status.success())
            .unwrap_or(false)
    }

    fn kill_process(pid: u32) -> std::io::Result<std::process::Output> {
        std::process::Command::new("kill")
            .arg("-9")
            .arg(pid.to_string())
            .output()
    }
}
