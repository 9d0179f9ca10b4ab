use devd_core::ops::ota::OtaImage;
use std::path::Path;
use tokio::process::Command;

/// Status reported to the cloud when the OTA program cannot be started or is
/// killed by a signal.
pub const OTA_LAUNCH_FAILED: i32 = -1;

/// Builds the invocation of the configured OTA program: the image URL as the
/// only argument, the rest of the image details in the environment.
pub fn ota_command(program: &Path, image: &OtaImage) -> Command {
    let mut command = Command::new(program);
    command
        .arg(&image.url)
        .env("DEVD_OTA_TYPE", &image.kind)
        .env("DEVD_OTA_VERSION", &image.ver)
        .env("DEVD_OTA_CHECKSUM", &image.checksum)
        .env("DEVD_OTA_SIZE", image.size.to_string())
        .kill_on_drop(true);
    command
}

/// Runs the OTA program to completion and returns the status to report.
/// Zero means the update was taken.
pub async fn run_ota(program: &Path, image: &OtaImage) -> i32 {
    log::info!("ota: running {} for version {}", program.display(), image.ver);
    match ota_command(program, image).status().await {
        Ok(status) => {
            let code = status.code().unwrap_or(OTA_LAUNCH_FAILED);
            if code != 0 {
                log::warn!("ota: {} exited with {code}", program.display());
            }
            code
        }
        Err(err) => {
            log::error!("ota: failed to start {}: {err}", program.display());
            OTA_LAUNCH_FAILED
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ffi::OsStr;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::TempDir;

    fn image() -> OtaImage {
        OtaImage {
            kind: OtaImage::HOST_MCU.to_string(),
            url: "https://files.example.com/fw.bin".to_string(),
            checksum: "abc123".to_string(),
            ver: "2.1".to_string(),
            size: 4096,
        }
    }

    #[test]
    fn command_passes_url_and_details() {
        let command = ota_command(Path::new("/usr/sbin/ota-apply"), &image());
        let std = command.as_std();
        assert_eq!(std.get_args().collect::<Vec<_>>(), vec![OsStr::new("https://files.example.com/fw.bin")]);
        let envs: Vec<_> = std.get_envs().collect();
        assert!(envs.contains(&(OsStr::new("DEVD_OTA_VERSION"), Some(OsStr::new("2.1")))));
        assert!(envs.contains(&(OsStr::new("DEVD_OTA_SIZE"), Some(OsStr::new("4096")))));
    }

    #[tokio::test(flavor = "current_thread")]
    async fn exit_status_is_reported() {
        let dir = TempDir::new().expect("temp dir");
        let script = dir.path().join("ota.sh");
        std::fs::write(&script, "#!/bin/sh\n[ \"$DEVD_OTA_VERSION\" = 2.1 ] || exit 9\nexit 3\n").expect("script");
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).expect("chmod");
        assert_eq!(run_ota(&script, &image()).await, 3);
        assert_eq!(run_ota(&dir.path().join("missing"), &image()).await, OTA_LAUNCH_FAILED);
    }
}
