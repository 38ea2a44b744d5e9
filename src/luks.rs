use std::path::{Path, PathBuf};
use std::process::Stdio;

use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, warn};
use uuid::Uuid;

/// Path under which dm-crypt exposes an opened volume.
fn mapper_path(devmapper_name: &str) -> PathBuf {
    Path::new("/dev/mapper").join(devmapper_name)
}

/// An opened LUKS volume shows up as `/dev/mapper/<name>`.
pub fn is_luks_device_opened(devmapper_name: &str) -> bool {
    mapper_path(devmapper_name).exists()
}

/// Open a LUKS volume with cryptsetup, addressing it by UUID.
///
/// The passphrase is fed through stdin, never the command line.
pub async fn open_luks_device(
    volume_uuid: &Uuid,
    devmapper_name: &str,
    passphrase_text: &str,
    allow_discards: bool,
) -> bool {
    let mut command = Command::new("cryptsetup");
    command
        .arg("luksOpen")
        .arg(format!("UUID={}", volume_uuid.hyphenated()))
        .arg(devmapper_name)
        .arg("--key-file")
        .arg("-");
    if allow_discards {
        command.arg("--allow-discards");
    }
    command
        .stdin(Stdio::piped())
        .stdout(Stdio::null())
        .stderr(Stdio::null());

    let mut child = match command.spawn() {
        Ok(child) => child,
        Err(err) => {
            warn!(error = %err, "Failed to spawn cryptsetup");
            return false;
        }
    };

    if let Some(mut stdin) = child.stdin.take() {
        if let Err(err) = stdin.write_all(passphrase_text.as_bytes()).await {
            warn!(error = %err, "Failed to pass key to cryptsetup");
            return false;
        }
        // Dropping stdin closes the pipe; cryptsetup reads key material
        // until EOF.
    }

    match child.wait().await {
        Ok(status) => {
            debug!(
                volume = %devmapper_name,
                uuid = %volume_uuid.hyphenated(),
                success = status.success(),
                "cryptsetup luksOpen finished"
            );
            status.success()
        }
        Err(err) => {
            warn!(error = %err, "Failed to wait for cryptsetup");
            false
        }
    }
}
