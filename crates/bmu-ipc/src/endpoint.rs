//! Well-known Unix socket endpoint

use std::os::unix::fs::{FileTypeExt, PermissionsExt};
use std::path::{Path, PathBuf};

use tokio::net::{UnixListener, UnixStream};
use tracing::{debug, info};

use crate::error::IpcError;

/// Socket file name under the system temp directory
pub const ENDPOINT_NAME: &str = "bmu_viewer_helper";

pub fn default_endpoint() -> PathBuf {
    std::env::temp_dir().join(ENDPOINT_NAME)
}

/// Bind the viewer's listening socket.
///
/// A stale socket left by a crashed viewer is removed first; any other kind
/// of file at `path` is an error. The socket is made world-connectable since
/// the helper runs as root and the viewer as the desktop user.
pub fn bind_listener(path: &Path) -> Result<UnixListener, IpcError> {
    match std::fs::symlink_metadata(path) {
        Ok(meta) if meta.file_type().is_socket() => {
            debug!(path = %path.display(), "Removing stale endpoint");
            std::fs::remove_file(path)?;
        }
        Ok(_) => {
            return Err(IpcError::Io(std::io::Error::new(
                std::io::ErrorKind::AlreadyExists,
                format!("{} exists and is not a socket", path.display()),
            )));
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }

    let listener = UnixListener::bind(path)?;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o777))?;
    info!(path = %path.display(), "Helper endpoint listening");
    Ok(listener)
}

/// Connect to the viewer's endpoint (helper side)
pub async fn connect(path: &Path) -> Result<UnixStream, IpcError> {
    let stream = UnixStream::connect(path).await?;
    debug!(path = %path.display(), "Connected to viewer endpoint");
    Ok(stream)
}
