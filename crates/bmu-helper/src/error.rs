//! Helper errors

use std::path::PathBuf;

use bmu_ipc::IpcError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum HelperError {
    #[error("Cannot reach viewer endpoint {path}: {source}")]
    Connect {
        path: PathBuf,
        #[source]
        source: IpcError,
    },

    #[error(transparent)]
    Ipc(#[from] IpcError),
}
