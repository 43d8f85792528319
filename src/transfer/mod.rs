pub mod engine;
pub mod storage;

pub use engine::{
    DeclaredFile, DownloadCursor, Transfer, TransferDirection, TransferEngine, TransferState,
};
pub use storage::{find_available_name, sanitize_filename, UploadStorage};
