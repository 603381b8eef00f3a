mod config;
mod storage;

pub use config::FileStorageConfig;
pub use storage::FileStore;
