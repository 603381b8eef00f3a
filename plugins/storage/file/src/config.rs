use std::path::PathBuf;

// ════════════════════════════════════════════════════════════════
//  Configuration
// ════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, serde::Deserialize)]
pub struct FileStorageConfig {
    /// Storage root: один файл на ключ, `{data_dir}/{KEY}`.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    /// fsync файла и директории перед тем, как `put` вернёт Ok.
    /// Отключать только в тестах/на tmpfs.
    #[serde(default = "default_fsync")]
    pub fsync: bool,
}

impl Default for FileStorageConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            fsync: default_fsync(),
        }
    }
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("/tmp/data")
}

fn default_fsync() -> bool {
    true
}
