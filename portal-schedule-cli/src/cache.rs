use std::{
    io::ErrorKind,
    path::{Path, PathBuf},
    sync::atomic::{AtomicU64, Ordering},
};

use async_trait::async_trait;

use portal_schedule_core::{Error, Result, cache::CacheBackend};

const EXTENSION: &str = "json";

static TEMP_COUNTER: AtomicU64 = AtomicU64::new(0);

/// 每个键一个文件的本地存储
///
/// 文件名是键的十六进制编码，便于按前缀列出；写入先落到临时文件再 `rename`，
/// 读者不会看到写了一半的值。
#[derive(Debug, Clone)]
pub struct FileCache {
    cache_dir: PathBuf,
}

impl FileCache {
    pub fn new(cache_dir: PathBuf) -> Result<Self> {
        if !cache_dir.exists() {
            std::fs::create_dir_all(&cache_dir).map_err(|e| {
                Error::Config(format!("Failed to create cache directory: {}", e))
            })?;
        }

        Ok(Self { cache_dir })
    }

    pub fn with_default_dir(app_name: &str) -> Result<Self> {
        let cache_dir = Self::get_default_cache_dir(app_name)?;
        Self::new(cache_dir)
    }

    pub fn dir(&self) -> &Path {
        &self.cache_dir
    }

    fn get_default_cache_dir(app_name: &str) -> Result<PathBuf> {
        #[cfg(target_os = "macos")]
        {
            if let Some(home) = std::env::var_os("HOME") {
                Ok(PathBuf::from(home)
                    .join("Library")
                    .join("Caches")
                    .join(app_name))
            } else {
                Err(Error::Config("Cannot determine cache directory".to_string()))
            }
        }

        #[cfg(target_os = "linux")]
        {
            if let Some(cache_dir) = std::env::var_os("XDG_CACHE_HOME") {
                Ok(PathBuf::from(cache_dir).join(app_name))
            } else if let Some(home) = std::env::var_os("HOME") {
                Ok(PathBuf::from(home).join(".cache").join(app_name))
            } else {
                Err(Error::Config("Cannot determine cache directory".to_string()))
            }
        }

        #[cfg(target_os = "windows")]
        {
            if let Some(local_app_data) = std::env::var_os("LOCALAPPDATA") {
                Ok(PathBuf::from(local_app_data).join(app_name))
            } else {
                Err(Error::Config("Cannot determine cache directory".to_string()))
            }
        }

        #[cfg(not(any(target_os = "macos", target_os = "linux", target_os = "windows")))]
        {
            Err(Error::Config(
                "Unsupported operating system for cache directory detection".to_string(),
            ))
        }
    }

    fn cache_file_path(&self, key: &str) -> PathBuf {
        self.cache_dir
            .join(format!("{}.{}", encode_key(key), EXTENSION))
    }

    async fn write_temp(&self, key: &str, value: &[u8]) -> Result<PathBuf> {
        let temp_path = self.cache_dir.join(format!(
            ".{}.{}-{}.tmp",
            encode_key(key),
            std::process::id(),
            TEMP_COUNTER.fetch_add(1, Ordering::Relaxed)
        ));
        tokio::fs::write(&temp_path, value)
            .await
            .map_err(|e| Error::Storage(format!("Failed to write cache file: {}", e)))?;
        Ok(temp_path)
    }
}

fn encode_key(key: &str) -> String {
    key.bytes().map(|b| format!("{:02x}", b)).collect()
}

fn decode_key(name: &str) -> Option<String> {
    if name.len() % 2 != 0 {
        return None;
    }
    let bytes = (0..name.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(name.get(i..i + 2)?, 16).ok())
        .collect::<Option<Vec<u8>>>()?;
    String::from_utf8(bytes).ok()
}

#[async_trait]
impl CacheBackend for FileCache {
    async fn set_raw(&self, key: &str, value: &[u8]) -> Result<()> {
        let temp_path = self.write_temp(key, value).await?;
        if let Err(e) = tokio::fs::rename(&temp_path, self.cache_file_path(key)).await {
            let _ = tokio::fs::remove_file(&temp_path).await;
            return Err(Error::Storage(format!("Failed to replace cache file: {}", e)));
        }
        Ok(())
    }

    async fn set_raw_nx(&self, key: &str, value: &[u8]) -> Result<bool> {
        let temp_path = self.write_temp(key, value).await?;
        // hard_link 在目标已存在时失败，保证只有第一个写入者成功
        let linked = tokio::fs::hard_link(&temp_path, self.cache_file_path(key)).await;
        let _ = tokio::fs::remove_file(&temp_path).await;

        match linked {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => Ok(false),
            Err(e) => Err(Error::Storage(format!("Failed to create cache file: {}", e))),
        }
    }

    async fn get_raw(&self, key: &str) -> Result<Option<Vec<u8>>> {
        match tokio::fs::read(self.cache_file_path(key)).await {
            Ok(content) => Ok(Some(content)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Error::Storage(format!("Failed to read cache file: {}", e))),
        }
    }

    async fn delete(&self, key: &str) -> Result<()> {
        match tokio::fs::remove_file(self.cache_file_path(key)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::Storage(format!("Failed to delete cache file: {}", e))),
        }
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        tokio::fs::try_exists(self.cache_file_path(key))
            .await
            .map_err(|e| Error::Storage(format!("Failed to stat cache file: {}", e)))
    }

    async fn keys(&self, prefix: &str) -> Result<Vec<String>> {
        let mut entries = tokio::fs::read_dir(&self.cache_dir)
            .await
            .map_err(|e| Error::Storage(format!("Failed to read cache directory: {}", e)))?;

        let mut keys = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| Error::Storage(format!("Failed to read directory entry: {}", e)))?
        {
            let path = entry.path();
            if path.extension().is_none_or(|ext| ext != EXTENSION) {
                continue;
            }
            let Some(key) = path
                .file_stem()
                .and_then(|stem| stem.to_str())
                .and_then(decode_key)
            else {
                continue;
            };
            if key.starts_with(prefix) {
                keys.push(key);
            }
        }
        keys.sort();
        Ok(keys)
    }
}
