//! 本地磁盘存储后端
//!
//! 把文件移动（跨文件系统时复制+删除）进受管目录。
//! 没有真实预览直链（返回空串，由调用方流式读取），不支持分享。

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, warn};

use crate::error::StorageError;
use crate::storage::provider::{ByteStream, StorageProvider};
use crate::storage::types::StorageKind;

/// 本地存储后端（单例，无账号）
pub struct LocalProvider {
    /// 受管根目录
    base_dir: PathBuf,
}

impl LocalProvider {
    pub fn new(base_dir: PathBuf) -> Self {
        Self { base_dir }
    }

    /// 解析存储路径并校验不逃逸出受管目录
    fn resolve(&self, stored_path: &str) -> Result<PathBuf, StorageError> {
        let relative = Path::new(stored_path);
        if relative
            .components()
            .any(|c| matches!(c, std::path::Component::ParentDir | std::path::Component::RootDir))
        {
            return Err(StorageError::InvalidConfig(format!(
                "非法的存储路径: {}",
                stored_path
            )));
        }
        Ok(self.base_dir.join(relative))
    }

    /// 目标已存在时派生不冲突的文件名: name.ext -> name_1a2b3c4d.ext
    fn dedup_name(target_name: &str) -> String {
        let suffix = &uuid::Uuid::new_v4().simple().to_string()[..8];
        let path = Path::new(target_name);
        match (path.file_stem(), path.extension()) {
            (Some(stem), Some(ext)) => {
                let parent = path.parent().unwrap_or(Path::new(""));
                parent
                    .join(format!(
                        "{}_{}.{}",
                        stem.to_string_lossy(),
                        suffix,
                        ext.to_string_lossy()
                    ))
                    .to_string_lossy()
                    .into_owned()
            }
            _ => format!("{}_{}", target_name, suffix),
        }
    }

    /// 复制回退用的暂存路径；并发保存同名不同扩展名的文件时不能共用一个暂存名
    fn staging_path(target: &Path) -> PathBuf {
        let suffix = &uuid::Uuid::new_v4().simple().to_string()[..8];
        target.with_extension(format!("{}.part", suffix))
    }
}

#[async_trait]
impl StorageProvider for LocalProvider {
    fn kind(&self) -> StorageKind {
        StorageKind::Local
    }

    fn display_name(&self) -> String {
        "本地存储".to_string()
    }

    async fn save_file(
        &self,
        source: &Path,
        target_name: &str,
        _mime_type: &str,
    ) -> Result<String, StorageError> {
        let mut stored = target_name.to_string();
        let mut target = self.resolve(&stored)?;
        if fs::try_exists(&target).await? {
            stored = Self::dedup_name(target_name);
            target = self.resolve(&stored)?;
        }

        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).await?;
        }

        // 优先同文件系统 rename；失败时复制到临时文件再 rename，保证目标名下不出现半截文件
        match fs::rename(source, &target).await {
            Ok(()) => {}
            Err(e) => {
                debug!("rename 失败（{}），回退到复制: {:?}", e, target);
                let part = Self::staging_path(&target);
                if let Err(e) = fs::copy(source, &part).await {
                    let _ = fs::remove_file(&part).await;
                    return Err(e.into());
                }
                fs::rename(&part, &target).await?;
                if let Err(e) = fs::remove_file(source).await {
                    warn!("复制后删除源文件失败: {:?}, 错误: {}", source, e);
                }
            }
        }

        debug!("本地保存完成: {:?}", target);
        Ok(stored)
    }

    async fn get_file_stream(&self, stored_path: &str) -> Result<ByteStream, StorageError> {
        let path = self.resolve(stored_path)?;
        match fs::File::open(&path).await {
            Ok(file) => Ok(Box::new(file)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(StorageError::NotFound(stored_path.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn get_preview_url(&self, _stored_path: &str) -> Result<String, StorageError> {
        // 本地文件没有直链，调用方回落到流式读取
        Ok(String::new())
    }

    async fn delete_file(&self, stored_path: &str) -> Result<(), StorageError> {
        let path = self.resolve(stored_path)?;
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn get_file_size(&self, stored_path: &str) -> Result<u64, StorageError> {
        let path = self.resolve(stored_path)?;
        match fs::metadata(&path).await {
            Ok(meta) => Ok(meta.len()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(StorageError::NotFound(stored_path.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn ensure_folder(&self, folder: &str) -> Result<(), StorageError> {
        let path = self.resolve(folder)?;
        fs::create_dir_all(&path).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    async fn setup() -> (tempfile::TempDir, LocalProvider, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let provider = LocalProvider::new(dir.path().join("managed"));
        let source = dir.path().join("incoming.bin");
        fs::write(&source, b"hello savebox").await.unwrap();
        (dir, provider, source)
    }

    #[tokio::test]
    async fn test_save_and_read_back() {
        let (_dir, provider, source) = setup().await;

        let stored = provider
            .save_file(&source, "docs/hello.bin", "application/octet-stream")
            .await
            .unwrap();
        assert_eq!(stored, "docs/hello.bin");
        // 移动语义：源文件消失
        assert!(!source.exists());

        let mut stream = provider.get_file_stream(&stored).await.unwrap();
        let mut buf = Vec::new();
        stream.read_to_end(&mut buf).await.unwrap();
        assert_eq!(buf, b"hello savebox");

        assert_eq!(provider.get_file_size(&stored).await.unwrap(), 13);
        assert_eq!(provider.get_preview_url(&stored).await.unwrap(), "");
    }

    #[tokio::test]
    async fn test_save_dedups_existing_name() {
        let (dir, provider, source) = setup().await;

        let first = provider
            .save_file(&source, "a.txt", "text/plain")
            .await
            .unwrap();

        let source2 = dir.path().join("second.bin");
        fs::write(&source2, b"second").await.unwrap();
        let second = provider
            .save_file(&source2, "a.txt", "text/plain")
            .await
            .unwrap();

        assert_eq!(first, "a.txt");
        assert_ne!(second, first);
        assert!(second.starts_with("a_") && second.ends_with(".txt"));
    }

    #[tokio::test]
    async fn test_delete_idempotent() {
        let (_dir, provider, source) = setup().await;
        let stored = provider
            .save_file(&source, "x.bin", "application/octet-stream")
            .await
            .unwrap();

        provider.delete_file(&stored).await.unwrap();
        // 再次删除不报错
        provider.delete_file(&stored).await.unwrap();
        provider.delete_file("从未存在.bin").await.unwrap();

        assert!(matches!(
            provider.get_file_stream(&stored).await,
            Err(StorageError::NotFound(_))
        ));
    }

    #[test]
    fn test_staging_paths_do_not_collide() {
        // a.bin 和 a.txt 的暂存名不能撞在同一个 a.part 上
        let a = LocalProvider::staging_path(Path::new("dir/a.bin"));
        let b = LocalProvider::staging_path(Path::new("dir/a.txt"));
        assert_ne!(a, b);
        assert!(a.to_string_lossy().ends_with(".part"));
        assert_eq!(a.parent(), Some(Path::new("dir")));

        // 同一目标反复暂存也互不相同
        assert_ne!(LocalProvider::staging_path(Path::new("dir/a.bin")), a);
    }

    #[tokio::test]
    async fn test_rejects_path_escape() {
        let (_dir, provider, _source) = setup().await;
        assert!(provider.get_file_stream("../etc/passwd").await.is_err());
        assert!(matches!(
            provider.get_file_size("../../x").await,
            Err(StorageError::InvalidConfig(_))
        ));
    }
}
