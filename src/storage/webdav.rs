//! WebDAV 存储后端
//!
//! 保存是整体缓冲后的单次 PUT（不假设服务端支持增量写入），
//! 大小通过 HEAD 获取，无直链预览，不支持分享。

use async_trait::async_trait;
use base64::Engine;
use reqwest::Client;
use std::path::Path;
use std::time::Duration;
use tracing::debug;

use crate::error::StorageError;
use crate::storage::provider::{error_body, response_stream, ByteStream, StorageProvider};
use crate::storage::types::{StorageKind, WebdavConfig};

/// WebDAV 后端
pub struct WebdavProvider {
    config: WebdavConfig,
    display_name: String,
    client: Client,
    auth_header: String,
}

impl WebdavProvider {
    pub fn new(config: WebdavConfig, display_name: String) -> Result<Self, StorageError> {
        if config.base_url.is_empty() {
            return Err(StorageError::InvalidConfig(
                "WebDAV 配置缺少 base_url".to_string(),
            ));
        }
        let client = Client::builder()
            .timeout(Duration::from_secs(120))
            .build()?;
        let auth_header = format!(
            "Basic {}",
            base64::engine::general_purpose::STANDARD
                .encode(format!("{}:{}", config.username, config.password))
        );
        Ok(Self {
            config,
            display_name,
            client,
            auth_header,
        })
    }

    /// 拼出对象的完整 URL（逐段编码）
    fn url_for(&self, stored_path: &str) -> String {
        let base = self.config.base_url.trim_end_matches('/');
        let dir = self.config.directory.trim_matches('/');
        let encoded: String = stored_path
            .trim_start_matches('/')
            .split('/')
            .map(|seg| urlencoding::encode(seg).into_owned())
            .collect::<Vec<_>>()
            .join("/");
        if dir.is_empty() {
            format!("{}/{}", base, encoded)
        } else {
            format!("{}/{}/{}", base, dir, encoded)
        }
    }
}

#[async_trait]
impl StorageProvider for WebdavProvider {
    fn kind(&self) -> StorageKind {
        StorageKind::Webdav
    }

    fn display_name(&self) -> String {
        self.display_name.clone()
    }

    async fn save_file(
        &self,
        source: &Path,
        target_name: &str,
        mime_type: &str,
    ) -> Result<String, StorageError> {
        let body = tokio::fs::read(source).await?;
        let size = body.len();
        let url = self.url_for(target_name);

        let response = self
            .client
            .put(&url)
            .header(reqwest::header::AUTHORIZATION, &self.auth_header)
            .header(reqwest::header::CONTENT_TYPE, mime_type)
            .body(body)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(StorageError::from_status(
                status,
                error_body(response).await,
                "WebDAV PUT 失败",
            ));
        }

        debug!("WebDAV 上传完成: {}, 大小={} bytes", url, size);
        Ok(target_name.to_string())
    }

    async fn get_file_stream(&self, stored_path: &str) -> Result<ByteStream, StorageError> {
        let response = self
            .client
            .get(self.url_for(stored_path))
            .header(reqwest::header::AUTHORIZATION, &self.auth_header)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(StorageError::from_status(
                status,
                error_body(response).await,
                stored_path,
            ));
        }
        Ok(response_stream(response))
    }

    async fn get_preview_url(&self, _stored_path: &str) -> Result<String, StorageError> {
        // WebDAV 直链需要凭证，无法对外直出
        Ok(String::new())
    }

    async fn delete_file(&self, stored_path: &str) -> Result<(), StorageError> {
        let response = self
            .client
            .delete(self.url_for(stored_path))
            .header(reqwest::header::AUTHORIZATION, &self.auth_header)
            .send()
            .await?;
        let status = response.status();
        if status.is_success() || status.as_u16() == 404 {
            Ok(())
        } else {
            Err(StorageError::from_status(
                status,
                error_body(response).await,
                "WebDAV DELETE 失败",
            ))
        }
    }

    async fn get_file_size(&self, stored_path: &str) -> Result<u64, StorageError> {
        let response = self
            .client
            .head(self.url_for(stored_path))
            .header(reqwest::header::AUTHORIZATION, &self.auth_header)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(StorageError::from_status(status, String::new(), stored_path));
        }
        response
            .headers()
            .get(reqwest::header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse().ok())
            .ok_or_else(|| StorageError::Other("HEAD 响应缺少 Content-Length".to_string()))
    }

    async fn ensure_folder(&self, folder: &str) -> Result<(), StorageError> {
        let mkcol = reqwest::Method::from_bytes(b"MKCOL")
            .map_err(|e| StorageError::Other(format!("构造 MKCOL 方法失败: {}", e)))?;
        let response = self
            .client
            .request(mkcol, self.url_for(folder))
            .header(reqwest::header::AUTHORIZATION, &self.auth_header)
            .send()
            .await?;
        let status = response.status();
        // 405 Method Not Allowed = 目录已存在
        if status.is_success() || status.as_u16() == 405 {
            Ok(())
        } else {
            Err(StorageError::from_status(
                status,
                error_body(response).await,
                "WebDAV MKCOL 失败",
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_provider(directory: &str) -> WebdavProvider {
        WebdavProvider::new(
            WebdavConfig {
                base_url: "https://dav.example.com/remote.php/dav/files/user/".to_string(),
                username: "user".to_string(),
                password: "pass".to_string(),
                directory: directory.to_string(),
            },
            "坚果云".to_string(),
        )
        .unwrap()
    }

    #[test]
    fn test_url_building() {
        let provider = sample_provider("savebox");
        assert_eq!(
            provider.url_for("照片 1.jpg"),
            "https://dav.example.com/remote.php/dav/files/user/savebox/%E7%85%A7%E7%89%87%201.jpg"
        );

        let provider = sample_provider("");
        assert_eq!(
            provider.url_for("a/b.txt"),
            "https://dav.example.com/remote.php/dav/files/user/a/b.txt"
        );
    }

    #[test]
    fn test_basic_auth_header() {
        let provider = sample_provider("");
        // user:pass 的 base64
        assert_eq!(provider.auth_header, "Basic dXNlcjpwYXNz");
    }

    #[test]
    fn test_share_unsupported() {
        let provider = sample_provider("");
        assert!(provider.share().is_none());
    }

    #[tokio::test]
    async fn test_delete_missing_is_ok() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base = format!("http://{}", listener.local_addr().unwrap());
        let app =
            axum::Router::new().fallback(|| async { axum::http::StatusCode::NOT_FOUND });
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let provider = WebdavProvider::new(
            WebdavConfig {
                base_url: base,
                username: "u".to_string(),
                password: "p".to_string(),
                directory: String::new(),
            },
            "测试".to_string(),
        )
        .unwrap();

        // 对端 404 视为已删除，重复删除同样成功
        provider.delete_file("ghost.bin").await.unwrap();
        provider.delete_file("ghost.bin").await.unwrap();
    }
}
