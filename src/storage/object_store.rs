//! S3 兼容对象存储后端（AWS S3 / 阿里云 OSS / MinIO 等）
//!
//! 直接用 reqwest + V4 签名实现，避免引入笨重的官方 SDK。
//! 保存是单次 PUT；预览链接是限时签名 URL，生成成本低，每次请求现算，不做缓存。

use async_trait::async_trait;
use chrono::Utc;
use hmac::{Hmac, Mac};
use reqwest::Client;
use sha2::{Digest, Sha256};
use std::path::Path;
use std::time::Duration;
use tracing::debug;

use crate::error::StorageError;
use crate::storage::provider::{error_body, response_stream, ByteStream, ShareCapable, StorageProvider};
use crate::storage::types::{ObjectStoreConfig, ShareLink, StorageKind};

type HmacSha256 = Hmac<Sha256>;

/// 空请求体的 SHA256
const EMPTY_PAYLOAD_HASH: &str =
    "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";

/// 预览直链的默认有效期
const PREVIEW_EXPIRES_SECS: u64 = 3600;

/// 对象存储后端
pub struct ObjectStoreProvider {
    config: ObjectStoreConfig,
    display_name: String,
    client: Client,
}

impl ObjectStoreProvider {
    pub fn new(config: ObjectStoreConfig, display_name: String) -> Result<Self, StorageError> {
        if config.bucket.is_empty() || config.access_key.is_empty() {
            return Err(StorageError::InvalidConfig(
                "对象存储配置缺少 bucket 或 access_key".to_string(),
            ));
        }
        let client = Client::builder()
            .timeout(Duration::from_secs(120))
            .build()?;
        Ok(Self {
            config,
            display_name,
            client,
        })
    }

    /// 对象键（带配置前缀）
    fn object_key(&self, stored_path: &str) -> String {
        let key = stored_path.trim_start_matches('/');
        if self.config.prefix.is_empty() {
            key.to_string()
        } else {
            format!("{}/{}", self.config.prefix.trim_matches('/'), key)
        }
    }

    /// 请求的 host 与规范化路径
    ///
    /// path-style: host=endpoint, path=/bucket/key
    /// virtual-host: host=bucket.endpoint, path=/key
    fn host_and_path(&self, key: &str) -> (String, String) {
        let endpoint = self
            .config
            .endpoint
            .trim_end_matches('/')
            .trim_start_matches("https://")
            .trim_start_matches("http://")
            .to_string();
        let encoded = encode_key(key);
        if self.config.path_style {
            (endpoint, format!("/{}/{}", self.config.bucket, encoded))
        } else {
            (
                format!("{}.{}", self.config.bucket, endpoint),
                format!("/{}", encoded),
            )
        }
    }

    fn scheme(&self) -> &str {
        if self.config.endpoint.starts_with("http://") {
            "http"
        } else {
            "https"
        }
    }

    /// V4 签名密钥派生
    fn signing_key(&self, date_stamp: &str) -> Vec<u8> {
        let k_date = hmac_sha256(
            format!("AWS4{}", self.config.secret_key).as_bytes(),
            date_stamp.as_bytes(),
        );
        let k_region = hmac_sha256(&k_date, self.config.region.as_bytes());
        let k_service = hmac_sha256(&k_region, b"s3");
        hmac_sha256(&k_service, b"aws4_request")
    }

    /// 发起一次带 V4 头签名的请求
    async fn signed_request(
        &self,
        method: reqwest::Method,
        key: &str,
        body: Option<Vec<u8>>,
        content_type: Option<&str>,
    ) -> Result<reqwest::Response, StorageError> {
        let (host, path) = self.host_and_path(key);
        let url = format!("{}://{}{}", self.scheme(), host, path);

        let now = Utc::now();
        let amz_date = now.format("%Y%m%dT%H%M%SZ").to_string();
        let date_stamp = now.format("%Y%m%d").to_string();

        let payload_hash = match &body {
            Some(bytes) => hex::encode(Sha256::digest(bytes)),
            None => EMPTY_PAYLOAD_HASH.to_string(),
        };

        // 规范化请求：签名头固定为 host;x-amz-content-sha256;x-amz-date
        let canonical_headers = format!(
            "host:{}\nx-amz-content-sha256:{}\nx-amz-date:{}\n",
            host, payload_hash, amz_date
        );
        let signed_headers = "host;x-amz-content-sha256;x-amz-date";
        let canonical_request = format!(
            "{}\n{}\n\n{}\n{}\n{}",
            method.as_str(),
            path,
            canonical_headers,
            signed_headers,
            payload_hash
        );

        let credential_scope = format!("{}/{}/s3/aws4_request", date_stamp, self.config.region);
        let string_to_sign = format!(
            "AWS4-HMAC-SHA256\n{}\n{}\n{}",
            amz_date,
            credential_scope,
            hex::encode(Sha256::digest(canonical_request.as_bytes()))
        );

        let signature = hex::encode(hmac_sha256(
            &self.signing_key(&date_stamp),
            string_to_sign.as_bytes(),
        ));
        let authorization = format!(
            "AWS4-HMAC-SHA256 Credential={}/{}, SignedHeaders={}, Signature={}",
            self.config.access_key, credential_scope, signed_headers, signature
        );

        let mut request = self
            .client
            .request(method, &url)
            .header("Host", &host)
            .header("x-amz-date", &amz_date)
            .header("x-amz-content-sha256", &payload_hash)
            .header("Authorization", authorization);
        if let Some(ct) = content_type {
            request = request.header("Content-Type", ct);
        }
        if let Some(bytes) = body {
            request = request.body(bytes);
        }

        Ok(request.send().await?)
    }

    /// 生成限时签名 GET URL（query 串鉴权）
    fn presign_get(&self, key: &str, expires_secs: u64) -> String {
        let (host, path) = self.host_and_path(key);

        let now = Utc::now();
        let amz_date = now.format("%Y%m%dT%H%M%SZ").to_string();
        let date_stamp = now.format("%Y%m%d").to_string();
        let credential_scope = format!("{}/{}/s3/aws4_request", date_stamp, self.config.region);
        let credential = format!("{}/{}", self.config.access_key, credential_scope);

        // query 参数必须按键名排序参与签名
        let canonical_query = format!(
            "X-Amz-Algorithm=AWS4-HMAC-SHA256&X-Amz-Credential={}&X-Amz-Date={}&X-Amz-Expires={}&X-Amz-SignedHeaders=host",
            urlencoding::encode(&credential),
            amz_date,
            expires_secs
        );

        let canonical_request = format!(
            "GET\n{}\n{}\nhost:{}\n\nhost\nUNSIGNED-PAYLOAD",
            path, canonical_query, host
        );
        let string_to_sign = format!(
            "AWS4-HMAC-SHA256\n{}\n{}\n{}",
            amz_date,
            credential_scope,
            hex::encode(Sha256::digest(canonical_request.as_bytes()))
        );
        let signature = hex::encode(hmac_sha256(
            &self.signing_key(&date_stamp),
            string_to_sign.as_bytes(),
        ));

        format!(
            "{}://{}{}?{}&X-Amz-Signature={}",
            self.scheme(),
            host,
            path,
            canonical_query,
            signature
        )
    }
}

#[async_trait]
impl StorageProvider for ObjectStoreProvider {
    fn kind(&self) -> StorageKind {
        StorageKind::ObjectStore
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
        let key = self.object_key(target_name);
        let bytes = tokio::fs::read(source).await?;
        let size = bytes.len();

        let response = self
            .signed_request(reqwest::Method::PUT, &key, Some(bytes), Some(mime_type))
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(StorageError::from_status(
                status,
                error_body(response).await,
                "PUT 对象失败",
            ));
        }

        debug!("对象上传完成: key={}, 大小={} bytes", key, size);
        Ok(key)
    }

    async fn get_file_stream(&self, stored_path: &str) -> Result<ByteStream, StorageError> {
        let response = self
            .signed_request(reqwest::Method::GET, stored_path, None, None)
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

    async fn get_preview_url(&self, stored_path: &str) -> Result<String, StorageError> {
        Ok(self.presign_get(stored_path, PREVIEW_EXPIRES_SECS))
    }

    async fn delete_file(&self, stored_path: &str) -> Result<(), StorageError> {
        let response = self
            .signed_request(reqwest::Method::DELETE, stored_path, None, None)
            .await?;
        let status = response.status();
        // S3 对不存在的对象 DELETE 返回 204；个别实现返回 404，一并吞掉
        if status.is_success() || status.as_u16() == 404 {
            Ok(())
        } else {
            Err(StorageError::from_status(
                status,
                error_body(response).await,
                "DELETE 对象失败",
            ))
        }
    }

    async fn get_file_size(&self, stored_path: &str) -> Result<u64, StorageError> {
        let response = self
            .signed_request(reqwest::Method::HEAD, stored_path, None, None)
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(StorageError::from_status(
                status,
                String::new(),
                stored_path,
            ));
        }
        response
            .headers()
            .get(reqwest::header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse().ok())
            .ok_or_else(|| StorageError::Other("HEAD 响应缺少 Content-Length".to_string()))
    }

    fn share(&self) -> Option<&dyn ShareCapable> {
        Some(self)
    }
}

#[async_trait]
impl ShareCapable for ObjectStoreProvider {
    async fn create_share_link(
        &self,
        stored_path: &str,
        password: Option<&str>,
        expires_secs: Option<u64>,
    ) -> Result<ShareLink, StorageError> {
        if password.is_some() {
            return Err(StorageError::Unsupported("对象存储分享不支持访问密码"));
        }
        let expires = expires_secs.unwrap_or(7 * 24 * 3600);
        let link = self.presign_get(stored_path, expires);
        Ok(ShareLink {
            link,
            expires_at: Some(Utc::now().timestamp() + expires as i64),
        })
    }
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> Vec<u8> {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC 接受任意长度的密钥");
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}

/// 对象键的 URI 编码：逐段编码，保留路径分隔符
fn encode_key(key: &str) -> String {
    key.split('/')
        .map(|seg| urlencoding::encode(seg).into_owned())
        .collect::<Vec<_>>()
        .join("/")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_config(path_style: bool) -> ObjectStoreConfig {
        ObjectStoreConfig {
            endpoint: "https://oss-cn-hangzhou.aliyuncs.com".to_string(),
            region: "cn-hangzhou".to_string(),
            bucket: "my-bucket".to_string(),
            access_key: "AKID".to_string(),
            secret_key: "SECRET".to_string(),
            path_style,
            prefix: "savebox".to_string(),
        }
    }

    #[test]
    fn test_url_styles() {
        let provider =
            ObjectStoreProvider::new(sample_config(false), "OSS".to_string()).unwrap();
        let (host, path) = provider.host_and_path("a/b.txt");
        assert_eq!(host, "my-bucket.oss-cn-hangzhou.aliyuncs.com");
        assert_eq!(path, "/a/b.txt");

        let provider = ObjectStoreProvider::new(sample_config(true), "OSS".to_string()).unwrap();
        let (host, path) = provider.host_and_path("a/b.txt");
        assert_eq!(host, "oss-cn-hangzhou.aliyuncs.com");
        assert_eq!(path, "/my-bucket/a/b.txt");
    }

    #[test]
    fn test_object_key_prefix() {
        let provider =
            ObjectStoreProvider::new(sample_config(false), "OSS".to_string()).unwrap();
        assert_eq!(provider.object_key("photo.jpg"), "savebox/photo.jpg");
        assert_eq!(provider.object_key("/photo.jpg"), "savebox/photo.jpg");
    }

    #[test]
    fn test_encode_key_keeps_slashes() {
        assert_eq!(encode_key("dir/文件 1.txt"), "dir/%E6%96%87%E4%BB%B6%201.txt");
    }

    #[test]
    fn test_presign_contains_signature_params() {
        let provider =
            ObjectStoreProvider::new(sample_config(false), "OSS".to_string()).unwrap();
        let url = provider.presign_get("savebox/a.png", 600);
        assert!(url.contains("X-Amz-Algorithm=AWS4-HMAC-SHA256"));
        assert!(url.contains("X-Amz-Expires=600"));
        assert!(url.contains("X-Amz-Signature="));
        // 同一秒内重复生成应当确定性一致（无随机量）
        let url2 = provider.presign_get("savebox/a.png", 600);
        assert_eq!(url.len(), url2.len());
    }

    #[tokio::test]
    async fn test_delete_missing_object_is_ok() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let endpoint = format!("http://{}", listener.local_addr().unwrap());
        let app =
            axum::Router::new().fallback(|| async { axum::http::StatusCode::NOT_FOUND });
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        // 自建服务走 path-style
        let config = ObjectStoreConfig {
            endpoint,
            region: "us-east-1".to_string(),
            bucket: "my-bucket".to_string(),
            access_key: "AKID".to_string(),
            secret_key: "SECRET".to_string(),
            path_style: true,
            prefix: String::new(),
        };
        let provider = ObjectStoreProvider::new(config, "MinIO".to_string()).unwrap();

        // 对端 404 视为已删除，重复删除同样成功
        provider.delete_file("ghost.bin").await.unwrap();
        provider.delete_file("ghost.bin").await.unwrap();
    }

    #[tokio::test]
    async fn test_share_rejects_password() {
        let provider =
            ObjectStoreProvider::new(sample_config(false), "OSS".to_string()).unwrap();
        let share = provider.share().expect("对象存储应支持分享");
        let err = share
            .create_share_link("savebox/a.png", Some("1234"), None)
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::Unsupported(_)));
    }
}
