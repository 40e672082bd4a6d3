//! 存储后端共享类型
//!
//! 账号、后端类型、各后端的配置包以及分享链接等公共结构

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::StorageError;

/// 支持的存储后端类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageKind {
    /// 本地磁盘
    Local,
    /// S3 兼容对象存储 / 阿里云 OSS
    ObjectStore,
    /// WebDAV
    Webdav,
    /// OAuth 网盘（OneDrive 系）
    OauthDrive,
}

impl fmt::Display for StorageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StorageKind::Local => write!(f, "local"),
            StorageKind::ObjectStore => write!(f, "object_store"),
            StorageKind::Webdav => write!(f, "webdav"),
            StorageKind::OauthDrive => write!(f, "oauth_drive"),
        }
    }
}

impl StorageKind {
    /// 从数据库存储的字符串解析
    pub fn parse(s: &str) -> Result<Self, StorageError> {
        match s {
            "local" => Ok(StorageKind::Local),
            "object_store" => Ok(StorageKind::ObjectStore),
            "webdav" => Ok(StorageKind::Webdav),
            "oauth_drive" => Ok(StorageKind::OauthDrive),
            other => Err(StorageError::InvalidConfig(format!(
                "未知的存储类型: {}",
                other
            ))),
        }
    }
}

/// 存储账号（持久化行）
///
/// `config` 是不透明的 JSON 密钥包，按 `kind` 解析成对应的配置结构
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageAccount {
    /// 账号 ID
    pub id: String,
    /// 后端类型
    pub kind: StorageKind,
    /// 显示名称
    pub display_name: String,
    /// 配置密钥包（JSON）
    pub config: String,
    /// 是否为当前写入账号（全局最多一个）
    pub is_active: bool,
    /// 创建时间 (Unix timestamp)
    pub created_at: i64,
    /// 更新时间 (Unix timestamp)
    pub updated_at: i64,
}

impl StorageAccount {
    /// 创建新账号（未激活）
    pub fn new(kind: StorageKind, display_name: String, config: String) -> Self {
        let now = chrono::Utc::now().timestamp();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            kind,
            display_name,
            config,
            is_active: false,
            created_at: now,
            updated_at: now,
        }
    }

    /// 注册表实例键，形如 "oauth_drive:550e8400-..."
    pub fn instance_key(&self) -> String {
        format!("{}:{}", self.kind, self.id)
    }
}

/// 对象存储配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObjectStoreConfig {
    /// 端点，如 https://oss-cn-hangzhou.aliyuncs.com 或 https://s3.us-east-1.amazonaws.com
    pub endpoint: String,
    /// 区域
    pub region: String,
    /// 桶名
    pub bucket: String,
    /// AccessKey
    pub access_key: String,
    /// SecretKey
    pub secret_key: String,
    /// 是否使用 path-style 访问（MinIO 等自建服务需要）
    #[serde(default)]
    pub path_style: bool,
    /// 对象前缀
    #[serde(default)]
    pub prefix: String,
}

/// WebDAV 配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebdavConfig {
    /// 基础 URL，如 https://dav.example.com/remote.php/dav/files/user
    pub base_url: String,
    /// 用户名
    pub username: String,
    /// 密码
    pub password: String,
    /// 保存目录
    #[serde(default)]
    pub directory: String,
}

/// OAuth 网盘配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OauthDriveConfig {
    /// OAuth 客户端 ID
    pub client_id: String,
    /// OAuth 客户端密钥
    pub client_secret: String,
    /// 刷新令牌（轮换后同步写回数据库）
    pub refresh_token: String,
    /// 令牌端点
    #[serde(default = "default_token_endpoint")]
    pub token_endpoint: String,
    /// 网盘 API 基础地址
    #[serde(default = "default_drive_base")]
    pub drive_base: String,
    /// 保存目录（网盘内路径）
    #[serde(default = "default_drive_folder")]
    pub folder: String,
}

fn default_token_endpoint() -> String {
    "https://login.microsoftonline.com/common/oauth2/v2.0/token".to_string()
}

fn default_drive_base() -> String {
    "https://graph.microsoft.com/v1.0/me/drive".to_string()
}

fn default_drive_folder() -> String {
    "savebox".to_string()
}

/// 分享链接结果
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShareLink {
    /// 分享 URL
    pub link: String,
    /// 过期时间 (Unix timestamp)，None 表示不过期
    pub expires_at: Option<i64>,
}

/// 已保存文件的元数据（写入 files 表）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileRecord {
    /// 记录 ID
    pub id: String,
    /// 原始文件名
    pub file_name: String,
    /// 后端返回的存储路径或对象 ID
    pub stored_path: String,
    /// MIME 类型
    pub mime_type: Option<String>,
    /// 文件大小（字节）
    pub size: u64,
    /// 逻辑目录（批量上传时为批次目录名）
    pub folder: Option<String>,
    /// 所属账号，账号删除后置空
    pub account_id: Option<String>,
    /// 创建时间 (Unix timestamp)
    pub created_at: i64,
}

impl FileRecord {
    pub fn new(
        file_name: String,
        stored_path: String,
        mime_type: Option<String>,
        size: u64,
        folder: Option<String>,
        account_id: Option<String>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            file_name,
            stored_path,
            mime_type,
            size,
            folder,
            account_id,
            created_at: chrono::Utc::now().timestamp(),
        }
    }
}
