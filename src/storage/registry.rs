//! 存储账号注册表
//!
//! 管理账号的增删改查与"当前写入后端"的热切换。
//! 切换流程：先完整构建新实例，成功后才一次性替换活动指针，
//! 构建失败时旧后端保持原样，进行中的传输不受影响。
//! 本地存储是无账号的兜底后端，删除活动账号后自动回落。

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use dashmap::DashMap;
use parking_lot::RwLock;
use tracing::{info, warn};

use crate::persistence::Database;
use crate::storage::local::LocalProvider;
use crate::storage::oauth_drive::OauthDriveProvider;
use crate::storage::object_store::ObjectStoreProvider;
use crate::storage::provider::StorageProvider;
use crate::storage::types::{
    OauthDriveConfig, ObjectStoreConfig, StorageAccount, StorageKind, WebdavConfig,
};
use crate::storage::webdav::WebdavProvider;

/// 存储账号注册表
pub struct ProviderRegistry {
    db: Arc<Database>,
    /// 兜底后端：本地磁盘（无账号，不可删除）
    local: Arc<dyn StorageProvider>,
    /// 实例键 "{类型}:{账号 ID}" -> 已构建的后端实例
    providers: DashMap<String, Arc<dyn StorageProvider>>,
    /// 当前写入后端
    active: RwLock<Arc<dyn StorageProvider>>,
    /// 当前激活账号 ID，None 表示本地
    active_id: RwLock<Option<String>>,
}

impl ProviderRegistry {
    /// 从数据库恢复注册表状态
    pub fn new(db: Arc<Database>, local_dir: PathBuf) -> Result<Self> {
        let local: Arc<dyn StorageProvider> = Arc::new(LocalProvider::new(local_dir));

        let registry = Self {
            db: db.clone(),
            local: local.clone(),
            providers: DashMap::new(),
            active: RwLock::new(local),
            active_id: RwLock::new(None),
        };

        // 启动时恢复激活账号；构建失败只告警并回落本地，不阻塞启动
        if let Some(account) = db.active_account()? {
            match registry.build_provider(&account) {
                Ok(provider) => {
                    registry
                        .providers
                        .insert(account.instance_key(), provider.clone());
                    *registry.active.write() = provider;
                    *registry.active_id.write() = Some(account.id.clone());
                    info!("已恢复激活账号: {} ({})", account.display_name, account.kind);
                }
                Err(e) => {
                    warn!("恢复激活账号失败，回落到本地存储: {}", e);
                }
            }
        }

        Ok(registry)
    }

    /// 按账号配置构建后端实例
    fn build_provider(&self, account: &StorageAccount) -> Result<Arc<dyn StorageProvider>> {
        let provider: Arc<dyn StorageProvider> = match account.kind {
            StorageKind::Local => self.local.clone(),
            StorageKind::ObjectStore => {
                let config: ObjectStoreConfig =
                    serde_json::from_str(&account.config).context("解析对象存储配置失败")?;
                Arc::new(ObjectStoreProvider::new(
                    config,
                    account.display_name.clone(),
                )?)
            }
            StorageKind::Webdav => {
                let config: WebdavConfig =
                    serde_json::from_str(&account.config).context("解析 WebDAV 配置失败")?;
                Arc::new(WebdavProvider::new(config, account.display_name.clone())?)
            }
            StorageKind::OauthDrive => {
                let config: OauthDriveConfig =
                    serde_json::from_str(&account.config).context("解析 OAuth 网盘配置失败")?;
                Arc::new(OauthDriveProvider::new(
                    account.id.clone(),
                    account.display_name.clone(),
                    config,
                    self.db.clone(),
                )?)
            }
        };
        Ok(provider)
    }

    /// 当前写入后端
    pub fn active(&self) -> Arc<dyn StorageProvider> {
        self.active.read().clone()
    }

    /// 当前激活账号 ID（None = 本地）
    pub fn active_id(&self) -> Option<String> {
        self.active_id.read().clone()
    }

    /// 列出所有账号
    pub fn list_accounts(&self) -> Result<Vec<StorageAccount>> {
        self.db.list_accounts()
    }

    /// 新增账号；先试构建以尽早暴露配置错误，再落库
    pub fn add_account(
        &self,
        kind: StorageKind,
        display_name: String,
        config_json: String,
    ) -> Result<StorageAccount> {
        if kind == StorageKind::Local {
            return Err(anyhow!("本地存储是内置后端，不需要创建账号"));
        }
        let account = StorageAccount::new(kind, display_name, config_json);
        let provider = self.build_provider(&account)?;

        self.db.insert_account(&account)?;
        self.providers.insert(account.instance_key(), provider);
        info!("新增存储账号: {} ({})", account.display_name, account.kind);
        Ok(account)
    }

    /// 重命名账号
    pub fn rename_account(&self, id: &str, display_name: &str) -> Result<()> {
        self.db.rename_account(id, display_name)?;
        // 实例持有旧名称，丢弃缓存下次按需重建
        if let Some(account) = self.db.get_account(id)? {
            self.providers.remove(&account.instance_key());
        }
        if self.active_id().as_deref() == Some(id) {
            self.activate(Some(id))?;
        }
        Ok(())
    }

    /// 删除账号；若删的是激活账号则回落到本地存储
    pub fn delete_account(&self, id: &str) -> Result<()> {
        let account = self.db.get_account(id)?;
        let was_active = self.active_id().as_deref() == Some(id);
        if was_active {
            self.db.set_active_account(None)?;
            *self.active.write() = self.local.clone();
            *self.active_id.write() = None;
            info!("激活账号被删除，已回落到本地存储");
        }
        self.db.delete_account(id)?;
        if let Some(account) = account {
            self.providers.remove(&account.instance_key());
        }
        Ok(())
    }

    /// 切换写入后端（None = 本地）
    ///
    /// 新实例构建成功之前不触碰活动指针
    pub fn activate(&self, id: Option<&str>) -> Result<()> {
        let (provider, active_id) = match id {
            None => (self.local.clone(), None),
            Some(id) => {
                let account = self
                    .db
                    .get_account(id)?
                    .ok_or_else(|| anyhow!("账号不存在: {}", id))?;
                let provider = self.build_provider(&account)?;
                self.providers.insert(account.instance_key(), provider.clone());
                (provider, Some(account.id))
            }
        };

        self.db.set_active_account(id)?;
        *self.active.write() = provider;
        *self.active_id.write() = active_id;
        info!(
            "写入后端已切换: {}",
            id.map(|s| s.to_string()).unwrap_or_else(|| "本地存储".to_string())
        );
        Ok(())
    }

    /// 按账号 ID 取后端实例（读取历史文件时用，账号不必是激活状态）
    pub fn provider_for(&self, account_id: &str) -> Result<Arc<dyn StorageProvider>> {
        let account = self
            .db
            .get_account(account_id)?
            .ok_or_else(|| anyhow!("账号不存在: {}", account_id))?;
        let key = account.instance_key();
        if let Some(cached) = self.providers.get(&key) {
            return Ok(cached.clone());
        }
        let provider = self.build_provider(&account)?;
        self.providers.insert(key, provider.clone());
        Ok(provider)
    }
}
