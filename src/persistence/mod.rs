//! SQLite 持久化模块
//!
//! 三张表：
//! - storage_accounts: 存储账号（类型、不透明配置包、激活标记）
//! - settings: 通用键值配置（旧配置迁移、待定账号暂存）
//! - files: 已保存文件的元数据，account_id 可空（账号删除时解除关联而非级联删除）

use std::path::Path;

use anyhow::{Context, Result};
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, OptionalExtension};
use tracing::{debug, info};

use crate::storage::types::{FileRecord, StorageAccount, StorageKind};

/// 数据库管理器
pub struct Database {
    pool: Pool<SqliteConnectionManager>,
}

impl Database {
    /// 打开（或创建）数据库并初始化表结构
    pub fn new(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let manager = SqliteConnectionManager::file(db_path);
        let pool = Pool::builder()
            .max_size(4)
            .build(manager)
            .context("创建数据库连接池失败")?;

        let db = Self { pool };
        db.init_tables()?;
        info!("数据库初始化完成: {:?}", db_path);
        Ok(db)
    }

    /// 内存数据库（测试用）
    #[cfg(test)]
    pub fn in_memory() -> Result<Self> {
        // 连接池中每个连接都是独立的内存库，因此测试库固定单连接
        let manager = SqliteConnectionManager::memory();
        let pool = Pool::builder().max_size(1).build(manager)?;
        let db = Self { pool };
        db.init_tables()?;
        Ok(db)
    }

    /// 初始化数据库表
    fn init_tables(&self) -> Result<()> {
        let conn = self.pool.get()?;

        conn.execute(
            r#"
            CREATE TABLE IF NOT EXISTS storage_accounts (
                id TEXT PRIMARY KEY,
                kind TEXT NOT NULL,
                display_name TEXT NOT NULL,
                config TEXT NOT NULL,
                is_active INTEGER NOT NULL DEFAULT 0,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            )
            "#,
            [],
        )?;

        conn.execute(
            r#"
            CREATE TABLE IF NOT EXISTS settings (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                updated_at INTEGER NOT NULL
            )
            "#,
            [],
        )?;

        conn.execute(
            r#"
            CREATE TABLE IF NOT EXISTS files (
                id TEXT PRIMARY KEY,
                file_name TEXT NOT NULL,
                stored_path TEXT NOT NULL,
                mime_type TEXT,
                size INTEGER NOT NULL,
                folder TEXT,
                account_id TEXT,
                created_at INTEGER NOT NULL
            )
            "#,
            [],
        )?;

        Ok(())
    }

    // =====================================================
    // 存储账号
    // =====================================================

    /// 列出所有账号
    pub fn list_accounts(&self) -> Result<Vec<StorageAccount>> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(
            "SELECT id, kind, display_name, config, is_active, created_at, updated_at
             FROM storage_accounts ORDER BY created_at",
        )?;
        let rows = stmt.query_map([], row_to_account)?;
        let mut accounts = Vec::new();
        for row in rows {
            accounts.push(row?);
        }
        Ok(accounts)
    }

    /// 按 ID 查询账号
    pub fn get_account(&self, id: &str) -> Result<Option<StorageAccount>> {
        let conn = self.pool.get()?;
        let account = conn
            .query_row(
                "SELECT id, kind, display_name, config, is_active, created_at, updated_at
                 FROM storage_accounts WHERE id = ?1",
                params![id],
                row_to_account,
            )
            .optional()?;
        Ok(account)
    }

    /// 插入新账号
    pub fn insert_account(&self, account: &StorageAccount) -> Result<()> {
        let conn = self.pool.get()?;
        conn.execute(
            "INSERT INTO storage_accounts
             (id, kind, display_name, config, is_active, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                account.id,
                account.kind.to_string(),
                account.display_name,
                account.config,
                account.is_active as i64,
                account.created_at,
                account.updated_at,
            ],
        )?;
        debug!("账号已写入数据库: {} ({})", account.display_name, account.id);
        Ok(())
    }

    /// 更新账号配置包（令牌轮换等）
    ///
    /// 必须在刷新调用内同步执行，延迟写入会导致轮换后的 refresh_token 丢失
    pub fn update_account_config(&self, id: &str, config: &str) -> Result<()> {
        let conn = self.pool.get()?;
        let changed = conn.execute(
            "UPDATE storage_accounts SET config = ?1, updated_at = ?2 WHERE id = ?3",
            params![config, chrono::Utc::now().timestamp(), id],
        )?;
        if changed == 0 {
            anyhow::bail!("账号不存在: {}", id);
        }
        Ok(())
    }

    /// 重命名账号
    pub fn rename_account(&self, id: &str, display_name: &str) -> Result<()> {
        let conn = self.pool.get()?;
        let changed = conn.execute(
            "UPDATE storage_accounts SET display_name = ?1, updated_at = ?2 WHERE id = ?3",
            params![display_name, chrono::Utc::now().timestamp(), id],
        )?;
        if changed == 0 {
            anyhow::bail!("账号不存在: {}", id);
        }
        Ok(())
    }

    /// 删除账号
    ///
    /// 软删除语义：引用该账号的文件记录解除关联（account_id 置空），不级联删除
    pub fn delete_account(&self, id: &str) -> Result<()> {
        let mut conn = self.pool.get()?;
        let tx = conn.transaction()?;
        let detached = tx.execute(
            "UPDATE files SET account_id = NULL WHERE account_id = ?1",
            params![id],
        )?;
        tx.execute("DELETE FROM storage_accounts WHERE id = ?1", params![id])?;
        tx.commit()?;
        info!("账号 {} 已删除，解除关联文件 {} 个", id, detached);
        Ok(())
    }

    /// 设置激活账号
    ///
    /// 单事务内先全部清零再置位，保证任何时刻最多一行 is_active=1；
    /// 传 None 表示回退到本地存储（无激活行）
    pub fn set_active_account(&self, id: Option<&str>) -> Result<()> {
        let mut conn = self.pool.get()?;
        let tx = conn.transaction()?;
        tx.execute("UPDATE storage_accounts SET is_active = 0", [])?;
        if let Some(id) = id {
            let changed = tx.execute(
                "UPDATE storage_accounts SET is_active = 1, updated_at = ?1 WHERE id = ?2",
                params![chrono::Utc::now().timestamp(), id],
            )?;
            if changed == 0 {
                anyhow::bail!("账号不存在: {}", id);
            }
        }
        tx.commit()?;
        Ok(())
    }

    /// 查询激活账号
    pub fn active_account(&self) -> Result<Option<StorageAccount>> {
        let conn = self.pool.get()?;
        let account = conn
            .query_row(
                "SELECT id, kind, display_name, config, is_active, created_at, updated_at
                 FROM storage_accounts WHERE is_active = 1",
                [],
                row_to_account,
            )
            .optional()?;
        Ok(account)
    }

    // =====================================================
    // 通用设置
    // =====================================================

    /// 读取设置项
    pub fn get_setting(&self, key: &str) -> Result<Option<String>> {
        let conn = self.pool.get()?;
        let value = conn
            .query_row(
                "SELECT value FROM settings WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value)
    }

    /// 写入设置项（upsert）
    pub fn set_setting(&self, key: &str, value: &str) -> Result<()> {
        let conn = self.pool.get()?;
        conn.execute(
            "INSERT INTO settings (key, value, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET value = ?2, updated_at = ?3",
            params![key, value, chrono::Utc::now().timestamp()],
        )?;
        Ok(())
    }

    /// 删除设置项
    pub fn delete_setting(&self, key: &str) -> Result<()> {
        let conn = self.pool.get()?;
        conn.execute("DELETE FROM settings WHERE key = ?1", params![key])?;
        Ok(())
    }

    // =====================================================
    // 文件元数据
    // =====================================================

    /// 记录已保存文件
    pub fn insert_file_record(&self, record: &FileRecord) -> Result<()> {
        let conn = self.pool.get()?;
        conn.execute(
            "INSERT INTO files
             (id, file_name, stored_path, mime_type, size, folder, account_id, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                record.id,
                record.file_name,
                record.stored_path,
                record.mime_type,
                record.size as i64,
                record.folder,
                record.account_id,
                record.created_at,
            ],
        )?;
        Ok(())
    }

    /// 统计某账号名下的文件数
    pub fn count_files_for_account(&self, account_id: &str) -> Result<u64> {
        let conn = self.pool.get()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM files WHERE account_id = ?1",
            params![account_id],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }
}

/// 行映射
fn row_to_account(row: &rusqlite::Row<'_>) -> rusqlite::Result<StorageAccount> {
    let kind_str: String = row.get(1)?;
    let kind = StorageKind::parse(&kind_str).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(
            1,
            rusqlite::types::Type::Text,
            Box::new(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                e.to_string(),
            )),
        )
    })?;
    Ok(StorageAccount {
        id: row.get(0)?,
        kind,
        display_name: row.get(2)?,
        config: row.get(3)?,
        is_active: row.get::<_, i64>(4)? != 0,
        created_at: row.get(5)?,
        updated_at: row.get(6)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_account(name: &str) -> StorageAccount {
        StorageAccount::new(StorageKind::Webdav, name.to_string(), "{}".to_string())
    }

    #[test]
    fn test_account_crud() {
        let db = Database::in_memory().unwrap();

        let account = sample_account("坚果云");
        db.insert_account(&account).unwrap();

        let loaded = db.get_account(&account.id).unwrap().unwrap();
        assert_eq!(loaded.display_name, "坚果云");
        assert_eq!(loaded.kind, StorageKind::Webdav);

        db.rename_account(&account.id, "新名字").unwrap();
        let loaded = db.get_account(&account.id).unwrap().unwrap();
        assert_eq!(loaded.display_name, "新名字");

        db.delete_account(&account.id).unwrap();
        assert!(db.get_account(&account.id).unwrap().is_none());
    }

    #[test]
    fn test_at_most_one_active() {
        let db = Database::in_memory().unwrap();

        let a = sample_account("A");
        let b = sample_account("B");
        db.insert_account(&a).unwrap();
        db.insert_account(&b).unwrap();

        db.set_active_account(Some(&a.id)).unwrap();
        assert_eq!(db.active_account().unwrap().unwrap().id, a.id);

        // 切换激活账号后旧账号必须被清零
        db.set_active_account(Some(&b.id)).unwrap();
        let actives: Vec<_> = db
            .list_accounts()
            .unwrap()
            .into_iter()
            .filter(|acc| acc.is_active)
            .collect();
        assert_eq!(actives.len(), 1);
        assert_eq!(actives[0].id, b.id);

        // 回退到本地
        db.set_active_account(None).unwrap();
        assert!(db.active_account().unwrap().is_none());
    }

    #[test]
    fn test_delete_account_detaches_files() {
        let db = Database::in_memory().unwrap();

        let account = sample_account("OSS");
        db.insert_account(&account).unwrap();

        let record = FileRecord::new(
            "photo.jpg".to_string(),
            "objects/photo.jpg".to_string(),
            Some("image/jpeg".to_string()),
            1024,
            None,
            Some(account.id.clone()),
        );
        db.insert_file_record(&record).unwrap();
        assert_eq!(db.count_files_for_account(&account.id).unwrap(), 1);

        // 删除账号后文件记录保留但解除关联
        db.delete_account(&account.id).unwrap();
        assert_eq!(db.count_files_for_account(&account.id).unwrap(), 0);

        let conn = db.pool.get().unwrap();
        let total: i64 = conn
            .query_row("SELECT COUNT(*) FROM files", [], |row| row.get(0))
            .unwrap();
        assert_eq!(total, 1);
    }

    #[test]
    fn test_settings_upsert() {
        let db = Database::in_memory().unwrap();
        assert!(db.get_setting("pending_account").unwrap().is_none());

        db.set_setting("pending_account", "{\"kind\":\"webdav\"}").unwrap();
        db.set_setting("pending_account", "{\"kind\":\"oauth_drive\"}").unwrap();
        assert_eq!(
            db.get_setting("pending_account").unwrap().unwrap(),
            "{\"kind\":\"oauth_drive\"}"
        );

        db.delete_setting("pending_account").unwrap();
        assert!(db.get_setting("pending_account").unwrap().is_none());
    }
}
