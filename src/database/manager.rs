//! DatabaseManager - 连接池管理器
//!
//! - r2d2 连接池管理
//! - 打开前的版本对账（见 [`MigrationGuard`]）与之后的前向迁移
//! - 进程内唯一实例的一次性初始化（[`DatabaseProvider`]）

use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, OnceLock, RwLock};
use std::time::Duration;
use tracing::{error, info, warn};

use super::{SqlitePool, SqlitePooledConnection};
use crate::config::GuardConfig;
use crate::data_governance::migration::{apply_migrations, MigrationReport, SchemaMigrator};
use crate::data_governance::{GuardError, GuardResult, MigrationGuard, ReconcileOutcome};

pub struct DatabaseManager {
    pool: RwLock<SqlitePool>,
    db_path: PathBuf,
}

impl std::fmt::Debug for DatabaseManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DatabaseManager")
            .field("db_path", &self.db_path)
            .finish()
    }
}

impl DatabaseManager {
    /// 创建新的数据库管理器，使用 r2d2 连接池
    pub fn new(db_path: &Path) -> GuardResult<Self> {
        if let Some(parent) = db_path.parent() {
            fs::create_dir_all(parent)?;
        }

        let pool = Self::build_pool(db_path)?;

        Ok(DatabaseManager {
            pool: RwLock::new(pool),
            db_path: db_path.to_path_buf(),
        })
    }

    fn build_pool(db_path: &Path) -> GuardResult<SqlitePool> {
        let manager = SqliteConnectionManager::file(db_path).with_init(|c| {
            c.pragma_update(None, "foreign_keys", "ON")?;
            c.pragma_update(None, "journal_mode", "WAL")?;
            c.pragma_update(None, "synchronous", "NORMAL")?;
            // 写锁等待上限 3 秒，超时交给上层重试/提示
            c.pragma_update(None, "busy_timeout", 3000i64)?;
            Ok(())
        });

        let pool = Pool::builder()
            .max_size(8)
            .min_idle(Some(1))
            .connection_timeout(Duration::from_secs(10))
            .build(manager)?;

        Ok(pool)
    }

    /// 获取数据库连接
    pub fn get_conn(&self) -> GuardResult<SqlitePooledConnection> {
        let pool = self.pool.read().unwrap_or_else(|poisoned| {
            error!("[DatabaseManager] Pool RwLock poisoned! Attempting recovery");
            poisoned.into_inner()
        });
        Ok(pool.get()?)
    }

    /// 数据库文件路径
    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    /// 释放引擎缓存与文件句柄
    ///
    /// 收缩页缓存、checkpoint WAL，然后把连接池切换到内存数据库，
    /// 之后磁盘文件可以被替换。调用后此实例不再指向磁盘文件，应丢弃。
    pub fn release_cache(&self) {
        if let Ok(conn) = self.get_conn() {
            if let Err(e) =
                conn.execute_batch("PRAGMA shrink_memory; PRAGMA wal_checkpoint(TRUNCATE);")
            {
                warn!("[DatabaseManager] 释放缓存失败（忽略）: {}", e);
            }
        }

        let mem_pool = match Pool::builder()
            .max_size(1)
            .build(SqliteConnectionManager::memory())
        {
            Ok(pool) => pool,
            Err(e) => {
                warn!("[DatabaseManager] 创建内存连接池失败，保留原连接池: {}", e);
                return;
            }
        };

        let mut guard = self.pool.write().unwrap_or_else(|poisoned| {
            error!("[DatabaseManager] Pool RwLock poisoned during release_cache! Forcing recovery");
            poisoned.into_inner()
        });
        // 旧池在此被 drop；仍被持有的 PooledConnection 会在归还时关闭
        *guard = mem_pool;
        info!(
            "[DatabaseManager] 已释放数据库文件句柄: {}",
            self.db_path.display()
        );
    }

    /// 执行前向迁移
    pub fn migrate(
        &self,
        migrator: &dyn SchemaMigrator,
        target: u32,
    ) -> GuardResult<MigrationReport> {
        let mut conn = self.get_conn()?;
        Ok(apply_migrations(&mut conn, migrator, target)?)
    }
}

/// 进程内唯一数据库实例的提供者
///
/// 首次 [`acquire`](Self::acquire) 时依次执行：对账 → 打开连接池 → 迁移 → 发布。
/// 对账不通过时直接返回错误，绝不让引擎在原位置创建一个空库。
pub struct DatabaseProvider {
    config: GuardConfig,
    migrator: Arc<dyn SchemaMigrator>,
    target_version: u32,
    cache_release: Option<Arc<dyn Fn() + Send + Sync>>,
    instance: OnceLock<Arc<DatabaseManager>>,
    init_lock: Mutex<()>,
}

impl std::fmt::Debug for DatabaseProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DatabaseProvider")
            .field("database", &self.config.database_path())
            .field("target_version", &self.target_version)
            .field("initialized", &self.instance.get().is_some())
            .finish()
    }
}

impl DatabaseProvider {
    /// 以迁移器的最高版本作为目标版本
    pub fn new(config: GuardConfig, migrator: Arc<dyn SchemaMigrator>) -> Self {
        let target_version = migrator.latest_version();
        Self {
            config,
            migrator,
            target_version,
            cache_release: None,
            instance: OnceLock::new(),
            init_lock: Mutex::new(()),
        }
    }

    /// 指定目标版本（低于迁移器最高版本时用于发布旧版本程序）
    pub fn with_target_version(mut self, target_version: u32) -> Self {
        self.target_version = target_version;
        self
    }

    /// 降级恢复前调用的缓存释放回调
    ///
    /// 首次 `acquire` 时本提供者还没有连接池，无需回调；进程内已持有旧
    /// [`DatabaseManager`]（例如切换数据目录后重新对账）时，传入
    /// `move || old_db.release_cache()`，让恢复前释放旧池的文件句柄。
    pub fn with_cache_release<F>(mut self, hook: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.cache_release = Some(Arc::new(hook));
        self
    }

    pub fn target_version(&self) -> u32 {
        self.target_version
    }

    /// 已初始化的实例（不触发初始化）
    pub fn get(&self) -> Option<Arc<DatabaseManager>> {
        self.instance.get().cloned()
    }

    /// 获取数据库实例，首次调用时完成对账与迁移
    pub fn acquire(&self) -> GuardResult<Arc<DatabaseManager>> {
        if let Some(db) = self.instance.get() {
            return Ok(Arc::clone(db));
        }

        let _init = self.init_lock.lock().unwrap_or_else(|poisoned| {
            error!("[DatabaseProvider] init lock poisoned! Attempting recovery");
            poisoned.into_inner()
        });
        // 等锁期间可能已被其他线程初始化
        if let Some(db) = self.instance.get() {
            return Ok(Arc::clone(db));
        }

        let outcome = self.build_guard().reconcile_with_outcome();
        if !outcome.is_safe_to_open(self.config.abort_on_backup_failure) {
            error!(
                "[DatabaseProvider] ❌ 对账未通过，拒绝打开数据库: {}",
                outcome
            );
            return Err(GuardError::ReconcileRefused(outcome.to_string()));
        }
        info!("[DatabaseProvider] 对账完成: {}", outcome);

        let db = DatabaseManager::new(&self.config.database_path())?;
        let report = db.migrate(self.migrator.as_ref(), self.target_version)?;
        if !report.is_noop() {
            info!(
                "[DatabaseProvider] schema 已从 v{} 迁移到 v{}",
                report.from_version, report.to_version
            );
        } else if matches!(outcome, ReconcileOutcome::Restored { .. }) {
            info!(
                "[DatabaseProvider] 已使用恢复后的 v{} 数据库",
                report.to_version
            );
        }

        let db = Arc::new(db);
        // 持有 init_lock 时只有本线程能写入
        let _ = self.instance.set(Arc::clone(&db));
        Ok(db)
    }

    fn build_guard(&self) -> MigrationGuard {
        let guard = MigrationGuard::new(self.config.clone(), self.target_version);
        match &self.cache_release {
            Some(hook) => {
                let hook = Arc::clone(hook);
                guard.with_cache_release(move || hook())
            }
            None => guard,
        }
    }
}
