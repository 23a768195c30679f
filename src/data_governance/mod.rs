//! # 数据治理 (Data Governance)
//!
//! 数据库版本对账、迁移前快照、降级恢复与前向迁移。
//!
//! ## 模块结构
//!
//! - `version_oracle`: 只读探测磁盘上的 schema 版本
//! - `guard`: 打开数据库前的版本对账（备份 / 恢复 / 放行）
//! - `backup`: 快照的创建、校验、恢复与目录索引
//! - `migration`: 对账通过后执行的前向迁移
//!
//! ## 调用顺序
//!
//! ```text
//! VersionOracle -> MigrationGuard::reconcile() -> (true) 打开连接 -> apply_migrations
//!                                              -> (false) 拒绝打开
//! ```

pub mod backup;
pub mod guard;
pub mod migration;
pub mod version_oracle;

pub use backup::{BackupCatalog, BackupError, BackupManager, BackupRecord};
pub use guard::{CacheReleaseHook, MigrationGuard, ReconcileOutcome};
pub use migration::{
    apply_migrations, MigrationError, MigrationReport, MigrationSet, MigrationStep,
    SchemaMigrator, NOTES_MIGRATION_SET, NOTES_SCHEMA_VERSION,
};
pub use version_oracle::{
    disk_ahead_of_target, needs_backup, SchemaVersion, VersionOracle, VersionSkew,
};

/// 数据治理错误类型
#[derive(Debug, thiserror::Error)]
pub enum GuardError {
    #[error("Migration error: {0}")]
    Migration(#[from] MigrationError),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Connection pool error: {0}")]
    Pool(#[from] r2d2::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Refusing to open database: {0}")]
    ReconcileRefused(String),
}

impl From<rusqlite::Error> for GuardError {
    fn from(err: rusqlite::Error) -> Self {
        GuardError::Database(err.to_string())
    }
}

/// Result 类型别名
pub type GuardResult<T> = Result<T, GuardError>;
