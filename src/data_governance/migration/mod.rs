//! # Migration 模块
//!
//! 前向迁移执行器。守护（[`crate::data_governance::guard`]）只负责判断与备份/恢复，
//! 真正的建表、改表由注入的 [`SchemaMigrator`] 提供，且只在对账通过之后执行。
//!
//! ## 核心原则
//!
//! 1. **事务原子性**：整条迁移路径在同一个事务中执行，并在同一事务里写入 `user_version`
//! 2. **只前进**：当前版本高于目标时拒绝执行，降级交给守护从备份恢复
//! 3. **永不修改历史**：已发布的步骤不可修改，通过新步骤修复问题
//!
//! ## 组件
//!
//! - `definitions`: 迁移步骤与集合
//! - `notes`: 笔记库的迁移定义

pub mod definitions;
pub mod notes;

use rusqlite::Connection;
use tracing::info;

pub use definitions::{MigrationSet, MigrationStep};
pub use notes::{NOTES_MIGRATION_SET, NOTES_SCHEMA_VERSION};

/// 迁移错误
#[derive(Debug, thiserror::Error)]
pub enum MigrationError {
    #[error("Database error: {0}")]
    Database(String),

    #[error("No migration path for {database}: v{from} -> v{to}")]
    NoPath { database: String, from: u32, to: u32 },

    #[error("Refusing to downgrade schema: current v{current} is newer than target v{target}")]
    DowngradeRefused { current: u32, target: u32 },
}

impl From<rusqlite::Error> for MigrationError {
    fn from(err: rusqlite::Error) -> Self {
        MigrationError::Database(err.to_string())
    }
}

/// 前向迁移提供者
///
/// 把 `(current, target)` 映射为需要执行的语句序列。
pub trait SchemaMigrator: Send + Sync {
    /// 该迁移器能达到的最高版本
    fn latest_version(&self) -> u32;

    /// `current -> target` 需要执行的语句（按顺序）
    fn statements(&self, current: u32, target: u32) -> Result<Vec<String>, MigrationError>;
}

/// 单次迁移结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationReport {
    pub from_version: u32,
    pub to_version: u32,
    pub statements_applied: usize,
}

impl MigrationReport {
    pub fn is_noop(&self) -> bool {
        self.from_version == self.to_version
    }
}

/// 读取 `user_version`
pub fn read_user_version(conn: &Connection) -> Result<u32, MigrationError> {
    let version: i64 = conn.pragma_query_value(None, "user_version", |row| row.get(0))?;
    u32::try_from(version).map_err(|_| {
        MigrationError::Database(format!("user_version out of range: {}", version))
    })
}

/// 把数据库迁移到 `target`
///
/// 所有语句与版本号写入在同一个事务中完成，失败时整体回滚。
pub fn apply_migrations(
    conn: &mut Connection,
    migrator: &dyn SchemaMigrator,
    target: u32,
) -> Result<MigrationReport, MigrationError> {
    let current = read_user_version(conn)?;
    if current == target {
        return Ok(MigrationReport {
            from_version: current,
            to_version: target,
            statements_applied: 0,
        });
    }
    if current > target {
        return Err(MigrationError::DowngradeRefused { current, target });
    }

    let statements = migrator.statements(current, target)?;
    info!(
        "[Migration] 开始迁移 v{} -> v{}（{} 条语句）",
        current,
        target,
        statements.len()
    );

    let tx = conn.transaction()?;
    for sql in &statements {
        tx.execute_batch(sql)?;
    }
    tx.pragma_update(None, "user_version", target)?;
    tx.commit()?;

    info!("[Migration] ✅ 迁移完成 v{} -> v{}", current, target);
    Ok(MigrationReport {
        from_version: current,
        to_version: target,
        statements_applied: statements.len(),
    })
}
