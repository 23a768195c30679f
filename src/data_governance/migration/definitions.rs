//! # Migration Definitions (迁移定义)
//!
//! 只前进的迁移步骤 `from -> to`，每步是一组按顺序执行的 SQL 语句。
//!
//! ## 版本号说明
//!
//! 版本即 SQLite 头部的 `user_version`。未初始化的库为 0，
//! 因此初始化步骤写作 `0 -> 1`。

use super::{MigrationError, SchemaMigrator};

/// 单个迁移步骤
#[derive(Debug, Clone, Copy)]
pub struct MigrationStep {
    /// 起始版本
    pub from: u32,
    /// 结束版本
    pub to: u32,
    /// 迁移名称（日志用）
    pub name: &'static str,
    /// 按顺序执行的语句
    pub statements: &'static [&'static str],
}

impl MigrationStep {
    pub const fn new(
        from: u32,
        to: u32,
        name: &'static str,
        statements: &'static [&'static str],
    ) -> Self {
        Self {
            from,
            to,
            name,
            statements,
        }
    }
}

/// 一个数据库的迁移集合
#[derive(Debug, Clone, Copy)]
pub struct MigrationSet {
    /// 数据库名称
    pub database_name: &'static str,
    /// 迁移步骤
    pub steps: &'static [MigrationStep],
}

impl MigrationSet {
    pub const fn new(database_name: &'static str, steps: &'static [MigrationStep]) -> Self {
        Self {
            database_name,
            steps,
        }
    }

    /// 最新版本（所有步骤中最大的 `to`）
    pub fn latest_version(&self) -> u32 {
        self.steps.iter().map(|s| s.to).max().unwrap_or(0)
    }

    /// 计算 `current -> target` 的迁移路径
    ///
    /// 每一步选择从当前版本出发、不越过目标的最远步骤。
    pub fn path(
        &self,
        current: u32,
        target: u32,
    ) -> Result<Vec<&'static MigrationStep>, MigrationError> {
        if current > target {
            return Err(MigrationError::DowngradeRefused {
                current,
                target,
            });
        }

        let steps: &'static [MigrationStep] = self.steps;
        let mut path = Vec::new();
        let mut version = current;
        while version < target {
            let next = steps
                .iter()
                .filter(|s| s.from == version && s.to > s.from && s.to <= target)
                .max_by_key(|s| s.to)
                .ok_or_else(|| MigrationError::NoPath {
                    database: self.database_name.to_string(),
                    from: version,
                    to: target,
                })?;
            path.push(next);
            version = next.to;
        }
        Ok(path)
    }
}

impl SchemaMigrator for MigrationSet {
    fn latest_version(&self) -> u32 {
        MigrationSet::latest_version(self)
    }

    fn statements(&self, current: u32, target: u32) -> Result<Vec<String>, MigrationError> {
        Ok(self
            .path(current, target)?
            .into_iter()
            .flat_map(|step| step.statements.iter().map(|s| s.to_string()))
            .collect())
    }
}
