// Notes Guard library entry
// 数据库版本对账、迁移前快照、降级恢复与前向迁移。

pub mod backup_common;
pub mod config;
pub mod data_governance;
pub mod database;

pub use config::{ConfigError, GuardConfig};
pub use data_governance::{
    GuardError, GuardResult, MigrationGuard, ReconcileOutcome, SchemaVersion, VersionOracle,
};
pub use database::{DatabaseManager, DatabaseProvider};
