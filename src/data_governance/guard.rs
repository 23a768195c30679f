//! # Migration Guard (迁移守护)
//!
//! 在任何连接打开数据库之前，对比磁盘版本与程序目标版本并处理差异：
//!
//! | 磁盘 vs 目标 | 处理 | 结果 |
//! |---|---|---|
//! | 不存在 / 未知 | 仅惰性创建备份目录 | 放行（全新安装） |
//! | 相等 | 无 | 放行 |
//! | 磁盘 < 目标 | 迁移前快照 `{db}_v{disk}_to_v{target}_{ts}.db` | 放行（备份失败按策略） |
//! | 磁盘 > 目标 | 找 `from == target` 的最新快照并恢复 | 恢复成功放行，否则拒绝 |
//!
//! 守护内部不向外抛错：所有文件操作失败都记录日志并转为 [`ReconcileOutcome`]。

use std::fmt;
use std::path::PathBuf;

use tracing::{debug, error, info, warn};

use super::backup::{BackupError, BackupManager};
use super::version_oracle::{SchemaVersion, VersionOracle, VersionSkew};
use crate::config::GuardConfig;

/// 恢复前释放引擎缓存/句柄的回调
pub type CacheReleaseHook = Box<dyn Fn() + Send + Sync>;

/// 对账结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// 数据库不存在（或版本未知），按全新安装处理
    FreshInstall,
    /// 磁盘版本与目标一致
    UpToDate { version: u32 },
    /// 已创建迁移前快照
    BackedUp { from: u32, to: u32, backup: PathBuf },
    /// 迁移前快照失败
    BackupFailed { from: u32, to: u32, reason: String },
    /// 已从快照降级恢复
    Restored {
        rolled_back_from: u32,
        version: u32,
        backup: PathBuf,
    },
    /// 磁盘版本更新，但没有可用于降级的快照
    NoCompatibleBackup { disk: u32, target: u32 },
    /// 找到快照但恢复失败
    RestoreFailed {
        disk: u32,
        target: u32,
        reason: String,
    },
}

impl ReconcileOutcome {
    /// 是否可以继续打开/迁移数据库
    pub fn is_safe_to_open(&self, abort_on_backup_failure: bool) -> bool {
        match self {
            ReconcileOutcome::FreshInstall
            | ReconcileOutcome::UpToDate { .. }
            | ReconcileOutcome::BackedUp { .. }
            | ReconcileOutcome::Restored { .. } => true,
            ReconcileOutcome::BackupFailed { .. } => !abort_on_backup_failure,
            ReconcileOutcome::NoCompatibleBackup { .. }
            | ReconcileOutcome::RestoreFailed { .. } => false,
        }
    }
}

impl fmt::Display for ReconcileOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReconcileOutcome::FreshInstall => write!(f, "fresh install"),
            ReconcileOutcome::UpToDate { version } => write!(f, "up to date at v{}", version),
            ReconcileOutcome::BackedUp { from, to, backup } => {
                write!(f, "backed up v{} -> v{} to {}", from, to, backup.display())
            }
            ReconcileOutcome::BackupFailed { from, to, reason } => {
                write!(f, "backup v{} -> v{} failed: {}", from, to, reason)
            }
            ReconcileOutcome::Restored {
                rolled_back_from,
                version,
                backup,
            } => write!(
                f,
                "restored v{} from {} (was v{})",
                version,
                backup.display(),
                rolled_back_from
            ),
            ReconcileOutcome::NoCompatibleBackup { disk, target } => write!(
                f,
                "database is v{} but no backup from v{} exists",
                disk, target
            ),
            ReconcileOutcome::RestoreFailed {
                disk,
                target,
                reason,
            } => write!(f, "restore v{} -> v{} failed: {}", disk, target, reason),
        }
    }
}

/// 迁移守护
pub struct MigrationGuard {
    config: GuardConfig,
    target_version: u32,
    oracle: VersionOracle,
    backups: BackupManager,
    cache_release: Option<CacheReleaseHook>,
}

impl fmt::Debug for MigrationGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MigrationGuard")
            .field("database", &self.oracle.db_path())
            .field("target_version", &self.target_version)
            .field("backup_dir", &self.backups.backup_dir())
            .field("has_cache_release", &self.cache_release.is_some())
            .finish()
    }
}

impl MigrationGuard {
    pub fn new(config: GuardConfig, target_version: u32) -> Self {
        let oracle = VersionOracle::new(config.database_path());
        let backups = BackupManager::from_config(&config);
        Self {
            config,
            target_version,
            oracle,
            backups,
            cache_release: None,
        }
    }

    /// 设置恢复前的缓存释放回调
    pub fn with_cache_release<F>(mut self, hook: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.cache_release = Some(Box::new(hook));
        self
    }

    pub fn target_version(&self) -> u32 {
        self.target_version
    }

    pub fn config(&self) -> &GuardConfig {
        &self.config
    }

    pub fn backups(&self) -> &BackupManager {
        &self.backups
    }

    /// 当前磁盘版本
    pub fn disk_version(&self) -> SchemaVersion {
        self.oracle.get_database_version()
    }

    /// 对账并按配置策略给出是否放行
    pub fn reconcile(&self) -> bool {
        let outcome = self.reconcile_with_outcome();
        let safe = outcome.is_safe_to_open(self.config.abort_on_backup_failure);
        if safe {
            info!("[MigrationGuard] 对账完成: {}", outcome);
        } else {
            error!("[MigrationGuard] ❌ 对账未通过，拒绝打开数据库: {}", outcome);
        }
        safe
    }

    /// 对账并返回详细结果
    pub fn reconcile_with_outcome(&self) -> ReconcileOutcome {
        let disk = self.oracle.get_database_version();
        match VersionSkew::classify(disk, self.target_version) {
            VersionSkew::Absent => {
                self.ensure_backup_dir_lazily();
                info!(
                    "[MigrationGuard] 未找到已有数据库，按全新安装处理 (target=v{})",
                    self.target_version
                );
                ReconcileOutcome::FreshInstall
            }
            VersionSkew::Match => {
                self.ensure_backup_dir_lazily();
                ReconcileOutcome::UpToDate {
                    version: self.target_version,
                }
            }
            VersionSkew::Forward { from, to } => self.backup_before_upgrade(from, to),
            VersionSkew::Rollback { disk, target } => self.restore_for_downgrade(disk, target),
        }
    }

    fn ensure_backup_dir_lazily(&self) {
        if let Err(e) = self.backups.ensure_backup_dir() {
            warn!(
                operation = "ensure_backup_dir",
                path = %self.backups.backup_dir().display(),
                error = %e,
                "[MigrationGuard] 无法创建备份目录"
            );
        }
    }

    fn backup_before_upgrade(&self, from: u32, to: u32) -> ReconcileOutcome {
        let live = self.oracle.db_path();
        info!(
            "[MigrationGuard] 检测到升级 v{} -> v{}，创建迁移前快照",
            from, to
        );

        match self.backups.find_identical_backup(live, from, to) {
            Ok(Some(record)) => {
                info!(
                    "[MigrationGuard] 已有内容一致的快照，直接复用: {}",
                    record.path.display()
                );
                return ReconcileOutcome::BackedUp {
                    from,
                    to,
                    backup: record.path,
                };
            }
            Ok(None) => {}
            Err(e) => {
                debug!(
                    path = %live.display(),
                    error = %e,
                    "[MigrationGuard] 无法比对已有快照，重新创建"
                );
            }
        }

        match self.backups.create_backup(live, from, to) {
            Ok(record) => {
                if let Some(keep) = self.config.max_backup_count {
                    if let Err(e) = self.backups.cleanup_old_backups(keep) {
                        warn!(
                            operation = "cleanup_old_backups",
                            path = %self.backups.backup_dir().display(),
                            error = %e,
                            "[MigrationGuard] 清理旧备份失败"
                        );
                    }
                }
                ReconcileOutcome::BackedUp {
                    from,
                    to,
                    backup: record.path,
                }
            }
            Err(e) => {
                warn!(
                    operation = "pre_migration_backup",
                    path = %live.display(),
                    error = %e,
                    "[MigrationGuard] ⚠️ 迁移前快照失败"
                );
                ReconcileOutcome::BackupFailed {
                    from,
                    to,
                    reason: e.to_string(),
                }
            }
        }
    }

    fn restore_for_downgrade(&self, disk: u32, target: u32) -> ReconcileOutcome {
        let live = self.oracle.db_path();
        warn!(
            "[MigrationGuard] 磁盘版本 v{} 高于程序版本 v{}，尝试从快照降级",
            disk, target
        );

        let catalog = self.backups.catalog();
        let candidates: Vec<_> = catalog.candidates_from(target).collect();
        if candidates.is_empty() {
            error!(
                operation = "find_rollback_backup",
                path = %self.backups.backup_dir().display(),
                "[MigrationGuard] 没有 from=v{} 的快照，无法降级",
                target
            );
            return ReconcileOutcome::NoCompatibleBackup { disk, target };
        }

        if let Some(release) = &self.cache_release {
            release();
        }

        let mut last_error: Option<BackupError> = None;
        for record in candidates {
            match self.backups.restore(record, live) {
                Ok(()) => {
                    let restored = self.oracle.get_database_version();
                    if restored.get() != Some(target) {
                        warn!(
                            "[MigrationGuard] 恢复后的版本 {} 与快照文件名记录的 v{} 不一致: {}",
                            restored,
                            target,
                            record.path.display()
                        );
                    }
                    info!(
                        "[MigrationGuard] ✅ 已从快照恢复到 v{}: {}",
                        target,
                        record.path.display()
                    );
                    return ReconcileOutcome::Restored {
                        rolled_back_from: disk,
                        version: target,
                        backup: record.path.clone(),
                    };
                }
                Err(
                    e @ (BackupError::IntegrityCheckFailed(_)
                    | BackupError::Database(_)
                    | BackupError::ChecksumMismatch { .. }
                    | BackupError::FileNotFound(_)),
                ) => {
                    // 快照本身不可用，换下一个
                    warn!(
                        operation = "verify_backup",
                        path = %record.path.display(),
                        error = %e,
                        "[MigrationGuard] 快照不可用，尝试更早的快照"
                    );
                    last_error = Some(e);
                }
                Err(e) => {
                    error!(
                        operation = "restore_backup",
                        path = %live.display(),
                        error = %e,
                        "[MigrationGuard] ❌ 恢复失败"
                    );
                    return ReconcileOutcome::RestoreFailed {
                        disk,
                        target,
                        reason: e.to_string(),
                    };
                }
            }
        }

        ReconcileOutcome::RestoreFailed {
            disk,
            target,
            reason: last_error
                .map(|e| e.to_string())
                .unwrap_or_else(|| "no usable backup".to_string()),
        }
    }
}

// ============================================================================
// 测试
// ============================================================================
