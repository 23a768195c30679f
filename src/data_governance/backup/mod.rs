//! # Backup 模块
//!
//! 迁移前快照与降级恢复。
//!
//! ## 设计原则
//!
//! 1. **字节级复制**：快照是活动数据库文件的逐字节拷贝，恢复后内容完全一致
//! 2. **原子写入**：先写入同目录临时文件并 `sync_all`，再 `rename` 到目标位置
//! 3. **可验证**：复制后比较 SHA256；恢复前对快照执行 `PRAGMA quick_check`
//! 4. **文件名即索引**：见 [`catalog`]
//!
//! ## WAL 处理
//!
//! - 备份前若存在 `-wal` 文件，先 `PRAGMA wal_checkpoint(TRUNCATE)` 把内容落入主文件
//! - 恢复时先把活动库的 `-wal` / `-shm` / `-journal` 移开，替换成功后删除，失败则放回

pub mod catalog;

use std::ffi::OsString;
use std::fs::{self, File};
use std::path::{Path, PathBuf};

use rusqlite::{Connection, OpenFlags};
use tracing::{debug, error, info, warn};

use crate::backup_common::{calculate_file_hash, check_disk_space};
use crate::config::GuardConfig;

pub use catalog::{BackupCatalog, BackupRecord};

/// 生成唯一文件名的最大尝试次数
const MAX_NAME_ATTEMPTS: i64 = 10;

/// SQLite 伴随文件后缀
const SQLITE_SIDECAR_SUFFIXES: [&str; 3] = ["-wal", "-shm", "-journal"];

/// 备份错误
#[derive(Debug, thiserror::Error)]
pub enum BackupError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },

    #[error("File not found: {0}")]
    FileNotFound(String),

    #[error("Integrity check failed: {0}")]
    IntegrityCheckFailed(String),

    #[error("Backup directory error: {0}")]
    BackupDirectory(String),

    #[error("Insufficient disk space: {available_mb}MB available, need at least {required_mb}MB")]
    InsufficientDiskSpace { available_mb: u64, required_mb: u64 },
}

impl From<rusqlite::Error> for BackupError {
    fn from(err: rusqlite::Error) -> Self {
        BackupError::Database(err.to_string())
    }
}

/// 备份管理器
///
/// 独占备份目录：只有它创建、读取、删除其中的文件。
#[derive(Debug, Clone)]
pub struct BackupManager {
    /// 备份目录
    backup_dir: PathBuf,
    /// 数据库基础名（用于文件名）
    db_name: String,
    /// 是否执行校验
    verify: bool,
    /// 磁盘预检余量（字节）
    disk_space_margin_bytes: u64,
}

impl BackupManager {
    /// 创建新的备份管理器
    pub fn new(backup_dir: PathBuf, db_name: impl Into<String>) -> Self {
        Self {
            backup_dir,
            db_name: db_name.into(),
            verify: true,
            disk_space_margin_bytes: 0,
        }
    }

    /// 从守护配置创建
    pub fn from_config(config: &GuardConfig) -> Self {
        Self {
            backup_dir: config.backup_dir(),
            db_name: config.db_name.clone(),
            verify: config.verify_backups,
            disk_space_margin_bytes: config.disk_space_margin_bytes(),
        }
    }

    /// 设置磁盘预检余量
    pub fn with_disk_space_margin(mut self, bytes: u64) -> Self {
        self.disk_space_margin_bytes = bytes;
        self
    }

    /// 获取备份目录
    pub fn backup_dir(&self) -> &Path {
        &self.backup_dir
    }

    pub fn db_name(&self) -> &str {
        &self.db_name
    }

    /// 确保备份目录存在（幂等）
    pub fn ensure_backup_dir(&self) -> Result<(), BackupError> {
        if self.backup_dir.exists() && !self.backup_dir.is_dir() {
            return Err(BackupError::BackupDirectory(format!(
                "备份路径已存在但不是目录: {}",
                self.backup_dir.display()
            )));
        }
        fs::create_dir_all(&self.backup_dir)?;
        Ok(())
    }

    /// 当前备份目录的索引视图
    pub fn catalog(&self) -> BackupCatalog {
        BackupCatalog::scan(&self.backup_dir, &self.db_name)
    }

    /// 为活动数据库创建快照
    ///
    /// ## 执行步骤
    ///
    /// 1. 确保备份目录存在
    /// 2. 磁盘空间预检
    /// 3. 如有 WAL，先 checkpoint
    /// 4. 复制到临时文件并落盘
    /// 5. 校验 SHA256（可选）
    /// 6. 原子重命名为 `{db}_v{from}_to_v{to}_{ts}.db`
    pub fn create_backup(
        &self,
        live_db: &Path,
        from: u32,
        to: u32,
    ) -> Result<BackupRecord, BackupError> {
        self.ensure_backup_dir()?;

        if !live_db.is_file() {
            return Err(BackupError::FileNotFound(live_db.display().to_string()));
        }

        let size = fs::metadata(live_db)?.len();
        if let Err((available, required)) =
            check_disk_space(&self.backup_dir, size, self.disk_space_margin_bytes)
        {
            return Err(BackupError::InsufficientDiskSpace {
                available_mb: available / (1024 * 1024),
                required_mb: required.div_ceil(1024 * 1024),
            });
        }

        checkpoint_if_wal(live_db)?;

        let (final_path, created_at_ms) = self.allocate_backup_path(from, to)?;
        let tmp_path = temp_sibling(&final_path, "tmp");

        debug!(
            "[Backup] 复制数据库: {} -> {}",
            live_db.display(),
            final_path.display()
        );
        let result = copy_synced(live_db, &tmp_path)
            .and_then(|()| {
                if self.verify {
                    verify_same_content(live_db, &tmp_path)
                } else {
                    Ok(())
                }
            })
            .and_then(|()| fs::rename(&tmp_path, &final_path).map_err(BackupError::from));

        if let Err(e) = result {
            remove_if_exists(&tmp_path);
            return Err(e);
        }

        info!(
            "[Backup] 已创建迁移前快照 v{} -> v{}: {} ({} bytes)",
            from,
            to,
            final_path.display(),
            size
        );

        Ok(BackupRecord {
            from,
            to,
            created_at_ms,
            path: final_path,
        })
    }

    /// 选出不冲突的备份文件名；同一毫秒内已存在时把时间戳后移
    fn allocate_backup_path(&self, from: u32, to: u32) -> Result<(PathBuf, i64), BackupError> {
        let now_ms = chrono::Utc::now().timestamp_millis();
        for offset in 0..MAX_NAME_ATTEMPTS {
            let ts = now_ms + offset;
            let path = self
                .backup_dir
                .join(BackupRecord::file_name(&self.db_name, from, to, ts));
            if !path.exists() {
                return Ok((path, ts));
            }
        }
        Err(BackupError::BackupDirectory(
            "无法生成唯一备份文件名（多次尝试均冲突）".to_string(),
        ))
    }

    /// 校验快照可被 SQLite 正常读取
    pub fn verify_record(&self, record: &BackupRecord) -> Result<(), BackupError> {
        if !record.path.is_file() {
            return Err(BackupError::FileNotFound(record.path.display().to_string()));
        }
        let conn = Connection::open_with_flags(
            &record.path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        let result: String = conn.query_row("PRAGMA quick_check", [], |row| row.get(0))?;
        if result != "ok" {
            return Err(BackupError::IntegrityCheckFailed(format!(
                "{}: {}",
                record.path.display(),
                result
            )));
        }
        Ok(())
    }

    /// 用快照替换活动数据库
    ///
    /// 调用方负责在此之前释放所有指向活动库的连接与引擎缓存。
    /// 任一步骤失败时活动库主文件保持原样。
    pub fn restore(&self, record: &BackupRecord, live_db: &Path) -> Result<(), BackupError> {
        info!(
            "[Backup] 开始恢复快照 v{} (ts={}): {} -> {}",
            record.from,
            record.created_at_ms,
            record.path.display(),
            live_db.display()
        );

        if self.verify {
            self.verify_record(record)?;
        } else if !record.path.is_file() {
            return Err(BackupError::FileNotFound(record.path.display().to_string()));
        }

        if let Some(parent) = live_db.parent() {
            fs::create_dir_all(parent)?;
        }

        let tmp_path = temp_sibling(live_db, "restore.tmp");
        let staged = copy_synced(&record.path, &tmp_path).and_then(|()| {
            if self.verify {
                verify_same_content(&record.path, &tmp_path)
            } else {
                Ok(())
            }
        });
        if let Err(e) = staged {
            remove_if_exists(&tmp_path);
            return Err(e);
        }

        // 旧 WAL 不能留在原位，否则会被套用到恢复后的主文件上；
        // 先移到一旁，替换失败时放回，保证活动库（含未 checkpoint 的提交）不变
        let set_aside = match set_aside_sidecars(live_db) {
            Ok(moved) => moved,
            Err(e) => {
                remove_if_exists(&tmp_path);
                return Err(e);
            }
        };

        if let Err(e) = fs::rename(&tmp_path, live_db) {
            remove_if_exists(&tmp_path);
            put_back_sidecars(&set_aside);
            return Err(e.into());
        }

        for (_, aside) in &set_aside {
            remove_if_exists(aside);
        }

        info!("[Backup] 恢复完成: {}", live_db.display());
        Ok(())
    }

    /// 查找内容与活动库完全一致的 `from -> to` 快照
    ///
    /// 升级未完成前多次启动时复用已有快照，不重复复制。
    pub fn find_identical_backup(
        &self,
        live_db: &Path,
        from: u32,
        to: u32,
    ) -> Result<Option<BackupRecord>, BackupError> {
        let catalog = self.catalog();
        let matching: Vec<&BackupRecord> = catalog
            .candidates_from(from)
            .filter(|r| r.to == to)
            .collect();
        if matching.is_empty() {
            return Ok(None);
        }

        checkpoint_if_wal(live_db)?;
        let live_hash = calculate_file_hash(live_db)?;
        for record in matching {
            match calculate_file_hash(&record.path) {
                Ok(hash) if hash == live_hash => return Ok(Some(record.clone())),
                Ok(_) => {}
                Err(e) => {
                    warn!(
                        operation = "hash_backup",
                        path = %record.path.display(),
                        error = %e,
                        "[Backup] 无法读取已有快照，跳过"
                    );
                }
            }
        }
        Ok(None)
    }

    /// 清理旧备份，保留最新的 `keep_count` 个
    pub fn cleanup_old_backups(&self, keep_count: usize) -> Result<Vec<PathBuf>, BackupError> {
        let catalog = self.catalog();
        let mut deleted = Vec::new();

        if catalog.len() <= keep_count {
            return Ok(deleted);
        }

        for record in catalog.records().iter().skip(keep_count) {
            match fs::remove_file(&record.path) {
                Ok(()) => deleted.push(record.path.clone()),
                Err(e) => {
                    warn!(
                        "[Backup] 删除旧备份失败 {}: {}",
                        record.path.display(),
                        e
                    );
                }
            }
        }

        info!("[Backup] 清理旧备份完成，删除 {} 个", deleted.len());
        Ok(deleted)
    }
}

/// 同目录下的隐藏临时文件（`.name.suffix`），不会被目录索引识别
fn temp_sibling(path: &Path, suffix: &str) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    path.with_file_name(format!(".{}.{}", name, suffix))
}

/// 复制并落盘
fn copy_synced(src: &Path, dst: &Path) -> Result<(), BackupError> {
    fs::copy(src, dst)?;
    File::open(dst)?.sync_all()?;
    Ok(())
}

fn verify_same_content(expected: &Path, actual: &Path) -> Result<(), BackupError> {
    let expected_hash = calculate_file_hash(expected)?;
    let actual_hash = calculate_file_hash(actual)?;
    if expected_hash != actual_hash {
        return Err(BackupError::ChecksumMismatch {
            expected: expected_hash,
            actual: actual_hash,
        });
    }
    Ok(())
}

fn sidecar_path(db_path: &Path, suffix: &str) -> PathBuf {
    let mut os: OsString = db_path.as_os_str().to_owned();
    os.push(suffix);
    PathBuf::from(os)
}

/// 存在 WAL 时把日志内容合并进主文件，保证逐字节复制得到完整快照
fn checkpoint_if_wal(db_path: &Path) -> Result<(), BackupError> {
    let wal = sidecar_path(db_path, "-wal");
    if !wal.exists() {
        return Ok(());
    }
    debug!("[Backup] 执行 WAL checkpoint: {}", db_path.display());
    let conn = Connection::open_with_flags(
        db_path,
        OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_NO_MUTEX,
    )?;
    conn.execute_batch("PRAGMA wal_checkpoint(TRUNCATE);")?;
    drop(conn);
    Ok(())
}

/// 把活动库的伴随文件改名移开，返回 `(原路径, 暂存路径)`
///
/// 中途失败时已移动的文件会被放回。
fn set_aside_sidecars(db_path: &Path) -> Result<Vec<(PathBuf, PathBuf)>, BackupError> {
    let mut moved = Vec::new();
    for suffix in SQLITE_SIDECAR_SUFFIXES {
        let original = sidecar_path(db_path, suffix);
        if !original.exists() {
            continue;
        }
        let aside = temp_sibling(&original, "restore-aside");
        match fs::rename(&original, &aside) {
            Ok(()) => {
                debug!("[Backup] 已暂存伴随文件: {}", original.display());
                moved.push((original, aside));
            }
            Err(e) => {
                put_back_sidecars(&moved);
                return Err(e.into());
            }
        }
    }
    Ok(moved)
}

fn put_back_sidecars(moved: &[(PathBuf, PathBuf)]) {
    for (original, aside) in moved {
        if let Err(e) = fs::rename(aside, original) {
            error!(
                operation = "restore_sidecar",
                path = %original.display(),
                error = %e,
                "[Backup] ❌ 无法放回伴随文件，暂存副本保留在 {}",
                aside.display()
            );
        }
    }
}

fn remove_if_exists(path: &Path) {
    if let Err(e) = fs::remove_file(path) {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!("[Backup] 清理临时文件失败 {}: {}", path.display(), e);
        }
    }
}

// ============================================================================
// 测试
// ============================================================================
