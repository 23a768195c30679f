//! # Version Oracle (版本探测)
//!
//! 在数据库被打开/迁移之前，只读地探测磁盘上数据库文件的 schema 版本。
//!
//! ## 约束
//!
//! - 文件不存在 → `SchemaVersion::ABSENT`（-1），表示全新安装，不是错误
//! - 只读、非独占打开，读完立即关闭，绝不触发迁移
//! - 任何 I/O / 解析失败都降级为 `ABSENT` 并记录日志，不向上传播
//!
//! ## 版本存储
//!
//! 版本号保存在 SQLite 文件头的 `user_version` 字段（偏移 60，4 字节大端）。
//! 优先通过只读连接执行 `PRAGMA user_version`（可看到 WAL 中尚未 checkpoint 的修改），
//! 只读连接失败时回退为直接解析文件头。

use std::fmt;
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

use rusqlite::{Connection, OpenFlags};
use tracing::{debug, warn};

/// SQLite 文件头魔数
const SQLITE_HEADER_MAGIC: &[u8; 16] = b"SQLite format 3\0";

/// SQLite 文件头长度
const SQLITE_HEADER_LEN: usize = 100;

/// `user_version` 在文件头中的偏移
const USER_VERSION_OFFSET: usize = 60;

/// Schema 版本
///
/// 合法值为 >= 1 的整数；`-1` 为哨兵值，表示“数据库文件不存在或版本未知”。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SchemaVersion(i64);

impl SchemaVersion {
    /// 哨兵：无数据库文件 / 版本未知
    pub const ABSENT: SchemaVersion = SchemaVersion(-1);

    /// 创建已知版本，`0` 不是合法的 schema 版本
    pub fn new(version: u32) -> Option<Self> {
        if version >= 1 {
            Some(SchemaVersion(i64::from(version)))
        } else {
            None
        }
    }

    /// 是否为已知版本（非哨兵）
    pub fn is_known(self) -> bool {
        self.0 >= 1
    }

    /// 已知版本号
    pub fn get(self) -> Option<u32> {
        if self.is_known() {
            u32::try_from(self.0).ok()
        } else {
            None
        }
    }

    /// 原始整数表示（哨兵为 -1）
    pub fn as_i64(self) -> i64 {
        self.0
    }
}

impl From<u32> for SchemaVersion {
    /// `0` 映射为哨兵
    fn from(version: u32) -> Self {
        SchemaVersion::new(version).unwrap_or(SchemaVersion::ABSENT)
    }
}

impl fmt::Display for SchemaVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.get() {
            Some(v) => write!(f, "v{}", v),
            None => write!(f, "absent"),
        }
    }
}

/// 磁盘版本已知且目标版本更高：升级前需要备份
pub fn needs_backup(disk: SchemaVersion, target: u32) -> bool {
    disk.is_known() && i64::from(target) > disk.as_i64()
}

/// 磁盘版本已知且高于目标版本：应用被降级，需要恢复
pub fn disk_ahead_of_target(disk: SchemaVersion, target: u32) -> bool {
    disk.is_known() && disk.as_i64() > i64::from(target)
}

/// 版本偏差分类
///
/// 对任意 `(disk, target)` 恰好命中一个分支。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VersionSkew {
    /// 磁盘上没有（可识别的）数据库
    Absent,
    /// 版本一致
    Match,
    /// 需要向前迁移（先备份）
    Forward { from: u32, to: u32 },
    /// 磁盘版本领先（需要恢复）
    Rollback { disk: u32, target: u32 },
}

impl VersionSkew {
    pub fn classify(disk: SchemaVersion, target: u32) -> Self {
        match disk.get() {
            None => VersionSkew::Absent,
            Some(d) if needs_backup(disk, target) => VersionSkew::Forward { from: d, to: target },
            Some(d) if disk_ahead_of_target(disk, target) => VersionSkew::Rollback {
                disk: d,
                target,
            },
            Some(_) => VersionSkew::Match,
        }
    }
}

/// 版本探测内部错误（永远不会离开本模块）
#[derive(Debug, thiserror::Error)]
enum OracleError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid sqlite header: {0}")]
    InvalidHeader(&'static str),
}

/// 版本探测器
#[derive(Debug, Clone)]
pub struct VersionOracle {
    db_path: PathBuf,
}

impl VersionOracle {
    pub fn new(db_path: impl Into<PathBuf>) -> Self {
        Self {
            db_path: db_path.into(),
        }
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    /// 读取磁盘上数据库的 schema 版本
    ///
    /// 永不失败：不存在、无法读取、非 SQLite 文件、未写入版本号都返回 `ABSENT`。
    pub fn get_database_version(&self) -> SchemaVersion {
        if !self.db_path.exists() {
            debug!(
                "[VersionOracle] 数据库文件不存在，视为全新安装: {}",
                self.db_path.display()
            );
            return SchemaVersion::ABSENT;
        }

        let raw = match read_user_version(&self.db_path) {
            Ok(v) => v,
            Err(engine_err) => {
                debug!(
                    path = %self.db_path.display(),
                    error = %engine_err,
                    "[VersionOracle] 只读连接读取失败，回退为解析文件头"
                );
                match read_header_user_version(&self.db_path) {
                    Ok(v) => v,
                    Err(e) => {
                        warn!(
                            operation = "read_version_header",
                            path = %self.db_path.display(),
                            error = %e,
                            "[VersionOracle] 无法读取数据库版本，按不存在处理"
                        );
                        return SchemaVersion::ABSENT;
                    }
                }
            }
        };

        let version = SchemaVersion::from(raw);
        if !version.is_known() {
            warn!(
                "[VersionOracle] 数据库未写入 schema 版本 (user_version=0)，按不存在处理: {}",
                self.db_path.display()
            );
        }
        version
    }
}

/// 通过只读、非独占连接读取 `PRAGMA user_version`
fn read_user_version(path: &Path) -> Result<u32, OracleError> {
    let conn = Connection::open_with_flags(
        path,
        OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
    )?;
    let version: i64 = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;
    drop(conn);
    // user_version 是有符号 32 位整数，负数视为非法
    u32::try_from(version).map_err(|_| OracleError::InvalidHeader("negative user_version"))
}

/// 直接解析 SQLite 文件头中的 `user_version`
fn read_header_user_version(path: &Path) -> Result<u32, OracleError> {
    let mut header = [0u8; SQLITE_HEADER_LEN];
    let mut file = File::open(path)?;
    file.read_exact(&mut header)?;

    if &header[..SQLITE_HEADER_MAGIC.len()] != SQLITE_HEADER_MAGIC {
        return Err(OracleError::InvalidHeader("magic mismatch"));
    }

    let mut bytes = [0u8; 4];
    bytes.copy_from_slice(&header[USER_VERSION_OFFSET..USER_VERSION_OFFSET + 4]);
    let version = i32::from_be_bytes(bytes);
    u32::try_from(version).map_err(|_| OracleError::InvalidHeader("negative user_version"))
}
