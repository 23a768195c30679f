//! # Backup Catalog (备份目录索引)
//!
//! 备份文件名即元数据，不单独持久化索引：
//!
//! ```text
//! {db_name}_v{from}_to_v{to}_{timestamp_millis}.db
//! notes_database_v2_to_v3_1718000000000.db
//! ```
//!
//! 扫描时容忍目录不存在、为空，或混入无关/格式错误的文件名。

use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::backup_common::log_and_skip_entry_err;

/// 备份文件扩展名
pub const BACKUP_EXTENSION: &str = "db";

/// 单个备份快照
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupRecord {
    /// 备份时磁盘上的版本
    pub from: u32,
    /// 备份时应用的目标版本
    pub to: u32,
    /// 创建时间（Unix 毫秒）
    pub created_at_ms: i64,
    /// 备份文件路径
    pub path: PathBuf,
}

impl BackupRecord {
    /// 生成备份文件名
    pub fn file_name(db_name: &str, from: u32, to: u32, created_at_ms: i64) -> String {
        format!(
            "{}_v{}_to_v{}_{}.{}",
            db_name, from, to, created_at_ms, BACKUP_EXTENSION
        )
    }

    /// 从路径解析备份记录，不属于 `db_name` 或格式不符时返回 `None`
    pub fn parse(db_name: &str, path: &Path) -> Option<Self> {
        let file_name = path.file_name()?.to_str()?;
        let stem = file_name.strip_suffix(&format!(".{}", BACKUP_EXTENSION))?;
        let rest = stem.strip_prefix(db_name)?.strip_prefix("_v")?;

        let (from, rest) = rest.split_once("_to_v")?;
        let (to, timestamp) = rest.split_once('_')?;

        let from = parse_digits(from)?;
        let to = parse_digits(to)?;
        let created_at_ms = i64::try_from(parse_digits::<u64>(timestamp)?).ok()?;

        if from == 0 || to == 0 {
            return None;
        }

        Some(Self {
            from,
            to,
            created_at_ms,
            path: path.to_path_buf(),
        })
    }

    /// 创建时间
    pub fn created_at(&self) -> Option<chrono::DateTime<chrono::Utc>> {
        chrono::DateTime::from_timestamp_millis(self.created_at_ms)
    }
}

/// 只接受纯 ASCII 数字，拒绝 `+3`、空串等 `FromStr` 能接受的写法
fn parse_digits<T: std::str::FromStr>(s: &str) -> Option<T> {
    if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    s.parse().ok()
}

/// 备份目录的派生视图
#[derive(Debug, Clone, Default)]
pub struct BackupCatalog {
    records: Vec<BackupRecord>,
}

impl BackupCatalog {
    /// 扫描备份目录
    ///
    /// 不会失败：目录缺失或无法读取时返回空目录并记录日志。
    pub fn scan(backup_dir: &Path, db_name: &str) -> Self {
        let entries = match fs::read_dir(backup_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(
                    "[BackupCatalog] 备份目录不存在，视为空: {}",
                    backup_dir.display()
                );
                return Self::default();
            }
            Err(e) => {
                warn!(
                    operation = "scan_backup_dir",
                    path = %backup_dir.display(),
                    error = %e,
                    "[BackupCatalog] 无法读取备份目录，视为空"
                );
                return Self::default();
            }
        };

        let mut records = Vec::new();
        for entry in entries.filter_map(log_and_skip_entry_err) {
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            match BackupRecord::parse(db_name, &path) {
                Some(record) => records.push(record),
                None => debug!("[BackupCatalog] 忽略无关文件: {}", path.display()),
            }
        }

        Self::from_records(records)
    }

    /// 由记录构造（按创建时间从新到旧排序）
    pub fn from_records(mut records: Vec<BackupRecord>) -> Self {
        records.sort_by(|a, b| {
            b.created_at_ms
                .cmp(&a.created_at_ms)
                .then_with(|| b.path.cmp(&a.path))
        });
        Self { records }
    }

    /// 所有记录（从新到旧）
    pub fn records(&self) -> &[BackupRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// `from` 等于指定版本的候选（从新到旧）
    pub fn candidates_from(&self, version: u32) -> impl Iterator<Item = &BackupRecord> {
        self.records.iter().filter(move |r| r.from == version)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const DB: &str = "notes_database";

    #[test]
    fn test_file_name_format() {
        assert_eq!(
            BackupRecord::file_name(DB, 2, 3, 1000),
            "notes_database_v2_to_v3_1000.db"
        );
    }

    #[test]
    fn test_parse_valid_name() {
        let record =
            BackupRecord::parse(DB, Path::new("/b/notes_database_v2_to_v3_1000.db")).unwrap();
        assert_eq!(record.from, 2);
        assert_eq!(record.to, 3);
        assert_eq!(record.created_at_ms, 1000);
        assert_eq!(record.path, PathBuf::from("/b/notes_database_v2_to_v3_1000.db"));
        assert!(record.created_at().is_some());
    }

    #[test]
    fn test_parse_rejects_malformed_names() {
        for name in [
            "notes_database_v2_to_v3_1000.sqlite",
            "notes_database_v2_to_v3_.db",
            "notes_database_v_to_v3_1000.db",
            "notes_database_v+2_to_v3_1000.db",
            "notes_database_v2_to_v3_10x0.db",
            "notes_database_v2_v3_1000.db",
            "notes_database_v0_to_v3_1000.db",
            "other_db_v2_to_v3_1000.db",
            ".notes_database_v2_to_v3_1000.db.tmp",
            "notes_database.db",
            "README.md",
        ] {
            assert!(
                BackupRecord::parse(DB, Path::new(name)).is_none(),
                "should reject {}",
                name
            );
        }
    }

    #[test]
    fn test_parse_does_not_cross_db_name_prefix() {
        // "notes" 的备份不应把 "notes_database" 的文件当成自己的
        assert!(BackupRecord::parse("notes", Path::new("notes_database_v2_to_v3_1.db")).is_none());
        assert!(BackupRecord::parse("notes", Path::new("notes_v2_to_v3_1.db")).is_some());
    }

    #[test]
    fn test_scan_missing_dir_is_empty() {
        let dir = TempDir::new().unwrap();
        let catalog = BackupCatalog::scan(&dir.path().join("nope"), DB);
        assert!(catalog.is_empty());
        assert!(!dir.path().join("nope").exists());
    }

    #[test]
    fn test_scan_skips_unrelated_entries() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("notes_database_v2_to_v3_1000.db"), b"a").unwrap();
        std::fs::write(dir.path().join("garbage.txt"), b"b").unwrap();
        std::fs::write(dir.path().join("notes_database_vX_to_v3_1.db"), b"c").unwrap();
        std::fs::create_dir(dir.path().join("notes_database_v1_to_v2_5.db")).unwrap();

        let catalog = BackupCatalog::scan(dir.path(), DB);
        assert_eq!(catalog.len(), 1);
        assert_eq!(catalog.records()[0].from, 2);
    }

    #[test]
    fn test_candidates_ordered_newest_first() {
        let catalog = BackupCatalog::from_records(vec![
            BackupRecord {
                from: 2,
                to: 3,
                created_at_ms: 1000,
                path: PathBuf::from("a"),
            },
            BackupRecord {
                from: 2,
                to: 4,
                created_at_ms: 3000,
                path: PathBuf::from("b"),
            },
            BackupRecord {
                from: 3,
                to: 4,
                created_at_ms: 9000,
                path: PathBuf::from("c"),
            },
            BackupRecord {
                from: 2,
                to: 3,
                created_at_ms: 2000,
                path: PathBuf::from("d"),
            },
        ]);

        assert_eq!(
            catalog
                .candidates_from(2)
                .map(|r| r.created_at_ms)
                .collect::<Vec<_>>(),
            vec![3000, 2000, 1000]
        );
        assert!(catalog.candidates_from(1).next().is_none());
    }
}
