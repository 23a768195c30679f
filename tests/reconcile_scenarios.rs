//! 版本对账端到端场景
//!
//! ## 测试覆盖
//!
//! 1. 升级：迁移前快照 + 迁移后再次对账为空操作
//! 2. 降级：从 `from == target` 的快照恢复
//! 3. 降级失败：无兼容快照时拒绝，活动库不变
//! 4. 全新安装：只创建备份目录
//! 5. 多个候选：时间戳最大者胜出
//! 6. 快照 → 恢复的字节级一致性
//! 7. 谓词真值表

use std::fs;
use std::path::{Path, PathBuf};

use assert_matches::assert_matches;
use rusqlite::Connection;
use tempfile::TempDir;

use notes_guard_lib::data_governance::backup::{BackupCatalog, BackupManager, BackupRecord};
use notes_guard_lib::data_governance::migration::{apply_migrations, NOTES_MIGRATION_SET};
use notes_guard_lib::data_governance::{
    disk_ahead_of_target, needs_backup, SchemaVersion, VersionSkew,
};
use notes_guard_lib::{GuardConfig, MigrationGuard, ReconcileOutcome, VersionOracle};

// ============================================================================
// 辅助函数
// ============================================================================

struct Fixture {
    _temp_dir: TempDir,
    config: GuardConfig,
}

impl Fixture {
    fn new() -> Self {
        let temp_dir = TempDir::new().unwrap();
        let config = GuardConfig::with_data_dir(temp_dir.path().join("data"));
        Self {
            _temp_dir: temp_dir,
            config,
        }
    }

    fn live(&self) -> PathBuf {
        self.config.database_path()
    }

    fn guard(&self, target: u32) -> MigrationGuard {
        MigrationGuard::new(self.config.clone(), target)
    }

    fn catalog(&self) -> BackupCatalog {
        BackupCatalog::scan(&self.config.backup_dir(), &self.config.db_name)
    }

    fn disk_version(&self) -> SchemaVersion {
        VersionOracle::new(self.live()).get_database_version()
    }

    /// 在备份目录放置一个 v`from` 的快照
    fn place_backup(&self, from: u32, to: u32, ts: i64, marker: &str) -> PathBuf {
        let path = self
            .config
            .backup_dir()
            .join(BackupRecord::file_name(&self.config.db_name, from, to, ts));
        create_notes_db(&path, from, marker);
        path
    }
}

/// 创建迁移到 `version` 的笔记库并写入一条标记笔记
fn create_notes_db(path: &Path, version: u32, marker: &str) {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).unwrap();
    }
    let mut conn = Connection::open(path).unwrap();
    apply_migrations(&mut conn, &NOTES_MIGRATION_SET, version).unwrap();
    conn.execute("INSERT INTO notes (title) VALUES (?1)", [marker])
        .unwrap();
}

fn read_marker(path: &Path) -> String {
    let conn = Connection::open(path).unwrap();
    conn.query_row("SELECT title FROM notes ORDER BY id LIMIT 1", [], |row| {
        row.get(0)
    })
    .unwrap()
}

fn migrate_live(path: &Path, target: u32) {
    let mut conn = Connection::open(path).unwrap();
    apply_migrations(&mut conn, &NOTES_MIGRATION_SET, target).unwrap();
}

// ============================================================================
// 谓词
// ============================================================================

#[test]
fn predicates_partition_every_known_pair() {
    for d in 1..=5u32 {
        for t in 1..=5u32 {
            let disk = SchemaVersion::from(d);
            let backup = needs_backup(disk, t);
            let ahead = disk_ahead_of_target(disk, t);
            let noop = !backup && !ahead;

            assert_eq!(backup, t > d, "needs_backup({}, {})", d, t);
            assert_eq!(ahead, d > t, "disk_ahead_of_target({}, {})", d, t);
            assert_eq!(
                [noop, backup, ahead].iter().filter(|b| **b).count(),
                1,
                "exactly one branch for ({}, {})",
                d,
                t
            );
        }
    }
}

#[test]
fn predicates_for_absent_database_are_noop() {
    for t in 0..=5u32 {
        assert!(!needs_backup(SchemaVersion::ABSENT, t));
        assert!(!disk_ahead_of_target(SchemaVersion::ABSENT, t));
        assert_eq!(
            VersionSkew::classify(SchemaVersion::ABSENT, t),
            VersionSkew::Absent
        );
    }
}

// ============================================================================
// 场景
// ============================================================================

#[test]
fn upgrade_creates_backup_then_second_reconcile_is_noop() {
    let fx = Fixture::new();
    create_notes_db(&fx.live(), 2, "before-upgrade");

    let guard = fx.guard(3);
    assert!(guard.reconcile());

    let catalog = fx.catalog();
    assert_eq!(catalog.len(), 1);
    let record = &catalog.records()[0];
    assert_eq!((record.from, record.to), (2, 3));
    let name = record.path.file_name().unwrap().to_str().unwrap();
    assert!(name.starts_with("notes_database_v2_to_v3_"), "{}", name);

    // 对账之后才迁移
    migrate_live(&fx.live(), 3);
    assert_eq!(
        guard.reconcile_with_outcome(),
        ReconcileOutcome::UpToDate { version: 3 }
    );
    assert_eq!(fx.catalog().len(), 1);
}

#[test]
fn repeated_reconcile_before_migration_keeps_one_backup() {
    let fx = Fixture::new();
    create_notes_db(&fx.live(), 2, "pending-upgrade");

    // 升级失败后多次重启：磁盘仍是 v2
    let guard = fx.guard(3);
    for _ in 0..3 {
        assert!(guard.reconcile());
    }
    assert_eq!(fx.catalog().len(), 1);
}

#[test]
fn downgrade_restores_matching_backup() {
    let fx = Fixture::new();
    fx.place_backup(2, 3, 1000, "from-backup");
    create_notes_db(&fx.live(), 3, "newer-live");

    assert!(fx.guard(2).reconcile());

    assert_eq!(fx.disk_version().get(), Some(2));
    assert_eq!(read_marker(&fx.live()), "from-backup");
}

#[test]
fn downgrade_without_compatible_backup_refuses_and_leaves_live_untouched() {
    let fx = Fixture::new();
    create_notes_db(&fx.live(), 3, "newer-live");
    // 只有 from=1 的快照，不能用于回到 v2
    fx.place_backup(1, 3, 9000, "too-old");
    let before = fs::read(fx.live()).unwrap();

    let guard = fx.guard(2);
    assert_eq!(
        guard.reconcile_with_outcome(),
        ReconcileOutcome::NoCompatibleBackup { disk: 3, target: 2 }
    );
    assert!(!guard.reconcile());
    assert_eq!(fs::read(fx.live()).unwrap(), before);
    assert_eq!(fx.disk_version().get(), Some(3));
}

#[test]
fn absent_database_only_creates_backup_dir() {
    let fx = Fixture::new();

    assert!(fx.guard(3).reconcile());

    assert!(fx.config.backup_dir().is_dir());
    assert!(!fx.live().exists());
    assert!(fx.catalog().is_empty());
    let entries: Vec<_> = fs::read_dir(&fx.config.data_dir)
        .unwrap()
        .map(|e| e.unwrap().file_name())
        .collect();
    assert_eq!(entries, vec![std::ffi::OsString::from("database_backups")]);
}

#[test]
fn newest_candidate_wins_regardless_of_listing_order() {
    let fx = Fixture::new();
    // 写入顺序与时间戳顺序刻意打乱
    fx.place_backup(2, 3, 3000, "middle");
    fx.place_backup(2, 4, 5000, "newest");
    fx.place_backup(2, 3, 1000, "oldest");
    fx.place_backup(3, 4, 9000, "other-source-version");
    create_notes_db(&fx.live(), 3, "newer-live");

    let outcome = fx.guard(2).reconcile_with_outcome();
    assert_matches!(
        &outcome,
        ReconcileOutcome::Restored { rolled_back_from: 3, version: 2, backup }
            if backup.ends_with("notes_database_v2_to_v4_5000.db")
    );
    assert_eq!(read_marker(&fx.live()), "newest");
}

#[test]
fn backup_then_restore_is_byte_identical() {
    let fx = Fixture::new();
    create_notes_db(&fx.live(), 2, "original");
    let original = fs::read(fx.live()).unwrap();

    let manager = BackupManager::from_config(&fx.config);
    let record = manager.create_backup(&fx.live(), 2, 3).unwrap();
    assert_eq!(fs::read(&record.path).unwrap(), original);

    migrate_live(&fx.live(), 3);
    assert_ne!(fs::read(fx.live()).unwrap(), original);

    manager.restore(&record, &fx.live()).unwrap();
    assert_eq!(fs::read(fx.live()).unwrap(), original);
}

#[test]
fn full_cycle_upgrade_then_downgrade() {
    let fx = Fixture::new();
    create_notes_db(&fx.live(), 2, "v2-data");

    // 新版本程序：备份并升级
    assert!(fx.guard(3).reconcile());
    migrate_live(&fx.live(), 3);
    assert_eq!(fx.disk_version().get(), Some(3));

    // 回退到旧版本程序：恢复刚才的快照
    assert_matches!(
        fx.guard(2).reconcile_with_outcome(),
        ReconcileOutcome::Restored { rolled_back_from: 3, version: 2, .. }
    );
    assert_eq!(fx.disk_version().get(), Some(2));
    assert_eq!(read_marker(&fx.live()), "v2-data");

    // 旧版本程序再次启动：无需处理
    assert_eq!(
        fx.guard(2).reconcile_with_outcome(),
        ReconcileOutcome::UpToDate { version: 2 }
    );
}

#[test]
fn polluted_backup_dir_is_tolerated() {
    let fx = Fixture::new();
    fs::create_dir_all(fx.config.backup_dir()).unwrap();
    fs::write(fx.config.backup_dir().join("notes.txt"), b"hello").unwrap();
    fs::write(
        fx.config.backup_dir().join("notes_database_vX_to_v3_1.db"),
        b"junk",
    )
    .unwrap();
    fx.place_backup(2, 3, 1000, "good");
    create_notes_db(&fx.live(), 3, "newer-live");

    assert!(fx.guard(2).reconcile());
    assert_eq!(read_marker(&fx.live()), "good");
}
