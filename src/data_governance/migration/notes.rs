//! 笔记数据库迁移定义

use super::definitions::{MigrationSet, MigrationStep};

/// 笔记库当前版本
pub const NOTES_SCHEMA_VERSION: u32 = 3;

const V1_INIT: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS notes (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        title TEXT NOT NULL,
        body TEXT NOT NULL DEFAULT '',
        created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now')),
        updated_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
    )",
    "CREATE INDEX IF NOT EXISTS idx_notes_updated_at ON notes(updated_at)",
];

const V2_TAGS: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS tags (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        name TEXT NOT NULL UNIQUE
    )",
    "CREATE TABLE IF NOT EXISTS note_tags (
        note_id INTEGER NOT NULL REFERENCES notes(id) ON DELETE CASCADE,
        tag_id INTEGER NOT NULL REFERENCES tags(id) ON DELETE CASCADE,
        PRIMARY KEY (note_id, tag_id)
    )",
];

// ALTER TABLE ADD COLUMN 不支持 IF NOT EXISTS，依赖 user_version 保证只执行一次
const V3_PINNED: &[&str] = &[
    "ALTER TABLE notes ADD COLUMN pinned INTEGER NOT NULL DEFAULT 0",
    "CREATE INDEX IF NOT EXISTS idx_notes_pinned ON notes(pinned, updated_at)",
];

/// 笔记库迁移集合
pub const NOTES_MIGRATION_SET: MigrationSet = MigrationSet::new(
    "notes_database",
    &[
        MigrationStep::new(0, 1, "init", V1_INIT),
        MigrationStep::new(1, 2, "tags", V2_TAGS),
        MigrationStep::new(2, 3, "pinned_notes", V3_PINNED),
    ],
);
