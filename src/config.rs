//! 守护配置模块
//!
//! 配置来源（优先级从低到高）：
//! 1. 内置默认值
//! 2. `config/notes_guard.toml`（可选）
//! 3. `NOTES_GUARD__*` 环境变量（`.env` 会先被加载）

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// 配置文件路径（不含扩展名，交给 `config::File::with_name` 解析）
const CONFIG_FILE_STEM: &str = "config/notes_guard";

/// 环境变量前缀
const ENV_PREFIX: &str = "NOTES_GUARD";

/// 配置错误
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to load config: {0}")]
    Load(#[from] config::ConfigError),

    #[error("invalid value for {field}: {reason}")]
    InvalidValue { field: &'static str, reason: String },
}

/// 数据库守护配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GuardConfig {
    /// 存放活动数据库的目录
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// 数据库基础名称，活动文件为 `{db_name}.db`
    #[serde(default = "default_db_name")]
    pub db_name: String,

    /// 备份目录名（位于 `data_dir` 下）
    #[serde(default = "default_backup_dir_name")]
    pub backup_dir_name: String,

    /// 迁移前备份失败时是否拒绝升级
    #[serde(default)]
    pub abort_on_backup_failure: bool,

    /// 最多保留的备份数量（None 表示不清理）
    #[serde(default)]
    pub max_backup_count: Option<usize>,

    /// 备份后校验 SHA256、恢复前执行 quick_check
    #[serde(default = "default_verify_backups")]
    pub verify_backups: bool,

    /// 备份前磁盘空间预检的余量（MB）
    #[serde(default = "default_disk_space_margin_mb")]
    pub disk_space_margin_mb: u64,
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("data")
}

fn default_db_name() -> String {
    "notes_database".to_string()
}

fn default_backup_dir_name() -> String {
    "database_backups".to_string()
}

fn default_verify_backups() -> bool {
    true
}

fn default_disk_space_margin_mb() -> u64 {
    50
}

impl Default for GuardConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            db_name: default_db_name(),
            backup_dir_name: default_backup_dir_name(),
            abort_on_backup_failure: false,
            max_backup_count: None,
            verify_backups: default_verify_backups(),
            disk_space_margin_mb: default_disk_space_margin_mb(),
        }
    }
}

impl GuardConfig {
    /// 以指定数据目录创建默认配置（测试与嵌入场景常用）
    pub fn with_data_dir(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            ..Self::default()
        }
    }

    /// 从环境变量与配置文件加载
    pub fn from_env_and_file() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        let mut builder = config::Config::builder();
        if Path::new(&format!("{}.toml", CONFIG_FILE_STEM)).exists() {
            builder = builder.add_source(config::File::with_name(CONFIG_FILE_STEM));
        }
        // 后加入的来源优先级更高
        builder = builder.add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .separator("__")
                .try_parsing(true),
        );
        let loaded: GuardConfig = builder.build()?.try_deserialize()?;
        loaded.validate()?;
        Ok(loaded)
    }

    /// 校验配置
    pub fn validate(&self) -> Result<(), ConfigError> {
        check_file_component("db_name", &self.db_name)?;
        check_file_component("backup_dir_name", &self.backup_dir_name)?;
        if self.max_backup_count == Some(0) {
            return Err(ConfigError::InvalidValue {
                field: "max_backup_count",
                reason: "must be at least 1 when set".to_string(),
            });
        }
        Ok(())
    }

    /// 活动数据库文件路径
    pub fn database_path(&self) -> PathBuf {
        self.data_dir.join(format!("{}.db", self.db_name))
    }

    /// 备份目录路径
    pub fn backup_dir(&self) -> PathBuf {
        self.data_dir.join(&self.backup_dir_name)
    }

    /// 磁盘余量（字节）
    pub fn disk_space_margin_bytes(&self) -> u64 {
        self.disk_space_margin_mb.saturating_mul(1024 * 1024)
    }
}

fn check_file_component(field: &'static str, value: &str) -> Result<(), ConfigError> {
    if value.trim().is_empty() {
        return Err(ConfigError::InvalidValue {
            field,
            reason: "must not be empty".to_string(),
        });
    }
    if value.contains('/') || value.contains('\\') || value == "." || value == ".." {
        return Err(ConfigError::InvalidValue {
            field,
            reason: format!("'{}' must be a plain file name", value),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn test_default_paths() {
        let cfg = GuardConfig::with_data_dir("/tmp/notes");
        assert_eq!(
            cfg.database_path(),
            PathBuf::from("/tmp/notes/notes_database.db")
        );
        assert_eq!(cfg.backup_dir(), PathBuf::from("/tmp/notes/database_backups"));
        assert!(!cfg.abort_on_backup_failure);
        assert!(cfg.max_backup_count.is_none());
    }

    #[test]
    fn test_validate_rejects_path_like_names() {
        let mut cfg = GuardConfig::default();
        cfg.db_name = "../escape".to_string();
        assert_matches!(
            cfg.validate(),
            Err(ConfigError::InvalidValue { field: "db_name", .. })
        );

        let mut cfg = GuardConfig::default();
        cfg.backup_dir_name = "  ".to_string();
        assert_matches!(
            cfg.validate(),
            Err(ConfigError::InvalidValue {
                field: "backup_dir_name",
                ..
            })
        );
    }

    #[test]
    fn test_validate_rejects_zero_retention() {
        let mut cfg = GuardConfig::default();
        cfg.max_backup_count = Some(0);
        assert!(cfg.validate().is_err());
        cfg.max_backup_count = Some(3);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_deserialize_partial_toml_uses_defaults() {
        let loaded: GuardConfig = config::Config::builder()
            .add_source(config::File::from_str(
                "db_name = \"journal\"\nmax_backup_count = 4\n",
                config::FileFormat::Toml,
            ))
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap();

        assert_eq!(loaded.db_name, "journal");
        assert_eq!(loaded.max_backup_count, Some(4));
        assert_eq!(loaded.backup_dir_name, "database_backups");
        assert!(loaded.verify_backups);
        assert_eq!(loaded.disk_space_margin_mb, 50);
    }
}
