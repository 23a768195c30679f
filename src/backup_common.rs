//! 备份系统共享组件
//!
//! 提供备份/恢复模块共用的工具函数
//! - SHA256计算: 用于文件完整性校验
//! - 磁盘空间检查: 备份前预检，避免写满磁盘产生半截文件
//! - 目录迭代容错: 记录并跳过无法读取的目录项

use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{self, BufReader, Read};
use std::path::{Path, PathBuf};

/// 记录并跳过迭代中的错误，避免 `.flatten()` 静默丢弃
///
/// 适用于 `read_dir` 迭代场景，目录中出现无法读取的条目时不中断整个扫描。
pub fn log_and_skip_entry_err<T, E: std::fmt::Display>(
    result: std::result::Result<T, E>,
) -> Option<T> {
    match result {
        Ok(v) => Some(v),
        Err(e) => {
            tracing::warn!("[BackupCommon] Directory entry read error (skipped): {}", e);
            None
        }
    }
}

/// 计算文件的SHA256哈希值
///
/// 使用8KB缓冲区分块读取，适合处理大文件而不会占用过多内存
///
/// # Arguments
/// * `path` - 要计算哈希的文件路径
///
/// # Returns
/// * `Ok(String)` - 十六进制格式的SHA256哈希值
/// * `Err(io::Error)` - 文件打开或读取失败
pub fn calculate_file_hash(path: &Path) -> io::Result<String> {
    let file = File::open(path)?;

    let mut reader = BufReader::new(file);
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 8192]; // 8KB 缓冲区

    loop {
        let bytes_read = reader.read(&mut buffer)?;
        if bytes_read == 0 {
            break;
        }
        hasher.update(&buffer[..bytes_read]);
    }

    Ok(hex::encode(hasher.finalize()))
}

/// 获取路径所在磁盘的可用空间（字节）
///
/// 路径不存在时向上查找最近的已存在父目录。
/// 非 Unix 平台返回 `Unsupported`，调用方应按“空间未知”处理。
pub fn get_available_disk_space(path: &Path) -> io::Result<u64> {
    let check_path = nearest_existing_ancestor(path);

    #[cfg(unix)]
    {
        get_disk_space_statvfs(&check_path)
    }

    #[cfg(not(unix))]
    {
        let _ = check_path;
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "disk space query is only implemented for unix",
        ))
    }
}

fn nearest_existing_ancestor(path: &Path) -> PathBuf {
    let mut current = Some(path);
    while let Some(p) = current {
        if p.exists() {
            return p.to_path_buf();
        }
        current = p.parent();
    }
    PathBuf::from(".")
}

/// Unix: 使用 libc::statvfs 系统调用获取磁盘可用空间
///
/// f_bavail * f_frsize = 非特权用户可用的字节数。
#[cfg(unix)]
fn get_disk_space_statvfs(path: &Path) -> io::Result<u64> {
    use std::ffi::CString;
    use std::os::unix::ffi::OsStrExt;

    let c_path = CString::new(path.as_os_str().as_bytes())
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;

    let mut stat: libc::statvfs = unsafe { std::mem::zeroed() };
    let ret = unsafe { libc::statvfs(c_path.as_ptr(), &mut stat) };

    if ret == 0 {
        #[allow(clippy::unnecessary_cast)]
        let available = stat.f_bavail as u64 * stat.f_frsize as u64;
        tracing::debug!(
            "[BackupCommon] statvfs 成功: path={}, available={} bytes",
            path.display(),
            available
        );
        Ok(available)
    } else {
        Err(io::Error::last_os_error())
    }
}

/// 检查磁盘空间是否满足 `required_bytes + margin_bytes`
///
/// 空间查询失败时视为“未知”并放行（记录 warn），
/// 真正写满磁盘时复制本身会失败并被上层捕获。
///
/// # Returns
/// * `Ok(())` - 空间充足或无法查询
/// * `Err((available, required))` - 空间不足
pub fn check_disk_space(
    path: &Path,
    required_bytes: u64,
    margin_bytes: u64,
) -> std::result::Result<(), (u64, u64)> {
    let required = required_bytes.saturating_add(margin_bytes);
    let available = match get_available_disk_space(path) {
        Ok(bytes) => bytes,
        Err(e) => {
            tracing::warn!(
                "[BackupCommon] 无法获取磁盘可用空间，跳过预检: path={}, error={}",
                path.display(),
                e
            );
            return Ok(());
        }
    };

    if available < required {
        return Err((available, required));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_calculate_file_hash_known_content() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("hello.txt");
        std::fs::write(&path, b"hello").unwrap();

        assert_eq!(
            calculate_file_hash(&path).unwrap(),
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
    }

    #[test]
    fn test_calculate_file_hash_empty_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("empty");
        std::fs::write(&path, b"").unwrap();

        assert_eq!(
            calculate_file_hash(&path).unwrap(),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn test_calculate_file_hash_nonexistent_file() {
        let dir = TempDir::new().unwrap();
        assert!(calculate_file_hash(&dir.path().join("missing")).is_err());
    }

    #[cfg(unix)]
    #[test]
    fn test_get_available_disk_space_for_missing_child() {
        let dir = TempDir::new().unwrap();
        let missing = dir.path().join("a").join("b").join("c.db");
        let space = get_available_disk_space(&missing).unwrap();
        assert!(space > 0);
    }

    #[cfg(unix)]
    #[test]
    fn test_check_disk_space_rejects_impossible_requirement() {
        let dir = TempDir::new().unwrap();
        let result = check_disk_space(dir.path(), u64::MAX - 1, 1);
        assert!(result.is_err());
    }

    #[test]
    fn test_check_disk_space_accepts_zero() {
        let dir = TempDir::new().unwrap();
        assert!(check_disk_space(dir.path(), 0, 0).is_ok());
    }

    #[test]
    fn test_log_and_skip_entry_err() {
        assert_eq!(log_and_skip_entry_err::<i32, String>(Ok(3)), Some(3));
        assert_eq!(
            log_and_skip_entry_err::<i32, String>(Err("boom".to_string())),
            None
        );
    }
}
