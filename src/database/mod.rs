//! 数据库访问层
//!
//! 连接池类型与 [`DatabaseProvider`]：对账通过后才会打开连接。

mod manager;

pub use manager::{DatabaseManager, DatabaseProvider};

pub type SqlitePool = r2d2::Pool<r2d2_sqlite::SqliteConnectionManager>;
pub type SqlitePooledConnection = r2d2::PooledConnection<r2d2_sqlite::SqliteConnectionManager>;
