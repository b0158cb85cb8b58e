//! # 诊所数据库模块
//!
//! 以文档形式持久化五类实体：PostgreSQL JSONB 实现和内存实现共用同一套过滤语法树，
//! 并提供原子编号计数器与乐观锁版本控制。

pub mod connection;
pub mod memory;
pub mod models;
pub mod postgres;
pub mod queries;
pub mod search;
pub mod store;

// 重新导出主要类型
pub use connection::{DatabasePool, PoolOptions};
pub use memory::MemoryStore;
pub use models::*;
pub use postgres::PostgresStore;
pub use queries::{Filter, GroupBy, Predicate, Query, Scalar};
pub use search::{ListParams, PageSettings};
pub use store::{next_number, DocumentStore, Page, Repositories, Repository, Sequence, SharedStore};
