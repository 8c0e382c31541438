//! 持久化存储后端
//! Durable storage backends
//!
//! 关系型存储是会话与消息的权威来源。所有后端实现
//! `palaver_kernel::store::ConversationStore`，按 id 幂等写入。
//! The relational tier is the source of truth for sessions and messages.
//! Every backend implements `palaver_kernel::store::ConversationStore` and
//! writes idempotently by id.
//!
//! ```text
//!   ConversationRepository
//!            │
//!            ▼
//!   ┌─────────────────────────────────────────────┐
//!   │  PostgreSQL   │   SQLite    │   In-Memory   │
//!   │  (sqlx-pg)    │ (sqlx-lite) │   (default)   │
//!   └─────────────────────────────────────────────┘
//! ```
//!
//! ## SQLite 存储 (需要 `persistence-sqlite` feature)
//!
//! ```rust,ignore
//! use palaver_foundation::persistence::SqliteStore;
//!
//! // 内存数据库 (适用于测试)
//! let store = SqliteStore::in_memory().await?;
//! ```

mod memory;

pub use memory::*;

#[cfg(feature = "persistence-postgres")]
mod postgres;
#[cfg(feature = "persistence-postgres")]
pub use postgres::*;

#[cfg(feature = "persistence-sqlite")]
mod sqlite;
#[cfg(feature = "persistence-sqlite")]
pub use sqlite::*;
