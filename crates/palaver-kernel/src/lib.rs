//! `palaver-kernel`: contracts of the Palaver chat backend.
//!
//! The kernel holds the conversation entities and the capability traits the
//! rest of the workspace is written against:
//!
//! | Concern | Contract |
//! |---------|----------|
//! | Durable and cached conversation data | [`store::ConversationStore`] |
//! | Write-behind persistence events | [`queue::EventPublisher`], [`queue::EventHandler`] |
//! | Backend load accounting | [`balancer::LoadTracker`] |
//! | Instance lookup | [`balancer::ServiceDiscovery`] |
//! | Token streaming from inference workers | [`inference::InferenceService`], [`inference::InferenceConnector`] |
//!
//! Implementations live in `palaver-foundation`; nothing in this crate
//! performs I/O.

pub mod balancer;
pub mod chat;
pub mod config;
pub mod conversation;
pub mod error;
pub mod inference;
pub mod queue;
pub mod store;

pub use conversation::{Message, Role, Session};
pub use error::{ChatError, ChatResult};
