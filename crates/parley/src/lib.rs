//! # Parley
//!
//! Agent coordination SDK: independent agent processes exchange messages
//! through four patterns — fire-and-forget, blocking request/response,
//! non-blocking queued conversation, and multi-party turn-based meetings —
//! using a shared relational store as the only coordination medium.
//!
//! The core of the crate is the synchronization and state-machine layer:
//!
//! - A distributed lock ([`lock`]) whose guard owns the connection it was
//!   acquired on, so acquire and release can never straddle two connections.
//! - The conversation state machine ([`conversation`]): session lifecycle,
//!   the blocking send-and-wait protocol, non-blocking send, reply delivery.
//! - The meeting turn coordinator ([`meeting`]): meeting and participant
//!   lifecycle, round-robin and explicit turn assignment, turn-timeout
//!   auto-advance — every transition locked and re-validated.
//! - Handler invocation ([`handlers`]) and lifecycle event emission
//!   ([`events`]), kept deliberately separate: handlers carry business logic
//!   tied to payload content, event subscribers carry integration logic tied
//!   to lifecycle.
//!
//! Persistence sits behind the narrow [`store::Storage`] contract, with a
//! Postgres implementation shipped and an in-memory one behind the
//! `test-utils` feature.
//!
//! # Example
//!
//! ```rust,ignore
//! use parley::{Config, ContextKind, Parley, handler_fn};
//!
//! let sdk = Parley::connect(Config::from_env()?).await?;
//! sdk.register_organization("acme", "Acme").await?;
//! sdk.register_agent("acme", "alice", "Alice").await?;
//! sdk.register_agent("acme", "bob", "Bob").await?;
//!
//! sdk.register_handler("bob", ContextKind::Conversation, handler_fn(|payload, _ctx| async move {
//!     Ok(Some(serde_json::json!({ "a": "ok" })))
//! }));
//!
//! let outcome = sdk
//!     .send_and_wait("alice", "bob", &serde_json::json!({ "q": "status?" }),
//!                    std::time::Duration::from_secs(5))
//!     .await?;
//! ```

pub mod config;
pub mod conversation;
pub mod errors;
pub mod events;
pub mod handlers;
pub mod lock;
pub mod meeting;
pub mod models;
pub mod observability;
pub mod sdk;
pub mod store;
pub mod types;

pub use config::Config;
pub use conversation::SendOutcome;
pub use errors::{ParleyError, Result};
pub use events::{subscriber_fn, Event, EventData, EventKind, Subscriber};
pub use handlers::{handler_fn, Handler, MessageContext};
pub use meeting::TurnOutcome;
pub use models::ContextKind;
pub use sdk::Parley;
pub use store::{MessageQuery, Storage};
pub use types::{AgentId, MeetingId, MessageId, OrgId, ParticipantId, SessionId};
