//! # medsync-sync: Realtime Sync Engine for MedSync
//!
//! Keeps client-held calendars, schedules, medicine boxes, share tokens and
//! notifications consistent with the remote Data Service, which announces
//! row changes over a change feed.
//!
//! ## Architecture Overview
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Sync Engine Architecture                         │
//! │                                                                         │
//! │  ┌──────────────────────────────────────────────────────────────────┐  │
//! │  │                    SyncEngine (Main Orchestrator)                │  │
//! │  │                                                                  │  │
//! │  │  Owns caches + loading flags, follows identity and calendar     │  │
//! │  └────────────────────────────┬─────────────────────────────────────┘  │
//! │                               │ one per category                        │
//! │  ┌────────────────────────────▼─────────────────────────────────────┐  │
//! │  │                      LifecycleManager                            │  │
//! │  │  Idle → Subscribing → Active → TearingDown, stale-result guard  │  │
//! │  └──────────┬───────────────────────────────────┬───────────────────┘  │
//! │             ▼                                   ▼                       │
//! │  ┌────────────────────┐            ┌──────────────────────────┐        │
//! │  │    ChangeFeed      │  notify    │   RefetchCoordinator     │        │
//! │  │                    │───────────►│                          │        │
//! │  │ RealtimeFeed (WS)  │            │ debounce window, one     │        │
//! │  │ LocalFeed (tests)  │            │ fetch in flight          │        │
//! │  └────────────────────┘            └────────────┬─────────────┘        │
//! │                                                 ▼                       │
//! │                                    ┌──────────────────────────┐        │
//! │                                    │  SourceMap / ApiClient   │        │
//! │                                    │  owned, shared, token    │        │
//! │                                    └──────────────────────────┘        │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Organization
//!
//! ### Engine
//! - [`engine`] - `SyncEngine` orchestrator and channel plans
//! - [`lifecycle`] - Per-category subscription lifecycle
//! - [`coordinator`] - Debounced refetch coordinator
//! - [`cache`] - Scope-tagged cache entries
//! - [`loading`] - Aggregate loading state
//!
//! ### Data Service
//! - [`api`] - REST client
//! - [`source_map`] - Capabilities per source kind
//! - [`session`] - Current session and identity changes
//!
//! ### Change Feed
//! - [`change_feed`] - Subscription contract, realtime and local feeds
//! - [`protocol`] - Wire messages
//! - [`transport`] - WebSocket client with reconnection
//!
//! ### Ambient
//! - [`config`] - Engine configuration (TOML + env)
//! - [`error`] - Sync error types
//!
//! ## Usage
//!
//! ```rust,ignore
//! use medsync_core::Scope;
//! use medsync_sync::{EngineConfig, SessionStore, SyncEngineBuilder};
//!
//! let session = SessionStore::new();
//! session.sign_in(&access_token)?;
//!
//! let mut engine = SyncEngineBuilder::new(EngineConfig::load_or_default(None))
//!     .with_session(session)
//!     .build()?;
//! engine.start()?;
//!
//! engine.select_calendar(Some(Scope::owned("cal-1")?));
//! let mut schedule = engine.subscribe_schedule();
//! schedule.changed().await?;
//!
//! engine.shutdown().await;
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

// Engine
pub mod cache;
pub mod coordinator;
pub mod engine;
pub mod lifecycle;
pub mod loading;

// Data Service
pub mod api;
pub mod session;
pub mod source_map;

// Change Feed
pub mod change_feed;
pub mod protocol;
pub mod transport;

// Ambient
pub mod config;
pub mod error;

// =============================================================================
// Re-exports
// =============================================================================

pub use api::ApiClient;
pub use change_feed::{ChangeFeed, ChannelSpec, FeedHandle, LocalFeed, RealtimeFeed};
pub use config::{DebouncePolicy, EngineConfig};
pub use coordinator::{CoordinatorHandle, DebounceConfig, RefetchCoordinator};
pub use engine::{EngineStatus, SyncEngine, SyncEngineBuilder};
pub use error::{ErrorKind, SyncError, SyncResult};
pub use lifecycle::{LifecycleState, ManagerHandle};
pub use loading::{LoadingSnapshot, LoadingState};
pub use session::{Session, SessionStore};
pub use source_map::{AccountActions, DataSource, ScopedSource, SourceMap};
pub use transport::ConnectionState;
