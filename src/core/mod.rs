//! # Core
//!
//! Everything a store is made of. Nothing here knows about any particular
//! target type; features bring that knowledge in.
//!
//! ```text
//!                  ┌──────────────────────────────┐
//!   features ────► │            Store             │ ◄──── attach(target)
//!                  │                              │
//!                  │  StateContainer   TaskQueue  │
//!                  │  (snapshots,      (keys,     │
//!                  │   batching)        aborts)   │
//!                  └───────┬──────────────┬───────┘
//!                          │              │
//!                  subscribe/flush   RequestHandle
//!                          ▼              ▼
//!                      bindings        callers
//! ```
//!
//! ## Modules
//!
//! - [`state`]: copy-on-write snapshots and coalesced notifications
//! - [`queue`]: keyed tasks with exclusive/concurrent modes
//! - [`signal`]: cooperative abort signals
//! - [`feature`]: feature blueprints and request declarations
//! - [`store`]: composition, attach/detach, request dispatch
//! - [`meta`]: request provenance
//! - [`error`]: the store error taxonomy
//! - [`config`]: layered settings

pub mod config;
pub mod error;
pub mod feature;
pub mod meta;
pub mod queue;
pub mod signal;
pub mod state;
pub mod store;

pub use error::{BoxError, ConfigurationError, StoreError};
pub use feature::{Cancels, Feature, RequestConfig, RequestContext, RequestHandler, SubscribeContext};
pub use meta::RequestMeta;
pub use queue::{TaskMode, TaskQueue};
pub use signal::{AbortController, AbortSignal};
pub use state::{Snapshot, StateContainer, StateMap, Subscription, flush_pending};
pub use store::{RequestHandle, Store, StoreBuilder};
