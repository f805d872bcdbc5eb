//! Reactive state store bound to a swappable target.

pub mod core;
pub mod logging;

#[cfg(test)]
pub mod test_support;

pub use crate::core::config::{ResolvedConfig, StoreFileConfig};
pub use crate::core::error::{BoxError, ConfigurationError, StoreError};
pub use crate::core::feature::{
    Cancels, Feature, FeatureBuilder, GuardContext, RequestConfig, RequestContext, RequestHandler,
    SubscribeContext, Updater, state_map,
};
pub use crate::core::meta::RequestMeta;
pub use crate::core::queue::{TaskInfo, TaskMode};
pub use crate::core::signal::{AbortController, AbortSignal};
pub use crate::core::state::{ChangeSet, Snapshot, StateContainer, StateMap, Subscription, flush_pending};
pub use crate::core::store::{
    DetachHandle, ErrorContext, MetaRequest, RequestHandle, Store, StoreBuilder, TaskEvent, TaskStatus,
};
