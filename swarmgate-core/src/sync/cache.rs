//! The contract the sync loop expects from the coordination store.

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;

use crate::error::CacheError;

/// Notifications delivered while a subscription is healthy.
///
/// Each `Ok(())` is one published message. The stream ends, usually after
/// yielding an `Err`, once the underlying connection is lost.
pub type Notifications = BoxStream<'static, Result<(), CacheError>>;

/// A key/value store with publish/subscribe notifications.
#[async_trait]
pub trait Cache: Send + Sync {
    /// Fetch the value stored at `key`.
    async fn get(&self, key: &str) -> Result<Bytes, CacheError>;

    /// Start listening on `channel`.
    async fn subscribe(&self, channel: &str) -> Result<Notifications, CacheError>;
}
