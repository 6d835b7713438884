//! Upstream page source.

use async_trait::async_trait;

use crate::error::FetchResult;
use crate::types::page::{PageRequest, RawResponse};

/// Performs one HTTP exchange against the upstream API.
///
/// Implementations return the raw status and body for any response the server
/// produced. Only failures below HTTP (timeouts, resets, DNS) become errors,
/// as [`FetchError::Transport`](crate::error::FetchError::Transport).
#[async_trait]
pub trait PageSource: Send + Sync {
    async fn fetch(&self, request: &PageRequest) -> FetchResult<RawResponse>;
}

#[async_trait]
impl<T: PageSource + ?Sized> PageSource for std::sync::Arc<T> {
    async fn fetch(&self, request: &PageRequest) -> FetchResult<RawResponse> {
        (**self).fetch(request).await
    }
}
