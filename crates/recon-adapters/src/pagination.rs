//! Lazy page iteration over offset, after-token and cursor APIs.

use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use recon_storage::RateLimiter;
use serde_json::Value as JsonValue;
use tracing::debug;

use crate::{AdapterError, BatchStream};

/// One page of raw items plus the token that addresses the next page, if any.
#[derive(Debug, Clone, Default)]
pub struct Page {
    pub items: Vec<JsonValue>,
    pub next: Option<String>,
}

/// Fetches a single page. `token` is `None` for the first page; afterwards it is
/// whatever the previous page returned in `next` (an offset, an after-token or an opaque cursor).
/// Every request issued for the page must be throttled by `limiter`.
#[async_trait]
pub trait PageFetcher: Send + Sync + 'static {
    async fn fetch_page(&self, token: Option<String>, limiter: &RateLimiter) -> Result<Page, AdapterError>;
}

/// Drive `fetcher` to exhaustion as a stream of batches.
///
/// Stops after a page shorter than `page_size` (when given), when no next token
/// comes back, or when the API echoes the token it was called with. `limiter` is
/// handed to the fetcher so the transport can wait on it before every attempt.
/// A page error is yielded once and ends the stream.
pub fn paginate<F: PageFetcher>(fetcher: F, limiter: Arc<RateLimiter>, page_size: Option<usize>) -> BatchStream {
    let fetcher = Arc::new(fetcher);
    stream::try_unfold(Some(None::<String>), move |cursor| {
        let fetcher = Arc::clone(&fetcher);
        let limiter = Arc::clone(&limiter);
        async move {
            let Some(mut token) = cursor else {
                return Ok(None);
            };
            loop {
                let page = fetcher.fetch_page(token.clone(), &limiter).await?;
                let short = page_size.is_some_and(|size| page.items.len() < size);
                let next = match page.next {
                    Some(next) if !short && Some(&next) != token.as_ref() => Some(next),
                    _ => None,
                };
                debug!(items = page.items.len(), has_next = next.is_some(), "page fetched");
                if page.items.is_empty() {
                    match next {
                        Some(next) => {
                            token = Some(next);
                            continue;
                        }
                        None => return Ok(None),
                    }
                }
                return Ok(Some((page.items, next.map(Some))));
            }
        }
    })
    .boxed()
}

/// Stream with no batches, for adapters with nothing configured to read.
pub fn empty() -> BatchStream {
    stream::empty().boxed()
}
