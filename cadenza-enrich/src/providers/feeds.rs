//! Feed subscription refresher
//!
//! Conditional GET with the stored ETag. An unchanged feed (304) reports no
//! item count so the stored count is kept.

use async_trait::async_trait;
use reqwest::header::{ETAG, IF_NONE_MATCH};
use reqwest::StatusCode;
use std::time::Duration;
use tracing::debug;

use super::{FeedRefresh, ProviderError, SubscriptionRefresher};
use crate::models::Subject;

pub struct HttpFeedRefresher {
    http_client: reqwest::Client,
}

impl HttpFeedRefresher {
    pub fn new(user_agent: &str) -> Result<Self, ProviderError> {
        let http_client = reqwest::Client::builder()
            .user_agent(user_agent)
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| ProviderError::Network(e.to_string()))?;

        Ok(Self { http_client })
    }
}

/// Count entries in an RSS (`<item>`) or Atom (`<entry>`) document
fn count_feed_items(body: &str) -> u64 {
    let rss = body.matches("<item>").count() + body.matches("<item ").count();
    let atom = body.matches("<entry>").count() + body.matches("<entry ").count();
    rss.max(atom) as u64
}

#[async_trait]
impl SubscriptionRefresher for HttpFeedRefresher {
    async fn refresh(&self, subscription: &Subject) -> Result<FeedRefresh, ProviderError> {
        let url = subscription
            .external_id
            .as_deref()
            .filter(|u| !u.is_empty())
            .ok_or_else(|| ProviderError::NotFound(format!("feed URL for '{}'", subscription.name)))?;

        let mut request = self.http_client.get(url);
        if let Some(etag) = subscription.aux.as_deref() {
            request = request.header(IF_NONE_MATCH, etag);
        }

        let response = request
            .send()
            .await
            .map_err(|e| ProviderError::Network(e.to_string()))?;

        let status = response.status();
        if status == StatusCode::NOT_MODIFIED {
            debug!(url = %url, "Feed unchanged");
            return Ok(FeedRefresh {
                etag: subscription.aux.clone(),
                item_count: None,
            });
        }
        if status == StatusCode::NOT_FOUND || status == StatusCode::GONE {
            return Err(ProviderError::NotFound(url.to_string()));
        }
        if status == StatusCode::TOO_MANY_REQUESTS {
            return Err(ProviderError::RateLimited);
        }
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            return Err(ProviderError::Api(status.as_u16(), error_text));
        }

        let etag = response
            .headers()
            .get(ETAG)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let body = response
            .text()
            .await
            .map_err(|e| ProviderError::Parse(e.to_string()))?;

        Ok(FeedRefresh {
            etag,
            item_count: Some(count_feed_items(&body)),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_count_feed_items() {
        let rss = "<rss><channel><item>a</item><item id=\"2\">b</item></channel></rss>";
        assert_eq!(count_feed_items(rss), 2);

        let atom = "<feed><entry>a</entry><entry>b</entry><entry>c</entry></feed>";
        assert_eq!(count_feed_items(atom), 3);

        assert_eq!(count_feed_items("<rss/>"), 0);
    }
}
