use async_trait::async_trait;
use reqwest::header::{CACHE_CONTROL, PRAGMA};
use std::time::Duration;
use tracing::debug;

/// A cheap check that the remote side is reachable.
#[async_trait]
pub trait Reachability: Send + Sync {
    async fn probe(&self) -> bool;
}

/// Issues an uncached `HEAD` request and treats any 2xx as reachable.
pub struct HttpProbe {
    url: String,
    client: reqwest::Client,
}

impl HttpProbe {
    pub fn new(url: &str, timeout: Duration) -> reqwest::Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            url: url.to_string(),
            client,
        })
    }
}

#[async_trait]
impl Reachability for HttpProbe {
    async fn probe(&self) -> bool {
        let result = self
            .client
            .head(&self.url)
            .header(CACHE_CONTROL, "no-cache")
            .header(PRAGMA, "no-cache")
            .send()
            .await;

        match result {
            Ok(response) => response.status().is_success(),
            Err(e) => {
                debug!("Reachability probe to {} failed: {}", self.url, e);
                false
            }
        }
    }
}
