use crate::config::FeedLocation;
use crate::errors::{Error, Result};
use chrono::Utc;
use std::path::PathBuf;
use std::time::Duration;
use tracing::debug;

/// Source of raw newline-delimited telemetry.
#[derive(Debug, Clone)]
pub enum Feed {
    Http(HttpFeed),
    File(FileFeed),
}

impl Feed {
    pub fn from_location(location: &FeedLocation, timeout: Duration) -> Result<Self> {
        match location {
            FeedLocation::Url(url) => Ok(Feed::Http(HttpFeed::new(url.clone(), timeout)?)),
            FeedLocation::Path(path) => Ok(Feed::File(FileFeed::new(path.clone()))),
        }
    }

    pub async fn fetch(&self) -> Result<String> {
        match self {
            Feed::Http(feed) => feed.fetch().await,
            Feed::File(feed) => feed.fetch().await,
        }
    }

    pub fn describe(&self) -> String {
        match self {
            Feed::Http(feed) => feed.url.clone(),
            Feed::File(feed) => feed.path.display().to_string(),
        }
    }
}

/// Feed served over HTTP, e.g. by the base station's access point.
#[derive(Debug, Clone)]
pub struct HttpFeed {
    url: String,
    client: reqwest::Client,
}

impl HttpFeed {
    pub fn new(url: String, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { url, client })
    }

    /// Fetches the feed with a cache-busting `_` query parameter.
    pub async fn fetch(&self) -> Result<String> {
        let stamp = Utc::now().timestamp_millis().to_string();
        debug!("Fetching feed {}", self.url);

        let response = self
            .client
            .get(&self.url)
            .query(&[("_", stamp.as_str())])
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(Error::FeedStatus(status.as_u16()));
        }

        Ok(response.text().await?)
    }
}

#[derive(Debug, Clone)]
pub struct FileFeed {
    path: PathBuf,
}

impl FileFeed {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub async fn fetch(&self) -> Result<String> {
        Ok(tokio::fs::read_to_string(&self.path).await?)
    }
}
