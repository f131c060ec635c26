// src/ingest/types.rs
use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::store::NewSignal;

/// One feed entry after parsing and normalization.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FeedEntry {
    pub source: String, // feed URL the entry came from
    pub url: String,    // entry link
    pub title: String,
    pub summary: String,
    pub published: Option<String>, // RFC 3339 when the feed gave a parsable date
    #[serde(skip_serializing_if = "Option::is_none")]
    pub comments: Option<String>,
}

impl FeedEntry {
    /// Map onto a store row. `fetched_at` stands in for a missing publish time.
    pub fn into_signal(self, fetched_at: &str) -> NewSignal {
        let raw = serde_json::to_string(&self).unwrap_or_default();
        let text = if self.summary.is_empty() {
            self.title.clone()
        } else {
            self.summary.clone()
        };
        NewSignal {
            ts: Some(self.published.unwrap_or_else(|| fetched_at.to_string())),
            source: Some(self.source),
            title: Some(self.title),
            text: Some(text),
            url: Some(self.url),
            summary: Some(self.summary),
            raw: Some(raw),
        }
    }
}

#[async_trait::async_trait]
pub trait SourceProvider: Send + Sync {
    async fn fetch_latest(&self) -> Result<Vec<FeedEntry>>;
    fn name(&self) -> &str;
}
