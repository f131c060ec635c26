// src/ingest/providers/rss.rs
//! RSS 2.0 / Atom provider. One instance per feed URL.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use metrics::{counter, histogram};
use quick_xml::de::from_str;
use serde::Deserialize;
use std::time::Duration;
use time::format_description::well_known::{Rfc2822, Rfc3339};
use time::{OffsetDateTime, UtcOffset};

use crate::config::IngestConfig;
use crate::ingest::normalize_text;
use crate::ingest::types::{FeedEntry, SourceProvider};

#[derive(Debug, Deserialize)]
struct Rss {
    channel: Channel,
}

#[derive(Debug, Deserialize)]
struct Channel {
    #[serde(rename = "item", default)]
    item: Vec<Item>,
}

#[derive(Debug, Deserialize)]
struct Item {
    title: Option<String>,
    link: Option<String>,
    #[serde(rename = "pubDate")]
    pub_date: Option<String>,
    description: Option<String>,
    comments: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AtomFeed {
    #[serde(rename = "entry", default)]
    entry: Vec<AtomEntry>,
}

#[derive(Debug, Deserialize)]
struct AtomEntry {
    title: Option<String>,
    #[serde(default)]
    link: Vec<AtomLink>,
    published: Option<String>,
    updated: Option<String>,
    summary: Option<String>,
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AtomLink {
    #[serde(rename = "@href")]
    href: Option<String>,
    #[serde(rename = "@rel")]
    rel: Option<String>,
}

/// RFC 2822 or RFC 3339 → RFC 3339 in UTC. Anything else → None.
fn normalize_date(ts: &str) -> Option<String> {
    let ts = ts.trim();
    OffsetDateTime::parse(ts, &Rfc2822)
        .or_else(|_| OffsetDateTime::parse(ts, &Rfc3339))
        .ok()
        .and_then(|dt| dt.to_offset(UtcOffset::UTC).format(&Rfc3339).ok())
}

pub struct RssProvider {
    feed_url: String,
    limit: usize,
    mode: Mode,
}

enum Mode {
    Fixture(String),
    Http {
        client: reqwest::Client,
        attempts: u32,
    },
}

impl RssProvider {
    pub fn from_fixture_str(feed_url: impl Into<String>, xml: &str) -> Self {
        Self {
            feed_url: feed_url.into(),
            limit: 50,
            mode: Mode::Fixture(xml.to_string()),
        }
    }

    pub fn from_url(feed_url: impl Into<String>, cfg: &IngestConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(cfg.timeout_secs))
            .user_agent(cfg.user_agent.clone())
            .build()
            .context("building http client")?;
        Ok(Self {
            feed_url: feed_url.into(),
            limit: cfg.per_feed_limit,
            mode: Mode::Http {
                client,
                attempts: cfg.attempts.max(1),
            },
        })
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    pub fn parse_entries(&self, s: &str) -> Result<Vec<FeedEntry>> {
        let t0 = std::time::Instant::now();
        let xml_clean = scrub_html_entities_for_xml(s);

        let mut out = match from_str::<Rss>(&xml_clean) {
            Ok(rss) => rss
                .channel
                .item
                .into_iter()
                .filter_map(|it| {
                    let url = it.link.map(|l| l.trim().to_string()).filter(|l| !l.is_empty())?;
                    Some(FeedEntry {
                        source: self.feed_url.clone(),
                        url,
                        title: normalize_text(it.title.as_deref().unwrap_or_default()),
                        summary: normalize_text(it.description.as_deref().unwrap_or_default()),
                        published: it.pub_date.as_deref().and_then(normalize_date),
                        comments: it.comments.map(|c| c.trim().to_string()).filter(|c| !c.is_empty()),
                    })
                })
                .collect::<Vec<_>>(),
            Err(rss_err) => {
                let atom: AtomFeed = from_str(&xml_clean).map_err(|atom_err| {
                    anyhow!("neither rss ({rss_err}) nor atom ({atom_err})")
                })?;
                atom.entry
                    .into_iter()
                    .filter_map(|e| {
                        let url = e
                            .link
                            .iter()
                            .find(|l| l.rel.as_deref().map_or(true, |r| r == "alternate"))
                            .or_else(|| e.link.first())
                            .and_then(|l| l.href.clone())
                            .map(|h| h.trim().to_string())
                            .filter(|h| !h.is_empty())?;
                        let summary = e.summary.or(e.content).unwrap_or_default();
                        Some(FeedEntry {
                            source: self.feed_url.clone(),
                            url,
                            title: normalize_text(e.title.as_deref().unwrap_or_default()),
                            summary: normalize_text(&summary),
                            published: e
                                .published
                                .or(e.updated)
                                .as_deref()
                                .and_then(normalize_date),
                            comments: None,
                        })
                    })
                    .collect()
            }
        };
        out.truncate(self.limit);

        let ms = t0.elapsed().as_secs_f64() * 1_000.0;
        histogram!("atlas_ingest_parse_ms").record(ms);
        counter!("atlas_ingest_entries_total").increment(out.len() as u64);
        Ok(out)
    }

    async fn fetch_body(&self, client: &reqwest::Client, attempts: u32) -> Result<String> {
        let mut last = None;
        for attempt in 0..attempts {
            let res = async {
                client
                    .get(&self.feed_url)
                    .send()
                    .await?
                    .error_for_status()?
                    .text()
                    .await
            }
            .await;
            match res {
                Ok(body) => return Ok(body),
                Err(e) => {
                    tracing::debug!(target: "ingest", feed = %self.feed_url, attempt, error = %e, "fetch attempt failed");
                    last = Some(e);
                    if attempt + 1 < attempts {
                        tokio::time::sleep(Duration::from_millis(1_500 * u64::from(attempt + 1))).await;
                    }
                }
            }
        }
        let err = match last {
            Some(e) => anyhow!(e),
            None => anyhow!("no fetch attempts made"),
        };
        Err(err.context(format!("GET {}", self.feed_url)))
    }
}

#[async_trait]
impl SourceProvider for RssProvider {
    async fn fetch_latest(&self) -> Result<Vec<FeedEntry>> {
        match &self.mode {
            Mode::Fixture(s) => self.parse_entries(s),
            Mode::Http { client, attempts } => {
                let body = self.fetch_body(client, *attempts).await?;
                self.parse_entries(&body)
                    .with_context(|| format!("parsing feed {}", self.feed_url))
            }
        }
    }

    fn name(&self) -> &str {
        &self.feed_url
    }
}

fn scrub_html_entities_for_xml(s: &str) -> String {
    s.replace("&nbsp;", " ")
        .replace("&ndash;", "-")
        .replace("&mdash;", "-")
        .replace("&ldquo;", "\"")
        .replace("&rdquo;", "\"")
        .replace("&lsquo;", "'")
        .replace("&rsquo;", "'")
        .replace("&hellip;", "...")
}
