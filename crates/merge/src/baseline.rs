//! Baseline collaborators.
//!
//! A baseline is a one-shot list of entities in the stream payload shape,
//! current as of fetch time and carrying no per-record freshness.

use crate::error::{MergeError, Result};
use async_trait::async_trait;
use common::stream::{CommandResponse, Position, Status, StreamPayload, Topic};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Default number of items requested per baseline page.
pub const DEFAULT_PAGE_SIZE: usize = 100;

/// Upper bound on pages fetched for one topic.
const MAX_PAGES: u32 = 1000;

/// One entity of a baseline fetch.
#[derive(Debug, Clone, PartialEq)]
pub struct BaselineEntry {
    pub entity_id: String,
    pub payload: StreamPayload,
}

/// `{entityId, ...payload}`; any `timestamp` field is ignored.
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct BaselineItem<P> {
    entity_id: String,
    #[serde(flatten)]
    payload: P,
}

impl BaselineEntry {
    /// Parse one baseline item for `topic`.
    pub fn from_value(topic: Topic, item: &Value) -> Result<Self> {
        match topic {
            Topic::Positions => parse_item::<Position>(item, StreamPayload::Position),
            Topic::Statuses => parse_item::<Status>(item, StreamPayload::Status),
            Topic::CommandResponses => {
                parse_item::<CommandResponse>(item, StreamPayload::CommandResponse)
            }
        }
    }
}

fn parse_item<P: DeserializeOwned>(item: &Value, wrap: fn(P) -> StreamPayload) -> Result<BaselineEntry> {
    let parsed = BaselineItem::<P>::deserialize(item)?;
    Ok(BaselineEntry {
        entity_id: parsed.entity_id,
        payload: wrap(parsed.payload),
    })
}

/// Request/response source of baseline entities.
#[async_trait]
pub trait BaselineSource: Send + Sync {
    async fn fetch(&self, topic: Topic) -> Result<Vec<BaselineEntry>>;
}

/// One page of `GET {base}/{path}?page=N&pageSize=M`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Page {
    #[serde(default)]
    items: Vec<Value>,
    #[serde(default = "first_page")]
    page: u32,
    #[serde(default = "first_page")]
    total_pages: u32,
}

fn first_page() -> u32 {
    1
}

/// Paged HTTP baseline source.
#[derive(Debug, Clone)]
pub struct HttpBaselineSource {
    client: reqwest::Client,
    base_url: String,
    page_size: usize,
}

impl HttpBaselineSource {
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            page_size: DEFAULT_PAGE_SIZE,
        })
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    /// Resource path for `topic` under the base URL.
    pub fn path(topic: Topic) -> &'static str {
        match topic {
            Topic::Positions => "positions",
            Topic::Statuses => "statuses",
            Topic::CommandResponses => "commands",
        }
    }
}

#[async_trait]
impl BaselineSource for HttpBaselineSource {
    async fn fetch(&self, topic: Topic) -> Result<Vec<BaselineEntry>> {
        let url = format!("{}/{}", self.base_url, Self::path(topic));
        let mut entries = Vec::new();
        let mut page: u32 = 1;

        loop {
            debug!("Fetching {} baseline page {} from {}", topic, page, url);
            let response = self
                .client
                .get(&url)
                .query(&[("page", page as usize), ("pageSize", self.page_size)])
                .send()
                .await?;

            if !response.status().is_success() {
                return Err(MergeError::Status {
                    status: response.status().as_u16(),
                    url,
                });
            }

            let body: Page = response.json().await?;
            let received = body.items.len();
            for item in &body.items {
                match BaselineEntry::from_value(topic, item) {
                    Ok(entry) => entries.push(entry),
                    Err(e) => warn!("Skipping malformed {} baseline item: {}", topic, e),
                }
            }

            if received == 0 || body.page >= body.total_pages || page >= MAX_PAGES {
                break;
            }
            page = body.page + 1;
        }

        info!("Fetched {} {} baseline entries", entries.len(), topic);
        Ok(entries)
    }
}
