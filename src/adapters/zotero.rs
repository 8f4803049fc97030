//! Zotero web API client.
//!
//! Read-only: items, collections, and attachment files, fetched with
//! key-based pagination. Attachment downloads carry their own retry
//! loop because the file endpoint rate-limits independently of the
//! JSON API.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tokio::fs;
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::domain::{AttachmentRef, CollectionPath, LibraryItem};

use super::{tally_collections, validate_collection_filter, LibrarySource, SYNCED_ITEM_TYPES};

const API_BASE: &str = "https://api.zotero.org";

/// Items per page; the API maximum
const PAGE_SIZE: usize = 100;

const DOWNLOAD_ATTEMPTS: u32 = 3;

/// Zotero web API client for one user library
pub struct ZoteroClient {
    client: reqwest::Client,
    base_url: String,
    user_id: String,
    api_key: String,
}

/// One collection as returned by the API
#[derive(Debug, Deserialize)]
struct CollectionEnvelope {
    key: String,
    data: CollectionData,
}

#[derive(Debug, Deserialize)]
struct CollectionData {
    name: String,
    #[serde(default, rename = "parentCollection")]
    parent: ParentRef,
}

/// `parentCollection` is either a key string or literal `false`
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ParentRef {
    Key(String),
    None(bool),
}

impl Default for ParentRef {
    fn default() -> Self {
        ParentRef::None(false)
    }
}

impl ParentRef {
    fn key(&self) -> Option<&str> {
        match self {
            ParentRef::Key(key) => Some(key),
            ParentRef::None(_) => None,
        }
    }
}

#[derive(Debug, Deserialize)]
struct ItemEnvelope {
    key: String,
    data: ItemData,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ItemData {
    #[serde(default)]
    item_type: String,
    #[serde(default)]
    title: String,
    #[serde(default)]
    abstract_note: String,
    #[serde(default)]
    date: String,
    #[serde(default)]
    publication_title: String,
    /// Venue field used by conferencePaper items
    #[serde(default)]
    proceedings_title: String,
    #[serde(default, rename = "DOI")]
    doi: String,
    #[serde(default)]
    creators: Vec<Creator>,
    #[serde(default)]
    tags: Vec<TagEntry>,
    /// Collection keys, resolved to paths after the collection fetch
    #[serde(default)]
    collections: Vec<String>,
    #[serde(flatten)]
    extra: HashMap<String, serde_json::Value>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Creator {
    #[serde(default)]
    creator_type: String,
    #[serde(default)]
    first_name: String,
    #[serde(default)]
    last_name: String,
    /// Single-field name used by institutional authors
    #[serde(default)]
    name: String,
}

#[derive(Debug, Deserialize)]
struct TagEntry {
    tag: String,
}

#[derive(Debug, Deserialize)]
struct ChildEnvelope {
    key: String,
    data: ChildData,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChildData {
    #[serde(default)]
    item_type: String,
    #[serde(default)]
    content_type: String,
    #[serde(default)]
    filename: String,
    #[serde(default)]
    link_mode: String,
}

/// Failure modes of the attachment file endpoint
enum FetchError {
    NotFound,
    RateLimited,
    Connect(String),
    Other(String),
}

impl ZoteroClient {
    pub fn new(user_id: String, api_key: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: API_BASE.to_string(),
            user_id,
            api_key,
        }
    }

    /// Create from resolved config; errors when credentials are missing
    pub fn from_config() -> Result<Self> {
        let settings = crate::config::config()?.zotero.clone();
        let user_id = settings
            .user_id
            .context("ZOTERO_USER_ID not configured (set it in .zotsync/config.yaml or the environment)")?;
        let api_key = settings
            .api_key
            .context("ZOTERO_API_KEY not configured (set it in .zotsync/config.yaml or the environment)")?;
        Ok(Self::new(user_id, api_key))
    }

    /// Point the client at a different server (tests)
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    async fn get_json<T: DeserializeOwned>(&self, url: &str, query: &[(&str, String)]) -> Result<T> {
        let response = self
            .client
            .get(url)
            .header("Zotero-API-Key", &self.api_key)
            .header("Zotero-API-Version", "3")
            .query(query)
            .send()
            .await
            .with_context(|| format!("Zotero API request failed: {url}"))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("Zotero API error ({status}) on {url}: {body}");
        }

        response
            .json()
            .await
            .with_context(|| format!("Invalid Zotero API response from {url}"))
    }

    async fn fetch_collections(&self) -> Result<Vec<CollectionEnvelope>> {
        let url = format!("{}/users/{}/collections", self.base_url, self.user_id);
        let mut all = Vec::new();
        let mut start = 0usize;
        loop {
            let batch: Vec<CollectionEnvelope> = self
                .get_json(
                    &url,
                    &[("start", start.to_string()), ("limit", PAGE_SIZE.to_string())],
                )
                .await?;
            let count = batch.len();
            all.extend(batch);
            if count < PAGE_SIZE {
                break;
            }
            start += PAGE_SIZE;
        }
        Ok(all)
    }

    async fn fetch_items_of_type(
        &self,
        item_type: &str,
        paths: &HashMap<String, CollectionPath>,
    ) -> Result<Vec<LibraryItem>> {
        let url = format!("{}/users/{}/items", self.base_url, self.user_id);
        let mut items = Vec::new();
        let mut start = 0usize;
        loop {
            let batch: Vec<ItemEnvelope> = self
                .get_json(
                    &url,
                    &[
                        ("itemType", item_type.to_string()),
                        ("start", start.to_string()),
                        ("limit", PAGE_SIZE.to_string()),
                    ],
                )
                .await?;
            let count = batch.len();
            items.extend(batch.into_iter().map(|envelope| into_item(envelope, paths)));
            if count < PAGE_SIZE {
                break;
            }
            start += PAGE_SIZE;
        }
        Ok(items)
    }

    async fn fetch_all_items(
        &self,
        paths: &HashMap<String, CollectionPath>,
    ) -> Result<Vec<LibraryItem>> {
        let mut items = Vec::new();
        for item_type in SYNCED_ITEM_TYPES {
            items.extend(self.fetch_items_of_type(item_type, paths).await?);
        }
        Ok(items)
    }

    async fn attachment_bytes(&self, file_key: &str) -> Result<Vec<u8>, FetchError> {
        let url = format!(
            "{}/users/{}/items/{}/file",
            self.base_url, self.user_id, file_key
        );
        let response = self
            .client
            .get(&url)
            .header("Zotero-API-Key", &self.api_key)
            .header("Zotero-API-Version", "3")
            .send()
            .await
            .map_err(|e| {
                if e.is_connect() || e.is_timeout() {
                    FetchError::Connect(e.to_string())
                } else {
                    FetchError::Other(e.to_string())
                }
            })?;

        match response.status() {
            StatusCode::NOT_FOUND => Err(FetchError::NotFound),
            StatusCode::TOO_MANY_REQUESTS => Err(FetchError::RateLimited),
            status if !status.is_success() => Err(FetchError::Other(format!("status {status}"))),
            _ => response
                .bytes()
                .await
                .map(|b| b.to_vec())
                .map_err(|e| FetchError::Other(e.to_string())),
        }
    }
}

#[async_trait]
impl LibrarySource for ZoteroClient {
    fn name(&self) -> &str {
        "zotero-api"
    }

    async fn list_items(&self, collection_filter: Option<&str>) -> Result<Vec<LibraryItem>> {
        let collections = self.fetch_collections().await?;
        let paths = collection_paths(&collections);
        let items = self.fetch_all_items(&paths).await?;
        if let Some(filter) = collection_filter {
            let joined: Vec<String> = paths.values().map(|p| p.joined()).collect();
            validate_collection_filter(filter, &joined, &items)?;
        }
        Ok(items)
    }

    async fn list_collections(&self) -> Result<Vec<(String, usize)>> {
        let collections = self.fetch_collections().await?;
        let paths = collection_paths(&collections);
        let items = self.fetch_all_items(&paths).await?;
        Ok(tally_collections(paths.values().map(|p| p.joined()), &items))
    }

    async fn attachment(&self, item_key: &str) -> Result<Option<AttachmentRef>> {
        let url = format!(
            "{}/users/{}/items/{}/children",
            self.base_url, self.user_id, item_key
        );
        let children: Vec<ChildEnvelope> = self.get_json(&url, &[]).await?;
        Ok(children.into_iter().find_map(|child| {
            let data = child.data;
            (data.item_type == "attachment" && data.content_type == "application/pdf").then(
                || AttachmentRef {
                    file_key: child.key,
                    filename: data.filename,
                    link_mode: data.link_mode,
                },
            )
        }))
    }
}

/// Resolve every collection key to its full path by walking parent
/// links. A seen-set bounds the walk in case the data contains a
/// parent cycle.
fn collection_paths(collections: &[CollectionEnvelope]) -> HashMap<String, CollectionPath> {
    let by_key: HashMap<&str, (&str, Option<&str>)> = collections
        .iter()
        .map(|c| (c.key.as_str(), (c.data.name.as_str(), c.data.parent.key())))
        .collect();

    let mut paths = HashMap::new();
    for key in by_key.keys() {
        let mut segments = Vec::new();
        let mut seen = HashSet::new();
        let mut current = Some(*key);
        while let Some(k) = current {
            if !seen.insert(k) {
                warn!(collection = k, "Parent cycle in collection data");
                break;
            }
            match by_key.get(k) {
                Some((name, parent)) => {
                    segments.push((*name).to_string());
                    current = *parent;
                }
                None => break,
            }
        }
        segments.reverse();
        paths.insert((*key).to_string(), CollectionPath::from_segments(segments));
    }
    paths
}

fn into_item(envelope: ItemEnvelope, paths: &HashMap<String, CollectionPath>) -> LibraryItem {
    let data = envelope.data;
    let publication = if data.publication_title.is_empty() {
        data.proceedings_title
    } else {
        data.publication_title
    };
    LibraryItem {
        key: envelope.key,
        title: data.title,
        item_type: data.item_type,
        authors: format_authors(&data.creators),
        collections: data
            .collections
            .iter()
            .filter_map(|key| paths.get(key).cloned())
            .collect(),
        abstract_text: data.abstract_note,
        date: data.date,
        publication,
        doi: data.doi,
        tags: data.tags.into_iter().map(|t| t.tag).collect(),
        attachment: None,
        extra: data.extra,
    }
}

/// "Last, First" author names; editors and translators are skipped
fn format_authors(creators: &[Creator]) -> Vec<String> {
    creators
        .iter()
        .filter(|c| c.creator_type.is_empty() || c.creator_type == "author")
        .map(|c| {
            if !c.last_name.is_empty() && !c.first_name.is_empty() {
                format!("{}, {}", c.last_name, c.first_name)
            } else if !c.last_name.is_empty() {
                c.last_name.clone()
            } else {
                c.name.clone()
            }
        })
        .filter(|name| !name.is_empty())
        .collect()
}

/// Find the PDF for an attachment, local Zotero storage first, then the
/// web API with retries. Returns None when no file can be produced; a
/// missing PDF degrades the note, it does not fail the item.
pub async fn ensure_attachment(
    client: Option<&ZoteroClient>,
    data_dir: Option<&Path>,
    download_dir: &Path,
    attachment: &AttachmentRef,
) -> Result<Option<PathBuf>> {
    if let Some(dir) = data_dir {
        let local = dir
            .join("storage")
            .join(&attachment.file_key)
            .join(&attachment.filename);
        if file_nonempty(&local).await {
            return Ok(Some(local));
        }
    }

    let dest = download_dir
        .join(&attachment.file_key)
        .join(&attachment.filename);
    if file_nonempty(&dest).await {
        return Ok(Some(dest));
    }

    let Some(client) = client else {
        return Ok(None);
    };

    for attempt in 1..=DOWNLOAD_ATTEMPTS {
        let wait = match client.attachment_bytes(&attachment.file_key).await {
            Ok(bytes) if bytes.is_empty() => {
                warn!(file_key = %attachment.file_key, "Downloaded attachment was empty");
                Duration::from_secs(2)
            }
            Ok(bytes) => {
                if let Some(parent) = dest.parent() {
                    fs::create_dir_all(parent).await.with_context(|| {
                        format!("Failed to create download directory {}", parent.display())
                    })?;
                }
                fs::write(&dest, &bytes)
                    .await
                    .with_context(|| format!("Failed to write {}", dest.display()))?;
                return Ok(Some(dest));
            }
            Err(FetchError::NotFound) => {
                // Linked-file attachments have no stored copy
                debug!(file_key = %attachment.file_key, "No downloadable file for attachment");
                return Ok(None);
            }
            Err(FetchError::RateLimited) => {
                let secs = (5u64 << (attempt - 1)).min(60);
                warn!(
                    file_key = %attachment.file_key,
                    attempt,
                    wait_secs = secs,
                    "Rate limited while downloading attachment"
                );
                Duration::from_secs(secs)
            }
            Err(FetchError::Connect(reason)) => {
                warn!(file_key = %attachment.file_key, attempt, %reason, "Connection failure");
                Duration::from_secs(5)
            }
            Err(FetchError::Other(reason)) => {
                warn!(file_key = %attachment.file_key, attempt, %reason, "Download failed");
                Duration::from_secs(2)
            }
        };

        if attempt < DOWNLOAD_ATTEMPTS {
            sleep(wait).await;
        }
    }

    warn!(file_key = %attachment.file_key, "Giving up on attachment download");
    Ok(None)
}

async fn file_nonempty(path: &Path) -> bool {
    match fs::metadata(path).await {
        Ok(meta) => meta.is_file() && meta.len() > 0,
        Err(_) => false,
    }
}
