//! Read-only access to a local Zotero installation.
//!
//! Reads zotero.sqlite directly, so sync works offline and without
//! burning API quota. Zotero holds a write lock while running; every
//! read opens a fresh read-only connection with a short busy timeout
//! instead of keeping one open.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use rusqlite::{params_from_iter, Connection, OpenFlags, OptionalExtension};
use tokio::task::spawn_blocking;

use crate::domain::{AttachmentRef, CollectionPath, LibraryItem};

use super::{tally_collections, validate_collection_filter, LibrarySource, SYNCED_ITEM_TYPES};

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Local Zotero data directory with its sqlite database
pub struct LocalLibrary {
    db_path: PathBuf,
    data_dir: PathBuf,
}

/// Everything one connection pass reads
struct LibrarySnapshot {
    items: Vec<LibraryItem>,
    collection_paths: Vec<String>,
}

impl LocalLibrary {
    /// Open a Zotero data directory; errors when zotero.sqlite is absent
    pub fn open(data_dir: impl Into<PathBuf>) -> Result<Self> {
        let data_dir = data_dir.into();
        let db_path = data_dir.join("zotero.sqlite");
        if !db_path.is_file() {
            anyhow::bail!("No Zotero database at {}", db_path.display());
        }
        Ok(Self { db_path, data_dir })
    }

    /// Open the configured data directory, falling back to autodetection
    pub fn from_config() -> Result<Self> {
        let settings = &crate::config::config()?.zotero;
        let data_dir = settings
            .data_dir
            .clone()
            .or_else(crate::config::detect_zotero_data_dir)
            .context(
                "No Zotero data directory found; set zotero.data_dir in .zotsync/config.yaml",
            )?;
        Self::open(data_dir)
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    /// Run a read against a fresh connection on the blocking pool.
    /// Connection is not Sync, so it never crosses await points.
    async fn with_connection<T, F>(&self, op: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let db_path = self.db_path.clone();
        spawn_blocking(move || {
            let conn = Connection::open_with_flags(
                &db_path,
                OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
            )
            .with_context(|| format!("Failed to open {}", db_path.display()))?;
            conn.busy_timeout(BUSY_TIMEOUT)?;
            op(&conn)
        })
        .await
        .context("Database read task panicked")?
    }

    async fn snapshot(&self) -> Result<LibrarySnapshot> {
        self.with_connection(read_snapshot).await
    }
}

#[async_trait]
impl LibrarySource for LocalLibrary {
    fn name(&self) -> &str {
        "zotero-local"
    }

    async fn list_items(&self, collection_filter: Option<&str>) -> Result<Vec<LibraryItem>> {
        let LibrarySnapshot {
            items,
            collection_paths,
        } = self.snapshot().await?;
        if let Some(filter) = collection_filter {
            validate_collection_filter(filter, &collection_paths, &items)?;
        }
        Ok(items)
    }

    async fn list_collections(&self) -> Result<Vec<(String, usize)>> {
        let snapshot = self.snapshot().await?;
        Ok(tally_collections(snapshot.collection_paths, &snapshot.items))
    }

    async fn attachment(&self, item_key: &str) -> Result<Option<AttachmentRef>> {
        let key = item_key.to_string();
        self.with_connection(move |conn| lookup_attachment(conn, &key))
            .await
    }
}

fn read_snapshot(conn: &Connection) -> Result<LibrarySnapshot> {
    let paths_by_id = read_collection_paths(conn)?;

    // Base rows: one per synced, non-trashed item
    let sql = format!(
        "SELECT i.itemID, i.key, it.typeName \
         FROM items i \
         JOIN itemTypes it ON it.itemTypeID = i.itemTypeID \
         WHERE it.typeName IN ({}) \
           AND i.itemID NOT IN (SELECT itemID FROM deletedItems)",
        SYNCED_ITEM_TYPES.map(|_| "?").join(", ")
    );
    let mut items: HashMap<i64, LibraryItem> = HashMap::new();
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params_from_iter(SYNCED_ITEM_TYPES), |row| {
        Ok((
            row.get::<_, i64>(0)?,
            row.get::<_, String>(1)?,
            row.get::<_, String>(2)?,
        ))
    })?;
    for row in rows {
        let (id, key, type_name) = row?;
        let mut item = LibraryItem::new(key, "");
        item.item_type = type_name;
        items.insert(id, item);
    }

    // Field values
    let mut stmt = conn.prepare(
        "SELECT d.itemID, f.fieldName, v.value \
         FROM itemData d \
         JOIN fields f ON f.fieldID = d.fieldID \
         JOIN itemDataValues v ON v.valueID = d.valueID",
    )?;
    let rows = stmt.query_map([], |row| {
        Ok((
            row.get::<_, i64>(0)?,
            row.get::<_, String>(1)?,
            row.get::<_, String>(2)?,
        ))
    })?;
    for row in rows {
        let (id, field, value) = row?;
        let Some(item) = items.get_mut(&id) else {
            continue;
        };
        match field.as_str() {
            "title" => item.title = value,
            "abstractNote" => item.abstract_text = value,
            "date" => item.date = value,
            "publicationTitle" | "proceedingsTitle" => item.publication = value,
            "DOI" => item.doi = value,
            _ => {
                item.extra.insert(field, serde_json::Value::String(value));
            }
        }
    }

    // Authors in creator order; single-field names sit in lastName
    let mut stmt = conn.prepare(
        "SELECT ic.itemID, c.firstName, c.lastName \
         FROM itemCreators ic \
         JOIN creators c ON c.creatorID = ic.creatorID \
         JOIN creatorTypes ct ON ct.creatorTypeID = ic.creatorTypeID \
         WHERE ct.creatorType = 'author' \
         ORDER BY ic.itemID, ic.orderIndex",
    )?;
    let rows = stmt.query_map([], |row| {
        Ok((
            row.get::<_, i64>(0)?,
            row.get::<_, Option<String>>(1)?.unwrap_or_default(),
            row.get::<_, Option<String>>(2)?.unwrap_or_default(),
        ))
    })?;
    for row in rows {
        let (id, first, last) = row?;
        let Some(item) = items.get_mut(&id) else {
            continue;
        };
        let name = if !last.is_empty() && !first.is_empty() {
            format!("{last}, {first}")
        } else if !last.is_empty() {
            last
        } else {
            first
        };
        if !name.is_empty() {
            item.authors.push(name);
        }
    }

    // Tags
    let mut stmt = conn.prepare(
        "SELECT it.itemID, t.name FROM itemTags it JOIN tags t ON t.tagID = it.tagID",
    )?;
    let rows = stmt.query_map([], |row| {
        Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?))
    })?;
    for row in rows {
        let (id, tag) = row?;
        if let Some(item) = items.get_mut(&id) {
            item.tags.push(tag);
        }
    }

    // Collection membership
    let mut stmt = conn.prepare("SELECT ci.itemID, ci.collectionID FROM collectionItems ci")?;
    let rows = stmt.query_map([], |row| {
        Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?))
    })?;
    for row in rows {
        let (item_id, collection_id) = row?;
        let (Some(item), Some(path)) = (items.get_mut(&item_id), paths_by_id.get(&collection_id))
        else {
            continue;
        };
        item.collections.push(path.clone());
    }

    // First stored PDF per item; linked files have no storage copy
    let mut stmt = conn.prepare(
        "SELECT a.parentItemID, ai.key, a.linkMode, a.path \
         FROM itemAttachments a \
         JOIN items ai ON ai.itemID = a.itemID \
         WHERE a.contentType = 'application/pdf' \
           AND a.linkMode IN (0, 1) \
           AND a.path IS NOT NULL \
           AND a.parentItemID IS NOT NULL \
           AND a.itemID NOT IN (SELECT itemID FROM deletedItems) \
         ORDER BY a.parentItemID, a.itemID",
    )?;
    let rows = stmt.query_map([], |row| {
        Ok((
            row.get::<_, i64>(0)?,
            row.get::<_, String>(1)?,
            row.get::<_, i64>(2)?,
            row.get::<_, String>(3)?,
        ))
    })?;
    for row in rows {
        let (parent_id, file_key, link_mode, path) = row?;
        let Some(item) = items.get_mut(&parent_id) else {
            continue;
        };
        if item.attachment.is_none() {
            item.attachment = Some(AttachmentRef {
                file_key,
                filename: attachment_filename(&path),
                link_mode: link_mode_name(link_mode).to_string(),
            });
        }
    }

    let mut list: Vec<LibraryItem> = items.into_values().collect();
    list.sort_by(|a, b| a.key.cmp(&b.key));

    Ok(LibrarySnapshot {
        items: list,
        collection_paths: paths_by_id.values().map(|p| p.joined()).collect(),
    })
}

/// Collection paths keyed by collectionID, parents resolved with a
/// cycle guard
fn read_collection_paths(conn: &Connection) -> Result<HashMap<i64, CollectionPath>> {
    let mut stmt =
        conn.prepare("SELECT collectionID, collectionName, parentCollectionID FROM collections")?;
    let rows = stmt.query_map([], |row| {
        Ok((
            row.get::<_, i64>(0)?,
            row.get::<_, String>(1)?,
            row.get::<_, Option<i64>>(2)?,
        ))
    })?;
    let mut by_id: HashMap<i64, (String, Option<i64>)> = HashMap::new();
    for row in rows {
        let (id, name, parent) = row?;
        by_id.insert(id, (name, parent));
    }

    let mut paths = HashMap::new();
    for id in by_id.keys() {
        let mut segments = Vec::new();
        let mut seen = std::collections::HashSet::new();
        let mut current = Some(*id);
        while let Some(current_id) = current {
            if !seen.insert(current_id) {
                break;
            }
            match by_id.get(&current_id) {
                Some((name, parent)) => {
                    segments.push(name.clone());
                    current = *parent;
                }
                None => break,
            }
        }
        segments.reverse();
        paths.insert(*id, CollectionPath::from_segments(segments));
    }
    Ok(paths)
}

fn lookup_attachment(conn: &Connection, item_key: &str) -> Result<Option<AttachmentRef>> {
    let row = conn
        .query_row(
            "SELECT ai.key, a.linkMode, a.path \
             FROM itemAttachments a \
             JOIN items ai ON ai.itemID = a.itemID \
             JOIN items parent ON parent.itemID = a.parentItemID \
             WHERE parent.key = ?1 \
               AND a.contentType = 'application/pdf' \
               AND a.linkMode IN (0, 1) \
               AND a.path IS NOT NULL \
               AND a.itemID NOT IN (SELECT itemID FROM deletedItems) \
             ORDER BY a.itemID \
             LIMIT 1",
            [item_key],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, String>(2)?,
                ))
            },
        )
        .optional()?;

    Ok(row.map(|(file_key, link_mode, path)| AttachmentRef {
        file_key,
        filename: attachment_filename(&path),
        link_mode: link_mode_name(link_mode).to_string(),
    }))
}

/// Stored paths look like "storage:paper.pdf"
fn attachment_filename(path: &str) -> String {
    let name = path.split_once(':').map_or(path, |(_, rest)| rest);
    Path::new(name)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| name.to_string())
}

fn link_mode_name(mode: i64) -> &'static str {
    match mode {
        0 => "imported_file",
        1 => "imported_url",
        2 => "linked_file",
        3 => "linked_url",
        _ => "unknown",
    }
}
