//! Plan computation: library state vs vault state.
//!
//! Pure comparison, no filesystem access. The caller supplies both
//! sides; the result says what the executor and pipeline should do.

use std::collections::{HashMap, HashSet};

use crate::domain::{CollectionPath, LibraryItem, LocalDocument, PlannedMove, ReconciliationPlan};

/// Compare library items against local documents and produce a plan.
///
/// Each document resolves to exactly one of: in sync (folder matches a
/// current collection), moved (item exists elsewhere), or deleted (key
/// gone from the library). Items with no document become `added`.
///
/// With a collection filter, only documents under a matching folder and
/// items with a matching collection participate; an item categorized
/// entirely outside the filter excludes its documents from the plan
/// rather than reporting them deleted. Destination choice is the
/// lexicographically first matching collection path, compared in
/// sanitized form, so plans are deterministic for items in several
/// collections.
pub fn compute_plan(
    items: &[LibraryItem],
    documents: &[LocalDocument],
    collection_filter: Option<&str>,
) -> ReconciliationPlan {
    let by_key: HashMap<&str, &LibraryItem> =
        items.iter().map(|item| (item.key.as_str(), item)).collect();
    let document_keys: HashSet<&str> = documents.iter().map(|doc| doc.key.as_str()).collect();

    let mut plan = ReconciliationPlan::default();

    for document in documents {
        if let Some(filter) = collection_filter {
            if !document.matches_filter(filter) {
                continue;
            }
        }

        let Some(item) = by_key.get(document.key.as_str()) else {
            plan.deleted.push(document.clone());
            continue;
        };

        let collections = item.effective_collections();
        let candidates: Vec<&CollectionPath> = match collection_filter {
            Some(filter) => collections
                .iter()
                .filter(|path| path.matches_filter(filter))
                .collect(),
            None => collections.iter().collect(),
        };
        if candidates.is_empty() {
            // Item lives entirely outside the filter
            continue;
        }

        let in_sync = candidates
            .iter()
            .any(|path| path.sanitized() == document.folder);
        if !in_sync {
            // candidates preserve the sorted collection order, so the
            // first one is the deterministic destination
            plan.moved.push(PlannedMove {
                document: document.clone(),
                to: candidates[0].sanitized(),
            });
        }
    }

    for item in items {
        if document_keys.contains(item.key.as_str()) {
            continue;
        }
        if let Some(filter) = collection_filter {
            if !item.matches_filter(filter) {
                continue;
            }
        }
        plan.added.push(item.key.clone());
    }
    plan.added.sort();

    plan
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::path::PathBuf;

    fn item(key: &str, paths: &[&str]) -> LibraryItem {
        let mut item = LibraryItem::new(key, format!("Title {}", key));
        item.collections = paths.iter().map(|p| CollectionPath::parse(p)).collect();
        item
    }

    fn doc(key: &str, folder: &str) -> LocalDocument {
        LocalDocument::new(key, format!("Title {}_{}.md", key, key), folder)
    }

    #[test]
    fn test_added_and_deleted() {
        // Library: A and B under AI/ML. Vault: A in place, C unknown.
        let items = vec![item("AAAA1111", &["AI/ML"]), item("BBBB2222", &["AI/ML"])];
        let documents = vec![doc("AAAA1111", "AI/ML"), doc("CCCC3333", "Old/Path")];

        let plan = compute_plan(&items, &documents, None);

        assert_eq!(plan.added, vec!["BBBB2222".to_string()]);
        assert_eq!(plan.deleted.len(), 1);
        assert_eq!(plan.deleted[0].key, "CCCC3333");
        assert!(plan.moved.is_empty());
    }

    #[test]
    fn test_move_to_new_collection() {
        // D moved from X/Y to X/Z in the library
        let items = vec![item("DDDD4444", &["X/Z"])];
        let documents = vec![doc("DDDD4444", "X/Y")];

        let plan = compute_plan(&items, &documents, None);

        assert!(plan.added.is_empty());
        assert!(plan.deleted.is_empty());
        assert_eq!(plan.moved.len(), 1);
        assert_eq!(plan.moved[0].key(), "DDDD4444");
        assert_eq!(plan.moved[0].document.folder, PathBuf::from("X/Y"));
        assert_eq!(plan.moved[0].to, PathBuf::from("X/Z"));
    }

    #[test]
    fn test_multi_collection_document_in_sync() {
        let items = vec![item("AAAA1111", &["B/Second", "A/First"])];
        let documents = vec![doc("AAAA1111", "B/Second")];

        let plan = compute_plan(&items, &documents, None);
        assert!(plan.is_empty());
    }

    #[test]
    fn test_move_destination_is_lexicographically_first() {
        let items = vec![item("AAAA1111", &["Z/Later", "A/First", "M/Middle"])];
        let documents = vec![doc("AAAA1111", "Old/Home")];

        let plan = compute_plan(&items, &documents, None);
        assert_eq!(plan.moved[0].to, PathBuf::from("A/First"));
    }

    #[test]
    fn test_move_destination_compares_sanitized_segments() {
        // "AI:Agents" lands on disk as "AI-Agents", ahead of "AI-ML"
        let items = vec![item("AAAA1111", &["AI-ML", "AI:Agents"])];
        let documents = vec![doc("AAAA1111", "Old/Home")];

        let plan = compute_plan(&items, &documents, None);
        assert_eq!(plan.moved[0].to, PathBuf::from("AI-Agents"));
    }

    #[test]
    fn test_uncategorized_sentinel() {
        let items = vec![item("AAAA1111", &[])];
        let documents = vec![];

        let plan = compute_plan(&items, &documents, None);
        assert_eq!(plan.added, vec!["AAAA1111".to_string()]);

        // And a document already under Uncategorized is in sync
        let documents = vec![doc("AAAA1111", "Uncategorized")];
        let plan = compute_plan(&items, &documents, None);
        assert!(plan.is_empty());
    }

    #[test]
    fn test_filter_restricts_all_sections() {
        let items = vec![
            item("AAAA1111", &["AI/ML"]),
            item("BBBB2222", &["Physics"]),
            item("DDDD4444", &["AI/Agents"]),
        ];
        let documents = vec![
            doc("CCCC3333", "AI/Old"),
            doc("EEEE5555", "Physics"),
            doc("DDDD4444", "AI/ML"),
        ];

        let plan = compute_plan(&items, &documents, Some("AI"));

        // BBBB2222 is outside the filter, not added; EEEE5555 outside,
        // not deleted
        assert_eq!(plan.added, vec!["AAAA1111".to_string()]);
        assert_eq!(plan.deleted.len(), 1);
        assert_eq!(plan.deleted[0].key, "CCCC3333");
        assert_eq!(plan.moved.len(), 1);
        assert_eq!(plan.moved[0].to, PathBuf::from("AI/Agents"));
    }

    #[test]
    fn test_filter_excludes_item_categorized_elsewhere() {
        // Document sits under AI but its item now lives under Physics
        // only; with the AI filter this is out of scope, not a move
        let items = vec![item("AAAA1111", &["Physics"])];
        let documents = vec![doc("AAAA1111", "AI/ML")];

        let plan = compute_plan(&items, &documents, Some("AI"));
        assert!(plan.is_empty());
    }

    #[test]
    fn test_sections_are_disjoint() {
        let items = vec![
            item("AAAA1111", &["AI/ML"]),
            item("BBBB2222", &["X/Z"]),
            item("DDDD4444", &[]),
        ];
        let documents = vec![
            doc("AAAA1111", "AI/ML"),
            doc("BBBB2222", "X/Y"),
            doc("CCCC3333", "Gone"),
        ];

        let plan = compute_plan(&items, &documents, None);

        let added: HashSet<&str> = plan.added.iter().map(|k| k.as_str()).collect();
        let deleted: HashSet<&str> = plan.deleted.iter().map(|d| d.key.as_str()).collect();
        let moved: HashSet<&str> = plan.moved.iter().map(|m| m.key()).collect();

        assert!(added.is_disjoint(&deleted));
        assert!(added.is_disjoint(&moved));
        assert!(deleted.is_disjoint(&moved));
        assert_eq!(added.len() + deleted.len() + moved.len(), 3);
    }

    #[test]
    fn test_sanitized_folder_counts_as_in_sync() {
        // Collection "AI: Agents" lands on disk as "AI- Agents"
        let items = vec![item("AAAA1111", &["AI: Agents"])];
        let documents = vec![doc("AAAA1111", "AI- Agents")];

        let plan = compute_plan(&items, &documents, None);
        assert!(plan.is_empty());
    }
}
