//! Index maintenance for the KV engine
//!
//! The KV engine keeps everything the relational engine gets from SQL
//! as explicit index blobs:
//!
//! - roster indexes: a JSON array of IDs per entity kind, used to
//!   enumerate entities
//! - unique indexes: a single ID stored under a derived key, used for
//!   path and source lookups
//! - child indexes: a JSON array of child IDs per parent, used to list
//!   annotations, sessions, flashcards, and reviews
//!
//! Index blobs are advisory: a blob that fails to parse is treated as
//! empty and rewritten on the next mutation, and the read path never
//! fails because of a bad index. Mutations go through compare-and-swap
//! so concurrent writers cannot drop each other's entries.

use tracing::warn;
use uuid::Uuid;

use crate::error::Result;
use crate::kv::backend::KeyValue;

const PREFIX: &str = "lectern";

// ==================== Key Builders ====================

/// Key holding an entity blob
pub(crate) fn entity_key(kind: &str, id: Uuid) -> String {
    format!("{PREFIX}:{kind}:{id}")
}

/// Key holding the roster of all IDs of one kind
pub(crate) fn roster_key(kind: &str) -> String {
    format!("{PREFIX}:index:{kind}")
}

/// Unique index key for a document path
pub(crate) fn path_key(path: &str) -> String {
    format!("{PREFIX}:index:document:secondary:path:{path}")
}

/// Unique index key for a (source, source_id) pair
pub(crate) fn source_key(source: &str, source_id: &str) -> String {
    format!("{PREFIX}:index:document:secondary:source:{source}:{source_id}")
}

/// Key holding the IDs of one parent's children of one kind
pub(crate) fn children_key(parent_kind: &str, child_kind: &str, parent_id: Uuid) -> String {
    format!("{PREFIX}:index:{parent_kind}:children:{child_kind}:{parent_id}")
}

// ==================== ID List Indexes ====================

fn decode_ids(key: &str, bytes: Option<&[u8]>) -> Vec<String> {
    let Some(bytes) = bytes else {
        return Vec::new();
    };
    match serde_json::from_slice(bytes) {
        Ok(ids) => ids,
        Err(err) => {
            warn!("corrupt index blob at {}, treating as empty: {}", key, err);
            Vec::new()
        }
    }
}

/// Read an ID list index
///
/// Missing or corrupt blobs read as empty; entries that are not valid
/// UUIDs are skipped.
pub(crate) fn read_ids<K: KeyValue>(kv: &K, key: &str) -> Result<Vec<Uuid>> {
    let raw = decode_ids(key, kv.get(key)?.as_deref());
    let mut ids = Vec::with_capacity(raw.len());
    for entry in raw {
        match Uuid::parse_str(&entry) {
            Ok(id) => ids.push(id),
            Err(err) => warn!("skipping invalid id {:?} in index {}: {}", entry, key, err),
        }
    }
    Ok(ids)
}

/// Apply a mutation to an ID list index under compare-and-swap
///
/// `apply` returns false to signal that nothing changed, which skips
/// the write. On contention the current value is reloaded and the
/// mutation re-applied.
pub(crate) fn mutate_ids<K, F>(kv: &mut K, key: &str, mut apply: F) -> Result<()>
where
    K: KeyValue,
    F: FnMut(&mut Vec<String>) -> bool,
{
    loop {
        let current = kv.get(key)?;
        let mut ids = decode_ids(key, current.as_deref());
        if !apply(&mut ids) {
            return Ok(());
        }
        let encoded = serde_json::to_vec(&ids)?;
        if kv.compare_and_swap(key, current.as_deref(), Some(&encoded))? {
            return Ok(());
        }
        // Lost a race with another writer; reload and retry
    }
}

/// Append an ID to a list index, skipping duplicates
pub(crate) fn append_id<K: KeyValue>(kv: &mut K, key: &str, id: Uuid) -> Result<()> {
    let id = id.to_string();
    mutate_ids(kv, key, |ids| {
        if ids.contains(&id) {
            false
        } else {
            ids.push(id.clone());
            true
        }
    })
}

/// Remove an ID from a list index
pub(crate) fn remove_id<K: KeyValue>(kv: &mut K, key: &str, id: Uuid) -> Result<()> {
    let id = id.to_string();
    mutate_ids(kv, key, |ids| {
        let before = ids.len();
        ids.retain(|entry| entry != &id);
        ids.len() != before
    })
}

// ==================== Unique Indexes ====================

/// Point a unique index key at an entity ID
pub(crate) fn put_unique<K: KeyValue>(kv: &mut K, key: &str, id: Uuid) -> Result<()> {
    kv.put(key, id.to_string().as_bytes())
}

/// Read the entity ID a unique index key points at
///
/// A corrupt value reads as absent.
pub(crate) fn read_unique<K: KeyValue>(kv: &K, key: &str) -> Result<Option<Uuid>> {
    let Some(bytes) = kv.get(key)? else {
        return Ok(None);
    };
    match std::str::from_utf8(&bytes)
        .ok()
        .and_then(|s| Uuid::parse_str(s).ok())
    {
        Some(id) => Ok(Some(id)),
        None => {
            warn!("corrupt unique index at {}, ignoring", key);
            Ok(None)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::backend::MemoryKv;

    #[test]
    fn test_key_shapes() {
        let id = Uuid::nil();
        assert_eq!(
            entity_key("document", id),
            "lectern:document:00000000-0000-0000-0000-000000000000"
        );
        assert_eq!(roster_key("flashcard"), "lectern:index:flashcard");
        assert_eq!(
            path_key("/papers/attention.pdf"),
            "lectern:index:document:secondary:path:/papers/attention.pdf"
        );
        assert_eq!(
            source_key("arxiv", "1706.03762"),
            "lectern:index:document:secondary:source:arxiv:1706.03762"
        );
        assert_eq!(
            children_key("document", "annotation", id),
            "lectern:index:document:children:annotation:00000000-0000-0000-0000-000000000000"
        );
    }

    #[test]
    fn test_append_preserves_order_and_dedupes() {
        let mut kv = MemoryKv::new();
        let key = roster_key("document");
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();

        append_id(&mut kv, &key, a).unwrap();
        append_id(&mut kv, &key, b).unwrap();
        append_id(&mut kv, &key, a).unwrap();

        assert_eq!(read_ids(&kv, &key).unwrap(), vec![a, b]);
    }

    #[test]
    fn test_remove_id() {
        let mut kv = MemoryKv::new();
        let key = roster_key("document");
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();

        append_id(&mut kv, &key, a).unwrap();
        append_id(&mut kv, &key, b).unwrap();
        remove_id(&mut kv, &key, a).unwrap();
        assert_eq!(read_ids(&kv, &key).unwrap(), vec![b]);

        // Removing an absent ID is a no-op
        remove_id(&mut kv, &key, a).unwrap();
        assert_eq!(read_ids(&kv, &key).unwrap(), vec![b]);
    }

    #[test]
    fn test_corrupt_roster_reads_empty_and_is_repaired() {
        let mut kv = MemoryKv::new();
        let key = roster_key("document");
        kv.put(&key, b"not json at all").unwrap();

        assert!(read_ids(&kv, &key).unwrap().is_empty());

        // The next mutation replaces the corrupt blob
        let id = Uuid::new_v4();
        append_id(&mut kv, &key, id).unwrap();
        assert_eq!(read_ids(&kv, &key).unwrap(), vec![id]);
    }

    #[test]
    fn test_non_uuid_entries_are_skipped() {
        let mut kv = MemoryKv::new();
        let key = roster_key("document");
        let id = Uuid::new_v4();
        let blob = serde_json::to_vec(&vec!["garbage".to_string(), id.to_string()]).unwrap();
        kv.put(&key, &blob).unwrap();

        assert_eq!(read_ids(&kv, &key).unwrap(), vec![id]);
    }

    #[test]
    fn test_unique_index_roundtrip() {
        let mut kv = MemoryKv::new();
        let key = path_key("/a.pdf");
        let id = Uuid::new_v4();

        assert!(read_unique(&kv, &key).unwrap().is_none());
        put_unique(&mut kv, &key, id).unwrap();
        assert_eq!(read_unique(&kv, &key).unwrap(), Some(id));

        kv.put(&key, b"\xff\xfe not a uuid").unwrap();
        assert!(read_unique(&kv, &key).unwrap().is_none());
    }
}
