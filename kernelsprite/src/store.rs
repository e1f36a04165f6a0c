use std::path::Path;

use common::types::{Domain, TrackedItem, FOLLOWERS, POSTS};
use sled::{Batch, Db, IVec, Tree};

use crate::error::{PersistError, StartupError};

/// Durable record of settled items, one collection per [`Domain`].
///
/// Collections are append-only from the reconciler's side: the presence of a
/// key is the only signal that an item was handled.
pub trait RecordStore: Send + Sync {
    /// Creates both collections if absent. Idempotent.
    fn ensure_collections(&self) -> Result<(), StartupError>;

    fn get(&self, domain: Domain, key: &str) -> Result<Option<String>, PersistError>;

    /// Upsert. Callers only use it for keys known to be absent.
    fn put(&self, domain: Domain, key: &str, marker: &str) -> Result<(), PersistError>;

    /// Records `key` if it is not already present and makes it durable.
    /// Returns `false` when the key was already settled.
    fn settle(&self, domain: Domain, key: &str, marker: &str) -> Result<bool, PersistError> {
        if self.get(domain, key)?.is_some() {
            return Ok(false);
        }
        self.put(domain, key, marker)?;
        Ok(true)
    }

    /// Writes all items or none of them.
    fn put_batch(&self, domain: Domain, items: &[&TrackedItem]) -> Result<(), PersistError>;

    fn cursor(&self, domain: Domain) -> Result<Option<String>, PersistError>;

    fn set_cursor(&self, domain: Domain, cursor: &str) -> Result<(), PersistError>;

    /// Items whose action failed after the cursor was allowed past them.
    fn parked(&self, domain: Domain) -> Result<Vec<Parked>, PersistError>;

    /// Inserts or replaces the parked entry for `parked.item`.
    fn park(&self, domain: Domain, parked: &Parked) -> Result<(), PersistError>;

    fn unpark(&self, domain: Domain, marker: &str) -> Result<(), PersistError>;

    fn len(&self, domain: Domain) -> usize;

    fn flush(&self) -> Result<(), PersistError>;
}

/// An unsettled item waiting for another action attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Parked {
    pub item: TrackedItem,
    /// Failed actions so far.
    pub attempts: u32,
}

pub struct SledStore {
    db: Db,
    posts: Tree,
    followers: Tree,
}

impl SledStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StartupError> {
        let path = path.as_ref();
        let db = sled::Config::default()
            .path(path)
            .flush_every_ms(Some(1_000))
            .open()
            .map_err(|source| StartupError::StoreOpen {
                path: path.display().to_string(),
                source,
            })?;
        Self::from_db(db)
    }

    #[cfg(test)]
    pub fn temporary() -> Result<Self, StartupError> {
        let db = sled::Config::new()
            .temporary(true)
            .open()
            .map_err(|source| StartupError::StoreOpen {
                path: "<temporary>".into(),
                source,
            })?;
        Self::from_db(db)
    }

    fn from_db(db: Db) -> Result<Self, StartupError> {
        let posts = open_collection(&db, POSTS)?;
        let followers = open_collection(&db, FOLLOWERS)?;
        Ok(Self {
            db,
            posts,
            followers,
        })
    }

    fn tree(&self, domain: Domain) -> &Tree {
        match domain {
            Domain::Posts => &self.posts,
            Domain::Followers => &self.followers,
        }
    }
}

fn open_collection(db: &Db, name: &'static str) -> Result<Tree, StartupError> {
    db.open_tree(name)
        .map_err(|source| StartupError::Collection {
            collection: name,
            source,
        })
}

fn decode(value: IVec) -> String {
    String::from_utf8_lossy(&value).into_owned()
}

// Parked value layout: attempts as a big-endian u32, then the item key.
fn encode_parked(parked: &Parked) -> Vec<u8> {
    let mut value = parked.attempts.to_be_bytes().to_vec();
    value.extend_from_slice(parked.item.key.as_bytes());
    value
}

fn decode_parked(marker: &[u8], value: &[u8]) -> Option<Parked> {
    let (attempts, key) = value.split_first_chunk::<4>()?;
    Some(Parked {
        item: TrackedItem::new(
            String::from_utf8_lossy(key),
            String::from_utf8_lossy(marker),
        ),
        attempts: u32::from_be_bytes(*attempts),
    })
}

impl RecordStore for SledStore {
    fn ensure_collections(&self) -> Result<(), StartupError> {
        for domain in Domain::ALL {
            open_collection(&self.db, domain.collection())?;
        }
        self.db.flush().map_err(|source| StartupError::Collection {
            collection: POSTS,
            source,
        })?;
        Ok(())
    }

    fn get(&self, domain: Domain, key: &str) -> Result<Option<String>, PersistError> {
        let value = self
            .tree(domain)
            .get(key)
            .map_err(|e| PersistError::new("get", domain.collection(), e))?;
        Ok(value.map(decode))
    }

    fn put(&self, domain: Domain, key: &str, marker: &str) -> Result<(), PersistError> {
        self.tree(domain)
            .insert(key, marker.as_bytes())
            .map_err(|e| PersistError::new("put", domain.collection(), e))?;
        Ok(())
    }

    fn settle(&self, domain: Domain, key: &str, marker: &str) -> Result<bool, PersistError> {
        let tree = self.tree(domain);
        let swapped = tree
            .compare_and_swap(key, None::<&[u8]>, Some(marker.as_bytes()))
            .map_err(|e| PersistError::new("settle", domain.collection(), e))?;
        if swapped.is_err() {
            return Ok(false);
        }
        tree.flush()
            .map_err(|e| PersistError::new("flush", domain.collection(), e))?;
        Ok(true)
    }

    fn put_batch(&self, domain: Domain, items: &[&TrackedItem]) -> Result<(), PersistError> {
        if items.is_empty() {
            return Ok(());
        }
        let mut batch = Batch::default();
        for item in items {
            batch.insert(item.key.as_bytes(), item.marker.as_bytes());
        }
        let tree = self.tree(domain);
        tree.apply_batch(batch)
            .map_err(|e| PersistError::new("put_batch", domain.collection(), e))?;
        tree.flush()
            .map_err(|e| PersistError::new("flush", domain.collection(), e))?;
        Ok(())
    }

    fn cursor(&self, domain: Domain) -> Result<Option<String>, PersistError> {
        let key = domain.cursor_key();
        let value = self
            .db
            .get(&key)
            .map_err(|e| PersistError::new("get", key, e))?;
        Ok(value.map(decode))
    }

    fn set_cursor(&self, domain: Domain, cursor: &str) -> Result<(), PersistError> {
        let key = domain.cursor_key();
        self.db
            .insert(key.as_bytes(), cursor.as_bytes())
            .map_err(|e| PersistError::new("put", key, e))?;
        Ok(())
    }

    fn parked(&self, domain: Domain) -> Result<Vec<Parked>, PersistError> {
        let prefix = domain.retry_prefix();
        let mut parked = Vec::new();
        for entry in self.db.scan_prefix(prefix.as_bytes()) {
            let (key, value) = entry.map_err(|e| PersistError::new("scan", prefix.as_str(), e))?;
            match decode_parked(&key[prefix.len()..], &value) {
                Some(item) => parked.push(item),
                None => tracing::warn!(
                    key = %String::from_utf8_lossy(&key),
                    "skipping unreadable parked entry"
                ),
            }
        }
        Ok(parked)
    }

    fn park(&self, domain: Domain, parked: &Parked) -> Result<(), PersistError> {
        let key = format!("{}{}", domain.retry_prefix(), parked.item.marker);
        self.db
            .insert(key.as_bytes(), encode_parked(parked))
            .map_err(|e| PersistError::new("park", key, e))?;
        Ok(())
    }

    fn unpark(&self, domain: Domain, marker: &str) -> Result<(), PersistError> {
        let key = format!("{}{marker}", domain.retry_prefix());
        self.db
            .remove(key.as_bytes())
            .map_err(|e| PersistError::new("unpark", key, e))?;
        Ok(())
    }

    fn len(&self, domain: Domain) -> usize {
        self.tree(domain).len()
    }

    fn flush(&self) -> Result<(), PersistError> {
        self.db
            .flush()
            .map_err(|e| PersistError::new("flush", "db", e))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn collections_exist_after_open() {
        let dir = tempfile::tempdir().unwrap();
        let store = SledStore::open(dir.path().join("ks.db")).unwrap();
        store.ensure_collections().unwrap();
        store.ensure_collections().unwrap();

        let names: Vec<IVec> = store.db.tree_names();
        assert!(names.iter().any(|n| n.as_ref() == POSTS.as_bytes()));
        assert!(names.iter().any(|n| n.as_ref() == FOLLOWERS.as_bytes()));
    }

    #[test]
    fn open_fails_when_path_is_unusable() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let err = SledStore::open(file.path().join("ks.db")).err().unwrap();
        assert!(matches!(err, StartupError::StoreOpen { .. }));
    }

    #[test]
    fn settle_only_inserts_absent_keys() {
        let store = SledStore::temporary().unwrap();
        let url = "https://example.social/@a/1";

        assert!(store.settle(Domain::Posts, url, "1").unwrap());
        assert!(!store.settle(Domain::Posts, url, "2").unwrap());
        assert_eq!(store.get(Domain::Posts, url).unwrap().as_deref(), Some("1"));
    }

    #[test]
    fn collections_are_independent() {
        let store = SledStore::temporary().unwrap();
        store.put(Domain::Posts, "https://example.social/@a", "7").unwrap();

        assert!(store.get(Domain::Followers, "https://example.social/@a").unwrap().is_none());
        assert_eq!(store.len(Domain::Posts), 1);
        assert_eq!(store.len(Domain::Followers), 0);
    }

    #[test]
    fn put_batch_writes_every_item() {
        let store = SledStore::temporary().unwrap();
        let a = TrackedItem::new("https://example.social/@a", "1");
        let b = TrackedItem::new("https://example.social/@b", "2");

        store.put_batch(Domain::Followers, &[&a, &b]).unwrap();

        assert_eq!(store.len(Domain::Followers), 2);
        assert_eq!(store.get(Domain::Followers, &b.key).unwrap().as_deref(), Some("2"));
    }

    #[test]
    fn cursor_lives_outside_the_collections() {
        let store = SledStore::temporary().unwrap();
        assert!(store.cursor(Domain::Posts).unwrap().is_none());

        store.set_cursor(Domain::Posts, "1099").unwrap();

        assert_eq!(store.cursor(Domain::Posts).unwrap().as_deref(), Some("1099"));
        assert_eq!(store.len(Domain::Posts), 0);
    }

    #[test]
    fn parked_items_keep_their_key_and_attempts() {
        let store = SledStore::temporary().unwrap();
        let parked = Parked {
            item: TrackedItem::new("https://example.social/@a/1205", "1205"),
            attempts: 1,
        };

        store.park(Domain::Posts, &parked).unwrap();
        store
            .park(
                Domain::Posts,
                &Parked {
                    attempts: 3,
                    ..parked.clone()
                },
            )
            .unwrap();

        assert_eq!(
            store.parked(Domain::Posts).unwrap(),
            vec![Parked {
                attempts: 3,
                ..parked.clone()
            }]
        );
        assert!(store.parked(Domain::Followers).unwrap().is_empty());
        assert_eq!(store.len(Domain::Posts), 0);

        store.unpark(Domain::Posts, "1205").unwrap();
        assert!(store.parked(Domain::Posts).unwrap().is_empty());
    }

    #[test]
    fn settled_items_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ks.db");
        {
            let store = SledStore::open(&path).unwrap();
            store.settle(Domain::Followers, "https://example.social/@b", "22").unwrap();
            store.flush().unwrap();
        }

        let store = SledStore::open(&path).unwrap();
        assert_eq!(
            store.get(Domain::Followers, "https://example.social/@b").unwrap().as_deref(),
            Some("22")
        );
    }
}
