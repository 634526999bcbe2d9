//! The document-mapping seam.

use async_trait::async_trait;
use bson::{doc, oid::ObjectId, Bson, Document};
use gridfs_bucket::path::{get_path, remove_path, set_path};
use gridfs_bucket::{CollectionRef, Result};

/// A record managed by a document-mapping layer.
///
/// Paths are dotted (`"files.avatar"`). `save` persists the whole record.
#[async_trait]
pub trait MappedRecord: Send + Sync {
    /// The collection the record is persisted in.
    fn collection(&self) -> &CollectionRef;

    /// Current value at `path`, if any.
    fn get(&self, path: &str) -> Option<Bson>;

    /// Set `path` to `value`. `Bson::Null` clears the field.
    fn set(&mut self, path: &str, value: Bson);

    /// Persist the record.
    async fn save(&mut self) -> Result<()>;

    /// The record's own identifier.
    fn id(&self) -> Option<Bson> {
        self.get("_id")
    }
}

/// A record backed by a plain BSON document.
#[derive(Debug, Clone)]
pub struct DocumentRecord {
    collection: CollectionRef,
    document: Document,
}

impl DocumentRecord {
    /// Wrap `document`, assigning a fresh `ObjectId` when it has no `_id`.
    pub fn new(collection: CollectionRef, document: Document) -> Self {
        let document = if document.contains_key("_id") {
            document
        } else {
            let mut with_id = doc! { "_id": ObjectId::new() };
            with_id.extend(document);
            with_id
        };
        Self {
            collection,
            document,
        }
    }

    /// Load a record by `_id`.
    pub async fn find_by_id(collection: &CollectionRef, id: impl Into<Bson>) -> Result<Option<Self>> {
        let found = collection.find_document(doc! { "_id": id.into() }).await?;
        Ok(found.map(|document| Self::new(collection.clone(), document)))
    }

    pub fn document(&self) -> &Document {
        &self.document
    }

    pub fn into_document(self) -> Document {
        self.document
    }
}

#[async_trait]
impl MappedRecord for DocumentRecord {
    fn collection(&self) -> &CollectionRef {
        &self.collection
    }

    fn get(&self, path: &str) -> Option<Bson> {
        match get_path(&self.document, path) {
            Some(Bson::Null) | None => None,
            Some(value) => Some(value.clone()),
        }
    }

    fn set(&mut self, path: &str, value: Bson) {
        match value {
            Bson::Null => {
                remove_path(&mut self.document, path);
            }
            value => set_path(&mut self.document, path, value),
        }
    }

    async fn save(&mut self) -> Result<()> {
        self.collection.save_document(self.document.clone()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gridfs_bucket::{GridFsError, MemoryDatastore};

    #[test]
    fn test_new_assigns_id_first() {
        let record = DocumentRecord::new(CollectionRef::detached("users"), doc! { "name": "ada" });
        assert_eq!(record.document().keys().next().map(String::as_str), Some("_id"));
        assert!(matches!(record.id(), Some(Bson::ObjectId(_))));

        let record = DocumentRecord::new(CollectionRef::detached("users"), doc! { "_id": 5 });
        assert_eq!(record.id(), Some(Bson::Int32(5)));
    }

    #[test]
    fn test_get_set_paths() {
        let mut record = DocumentRecord::new(CollectionRef::detached("users"), doc! {});
        record.set("files.avatar", Bson::String("a.png".into()));
        assert_eq!(record.get("files.avatar"), Some(Bson::String("a.png".into())));

        record.set("files.avatar", Bson::Null);
        assert_eq!(record.get("files.avatar"), None);
    }

    #[tokio::test]
    async fn test_save_and_reload() {
        let store = MemoryDatastore::new();
        let users = CollectionRef::new("users", store.shared());

        let mut record = DocumentRecord::new(users.clone(), doc! { "name": "ada" });
        record.save().await.unwrap();
        record.set("name", Bson::String("grace".into()));
        record.save().await.unwrap();

        let id = record.id().unwrap();
        let loaded = DocumentRecord::find_by_id(&users, id).await.unwrap().unwrap();
        assert_eq!(loaded.get("name"), Some(Bson::String("grace".into())));
        assert_eq!(store.documents("users").len(), 1);
    }

    #[tokio::test]
    async fn test_save_detached_fails() {
        let mut record = DocumentRecord::new(CollectionRef::detached("users"), doc! {});
        let err = record.save().await.unwrap_err();
        assert!(matches!(err, GridFsError::NotConnected));
    }
}
