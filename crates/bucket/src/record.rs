//! The stored file record, one document in `<bucket>.files`.

use bson::{Bson, DateTime, Document};
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Metadata describing one stored binary object.
///
/// Field names follow the GridFS files collection layout.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileRecord {
    #[serde(rename = "_id")]
    pub id: Bson,
    #[serde(default)]
    pub filename: String,
    pub length: i64,
    pub chunk_size: i32,
    pub upload_date: DateTime,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Document>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aliases: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub md5: Option<String>,
}

impl FileRecord {
    /// Decode a files-collection document.
    pub fn from_document(document: Document) -> Result<Self> {
        Ok(bson::from_document(document)?)
    }

    /// Encode as a files-collection document.
    pub fn to_document(&self) -> Result<Document> {
        Ok(bson::to_document(self)?)
    }
}

/// Render a file or record identifier for filenames and log lines.
///
/// ObjectIds render as hex, strings as-is, anything else in extended-JSON form.
pub fn id_to_string(id: &Bson) -> String {
    match id {
        Bson::ObjectId(oid) => oid.to_hex(),
        Bson::String(s) => s.clone(),
        Bson::Int32(n) => n.to_string(),
        Bson::Int64(n) => n.to_string(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::{doc, oid::ObjectId};

    #[test]
    fn test_document_uses_gridfs_field_names() {
        let record = FileRecord {
            id: Bson::ObjectId(ObjectId::new()),
            filename: "sample.txt".to_string(),
            length: 37,
            chunk_size: 261_120,
            upload_date: DateTime::now(),
            metadata: Some(doc! { "owner": "ada" }),
            aliases: None,
            content_type: Some("text/plain".to_string()),
            md5: None,
        };

        let document = record.to_document().unwrap();
        assert!(document.contains_key("_id"));
        assert_eq!(document.get_i32("chunkSize").unwrap(), 261_120);
        assert_eq!(document.get_i64("length").unwrap(), 37);
        assert!(document.contains_key("uploadDate"));
        assert_eq!(document.get_str("contentType").unwrap(), "text/plain");
        assert!(!document.contains_key("aliases"));
        assert!(!document.contains_key("md5"));

        let decoded = FileRecord::from_document(document).unwrap();
        assert_eq!(decoded, record);
    }

    #[test]
    fn test_decode_driver_document_with_int32_length() {
        let document = doc! {
            "_id": 42,
            "filename": "legacy.bin",
            "length": 12_i32,
            "chunkSize": 1024_i32,
            "uploadDate": DateTime::now(),
        };
        let record = FileRecord::from_document(document).unwrap();
        assert_eq!(record.length, 12);
        assert_eq!(record.metadata, None);
    }

    #[test]
    fn test_id_to_string() {
        let oid = ObjectId::new();
        assert_eq!(id_to_string(&Bson::ObjectId(oid)), oid.to_hex());
        assert_eq!(id_to_string(&Bson::String("abc".into())), "abc");
        assert_eq!(id_to_string(&Bson::Int64(7)), "7");
    }
}
