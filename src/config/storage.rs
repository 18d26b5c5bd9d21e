use crate::error::CoreError;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OpenFlags};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

/// Represents a single chunk of a source document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentChunk {
    pub id: i64,
    pub source: String,
    pub chunk_number: i32,
    pub content: String,
    pub metadata: serde_json::Value,
    pub created_at: Option<DateTime<Utc>>,
}

/// SQLite table holding the text behind every vector in the index.
#[derive(Debug, Clone)]
pub struct ChunkStore {
    db_path: PathBuf,
}

const SELECT_COLUMNS: &str = "id, source, chunk_number, content, metadata, created_at";

impl ChunkStore {
    /// Opens or creates the store, creating the table if needed.
    pub fn create(db_path: &Path) -> Result<Self, CoreError> {
        if let Some(parent) = db_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let store = Self {
            db_path: db_path.to_path_buf(),
        };
        store.initialize_db()?;
        Ok(store)
    }

    /// Opens an existing store. A missing file means the index was never built.
    pub fn open(db_path: &Path) -> Result<Self, CoreError> {
        if !db_path.is_file() {
            return Err(CoreError::IndexUnavailable(format!(
                "chunk database not found at {}",
                db_path.display()
            )));
        }
        Ok(Self {
            db_path: db_path.to_path_buf(),
        })
    }

    fn get_conn(&self) -> Result<Connection, CoreError> {
        Connection::open(&self.db_path).map_err(Into::into)
    }

    fn get_read_conn(&self) -> Result<Connection, CoreError> {
        Connection::open_with_flags(&self.db_path, OpenFlags::SQLITE_OPEN_READ_ONLY)
            .map_err(Into::into)
    }

    fn initialize_db(&self) -> Result<(), CoreError> {
        let conn = self.get_conn()?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS document_chunks (
                id INTEGER PRIMARY KEY, source TEXT NOT NULL, chunk_number INTEGER NOT NULL,
                content TEXT NOT NULL, metadata TEXT NOT NULL,
                created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now')),
                UNIQUE(source, chunk_number)
            )",
            [],
        )?;
        Ok(())
    }

    pub fn insert_chunk(
        &self,
        source: &str,
        chunk_number: i32,
        content: &str,
        metadata: &serde_json::Value,
    ) -> Result<i64, CoreError> {
        let metadata_str = serde_json::to_string(metadata)?;
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare(
            "INSERT INTO document_chunks (source, chunk_number, content, metadata)
             VALUES (?1, ?2, ?3, ?4)",
        )?;
        let id = stmt.insert(params![source, chunk_number, content, metadata_str])?;
        Ok(id)
    }

    /// Fetches chunks by id, in the order of `ids`. Unknown ids are skipped.
    pub fn get_chunks_by_ids(&self, ids: &[i64]) -> Result<Vec<DocumentChunk>, CoreError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let conn = self.get_read_conn()?;
        let placeholders = vec!["?"; ids.len()].join(",");
        let sql = format!(
            "SELECT {} FROM document_chunks WHERE id IN ({})",
            SELECT_COLUMNS, placeholders
        );
        let mut stmt = conn.prepare(&sql)?;
        let chunk_iter = stmt.query_map(rusqlite::params_from_iter(ids.iter()), row_to_chunk)?;

        let mut chunk_map = HashMap::new();
        for result in chunk_iter {
            let chunk = result?;
            chunk_map.insert(chunk.id, chunk);
        }
        Ok(ids.iter().filter_map(|id| chunk_map.remove(id)).collect())
    }

    /// Distinct sources, sorted.
    pub fn list_sources(&self) -> Result<Vec<String>, CoreError> {
        let conn = self.get_read_conn()?;
        let mut stmt = conn.prepare("SELECT DISTINCT source FROM document_chunks ORDER BY source")?;
        let mut rows = stmt.query([])?;
        let mut sources = Vec::new();
        while let Some(row) = rows.next()? {
            sources.push(row.get(0)?);
        }
        Ok(sources)
    }

    pub fn count(&self) -> Result<usize, CoreError> {
        let conn = self.get_read_conn()?;
        let n: i64 = conn.query_row("SELECT COUNT(*) FROM document_chunks", [], |row| row.get(0))?;
        Ok(n as usize)
    }
}

fn row_to_chunk(row: &rusqlite::Row<'_>) -> rusqlite::Result<DocumentChunk> {
    let metadata = serde_json::from_str(&row.get::<_, String>(4)?).unwrap_or(serde_json::Value::Null);
    let created_at = DateTime::parse_from_rfc3339(&row.get::<_, String>(5)?)
        .ok()
        .map(|ts| ts.with_timezone(&Utc));
    Ok(DocumentChunk {
        id: row.get(0)?,
        source: row.get(1)?,
        chunk_number: row.get(2)?,
        content: row.get(3)?,
        metadata,
        created_at,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunks_come_back_in_requested_order() {
        let dir = tempfile::tempdir().unwrap();
        let store = ChunkStore::create(&dir.path().join("chunks.db")).unwrap();
        let a = store.insert_chunk("ko_10k.txt", 0, "alpha", &serde_json::json!({})).unwrap();
        let b = store.insert_chunk("ko_10k.txt", 1, "beta", &serde_json::json!({"page": 2})).unwrap();

        let chunks = store.get_chunks_by_ids(&[b, 999, a]).unwrap();
        let texts: Vec<&str> = chunks.iter().map(|c| c.content.as_str()).collect();
        assert_eq!(texts, vec!["beta", "alpha"]);
        assert!(chunks[0].created_at.is_some());
        assert_eq!(store.list_sources().unwrap(), vec!["ko_10k.txt".to_string()]);
        assert_eq!(store.count().unwrap(), 2);
    }

    #[test]
    fn opening_a_missing_store_reports_unavailable_index() {
        let dir = tempfile::tempdir().unwrap();
        let err = ChunkStore::open(&dir.path().join("absent.db")).unwrap_err();
        assert!(matches!(err, CoreError::IndexUnavailable(_)));
    }
}
