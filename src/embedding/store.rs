//! Vector store façade over the embedding side table.
//!
//! Vectors are stored per entry with the version they were computed from;
//! an upsert carrying an older version than the stored row is refused so a
//! slow worker can never clobber a newer embedding.

use crate::artifact::EntryType;
use crate::error::Result;
use crate::storage::StorageAdapter;
use chrono::Utc;
use rusqlite::{params, OptionalExtension};
use std::sync::Arc;

/// One stored embedding row.
#[derive(Debug, Clone)]
pub struct StoredEmbedding {
    pub entry_type: EntryType,
    pub entry_id: String,
    pub version_id: String,
    pub version_num: i64,
    pub model: String,
    pub dimension: usize,
    pub vector: Vec<f32>,
}

/// A similarity hit.
#[derive(Debug, Clone)]
pub struct SimilarityHit {
    pub entry_type: EntryType,
    pub entry_id: String,
    pub score: f64,
}

/// Metadata row used by the re-embed pager.
#[derive(Debug, Clone)]
pub struct EmbeddingMeta {
    pub entry_type: EntryType,
    pub entry_id: String,
    pub dimension: usize,
}

/// Façade over the embeddings table.
#[derive(Clone)]
pub struct VectorStore {
    adapter: Arc<StorageAdapter>,
}

impl VectorStore {
    pub fn new(adapter: Arc<StorageAdapter>) -> Self {
        Self { adapter }
    }

    /// Store a vector. Returns `false` (without writing) when the stored
    /// row already carries a newer or equal version from a different job.
    pub fn upsert(
        &self,
        entry_type: EntryType,
        entry_id: &str,
        version_id: &str,
        version_num: i64,
        model: &str,
        vector: &[f32],
    ) -> Result<bool> {
        let existing: Option<(String, i64)> = self.adapter.with_conn(|conn| {
            conn.query_row(
                "SELECT version_id, version_num FROM embeddings
                 WHERE entry_type = ?1 AND entry_id = ?2",
                params![entry_type.to_string(), entry_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()
        })?;

        if let Some((stored_version, stored_num)) = existing {
            if stored_num > version_num
                || (stored_num == version_num && stored_version != version_id)
            {
                return Ok(false);
            }
        }

        let blob = encode_vector(vector);
        self.adapter.with_conn(|conn| {
            conn.execute(
                "INSERT INTO embeddings
                     (entry_type, entry_id, version_id, version_num, model, dimension, vector, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                 ON CONFLICT(entry_type, entry_id) DO UPDATE SET
                     version_id = excluded.version_id,
                     version_num = excluded.version_num,
                     model = excluded.model,
                     dimension = excluded.dimension,
                     vector = excluded.vector,
                     created_at = excluded.created_at",
                params![
                    entry_type.to_string(),
                    entry_id,
                    version_id,
                    version_num,
                    model,
                    vector.len() as i64,
                    blob,
                    Utc::now().to_rfc3339(),
                ],
            )
        })?;
        Ok(true)
    }

    /// Fetch the stored embedding for an entry.
    pub fn get(&self, entry_type: EntryType, entry_id: &str) -> Result<Option<StoredEmbedding>> {
        self.adapter.with_conn(|conn| {
            conn.query_row(
                "SELECT entry_type, entry_id, version_id, version_num, model, dimension, vector
                 FROM embeddings WHERE entry_type = ?1 AND entry_id = ?2",
                params![entry_type.to_string(), entry_id],
                |row| row_to_embedding(row),
            )
            .optional()
        })
    }

    /// Cosine-similarity top-K over stored vectors, constrained by kind.
    pub fn search(
        &self,
        query: &[f32],
        entry_types: &[EntryType],
        top_k: usize,
    ) -> Result<Vec<SimilarityHit>> {
        let rows: Vec<StoredEmbedding> = self.adapter.with_conn(|conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT entry_type, entry_id, version_id, version_num, model, dimension, vector
                 FROM embeddings WHERE dimension = ?1",
            )?;
            let rows = stmt
                .query_map(params![query.len() as i64], |row| row_to_embedding(row))?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })?;

        let mut hits: Vec<SimilarityHit> = rows
            .into_iter()
            .filter(|row| entry_types.is_empty() || entry_types.contains(&row.entry_type))
            .map(|row| SimilarityHit {
                score: cosine(query, &row.vector),
                entry_type: row.entry_type,
                entry_id: row.entry_id,
            })
            .collect();

        hits.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        hits.truncate(top_k);
        Ok(hits)
    }

    /// Count of stored rows whose dimension differs from `expected`.
    pub fn count_with_other_dimension(&self, expected: usize) -> Result<i64> {
        self.adapter.with_conn(|conn| {
            conn.query_row(
                "SELECT COUNT(*) FROM embeddings WHERE dimension != ?1",
                params![expected as i64],
                |row| row.get(0),
            )
        })
    }

    /// Page through metadata of rows with a mismatched dimension.
    pub fn page_mismatched(
        &self,
        expected: usize,
        offset: usize,
        batch: usize,
    ) -> Result<Vec<EmbeddingMeta>> {
        self.adapter.with_conn(|conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT entry_type, entry_id, dimension FROM embeddings
                 WHERE dimension != ?1
                 ORDER BY entry_type, entry_id LIMIT ?2 OFFSET ?3",
            )?;
            let rows = stmt
                .query_map(
                    params![expected as i64, batch as i64, offset as i64],
                    |row| {
                        let entry_type: String = row.get(0)?;
                        Ok(EmbeddingMeta {
                            entry_type: entry_type.parse().unwrap_or(EntryType::Knowledge),
                            entry_id: row.get(1)?,
                            dimension: row.get::<_, i64>(2)? as usize,
                        })
                    },
                )?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
    }

    /// Remove an entry's embedding.
    pub fn delete(&self, entry_type: EntryType, entry_id: &str) -> Result<bool> {
        let deleted = self.adapter.with_conn(|conn| {
            conn.execute(
                "DELETE FROM embeddings WHERE entry_type = ?1 AND entry_id = ?2",
                params![entry_type.to_string(), entry_id],
            )
        })?;
        Ok(deleted > 0)
    }
}

fn row_to_embedding(row: &rusqlite::Row) -> rusqlite::Result<StoredEmbedding> {
    let entry_type: String = row.get(0)?;
    let blob: Vec<u8> = row.get(6)?;
    Ok(StoredEmbedding {
        entry_type: entry_type.parse().unwrap_or(EntryType::Knowledge),
        entry_id: row.get(1)?,
        version_id: row.get(2)?,
        version_num: row.get(3)?,
        model: row.get(4)?,
        dimension: row.get::<_, i64>(5)? as usize,
        vector: decode_vector(&blob),
    })
}

fn encode_vector(vector: &[f32]) -> Vec<u8> {
    vector.iter().flat_map(|f| f.to_le_bytes()).collect()
}

fn decode_vector(blob: &[u8]) -> Vec<f32> {
    blob.chunks(4)
        .map(|chunk| {
            let arr: [u8; 4] = chunk.try_into().unwrap_or([0; 4]);
            f32::from_le_bytes(arr)
        })
        .collect()
}

fn cosine(a: &[f32], b: &[f32]) -> f64 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let (mut dot, mut na, mut nb) = (0.0f64, 0.0f64, 0.0f64);
    for (x, y) in a.iter().zip(b) {
        dot += (*x as f64) * (*y as f64);
        na += (*x as f64) * (*x as f64);
        nb += (*y as f64) * (*y as f64);
    }
    if na == 0.0 || nb == 0.0 {
        0.0
    } else {
        dot / (na.sqrt() * nb.sqrt())
    }
}
