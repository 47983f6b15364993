use std::sync::Arc;

use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::errors::{AppError, AppResult};

/// Namespaced key/value persistence shared by the geocode cache and
/// preferences. Values are stored as JSON text.
#[derive(Clone)]
pub struct KeyValueStore {
    db: Arc<Mutex<Connection>>,
}

impl KeyValueStore {
    pub fn new(db: Arc<Mutex<Connection>>) -> Self {
        Self { db }
    }

    #[cfg(test)]
    pub fn in_memory() -> Self {
        let connection = crate::db::open_in_memory().expect("in-memory store");
        Self::new(Arc::new(Mutex::new(connection)))
    }

    pub fn get<T: DeserializeOwned>(&self, key: &str) -> AppResult<Option<T>> {
        let raw: Option<String> = {
            let conn = self.db.lock();
            conn.query_row(
                "SELECT value FROM kv_entries WHERE key = ?1",
                [key],
                |row| row.get(0),
            )
            .optional()?
        };
        raw.map(|text| serde_json::from_str(&text))
            .transpose()
            .map_err(AppError::from)
    }

    pub fn put<T: Serialize>(&self, key: &str, value: &T) -> AppResult<()> {
        let encoded = serde_json::to_string(value)?;
        let conn = self.db.lock();
        upsert(&conn, key, &encoded)?;
        Ok(())
    }

    /// Writes every pair in one transaction.
    pub fn put_many<'a, T, I>(&self, entries: I) -> AppResult<usize>
    where
        T: Serialize + 'a,
        I: IntoIterator<Item = (String, &'a T)>,
    {
        let encoded = entries
            .into_iter()
            .map(|(key, value)| serde_json::to_string(value).map(|json| (key, json)))
            .collect::<Result<Vec<_>, _>>()?;

        let mut conn = self.db.lock();
        let tx = conn.transaction()?;
        for (key, json) in &encoded {
            upsert(&tx, key, json)?;
        }
        tx.commit()?;
        Ok(encoded.len())
    }

    pub fn remove_prefix(&self, prefix: &str) -> AppResult<usize> {
        let conn = self.db.lock();
        let removed = conn.execute(
            "DELETE FROM kv_entries WHERE substr(key, 1, ?2) = ?1",
            params![prefix, prefix.chars().count() as i64],
        )?;
        Ok(removed)
    }

    pub fn entries_with_prefix<T: DeserializeOwned>(
        &self,
        prefix: &str,
    ) -> AppResult<Vec<(String, T)>> {
        let raw = {
            let conn = self.db.lock();
            let mut stmt = conn.prepare(
                "SELECT key, value FROM kv_entries WHERE substr(key, 1, ?2) = ?1 ORDER BY key ASC",
            )?;
            let rows = stmt
                .query_map(params![prefix, prefix.chars().count() as i64], |row| {
                    Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
                })?
                .collect::<Result<Vec<_>, _>>()?;
            rows
        };

        raw.into_iter()
            .map(|(key, text)| Ok((key, serde_json::from_str(&text)?)))
            .collect()
    }

    pub fn count_prefix(&self, prefix: &str) -> AppResult<usize> {
        let conn = self.db.lock();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM kv_entries WHERE substr(key, 1, ?2) = ?1",
            params![prefix, prefix.chars().count() as i64],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }
}

fn upsert(conn: &Connection, key: &str, json: &str) -> rusqlite::Result<usize> {
    conn.execute(
        "INSERT INTO kv_entries (key, value, updated_at)
        VALUES (?1, ?2, DATETIME('now'))
        ON CONFLICT(key) DO UPDATE SET
            value = excluded.value,
            updated_at = excluded.updated_at",
        params![key, json],
    )
}
