use async_trait::async_trait;
use serde_json::Value;
use sqlx::{QueryBuilder, Row, Sqlite, SqlitePool, Transaction, sqlite::SqliteRow};

use crate::{
    db::{
        error::{DbError, DbResult},
        repos::{DocumentStore, DocumentTx, Seq, StoredDocument},
    },
    models::{Document, Filter, PullOutcome, document},
};

/// Convert a dotted path into an SQLite JSON path: `a.b` -> `$."a"."b"`.
fn json_path(path: &str) -> String {
    let mut out = String::from("$");
    for segment in path.split('.') {
        out.push_str(".\"");
        out.push_str(&segment.replace('"', "\\\""));
        out.push('"');
    }
    out
}

/// Append `AND (...)` clauses for each filter condition.
///
/// Conditions compare JSON type as well as value so that `2024` never matches
/// `"2024"`, mirroring in-memory `Value` equality.
fn push_filter(qb: &mut QueryBuilder<'_, Sqlite>, filter: &Filter) -> DbResult<()> {
    for (path, expected) in filter.iter() {
        let path = json_path(path);
        match expected {
            Value::Null => {
                qb.push(" AND json_extract(body, ");
                qb.push_bind(path);
                qb.push(") IS NULL");
            }
            Value::Bool(b) => {
                qb.push(" AND json_type(body, ");
                qb.push_bind(path);
                qb.push(") = ");
                qb.push_bind(if *b { "true" } else { "false" });
            }
            Value::Number(n) => {
                qb.push(" AND json_type(body, ");
                qb.push_bind(path.clone());
                if let Some(i) = n.as_i64() {
                    qb.push(") = 'integer' AND json_extract(body, ");
                    qb.push_bind(path);
                    qb.push(") = ");
                    qb.push_bind(i);
                } else if let Some(f) = n.as_f64() {
                    qb.push(") = 'real' AND json_extract(body, ");
                    qb.push_bind(path);
                    qb.push(") = ");
                    qb.push_bind(f);
                } else {
                    return Err(DbError::Validation(format!("unsupported number {n}")));
                }
            }
            Value::String(s) => {
                qb.push(" AND json_type(body, ");
                qb.push_bind(path.clone());
                qb.push(") = 'text' AND json_extract(body, ");
                qb.push_bind(path);
                qb.push(") = ");
                qb.push_bind(s.clone());
            }
            Value::Array(_) | Value::Object(_) => {
                let json_type = if expected.is_array() { "array" } else { "object" };
                qb.push(" AND json_type(body, ");
                qb.push_bind(path.clone());
                qb.push(") = ");
                qb.push_bind(json_type);
                qb.push(" AND json_extract(body, ");
                qb.push_bind(path);
                qb.push(") = json(");
                qb.push_bind(serde_json::to_string(expected)?);
                qb.push(")");
            }
        }
    }
    Ok(())
}

fn stored_from_row(row: &SqliteRow) -> DbResult<StoredDocument> {
    let seq: i64 = row.try_get("seq")?;
    let body: String = row.try_get("body")?;
    let body: Document = serde_json::from_str(&body)?;
    Ok(StoredDocument { seq, body })
}

pub struct SqliteDocumentStore {
    pool: SqlitePool,
}

impl SqliteDocumentStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl DocumentStore for SqliteDocumentStore {
    async fn list_collections(&self) -> DbResult<Vec<String>> {
        let rows = sqlx::query("SELECT name FROM collections ORDER BY name")
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|row| row.try_get::<String, _>("name").map_err(DbError::from))
            .collect()
    }

    async fn create_collection(&self, name: &str) -> DbResult<()> {
        sqlx::query("INSERT OR IGNORE INTO collections (name) VALUES (?)")
            .bind(name)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn insert_many(&self, collection: &str, docs: Vec<Document>) -> DbResult<u64> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("INSERT OR IGNORE INTO collections (name) VALUES (?)")
            .bind(collection)
            .execute(&mut *tx)
            .await?;

        let mut inserted = 0;
        for doc in &docs {
            let result = sqlx::query("INSERT INTO documents (collection, body) VALUES (?, ?)")
                .bind(collection)
                .bind(serde_json::to_string(doc)?)
                .execute(&mut *tx)
                .await?;
            inserted += result.rows_affected();
        }

        tx.commit().await?;
        Ok(inserted)
    }

    async fn find_one(&self, collection: &str, filter: &Filter) -> DbResult<Option<Document>> {
        let mut qb =
            QueryBuilder::<Sqlite>::new("SELECT seq, body FROM documents WHERE collection = ");
        qb.push_bind(collection.to_string());
        push_filter(&mut qb, filter)?;
        qb.push(" ORDER BY seq LIMIT 1");

        let row = qb.build().fetch_optional(&self.pool).await?;
        row.map(|r| stored_from_row(&r).map(|d| d.body)).transpose()
    }

    async fn fetch_page(
        &self,
        collection: &str,
        after: Option<Seq>,
        limit: u32,
    ) -> DbResult<Vec<StoredDocument>> {
        let rows = sqlx::query(
            r#"
            SELECT seq, body FROM documents
            WHERE collection = ? AND seq > ?
            ORDER BY seq
            LIMIT ?
            "#,
        )
        .bind(collection)
        .bind(after.unwrap_or(0))
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(stored_from_row).collect()
    }

    async fn count(&self, collection: &str, filter: &Filter) -> DbResult<u64> {
        let mut qb = QueryBuilder::<Sqlite>::new(
            "SELECT COUNT(*) AS n FROM documents WHERE collection = ",
        );
        qb.push_bind(collection.to_string());
        push_filter(&mut qb, filter)?;

        let row = qb.build().fetch_one(&self.pool).await?;
        let n: i64 = row.try_get("n")?;
        Ok(n as u64)
    }

    async fn begin(&self) -> DbResult<Box<dyn DocumentTx>> {
        let tx = self.pool.begin().await?;
        Ok(Box::new(SqliteDocumentTx { tx }))
    }
}

/// Open SQLite transaction. Dropping it rolls back.
struct SqliteDocumentTx {
    tx: Transaction<'static, Sqlite>,
}

impl SqliteDocumentTx {
    async fn matching(
        &mut self,
        collection: &str,
        filter: &Filter,
    ) -> DbResult<Vec<StoredDocument>> {
        let mut qb =
            QueryBuilder::<Sqlite>::new("SELECT seq, body FROM documents WHERE collection = ");
        qb.push_bind(collection.to_string());
        push_filter(&mut qb, filter)?;
        qb.push(" ORDER BY seq");

        let rows = qb.build().fetch_all(&mut *self.tx).await?;
        rows.iter().map(stored_from_row).collect()
    }

    async fn replace_body(&mut self, seq: Seq, body: &Document) -> DbResult<()> {
        sqlx::query("UPDATE documents SET body = ? WHERE seq = ?")
            .bind(serde_json::to_string(body)?)
            .bind(seq)
            .execute(&mut *self.tx)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl DocumentTx for SqliteDocumentTx {
    async fn find_many(&mut self, collection: &str, filter: &Filter) -> DbResult<Vec<Document>> {
        Ok(self
            .matching(collection, filter)
            .await?
            .into_iter()
            .map(|d| d.body)
            .collect())
    }

    async fn insert_one(&mut self, collection: &str, doc: Document) -> DbResult<()> {
        sqlx::query("INSERT OR IGNORE INTO collections (name) VALUES (?)")
            .bind(collection)
            .execute(&mut *self.tx)
            .await?;
        sqlx::query("INSERT INTO documents (collection, body) VALUES (?, ?)")
            .bind(collection)
            .bind(serde_json::to_string(&doc)?)
            .execute(&mut *self.tx)
            .await?;
        Ok(())
    }

    async fn delete_many(&mut self, collection: &str, filter: &Filter) -> DbResult<u64> {
        let mut qb = QueryBuilder::<Sqlite>::new("DELETE FROM documents WHERE collection = ");
        qb.push_bind(collection.to_string());
        push_filter(&mut qb, filter)?;

        let result = qb.build().execute(&mut *self.tx).await?;
        Ok(result.rows_affected())
    }

    async fn set_fields(
        &mut self,
        collection: &str,
        filter: &Filter,
        fields: &Document,
    ) -> DbResult<u64> {
        let matches = self.matching(collection, filter).await?;
        let mut modified = 0;
        for mut doc in matches {
            for (path, value) in fields {
                document::set_path(&mut doc.body, path, value.clone());
            }
            self.replace_body(doc.seq, &doc.body).await?;
            modified += 1;
        }
        Ok(modified)
    }

    async fn pull_value(
        &mut self,
        collection: &str,
        filter: &Filter,
        field: &str,
        value: &Value,
    ) -> DbResult<u64> {
        let matches = self.matching(collection, filter).await?;
        let mut modified = 0;
        for mut doc in matches {
            match document::pull_from_path(&mut doc.body, field, value) {
                PullOutcome::Removed(_) => {
                    self.replace_body(doc.seq, &doc.body).await?;
                    modified += 1;
                }
                PullOutcome::Unchanged => {}
                PullOutcome::NotAnArray => {
                    return Err(DbError::Validation(format!(
                        "cannot pull from non-array field '{field}' in '{collection}'"
                    )));
                }
            }
        }
        Ok(modified)
    }

    async fn commit(self: Box<Self>) -> DbResult<()> {
        self.tx.commit().await?;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> DbResult<()> {
        self.tx.rollback().await?;
        Ok(())
    }
}
