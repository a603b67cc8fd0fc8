//! Table store boundary for the migrator: exact-key lookups, column
//! introspection, structural clones and id-guarded copies, plus the
//! Postgres implementation over a single connection.
//!
//! All SQL is runtime-checked (`sqlx::query`, not macros) so building the
//! workspace never requires a live database.

use async_trait::async_trait;
use sqlx::postgres::PgRow;
use sqlx::{Connection, Executor, PgConnection, Row};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, warn};

pub const CRATE_NAME: &str = "cohort-store";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error(transparent)]
    Sql(#[from] sqlx::Error),
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// The slice of a matched row the pipeline acts on. `id` is never mutated;
/// `student_id` is `None` when the column is absent or null.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MatchedRow {
    pub id: i64,
    pub student_id: Option<i64>,
}

/// Values accepted by `update_by_id`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SqlValue {
    Text(String),
    NullableText(Option<String>),
    Bool(bool),
}

/// External-collaborator contract over the tabular store.
///
/// Implementations own all persisted state; callers hold no state beyond
/// per-run caches of what these methods return.
#[async_trait]
pub trait TableStore: Send + Sync {
    /// Column names of `table` in ordinal order; empty when the table is
    /// absent.
    async fn columns_of(&self, table: &str) -> Result<Vec<String>>;

    async fn table_exists(&self, table: &str) -> Result<bool>;

    async fn exists_by_id(&self, table: &str, id: i64) -> Result<bool>;

    /// Exact, case-sensitive match on a text key. No trimming, no
    /// normalization.
    async fn select_by_text_key(
        &self,
        table: &str,
        key_column: &str,
        value: &str,
    ) -> Result<Vec<MatchedRow>>;

    /// Ids of rows whose integer `key_column` equals `value` (child lookup
    /// by foreign key).
    async fn select_ids_by_int_key(
        &self,
        table: &str,
        key_column: &str,
        value: i64,
    ) -> Result<Vec<i64>>;

    /// `INSERT INTO dest (columns) SELECT columns FROM source WHERE id = $1`.
    async fn insert_by_id_selecting_columns(
        &self,
        source: &str,
        dest: &str,
        columns: &[String],
        id: i64,
    ) -> Result<()>;

    /// Structure-clone `dest` from `source` (identity and defaults
    /// included); no-op when `dest` already exists.
    async fn ensure_clone_table(&self, source: &str, dest: &str) -> Result<()>;

    async fn drop_table(&self, table: &str) -> Result<()>;

    /// Copy every row of `source` into `dest`, preserving explicit identity
    /// values. Returns the number of rows inserted.
    async fn insert_all_rows(&self, source: &str, dest: &str) -> Result<u64>;

    /// Insert rows of `override_table` whose id is absent from `base` into
    /// `dest`, restricted to `columns`; `updated_at_column` is forced to the
    /// current time when it appears in `columns`. Returns rows inserted.
    async fn insert_missing_rows(
        &self,
        override_table: &str,
        base: &str,
        dest: &str,
        columns: &[String],
        updated_at_column: &str,
    ) -> Result<u64>;

    async fn update_by_id(
        &self,
        table: &str,
        id: i64,
        assignments: &[(String, SqlValue)],
    ) -> Result<()>;

    /// Whether accent-insensitive matching is available in the target
    /// database. Probed once per run and threaded through the run context.
    async fn unaccent_available(&self) -> Result<bool>;

    /// Transaction boundary. Rollback is implicit on connection close or
    /// error.
    async fn commit(&self) -> Result<()>;
}

/// Escape an identifier for interpolation into SQL. Identifiers cannot be
/// bound as parameters, so every table/column name goes through here.
pub fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

fn column_csv(columns: &[String]) -> String {
    columns
        .iter()
        .map(|c| quote_ident(c))
        .collect::<Vec<_>>()
        .join(",")
}

struct Inner {
    conn: PgConnection,
    in_txn: bool,
}

/// Postgres-backed store over one connection. Statements run inside an
/// explicit transaction opened lazily before the first statement after a
/// commit, so `commit()` maps onto the underlying transactional boundary.
pub struct PgTableStore {
    inner: Mutex<Inner>,
}

impl PgTableStore {
    pub async fn connect(database_url: &str) -> Result<Self> {
        let conn = PgConnection::connect(database_url).await?;
        Ok(Self {
            inner: Mutex::new(Inner {
                conn,
                in_txn: false,
            }),
        })
    }
}

async fn txn_conn(inner: &mut Inner) -> Result<&mut PgConnection> {
    if !inner.in_txn {
        inner.conn.execute("BEGIN").await?;
        inner.in_txn = true;
    }
    Ok(&mut inner.conn)
}

fn int_column(row: &PgRow, column: &str) -> Option<i64> {
    if let Ok(value) = row.try_get::<Option<i64>, _>(column) {
        return value;
    }
    if let Ok(value) = row.try_get::<Option<i32>, _>(column) {
        return value.map(i64::from);
    }
    None
}

#[async_trait]
impl TableStore for PgTableStore {
    async fn columns_of(&self, table: &str) -> Result<Vec<String>> {
        let mut inner = self.inner.lock().await;
        let conn = txn_conn(&mut inner).await?;
        let rows = sqlx::query(
            r#"
            SELECT column_name::text
            FROM information_schema.columns
            WHERE table_schema = 'public' AND table_name = $1
            ORDER BY ordinal_position
            "#,
        )
        .bind(table)
        .fetch_all(&mut *conn)
        .await?;
        Ok(rows.iter().map(|r| r.get::<String, _>(0)).collect())
    }

    async fn table_exists(&self, table: &str) -> Result<bool> {
        let mut inner = self.inner.lock().await;
        let conn = txn_conn(&mut inner).await?;
        let row = sqlx::query(
            r#"
            SELECT 1 FROM information_schema.tables
            WHERE table_schema = 'public' AND table_name = $1
            "#,
        )
        .bind(table)
        .fetch_optional(&mut *conn)
        .await?;
        Ok(row.is_some())
    }

    async fn exists_by_id(&self, table: &str, id: i64) -> Result<bool> {
        let mut inner = self.inner.lock().await;
        let conn = txn_conn(&mut inner).await?;
        let sql = format!(
            "SELECT 1 FROM public.{} WHERE id = $1 LIMIT 1",
            quote_ident(table)
        );
        let row = sqlx::query(&sql).bind(id).fetch_optional(&mut *conn).await?;
        Ok(row.is_some())
    }

    async fn select_by_text_key(
        &self,
        table: &str,
        key_column: &str,
        value: &str,
    ) -> Result<Vec<MatchedRow>> {
        let mut inner = self.inner.lock().await;
        let conn = txn_conn(&mut inner).await?;
        let sql = format!(
            "SELECT * FROM public.{} WHERE {} = $1",
            quote_ident(table),
            quote_ident(key_column)
        );
        let rows = sqlx::query(&sql).bind(value).fetch_all(&mut *conn).await?;
        let mut matched = Vec::with_capacity(rows.len());
        for row in &rows {
            match int_column(row, "id") {
                Some(id) => matched.push(MatchedRow {
                    id,
                    student_id: int_column(row, "student_id"),
                }),
                None => warn!(table, key_column, value, "matched row without id; ignored"),
            }
        }
        Ok(matched)
    }

    async fn select_ids_by_int_key(
        &self,
        table: &str,
        key_column: &str,
        value: i64,
    ) -> Result<Vec<i64>> {
        let mut inner = self.inner.lock().await;
        let conn = txn_conn(&mut inner).await?;
        let sql = format!(
            "SELECT id::bigint FROM public.{} WHERE {} = $1",
            quote_ident(table),
            quote_ident(key_column)
        );
        let rows = sqlx::query(&sql).bind(value).fetch_all(&mut *conn).await?;
        Ok(rows.iter().map(|r| r.get::<i64, _>(0)).collect())
    }

    async fn insert_by_id_selecting_columns(
        &self,
        source: &str,
        dest: &str,
        columns: &[String],
        id: i64,
    ) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let conn = txn_conn(&mut inner).await?;
        let cols = column_csv(columns);
        let sql = format!(
            "INSERT INTO public.{dest} ({cols}) SELECT {cols} FROM public.{source} WHERE id = $1",
            dest = quote_ident(dest),
            source = quote_ident(source),
        );
        sqlx::query(&sql).bind(id).execute(&mut *conn).await?;
        Ok(())
    }

    async fn ensure_clone_table(&self, source: &str, dest: &str) -> Result<()> {
        if self.table_exists(dest).await? {
            return Ok(());
        }
        let mut inner = self.inner.lock().await;
        let conn = txn_conn(&mut inner).await?;
        let sql = format!(
            "CREATE TABLE public.{} (LIKE public.{} INCLUDING IDENTITY INCLUDING DEFAULTS)",
            quote_ident(dest),
            quote_ident(source)
        );
        debug!(source, dest, "cloning table structure");
        sqlx::query(&sql).execute(&mut *conn).await?;
        Ok(())
    }

    async fn drop_table(&self, table: &str) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let conn = txn_conn(&mut inner).await?;
        let sql = format!("DROP TABLE IF EXISTS public.{}", quote_ident(table));
        debug!(table, "dropping table");
        sqlx::query(&sql).execute(&mut *conn).await?;
        Ok(())
    }

    async fn insert_all_rows(&self, source: &str, dest: &str) -> Result<u64> {
        let columns = self.columns_of(source).await?;
        if columns.is_empty() {
            return Ok(0);
        }
        let mut inner = self.inner.lock().await;
        let conn = txn_conn(&mut inner).await?;
        let cols = column_csv(&columns);
        let sql = format!(
            "INSERT INTO public.{dest} ({cols}) OVERRIDING SYSTEM VALUE SELECT {cols} FROM public.{source}",
            dest = quote_ident(dest),
            source = quote_ident(source),
        );
        let result = sqlx::query(&sql).execute(&mut *conn).await?;
        Ok(result.rows_affected())
    }

    async fn insert_missing_rows(
        &self,
        override_table: &str,
        base: &str,
        dest: &str,
        columns: &[String],
        updated_at_column: &str,
    ) -> Result<u64> {
        let mut inner = self.inner.lock().await;
        let conn = txn_conn(&mut inner).await?;
        let exprs = columns
            .iter()
            .map(|c| {
                if c == updated_at_column {
                    "NOW()".to_string()
                } else {
                    format!("t.{}", quote_ident(c))
                }
            })
            .collect::<Vec<_>>()
            .join(",");
        let sql = format!(
            "INSERT INTO public.{dest} ({cols}) OVERRIDING SYSTEM VALUE \
             SELECT {exprs} FROM public.{overriding} t \
             WHERE NOT EXISTS (SELECT 1 FROM public.{base} b WHERE b.id = t.id)",
            dest = quote_ident(dest),
            cols = column_csv(columns),
            overriding = quote_ident(override_table),
            base = quote_ident(base),
        );
        let result = sqlx::query(&sql).execute(&mut *conn).await?;
        Ok(result.rows_affected())
    }

    async fn update_by_id(
        &self,
        table: &str,
        id: i64,
        assignments: &[(String, SqlValue)],
    ) -> Result<()> {
        if assignments.is_empty() {
            return Ok(());
        }
        let mut inner = self.inner.lock().await;
        let conn = txn_conn(&mut inner).await?;
        let sets = assignments
            .iter()
            .enumerate()
            .map(|(i, (column, _))| format!("{} = ${}", quote_ident(column), i + 1))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "UPDATE public.{} SET {} WHERE id = ${}",
            quote_ident(table),
            sets,
            assignments.len() + 1
        );
        let mut query = sqlx::query(&sql);
        for (_, value) in assignments {
            query = match value {
                SqlValue::Text(text) => query.bind(text.clone()),
                SqlValue::NullableText(option) => query.bind(option.clone()),
                SqlValue::Bool(flag) => query.bind(*flag),
            };
        }
        query.bind(id).execute(&mut *conn).await?;
        Ok(())
    }

    async fn unaccent_available(&self) -> Result<bool> {
        let mut inner = self.inner.lock().await;
        let conn = txn_conn(&mut inner).await?;
        let row = sqlx::query("SELECT 1 FROM pg_extension WHERE extname = 'unaccent'")
            .fetch_optional(&mut *conn)
            .await?;
        Ok(row.is_some())
    }

    async fn commit(&self) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if inner.in_txn {
            inner.conn.execute("COMMIT").await?;
            inner.in_txn = false;
            debug!("transaction committed");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identifiers_are_escaped() {
        assert_eq!(quote_ident("course_taas"), "\"course_taas\"");
        assert_eq!(quote_ident("odd\"name"), "\"odd\"\"name\"");
    }

    #[test]
    fn column_csv_quotes_each_column() {
        let cols = vec!["id".to_string(), "spreadsheet_name".to_string()];
        assert_eq!(column_csv(&cols), "\"id\",\"spreadsheet_name\"");
    }
}
