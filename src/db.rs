use crate::config::Config;
use crate::error::PersistenceError;
use crate::model::{GroupId, RecordFields, RecordRef};
use crate::sync::PersistenceGateway;
use anyhow::Result;
use libsql::{Builder, Connection, Database as LibsqlDatabase};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{Mutex, MutexGuard};

const SYSTEM_MIGRATIONS: &[(&str, &str)] =
    &[("system/000_migrations_table.sql", include_str!("migrations/system/000_migrations_table.sql"))];

const MIGRATIONS: &[(&str, &str)] = &[("001_records.sql", include_str!("migrations/001_records.sql"))];

const IN_MEMORY: &str = ":memory:";

pub struct Database {
    _db: LibsqlDatabase,
    conn: Connection,
    write_lock: Mutex<()>,
    /// Set when a gateway went away with its transaction still open.
    abandoned_tx: AtomicBool,
}

impl Database {
    async fn is_migration_applied(conn: &Connection, name: &str) -> Result<bool> {
        let query = "SELECT 1 FROM _migrations WHERE name = ?";
        match conn.query(query, libsql::params![name]).await {
            Ok(mut rows) => Ok(rows.next().await?.is_some()),
            Err(e) => {
                if e.to_string().contains("no such table") {
                    Ok(false)
                } else {
                    Err(e.into())
                }
            }
        }
    }

    async fn record_migration(conn: &Connection, name: &str) -> Result<()> {
        let query = r#"
            INSERT INTO _migrations (name, applied_at)
            VALUES (?, strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
        "#;
        conn.execute(query, libsql::params![name]).await?;
        Ok(())
    }

    async fn run_migration(conn: &Connection, name: &str, sql: &str) -> Result<()> {
        if Self::is_migration_applied(conn, name).await? {
            tracing::debug!("migration {} already applied, skipping", name);
            return Ok(());
        }

        tracing::info!("applying migration: {}", name);
        conn.execute_batch(sql)
            .await
            .map_err(|e| anyhow::anyhow!("failed to execute migration {name}: {e}"))?;

        Self::record_migration(conn, name).await?;
        Ok(())
    }

    pub async fn new(cfg: &Config, data_dir: &Path) -> Result<Self> {
        let name = cfg.app.get_db();
        if name == IN_MEMORY {
            return Self::open(IN_MEMORY).await;
        }
        let path = data_dir.join(name);
        Self::open(&path.to_string_lossy()).await
    }

    pub async fn in_memory() -> Result<Self> {
        Self::open(IN_MEMORY).await
    }

    async fn open(path: &str) -> Result<Self> {
        tracing::info!("[db] opening local database at {}", path);
        let db = Builder::new_local(path).build().await?;

        let conn = db.connect()?;
        conn.query("SELECT 1", ()).await?;

        for (filename, sql) in SYSTEM_MIGRATIONS.iter().chain(MIGRATIONS) {
            Self::run_migration(&conn, filename, sql).await?;
        }

        Ok(Database {
            _db: db,
            conn,
            write_lock: Mutex::new(()),
            abandoned_tx: AtomicBool::new(false),
        })
    }

    /// Waits for exclusive write access. Every persistence write goes through
    /// the returned gateway, so at most one writer exists at a time.
    /// An uncommitted transaction left behind by a dropped gateway is rolled
    /// back before the next one is handed out.
    pub async fn gateway(&self) -> LibsqlGateway<'_> {
        let guard = self.write_lock.lock().await;
        if self.abandoned_tx.swap(false, Ordering::AcqRel) {
            tracing::warn!("rolling back transaction of a dropped gateway");
            if let Err(e) = self.conn.execute("ROLLBACK", ()).await {
                tracing::error!(error = %e, "failed to roll back abandoned transaction");
            }
        }
        LibsqlGateway {
            conn: &self.conn,
            abandoned_tx: &self.abandoned_tx,
            _guard: guard,
            in_tx: false,
        }
    }
}

pub struct LibsqlGateway<'a> {
    conn: &'a Connection,
    abandoned_tx: &'a AtomicBool,
    _guard: MutexGuard<'a, ()>,
    in_tx: bool,
}

impl Drop for LibsqlGateway<'_> {
    fn drop(&mut self) {
        // runs before the write lock is released
        if self.in_tx {
            self.abandoned_tx.store(true, Ordering::Release);
        }
    }
}

impl LibsqlGateway<'_> {
    async fn begin(&mut self) -> Result<(), PersistenceError> {
        if !self.in_tx {
            self.conn.execute("BEGIN", ()).await?;
            self.in_tx = true;
        }
        Ok(())
    }

    pub async fn rollback(&mut self) -> Result<(), PersistenceError> {
        if self.in_tx {
            self.in_tx = false;
            self.conn.execute("ROLLBACK", ()).await?;
        }
        Ok(())
    }

    fn row_to_fields(row: &libsql::Row) -> Result<RecordFields, PersistenceError> {
        Ok(RecordFields {
            group_id: row.get(0)?,
            no: row.get(1)?,
            image_file: row.get(2)?,
            image_html: row.get(3)?,
            sort_key: row.get(4)?,
            title: row.get(5)?,
            explanation: row.get(6)?,
            mask_label: row.get(7)?,
            internal: row.get(8)?,
        })
    }
}

impl PersistenceGateway for LibsqlGateway<'_> {
    async fn find_by_group(&mut self, group: &GroupId) -> Result<Vec<RecordRef>, PersistenceError> {
        let query = "SELECT id FROM records WHERE group_id = ? ORDER BY id";
        let mut rows = self
            .conn
            .query(query, libsql::params![group.as_str().to_string()])
            .await?;

        let mut refs = Vec::new();
        while let Some(row) = rows.next().await? {
            refs.push(RecordRef(row.get::<i64>(0)?));
        }
        Ok(refs)
    }

    async fn read(&mut self, record: RecordRef) -> Result<RecordFields, PersistenceError> {
        let query = r#"
            SELECT group_id, no, image_file, image_html, sort_key, title, explanation, mask_label, internal
            FROM records WHERE id = ?
        "#;
        let mut rows = self.conn.query(query, libsql::params![record.0]).await?;

        match rows.next().await? {
            Some(row) => Self::row_to_fields(&row),
            None => Err(PersistenceError::NotFound(record)),
        }
    }

    async fn create(&mut self, group: &GroupId) -> Result<RecordRef, PersistenceError> {
        self.begin().await?;
        let query = "INSERT INTO records (group_id) VALUES (?) RETURNING id";
        let mut rows = self
            .conn
            .query(query, libsql::params![group.as_str().to_string()])
            .await?;

        match rows.next().await? {
            Some(row) => Ok(RecordRef(row.get::<i64>(0)?)),
            None => Err(PersistenceError::Other(format!("insert into group {} returned no id", group))),
        }
    }

    async fn write(&mut self, record: RecordRef, fields: &RecordFields) -> Result<(), PersistenceError> {
        self.begin().await?;
        let query = r#"
            UPDATE records SET
                group_id = ?, no = ?, image_file = ?, image_html = ?, sort_key = ?,
                title = ?, explanation = ?, mask_label = ?, internal = ?,
                updated_at = strftime('%Y-%m-%dT%H:%M:%fZ', 'now')
            WHERE id = ?
        "#;
        let changed = self
            .conn
            .execute(
                query,
                libsql::params![
                    fields.group_id.clone(),
                    fields.no.clone(),
                    fields.image_file.clone(),
                    fields.image_html.clone(),
                    fields.sort_key.clone(),
                    fields.title.clone(),
                    fields.explanation.clone(),
                    fields.mask_label.clone(),
                    fields.internal.clone(),
                    record.0
                ],
            )
            .await?;

        if changed == 0 {
            return Err(PersistenceError::NotFound(record));
        }
        Ok(())
    }

    async fn delete(&mut self, records: &[RecordRef]) -> Result<(), PersistenceError> {
        self.begin().await?;
        for record in records {
            self.conn
                .execute("DELETE FROM records WHERE id = ?", libsql::params![record.0])
                .await?;
        }
        Ok(())
    }

    async fn commit(&mut self) -> Result<(), PersistenceError> {
        if !self.in_tx {
            return Ok(());
        }
        if let Err(e) = self.conn.execute("COMMIT", ()).await {
            tracing::error!(error = %e, "commit failed, rolling back");
            if let Err(rb) = self.rollback().await {
                tracing::warn!(error = %rb, "rollback failed");
            }
            return Err(e.into());
        }
        self.in_tx = false;
        Ok(())
    }
}
