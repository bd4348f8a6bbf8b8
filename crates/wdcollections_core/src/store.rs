use std::collections::{BTreeSet, HashMap};
use std::fs;
use std::path::Path;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result, bail};
use rusqlite::{Connection, OptionalExtension, Params, params};
use serde::Serialize;
use tracing::{debug, info};

use crate::entity::EntityId;
use crate::registry::property_column;

pub const DEFAULT_COMMIT_EVERY: usize = 50;

/// Tables shared by every collection in one database.
pub const RESERVED_TABLES: &[&str] = &["interwiki", "harvested", "labels"];

const SHARED_SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS interwiki (
    item_id INTEGER NOT NULL,
    site TEXT NOT NULL,
    title TEXT NOT NULL,
    last_harvested_unix INTEGER,
    errors TEXT NOT NULL DEFAULT '',
    PRIMARY KEY (item_id, site)
);
CREATE INDEX IF NOT EXISTS idx_interwiki_site ON interwiki(site);

CREATE TABLE IF NOT EXISTS harvested (
    item_id INTEGER NOT NULL,
    source TEXT NOT NULL,
    harvested_at_unix INTEGER,
    PRIMARY KEY (item_id, source)
);

CREATE TABLE IF NOT EXISTS labels (
    item_id INTEGER NOT NULL,
    lang TEXT NOT NULL,
    label TEXT,
    description TEXT,
    PRIMARY KEY (item_id, lang)
);
"#;

#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct StoreCounts {
    pub items: usize,
    pub outdated_items: usize,
    pub interwiki_links: usize,
    pub unharvested_links: usize,
    pub harvested_rows: usize,
    pub labels: usize,
}

/// One harvested value waiting to be written back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagedValue {
    pub item: EntityId,
    pub source: String,
    pub property: u32,
    pub value: String,
}

/// Single SQLite connection for one collection. Writes run inside a lazily opened
/// transaction that is committed every `commit_every` writes and on `flush`.
pub struct Store {
    connection: Connection,
    table: String,
    properties: Vec<u32>,
    commit_every: usize,
    pending_writes: usize,
    write_count: usize,
    in_transaction: bool,
}

impl Store {
    pub fn open(
        db_path: &Path,
        table: &str,
        properties: &[u32],
        commit_every: usize,
    ) -> Result<Self> {
        if !is_valid_table_name(table) {
            bail!("invalid collection table name: {table}");
        }
        if let Some(parent) = db_path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("failed to create database parent directory {}", parent.display())
            })?;
        }
        let connection = open_connection(db_path)?;
        let mut store = Self {
            connection,
            table: table.to_string(),
            properties: properties.iter().copied().collect::<BTreeSet<_>>().into_iter().collect(),
            commit_every: commit_every.max(1),
            pending_writes: 0,
            write_count: 0,
            in_transaction: false,
        };
        store.initialize_schema()?;
        Ok(store)
    }

    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn properties(&self) -> &[u32] {
        &self.properties
    }

    /// Total write statements executed since the store was opened.
    pub fn write_count(&self) -> usize {
        self.write_count
    }

    fn initialize_schema(&mut self) -> Result<()> {
        self.connection
            .execute_batch(&format!(
                "CREATE TABLE IF NOT EXISTS \"{}\" (
                    item_id INTEGER PRIMARY KEY,
                    last_modified TEXT
                );",
                self.table
            ))
            .with_context(|| format!("failed to create collection table {}", self.table))?;
        self.connection
            .execute_batch(SHARED_SCHEMA_SQL)
            .context("failed to initialize shared schema")?;

        let table = self.table.clone();
        let added = ensure_property_columns(&self.connection, &table, &self.properties)?
            + ensure_property_columns(&self.connection, "harvested", &self.properties)?;
        if added > 0 {
            info!(table = %table, added, "added missing property columns");
        }
        Ok(())
    }

    /// Execute one write statement inside the batch transaction.
    pub fn write<P: Params>(&mut self, sql: &str, params: P) -> Result<usize> {
        if !self.in_transaction {
            self.connection
                .execute_batch("BEGIN")
                .context("failed to open write transaction")?;
            self.in_transaction = true;
        }
        let changed = self.connection.execute(sql, params)?;
        self.write_count += 1;
        self.pending_writes += 1;
        if self.pending_writes >= self.commit_every {
            self.flush()?;
        }
        Ok(changed)
    }

    /// Commit the open transaction, if any.
    pub fn flush(&mut self) -> Result<()> {
        if !self.in_transaction {
            return Ok(());
        }
        self.connection
            .execute_batch("COMMIT")
            .context("failed to commit write transaction")?;
        debug!(writes = self.pending_writes, "committed batch");
        self.in_transaction = false;
        self.pending_writes = 0;
        Ok(())
    }

    pub fn last_modified_map(&self) -> Result<HashMap<EntityId, Option<String>>> {
        let mut statement = self
            .connection
            .prepare(&format!("SELECT item_id, last_modified FROM \"{}\"", self.table))
            .context("failed to prepare last_modified query")?;
        let rows = statement
            .query_map([], |row| Ok((row.get::<_, i64>(0)?, row.get::<_, Option<String>>(1)?)))
            .context("failed to run last_modified query")?;
        let mut out = HashMap::new();
        for row in rows {
            let (item_id, modified) = row.context("failed to decode last_modified row")?;
            if let Some(item) = EntityId::from_sql(item_id) {
                out.insert(item, modified);
            }
        }
        Ok(out)
    }

    pub fn contains_item(&self, item: EntityId) -> Result<bool> {
        let exists: i64 = self
            .connection
            .query_row(
                &format!("SELECT EXISTS(SELECT 1 FROM \"{}\" WHERE item_id = ?1)", self.table),
                [item.as_sql()],
                |row| row.get(0),
            )
            .with_context(|| format!("failed to look up {item}"))?;
        Ok(exists == 1)
    }

    pub fn upsert_item(&mut self, item: EntityId, last_modified: Option<&str>) -> Result<()> {
        let sql = format!(
            "INSERT INTO \"{}\" (item_id, last_modified) VALUES (?1, ?2)
            ON CONFLICT(item_id) DO UPDATE SET last_modified = excluded.last_modified",
            self.table
        );
        self.write(&sql, params![item.as_sql(), last_modified])
            .with_context(|| format!("failed to upsert {item}"))?;
        Ok(())
    }

    pub fn set_item_value(
        &mut self,
        item: EntityId,
        property: u32,
        value: Option<&str>,
    ) -> Result<()> {
        let sql = format!(
            "UPDATE \"{}\" SET \"{}\" = ?1 WHERE item_id = ?2",
            self.table,
            property_column(property)
        );
        self.write(&sql, params![value, item.as_sql()])
            .with_context(|| format!("failed to write P{property} of {item}"))?;
        Ok(())
    }

    pub fn item_value(&self, item: EntityId, property: u32) -> Result<Option<String>> {
        let sql = format!(
            "SELECT \"{}\" FROM \"{}\" WHERE item_id = ?1",
            property_column(property),
            self.table
        );
        let value = self
            .connection
            .query_row(&sql, [item.as_sql()], |row| row.get::<_, Option<String>>(0))
            .optional()
            .with_context(|| format!("failed to read P{property} of {item}"))?;
        Ok(value.flatten())
    }

    /// Properties among `properties` whose local cell already holds a value.
    pub fn filled_properties(&self, item: EntityId, properties: &[u32]) -> Result<BTreeSet<u32>> {
        let mut filled = BTreeSet::new();
        for property in properties {
            if self.item_value(item, *property)?.is_some() {
                filled.insert(*property);
            }
        }
        Ok(filled)
    }

    pub fn mark_outdated(&mut self, item: EntityId) -> Result<()> {
        let sql = format!(
            "UPDATE \"{}\" SET last_modified = NULL WHERE item_id = ?1",
            self.table
        );
        self.write(&sql, [item.as_sql()])
            .with_context(|| format!("failed to mark {item} outdated"))?;
        Ok(())
    }

    pub fn outdated_items(&self) -> Result<Vec<EntityId>> {
        let mut statement = self
            .connection
            .prepare(&format!(
                "SELECT item_id FROM \"{}\" WHERE last_modified IS NULL ORDER BY item_id",
                self.table
            ))
            .context("failed to prepare outdated query")?;
        let rows = statement
            .query_map([], |row| row.get::<_, i64>(0))
            .context("failed to run outdated query")?;
        let mut out = Vec::new();
        for row in rows {
            if let Some(item) = EntityId::from_sql(row.context("failed to decode outdated row")?) {
                out.push(item);
            }
        }
        Ok(out)
    }

    /// Move every row keyed by `from` onto `to` after an identity redirect.
    pub fn rename_item(&mut self, from: EntityId, to: EntityId) -> Result<()> {
        let table_sql = format!("UPDATE \"{}\" SET item_id = ?1 WHERE item_id = ?2", self.table);
        self.write(&table_sql, params![to.as_sql(), from.as_sql()])
            .with_context(|| format!("failed to rename {from} to {to}"))?;
        for shared in RESERVED_TABLES {
            let sql = format!("UPDATE OR IGNORE {shared} SET item_id = ?1 WHERE item_id = ?2");
            self.write(&sql, params![to.as_sql(), from.as_sql()])
                .with_context(|| format!("failed to move {shared} rows of {from} to {to}"))?;
            let sql = format!("DELETE FROM {shared} WHERE item_id = ?1");
            self.write(&sql, [from.as_sql()])
                .with_context(|| format!("failed to drop leftover {shared} rows of {from}"))?;
        }
        Ok(())
    }

    /// Drop `item` from the collection and from every shared table.
    pub fn delete_item(&mut self, item: EntityId) -> Result<()> {
        let sql = format!("DELETE FROM \"{}\" WHERE item_id = ?1", self.table);
        self.write(&sql, [item.as_sql()])
            .with_context(|| format!("failed to delete {item}"))?;
        for shared in RESERVED_TABLES {
            let sql = format!("DELETE FROM {shared} WHERE item_id = ?1");
            self.write(&sql, [item.as_sql()])
                .with_context(|| format!("failed to drop {shared} rows of {item}"))?;
        }
        Ok(())
    }

    /// Insert or overwrite a site link. A changed title resets the harvest state so the
    /// new page gets harvested.
    pub fn upsert_interwiki(&mut self, item: EntityId, site: &str, title: &str) -> Result<()> {
        self.write(
            "INSERT INTO interwiki (item_id, site, title, last_harvested_unix, errors)
            VALUES (?1, ?2, ?3, NULL, '')
            ON CONFLICT(item_id, site) DO UPDATE SET
                last_harvested_unix = CASE WHEN interwiki.title = excluded.title
                    THEN interwiki.last_harvested_unix ELSE NULL END,
                errors = CASE WHEN interwiki.title = excluded.title
                    THEN interwiki.errors ELSE '' END,
                title = excluded.title",
            params![item.as_sql(), site, title],
        )
        .with_context(|| format!("failed to upsert {site} link of {item}"))?;
        Ok(())
    }

    pub fn interwiki_title(&self, item: EntityId, site: &str) -> Result<Option<String>> {
        self.connection
            .query_row(
                "SELECT title FROM interwiki WHERE item_id = ?1 AND site = ?2",
                params![item.as_sql(), site],
                |row| row.get(0),
            )
            .optional()
            .with_context(|| format!("failed to read {site} link of {item}"))
    }

    pub fn record_harvest_attempt(
        &mut self,
        item: EntityId,
        site: &str,
        harvested_at_unix: u64,
        errors: &str,
    ) -> Result<()> {
        self.write(
            "UPDATE interwiki SET last_harvested_unix = ?1, errors = ?2
            WHERE item_id = ?3 AND site = ?4",
            params![to_sql_time(harvested_at_unix)?, errors, item.as_sql(), site],
        )
        .with_context(|| format!("failed to record harvest of {site} page for {item}"))?;
        Ok(())
    }

    pub fn upsert_label(
        &mut self,
        item: EntityId,
        lang: &str,
        label: Option<&str>,
        description: Option<&str>,
    ) -> Result<()> {
        self.write(
            "INSERT INTO labels (item_id, lang, label, description) VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT(item_id, lang) DO UPDATE SET
                label = excluded.label,
                description = excluded.description",
            params![item.as_sql(), lang, label, description],
        )
        .with_context(|| format!("failed to upsert {lang} label of {item}"))?;
        Ok(())
    }

    pub fn stage_harvested(
        &mut self,
        item: EntityId,
        source: &str,
        property: u32,
        value: &str,
        harvested_at_unix: u64,
    ) -> Result<()> {
        self.write(
            "INSERT OR IGNORE INTO harvested (item_id, source) VALUES (?1, ?2)",
            params![item.as_sql(), source],
        )
        .with_context(|| format!("failed to create harvested row for {item} from {source}"))?;
        let sql = format!(
            "UPDATE harvested SET \"{}\" = ?1, harvested_at_unix = ?2
            WHERE item_id = ?3 AND source = ?4",
            property_column(property)
        );
        self.write(
            &sql,
            params![value, to_sql_time(harvested_at_unix)?, item.as_sql(), source],
        )
        .with_context(|| format!("failed to stage P{property} of {item} from {source}"))?;
        Ok(())
    }

    pub fn harvested_value(
        &self,
        item: EntityId,
        source: &str,
        property: u32,
    ) -> Result<Option<String>> {
        let sql = format!(
            "SELECT \"{}\" FROM harvested WHERE item_id = ?1 AND source = ?2",
            property_column(property)
        );
        let value = self
            .connection
            .query_row(&sql, params![item.as_sql(), source], |row| {
                row.get::<_, Option<String>>(0)
            })
            .optional()
            .with_context(|| format!("failed to read staged P{property} of {item}"))?;
        Ok(value.flatten())
    }

    pub fn clear_harvested(&mut self, item: EntityId, source: &str, property: u32) -> Result<()> {
        let sql = format!(
            "UPDATE harvested SET \"{}\" = NULL WHERE item_id = ?1 AND source = ?2",
            property_column(property)
        );
        self.write(&sql, params![item.as_sql(), source])
            .with_context(|| format!("failed to clear staged P{property} of {item}"))?;
        Ok(())
    }

    /// Items linked to a page on `site` that still miss one of `properties` and were not
    /// harvested since `harvested_before_unix`.
    pub fn harvest_candidates(
        &self,
        site: &str,
        properties: &[u32],
        harvested_before_unix: u64,
        limit: Option<usize>,
    ) -> Result<Vec<(EntityId, String)>> {
        if properties.is_empty() {
            return Ok(Vec::new());
        }
        let missing = properties
            .iter()
            .map(|property| format!("c.\"{}\" IS NULL", property_column(*property)))
            .collect::<Vec<_>>()
            .join(" OR ");
        let mut sql = format!(
            "SELECT i.item_id, i.title FROM interwiki i
            JOIN \"{}\" c ON c.item_id = i.item_id
            WHERE i.site = ?1
              AND (i.last_harvested_unix IS NULL OR i.last_harvested_unix < ?2)
              AND ({missing})
            ORDER BY i.item_id",
            self.table
        );
        if let Some(limit) = limit {
            sql.push_str(&format!(" LIMIT {limit}"));
        }
        let mut statement = self
            .connection
            .prepare(&sql)
            .context("failed to prepare harvest selection")?;
        let rows = statement
            .query_map(params![site, to_sql_time(harvested_before_unix)?], |row| {
                Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?))
            })
            .context("failed to run harvest selection")?;
        let mut out = Vec::new();
        for row in rows {
            let (item_id, title) = row.context("failed to decode harvest selection row")?;
            if let Some(item) = EntityId::from_sql(item_id) {
                out.push((item, title));
            }
        }
        Ok(out)
    }

    pub fn harvest_errors(&self, item: EntityId, site: &str) -> Result<Option<String>> {
        self.connection
            .query_row(
                "SELECT errors FROM interwiki WHERE item_id = ?1 AND site = ?2",
                params![item.as_sql(), site],
                |row| row.get(0),
            )
            .optional()
            .with_context(|| format!("failed to read harvest errors of {item} on {site}"))
    }

    /// Staged values of `property` whose canonical cell is still empty.
    pub fn staged_candidates(
        &self,
        property: u32,
        limit: Option<usize>,
    ) -> Result<Vec<StagedValue>> {
        let column = property_column(property);
        let mut sql = format!(
            "SELECT h.item_id, h.source, h.\"{column}\" FROM harvested h
            JOIN \"{}\" c ON c.item_id = h.item_id
            WHERE h.\"{column}\" IS NOT NULL AND c.\"{column}\" IS NULL
            ORDER BY h.item_id, h.source",
            self.table
        );
        if let Some(limit) = limit {
            sql.push_str(&format!(" LIMIT {limit}"));
        }
        let mut statement = self
            .connection
            .prepare(&sql)
            .with_context(|| format!("failed to prepare staged P{property} query"))?;
        let rows = statement
            .query_map([], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                ))
            })
            .with_context(|| format!("failed to run staged P{property} query"))?;
        let mut out = Vec::new();
        for row in rows {
            let (item_id, source, value) =
                row.with_context(|| format!("failed to decode staged P{property} row"))?;
            if let Some(item) = EntityId::from_sql(item_id) {
                out.push(StagedValue {
                    item,
                    source,
                    property,
                    value,
                });
            }
        }
        Ok(out)
    }

    /// Depot links of items whose canonical `property` cell is empty.
    pub fn depot_links_missing(
        &self,
        site: &str,
        property: u32,
    ) -> Result<Vec<(EntityId, String)>> {
        let sql = format!(
            "SELECT i.item_id, i.title FROM interwiki i
            JOIN \"{}\" c ON c.item_id = i.item_id
            WHERE i.site = ?1 AND c.\"{}\" IS NULL
            ORDER BY i.item_id",
            self.table,
            property_column(property)
        );
        let mut statement = self
            .connection
            .prepare(&sql)
            .context("failed to prepare depot link query")?;
        let rows = statement
            .query_map([site], |row| Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?)))
            .context("failed to run depot link query")?;
        let mut out = Vec::new();
        for row in rows {
            let (item_id, title) = row.context("failed to decode depot link row")?;
            if let Some(item) = EntityId::from_sql(item_id) {
                out.push((item, title));
            }
        }
        Ok(out)
    }

    pub fn counts(&self) -> Result<StoreCounts> {
        let count = |sql: String| -> Result<usize> {
            let value: i64 = self
                .connection
                .query_row(&sql, [], |row| row.get(0))
                .with_context(|| format!("failed to run count query: {sql}"))?;
            usize::try_from(value).context("negative row count")
        };
        let table = &self.table;
        Ok(StoreCounts {
            items: count(format!("SELECT COUNT(*) FROM \"{table}\""))?,
            outdated_items: count(format!(
                "SELECT COUNT(*) FROM \"{table}\" WHERE last_modified IS NULL"
            ))?,
            interwiki_links: count(format!(
                "SELECT COUNT(*) FROM interwiki JOIN \"{table}\" USING (item_id)"
            ))?,
            unharvested_links: count(format!(
                "SELECT COUNT(*) FROM interwiki JOIN \"{table}\" USING (item_id)
                WHERE interwiki.last_harvested_unix IS NULL"
            ))?,
            harvested_rows: count(format!(
                "SELECT COUNT(*) FROM harvested JOIN \"{table}\" USING (item_id)"
            ))?,
            labels: count(format!(
                "SELECT COUNT(*) FROM labels JOIN \"{table}\" USING (item_id)"
            ))?,
        })
    }
}

impl Drop for Store {
    fn drop(&mut self) {
        let _ = self.flush();
    }
}

/// Collection table names are restricted to `[a-z0-9_]`, must not start with a digit
/// and must not collide with the shared tables.
pub fn is_valid_table_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .bytes()
            .all(|byte| byte.is_ascii_lowercase() || byte.is_ascii_digit() || byte == b'_')
        && !name.as_bytes()[0].is_ascii_digit()
        && !name.starts_with("sqlite_")
        && !RESERVED_TABLES.contains(&name)
}

pub fn unix_timestamp() -> Result<u64> {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .context("system clock is before UNIX_EPOCH")
        .map(|duration| duration.as_secs())
}

fn to_sql_time(value: u64) -> Result<i64> {
    i64::try_from(value).context("timestamp does not fit into i64")
}

fn open_connection(db_path: &Path) -> Result<Connection> {
    let connection = Connection::open(db_path)
        .with_context(|| format!("failed to open {}", db_path.display()))?;
    connection
        .busy_timeout(Duration::from_secs(5))
        .context("failed to set sqlite busy timeout")?;
    connection
        .pragma_update(None, "journal_mode", "WAL")
        .context("failed to enable WAL journal mode")?;
    Ok(connection)
}

fn table_columns(connection: &Connection, table: &str) -> Result<BTreeSet<String>> {
    let mut statement = connection
        .prepare(&format!("PRAGMA table_info(\"{table}\")"))
        .with_context(|| format!("failed to inspect columns of {table}"))?;
    let rows = statement
        .query_map([], |row| row.get::<_, String>(1))
        .with_context(|| format!("failed to read columns of {table}"))?;
    let mut out = BTreeSet::new();
    for row in rows {
        out.insert(row.with_context(|| format!("failed to decode column of {table}"))?);
    }
    Ok(out)
}

/// Add a nullable `P<n> TEXT` column for each property the table lacks. Existing
/// columns are never dropped or altered.
fn ensure_property_columns(
    connection: &Connection,
    table: &str,
    properties: &[u32],
) -> Result<usize> {
    let existing = table_columns(connection, table)?;
    let mut added = 0;
    for property in properties {
        let column = property_column(*property);
        if existing.contains(&column) {
            continue;
        }
        connection
            .execute_batch(&format!("ALTER TABLE \"{table}\" ADD COLUMN \"{column}\" TEXT"))
            .with_context(|| format!("failed to add column {column} to {table}"))?;
        added += 1;
    }
    Ok(added)
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::{RESERVED_TABLES, Store, is_valid_table_name, table_columns};
    use crate::entity::EntityId;

    #[test]
    fn open_creates_tables_and_missing_property_columns() {
        let temp = tempdir().expect("tempdir");
        let db_path = temp.path().join("data").join("collections.db");
        {
            let store = Store::open(&db_path, "churches", &[373], 50).expect("open");
            let columns = table_columns(store.connection(), "churches").expect("columns");
            assert!(columns.contains("P373"));
            assert!(!columns.contains("P625"));
        }

        let store = Store::open(&db_path, "churches", &[373, 625], 50).expect("reopen");
        let columns = table_columns(store.connection(), "churches").expect("columns");
        assert!(columns.contains("P373"));
        assert!(columns.contains("P625"));
        let harvested = table_columns(store.connection(), "harvested").expect("columns");
        assert!(harvested.contains("P625"));
    }

    #[test]
    fn writes_are_committed_in_batches_and_on_flush() {
        let temp = tempdir().expect("tempdir");
        let db_path = temp.path().join("collections.db");
        let mut store = Store::open(&db_path, "churches", &[373], 2).expect("open");
        store.upsert_item(EntityId(1), Some("2024-01-01T00:00:00Z")).expect("upsert");
        assert!(store.in_transaction);
        store.upsert_item(EntityId(2), None).expect("upsert");
        assert!(!store.in_transaction);
        store.upsert_item(EntityId(3), None).expect("upsert");
        store.flush().expect("flush");
        assert!(!store.in_transaction);
        assert_eq!(store.write_count(), 3);
        assert_eq!(store.outdated_items().expect("outdated"), vec![EntityId(2), EntityId(3)]);
    }

    #[test]
    fn interwiki_title_change_resets_harvest_state() {
        let temp = tempdir().expect("tempdir");
        let mut store =
            Store::open(&temp.path().join("collections.db"), "churches", &[373], 50).expect("open");
        let item = EntityId(42);
        store.upsert_item(item, None).expect("upsert item");
        store.upsert_interwiki(item, "frwiki", "Foo").expect("link");
        store.record_harvest_attempt(item, "frwiki", 100, "oops").expect("attempt");

        store.upsert_interwiki(item, "frwiki", "Foo").expect("same title");
        let state: (Option<i64>, String) = store
            .connection()
            .query_row(
                "SELECT last_harvested_unix, errors FROM interwiki WHERE item_id = 42",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .expect("state");
        assert_eq!(state, (Some(100), "oops".to_string()));

        store.upsert_interwiki(item, "frwiki", "Bar").expect("new title");
        let state: (String, Option<i64>, String) = store
            .connection()
            .query_row(
                "SELECT title, last_harvested_unix, errors FROM interwiki WHERE item_id = 42",
                [],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .expect("state");
        assert_eq!(state, ("Bar".to_string(), None, String::new()));
    }

    #[test]
    fn staged_values_are_inserted_once_then_updated_and_cleared() {
        let temp = tempdir().expect("tempdir");
        let mut store =
            Store::open(&temp.path().join("collections.db"), "churches", &[373, 625], 50)
                .expect("open");
        let item = EntityId(42);
        store.stage_harvested(item, "frwiki", 373, "Foo", 10).expect("stage");
        store.stage_harvested(item, "frwiki", 625, "1.00000|2.00000|0", 11).expect("stage");
        assert_eq!(
            store.harvested_value(item, "frwiki", 373).expect("read"),
            Some("Foo".to_string())
        );
        store.clear_harvested(item, "frwiki", 373).expect("clear");
        assert_eq!(store.harvested_value(item, "frwiki", 373).expect("read"), None);
        assert_eq!(
            store.harvested_value(item, "frwiki", 625).expect("read").as_deref(),
            Some("1.00000|2.00000|0")
        );
    }

    #[test]
    fn rename_moves_shared_rows_to_the_new_identity() {
        let temp = tempdir().expect("tempdir");
        let mut store =
            Store::open(&temp.path().join("collections.db"), "churches", &[373], 50).expect("open");
        store.upsert_item(EntityId(1), None).expect("upsert");
        store.upsert_interwiki(EntityId(1), "frwiki", "Foo").expect("link");
        store.rename_item(EntityId(1), EntityId(2)).expect("rename");
        assert!(!store.contains_item(EntityId(1)).expect("old"));
        assert!(store.contains_item(EntityId(2)).expect("new"));
        assert_eq!(
            store.interwiki_title(EntityId(2), "frwiki").expect("title").as_deref(),
            Some("Foo")
        );
    }

    #[test]
    fn delete_leaves_no_shared_rows_behind() {
        let temp = tempdir().expect("tempdir");
        let mut store =
            Store::open(&temp.path().join("collections.db"), "churches", &[373], 50).expect("open");
        store.upsert_item(EntityId(1), None).expect("upsert");
        store.upsert_item(EntityId(2), None).expect("upsert");
        for item in [EntityId(1), EntityId(2)] {
            store.upsert_interwiki(item, "frwiki", "Foo").expect("link");
            store.upsert_label(item, "fr", Some("Foo"), None).expect("label");
            store.stage_harvested(item, "frwiki", 373, "Foo", 1).expect("stage");
        }
        store.delete_item(EntityId(1)).expect("delete");
        store.flush().expect("flush");

        assert!(!store.contains_item(EntityId(1)).expect("deleted"));
        for shared in RESERVED_TABLES {
            let rows = |item: EntityId| -> i64 {
                store
                    .connection
                    .query_row(
                        &format!("SELECT COUNT(*) FROM {shared} WHERE item_id = ?1"),
                        [item.as_sql()],
                        |row| row.get(0),
                    )
                    .expect("count")
            };
            assert_eq!(rows(EntityId(1)), 0, "{shared} rows of the deleted item");
            assert_eq!(rows(EntityId(2)), 1, "{shared} rows of the kept item");
        }
    }

    #[test]
    fn table_names_are_restricted() {
        assert!(is_valid_table_name("churches"));
        assert!(is_valid_table_name("fr_monuments_2"));
        assert!(!is_valid_table_name("Churches"));
        assert!(!is_valid_table_name("1church"));
        assert!(!is_valid_table_name("drop table;"));
        assert!(!is_valid_table_name("interwiki"));
        assert!(!is_valid_table_name(""));
    }
}
