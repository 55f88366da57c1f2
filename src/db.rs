//! Row/table control plane (SPEC_FULL §4.11): `Database` owns a set of
//! `Table`s, each backed by its own [`MiniLsm`] engine plus whatever
//! secondary and fulltext indexes were created on it. DDL is
//! synchronous and serialized to `<db>.meta` after every change;
//! `Database` also implements [`Engine`]/[`Catalog`] so the query layer
//! can run SQL against it without knowing any of this.

use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::error::{Result, SerengetiError};
use crate::fulltext::InvertedIndex;
use crate::lsm_storage::{LsmStorageOptions, MiniLsm};
use crate::query::ast::{CompareOp, DdlStatement, IndexKind};
use crate::query::executor::{Engine, Row};
use crate::query::planner::Catalog;
use crate::value::Value;

/// `Value` isn't `Ord` (cross-variant comparisons only make sense with
/// a fallback rank), but a sorted secondary index needs a key type
/// that is. This wraps `Value`'s own `PartialOrd` impl, which is total
/// in practice thanks to that fallback.
#[derive(Debug, Clone, PartialEq)]
struct OrdValue(Value);

impl Eq for OrdValue {}
impl PartialOrd for OrdValue {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for OrdValue {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.partial_cmp(&other.0).unwrap_or(Ordering::Equal)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct TableMeta {
    name: String,
    indexes: HashMap<String, IndexKind>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct DatabaseMeta {
    name: String,
    tables: Vec<TableMeta>,
}

pub struct Table {
    name: String,
    dir: PathBuf,
    engine: Arc<MiniLsm>,
    /// column -> kind, for every index created on this table.
    index_kinds: RwLock<HashMap<String, IndexKind>>,
    btree_indexes: RwLock<HashMap<String, BTreeMap<OrdValue, Vec<Uuid>>>>,
    fulltext_indexes: RwLock<HashMap<String, InvertedIndex>>,
}

impl Table {
    fn open(dir: PathBuf, meta: TableMeta, options: LsmStorageOptions) -> Result<Self> {
        fs::create_dir_all(&dir)?;
        fs::create_dir_all(dir.join("fulltext"))?;
        let engine = MiniLsm::open(dir.join("data"), options)?;

        let mut btree_indexes = HashMap::new();
        let mut fulltext_indexes = HashMap::new();
        for (column, kind) in &meta.indexes {
            match kind {
                IndexKind::BTree => {
                    btree_indexes.insert(column.clone(), BTreeMap::new());
                }
                IndexKind::Fulltext => {
                    let path = fulltext_path(&dir, column);
                    let idx = if path.exists() { InvertedIndex::load(&path)? } else { InvertedIndex::new() };
                    fulltext_indexes.insert(column.clone(), idx);
                }
            }
        }

        let table = Self {
            name: meta.name,
            dir,
            engine,
            index_kinds: RwLock::new(meta.indexes),
            btree_indexes: RwLock::new(btree_indexes),
            fulltext_indexes: RwLock::new(fulltext_indexes),
        };
        table.rebuild_indexes()?;
        Ok(table)
    }

    /// Secondary indexes are kept in memory only (besides the fulltext
    /// index, which persists to its own file); rebuild them from the
    /// LSM engine's current rows on open.
    fn rebuild_indexes(&self) -> Result<()> {
        let needs_btree = !self.btree_indexes.read().unwrap().is_empty();
        if !needs_btree {
            return Ok(());
        }
        for row in self.scan_rows()? {
            let mut indexes = self.btree_indexes.write().unwrap();
            for (column, index) in indexes.iter_mut() {
                if let Some(v) = row.columns.get(column) {
                    index.entry(OrdValue(v.clone())).or_default().push(row.id);
                }
            }
        }
        Ok(())
    }

    fn scan_rows(&self) -> Result<Vec<Row>> {
        let mut rows = Vec::new();
        let mut iter = self.engine.scan(std::ops::Bound::Unbounded, std::ops::Bound::Unbounded)?;
        use crate::iterators::StorageIterator;
        while iter.is_valid() {
            let columns: BTreeMap<String, Value> = bincode::deserialize(iter.value())
                .map_err(|e| SerengetiError::CorruptData(e.to_string()))?;
            let id = Uuid::from_slice(iter.key().raw_ref())
                .map_err(|e| SerengetiError::CorruptData(e.to_string()))?;
            rows.push(Row { id, columns });
            iter.next().map_err(|e| SerengetiError::CorruptData(e.to_string()))?;
        }
        Ok(rows)
    }

    fn fetch_row(&self, id: Uuid) -> Result<Option<Row>> {
        let bytes = self.engine.get(id.as_bytes())?;
        match bytes {
            None => Ok(None),
            Some(bytes) => {
                let columns: BTreeMap<String, Value> =
                    bincode::deserialize(&bytes).map_err(|e| SerengetiError::CorruptData(e.to_string()))?;
                Ok(Some(Row { id, columns }))
            }
        }
    }

    fn put_row(&self, row: &Row) -> Result<()> {
        let bytes =
            bincode::serialize(&row.columns).map_err(|e| SerengetiError::CorruptData(e.to_string()))?;
        self.engine.put(row.id.as_bytes(), &bytes)?;
        self.index_row(row);
        Ok(())
    }

    fn index_row(&self, row: &Row) {
        let mut btree = self.btree_indexes.write().unwrap();
        for (column, index) in btree.iter_mut() {
            if let Some(v) = row.columns.get(column) {
                index.entry(OrdValue(v.clone())).or_default().push(row.id);
            }
        }
        drop(btree);
        let mut fulltext = self.fulltext_indexes.write().unwrap();
        for (column, index) in fulltext.iter_mut() {
            if let Some(text) = row.columns.get(column).and_then(|v| v.as_str()) {
                index.index(row.id, text);
            }
        }
    }

    fn deindex_row(&self, row: &Row) {
        let mut btree = self.btree_indexes.write().unwrap();
        for (column, index) in btree.iter_mut() {
            if let Some(v) = row.columns.get(column) {
                if let Some(ids) = index.get_mut(&OrdValue(v.clone())) {
                    ids.retain(|id| *id != row.id);
                }
            }
        }
        drop(btree);
        let mut fulltext = self.fulltext_indexes.write().unwrap();
        for index in fulltext.values_mut() {
            index.delete(row.id);
        }
    }

    fn delete_row(&self, id: Uuid) -> Result<bool> {
        let Some(row) = self.fetch_row(id)? else {
            return Ok(false);
        };
        self.deindex_row(&row);
        self.engine.delete(id.as_bytes())?;
        Ok(true)
    }

    fn create_index(&self, column: &str, kind: IndexKind) -> Result<()> {
        self.index_kinds.write().unwrap().insert(column.to_string(), kind);
        match kind {
            IndexKind::BTree => {
                let mut index = BTreeMap::new();
                for row in self.scan_rows()? {
                    if let Some(v) = row.columns.get(column) {
                        index.entry(OrdValue(v.clone())).or_default().push(row.id);
                    }
                }
                self.btree_indexes.write().unwrap().insert(column.to_string(), index);
            }
            IndexKind::Fulltext => {
                let mut idx = InvertedIndex::new();
                for row in self.scan_rows()? {
                    if let Some(text) = row.columns.get(column).and_then(|v| v.as_str()) {
                        idx.index(row.id, text);
                    }
                }
                idx.save(fulltext_path(&self.dir, column))?;
                self.fulltext_indexes.write().unwrap().insert(column.to_string(), idx);
            }
        }
        Ok(())
    }

    fn drop_index(&self, column: &str) {
        self.index_kinds.write().unwrap().remove(column);
        self.btree_indexes.write().unwrap().remove(column);
        if self.fulltext_indexes.write().unwrap().remove(column).is_some() {
            let _ = fs::remove_file(fulltext_path(&self.dir, column));
        }
    }

    fn meta(&self) -> TableMeta {
        TableMeta { name: self.name.clone(), indexes: self.index_kinds.read().unwrap().clone() }
    }

    fn persist_fulltext(&self) -> Result<()> {
        for (column, index) in self.fulltext_indexes.read().unwrap().iter() {
            index.save(fulltext_path(&self.dir, column))?;
        }
        Ok(())
    }
}

fn fulltext_path(table_dir: &Path, column: &str) -> PathBuf {
    table_dir.join("fulltext").join(format!("{column}.ftidx"))
}

pub struct Database {
    name: String,
    dir: PathBuf,
    options: LsmStorageOptions,
    tables: RwLock<BTreeMap<String, Table>>,
}

impl Database {
    /// Opens (or creates) the database rooted at `data_root/<name>`,
    /// replaying `<name>.meta` if present.
    pub fn open(data_root: impl AsRef<Path>, name: &str, config: &EngineConfig) -> Result<Self> {
        let data_root = data_root.as_ref();
        fs::create_dir_all(data_root)?;
        let meta_path = data_root.join(format!("{name}.meta"));
        let meta = if meta_path.exists() {
            let bytes = fs::read(&meta_path)?;
            serde_json::from_slice(&bytes).map_err(|e| SerengetiError::CorruptData(e.to_string()))?
        } else {
            DatabaseMeta { name: name.to_string(), tables: Vec::new() }
        };

        let options = LsmStorageOptions {
            block_size: config.block_size,
            target_sst_size: config.memtable_max_bytes,
            max_memtable_limit: config.max_immutable,
            compaction_options: config.compaction_options(),
            enable_wal: true,
            wal_sync_mode: config.wal_sync_mode(),
            cache: config.cache_config(),
        };

        let dir = data_root.join(name);
        fs::create_dir_all(&dir)?;
        let mut tables = BTreeMap::new();
        for table_meta in meta.tables {
            let table_dir = dir.join(&table_meta.name);
            let table_name = table_meta.name.clone();
            let table = Table::open(table_dir, table_meta, options.clone())?;
            tables.insert(table_name, table);
        }

        info!(target: "serengeti::db", database = name, "database opened");
        Ok(Self { name: name.to_string(), dir: data_root.to_path_buf(), options, tables: RwLock::new(tables) })
    }

    fn meta_path(&self) -> PathBuf {
        self.dir.join(format!("{}.meta", self.name))
    }

    fn persist_meta(&self) -> Result<()> {
        let tables = self.tables.read().unwrap();
        let meta = DatabaseMeta {
            name: self.name.clone(),
            tables: tables.values().map(Table::meta).collect(),
        };
        let bytes = serde_json::to_vec_pretty(&meta).map_err(|e| SerengetiError::CorruptData(e.to_string()))?;
        fs::write(self.meta_path(), bytes)?;
        Ok(())
    }

    pub fn create_table(&self, name: &str) -> Result<()> {
        let mut tables = self.tables.write().unwrap();
        if tables.contains_key(name) {
            return Err(SerengetiError::AlreadyExists(name.to_string()));
        }
        let meta = TableMeta { name: name.to_string(), indexes: HashMap::new() };
        let table = Table::open(self.dir.join(&self.name).join(name), meta, self.options.clone())?;
        tables.insert(name.to_string(), table);
        drop(tables);
        self.persist_meta()
    }

    pub fn drop_table(&self, name: &str) -> Result<()> {
        let mut tables = self.tables.write().unwrap();
        let Some(table) = tables.remove(name) else {
            return Err(SerengetiError::NotFound(name.to_string()));
        };
        table.engine.close()?;
        let _ = fs::remove_dir_all(&table.dir);
        drop(tables);
        self.persist_meta()
    }

    fn with_table<T>(&self, name: &str, f: impl FnOnce(&Table) -> Result<T>) -> Result<T> {
        let tables = self.tables.read().unwrap();
        let table = tables.get(name).ok_or_else(|| SerengetiError::NotFound(name.to_string()))?;
        f(table)
    }
}

impl Catalog for Database {
    fn index_kind(&self, _database: &str, table: &str, column: &str) -> Option<IndexKind> {
        let tables = self.tables.read().unwrap();
        tables.get(table)?.index_kinds.read().unwrap().get(column).copied()
    }
}

impl Engine for Database {
    fn scan_table(&self, _database: &str, table: &str) -> Result<Vec<Row>> {
        self.with_table(table, |t| t.scan_rows())
    }

    fn fetch_by_index(&self, _database: &str, table: &str, column: &str, value: &Value) -> Result<Vec<Row>> {
        self.with_table(table, |t| {
            let ids: Vec<Uuid> = t
                .btree_indexes
                .read()
                .unwrap()
                .get(column)
                .and_then(|idx| idx.get(&OrdValue(value.clone())))
                .cloned()
                .unwrap_or_default();
            ids.into_iter().filter_map(|id| t.fetch_row(id).transpose()).collect()
        })
    }

    fn fetch_by_range(
        &self,
        _database: &str,
        table: &str,
        column: &str,
        lower: Option<(CompareOp, &Value)>,
        upper: Option<(CompareOp, &Value)>,
    ) -> Result<Vec<Row>> {
        use std::ops::Bound;
        let to_bound = |bound: Option<(CompareOp, &Value)>, included_op: CompareOp| match bound {
            None => Bound::Unbounded,
            Some((op, v)) if op == included_op => Bound::Included(OrdValue(v.clone())),
            Some((_, v)) => Bound::Excluded(OrdValue(v.clone())),
        };
        let lo = to_bound(lower, CompareOp::Ge);
        let hi = to_bound(upper, CompareOp::Le);
        self.with_table(table, |t| {
            let ids: Vec<Uuid> = t
                .btree_indexes
                .read()
                .unwrap()
                .get(column)
                .map(|idx| idx.range((lo, hi)).flat_map(|(_, ids)| ids.iter().copied()).collect())
                .unwrap_or_default();
            ids.into_iter().filter_map(|id| t.fetch_row(id).transpose()).collect()
        })
    }

    fn fulltext_search(&self, _database: &str, table: &str, column: &str, query: &str) -> Result<Vec<(Uuid, f64)>> {
        self.with_table(table, |t| {
            Ok(t.fulltext_indexes
                .read()
                .unwrap()
                .get(column)
                .map(|idx| idx.search(query))
                .unwrap_or_default())
        })
    }

    fn fetch_rows(&self, _database: &str, table: &str, ids: &[Uuid]) -> Result<Vec<Row>> {
        self.with_table(table, |t| ids.iter().filter_map(|id| t.fetch_row(*id).transpose()).collect())
    }

    fn insert_row(&self, _database: &str, table: &str, row: Row) -> Result<()> {
        self.with_table(table, |t| t.put_row(&row))
    }

    fn update_rows(
        &self,
        _database: &str,
        table: &str,
        rows: &[Row],
        assignments: &[(String, Value)],
    ) -> Result<usize> {
        self.with_table(table, |t| {
            for row in rows {
                let mut updated = row.clone();
                for (col, val) in assignments {
                    updated.columns.insert(col.clone(), val.clone());
                }
                t.deindex_row(row);
                t.put_row(&updated)?;
            }
            Ok(rows.len())
        })
    }

    fn delete_rows(&self, _database: &str, table: &str, ids: &[Uuid]) -> Result<usize> {
        self.with_table(table, |t| {
            let mut n = 0;
            for id in ids {
                if t.delete_row(*id)? {
                    n += 1;
                }
            }
            Ok(n)
        })
    }

    fn execute_ddl(&self, stmt: &DdlStatement) -> Result<Vec<Value>> {
        match stmt {
            DdlStatement::CreateDatabase { .. } | DdlStatement::DropDatabase { .. } => {
                // Database lifecycle is managed by the hosting process,
                // which owns the `Database` instances themselves.
                Ok(vec![])
            }
            DdlStatement::CreateTable { table, .. } => {
                self.create_table(table)?;
                Ok(vec![])
            }
            DdlStatement::DropTable { table } => {
                self.drop_table(&table.table)?;
                Ok(vec![])
            }
            DdlStatement::CreateIndex { table, column, kind } => {
                self.with_table(&table.table, |t| t.create_index(column, *kind))?;
                self.persist_meta()?;
                Ok(vec![])
            }
            DdlStatement::DropIndex { table, column } => {
                self.with_table(&table.table, |t| {
                    t.drop_index(column);
                    Ok(())
                })?;
                self.persist_meta()?;
                Ok(vec![])
            }
            DdlStatement::ShowDatabases => Ok(vec![Value::Str(self.name.clone())]),
            DdlStatement::ShowTables { .. } => {
                Ok(self.tables.read().unwrap().keys().map(|k| Value::Str(k.clone())).collect())
            }
            DdlStatement::ShowIndexes { table } => self.with_table(&table.table, |t| {
                Ok(t.index_kinds
                    .read()
                    .unwrap()
                    .keys()
                    .map(|k| Value::Str(k.clone()))
                    .collect())
            }),
        }
    }
}

impl Drop for Database {
    fn drop(&mut self) {
        if let Ok(tables) = self.tables.read() {
            for table in tables.values() {
                let _ = table.persist_fulltext();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::executor::execute;

    fn cfg() -> EngineConfig {
        let mut c = EngineConfig::default();
        c.memtable_max_bytes = 1 << 20;
        c
    }

    #[test]
    fn create_table_insert_select_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open(dir.path(), "mydb", &cfg()).unwrap();
        db.create_table("users").unwrap();

        let resp = execute("INSERT INTO mydb.users (name, age) VALUES ('ann', 30)", &db);
        assert!(resp.executed, "{:?}", resp.error);

        let resp = execute("SELECT name, age FROM mydb.users WHERE age >= 18", &db);
        assert!(resp.executed, "{:?}", resp.error);
        let list = resp.list.unwrap();
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].as_object().unwrap()["name"].as_str(), Some("ann"));
    }

    #[test]
    fn btree_index_serves_equality_lookup() {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open(dir.path(), "mydb", &cfg()).unwrap();
        db.create_table("users").unwrap();
        execute("INSERT INTO mydb.users (id) VALUES (1)", &db);
        execute("INSERT INTO mydb.users (id) VALUES (2)", &db);
        execute("CREATE INDEX ON mydb.users(id)", &db);

        let resp = execute("SELECT id FROM mydb.users WHERE id = 2", &db);
        assert!(resp.executed, "{:?}", resp.error);
        assert_eq!(resp.list.unwrap().len(), 1);
    }

    #[test]
    fn btree_index_serves_range_scan() {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open(dir.path(), "mydb", &cfg()).unwrap();
        db.create_table("users").unwrap();
        execute("CREATE INDEX ON mydb.users(age)", &db);
        for age in [10, 45, 50, 55, 59, 60, 70] {
            execute(&format!("INSERT INTO mydb.users (age) VALUES ({age})"), &db);
        }

        let resp = execute("SELECT age FROM mydb.users WHERE age >= 50 AND age < 60", &db);
        assert!(resp.executed, "{:?}", resp.error);
        let mut ages: Vec<i64> = resp
            .list
            .unwrap()
            .iter()
            .map(|v| v.as_object().unwrap()["age"].as_int().unwrap())
            .collect();
        ages.sort();
        assert_eq!(ages, vec![50, 55, 59]);
    }

    #[test]
    fn delete_removes_row() {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open(dir.path(), "mydb", &cfg()).unwrap();
        db.create_table("users").unwrap();
        execute("INSERT INTO mydb.users (id) VALUES (9)", &db);
        let resp = execute("DELETE FROM mydb.users WHERE id = 9", &db);
        assert!(resp.executed, "{:?}", resp.error);
        let resp = execute("SELECT id FROM mydb.users", &db);
        assert_eq!(resp.list.unwrap().len(), 0);
    }
}
