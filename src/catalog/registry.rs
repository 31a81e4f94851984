//! Table Registry: the catalog of table definitions, persisted
//! as a single descriptor file with temp/bak/current rotation so a
//! crash mid-write never leaves a corrupt catalog — the same rotation
//! shape the storage core's own top-level rename-based commits use.

use crate::master::MasterTable;
use crate::types::DataTableDef;
use crate::{Result, StorageError};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::Arc;

type TableKey = (String, String);

fn key_of(schema: &str, name: &str) -> TableKey {
    (schema.to_string(), name.to_string())
}

/// Catalog mapping `(schema, name)` to a table definition plus its
/// lazily-opened master table.
pub struct TableRegistry {
    data_dir: PathBuf,
    catalog_path: PathBuf,
    defs: RwLock<HashMap<TableKey, DataTableDef>>,
    open: RwLock<HashMap<TableKey, Arc<MasterTable>>>,
}

impl TableRegistry {
    pub fn open<P: AsRef<Path>>(data_dir: P) -> Result<Self> {
        let data_dir = data_dir.as_ref().to_path_buf();
        fs::create_dir_all(&data_dir)?;
        let catalog_path = data_dir.join("catalog.desc");

        let defs = Self::load_descriptor(&catalog_path)?;

        Ok(Self {
            data_dir,
            catalog_path,
            defs: RwLock::new(defs),
            open: RwLock::new(HashMap::new()),
        })
    }

    fn load_descriptor(catalog_path: &Path) -> Result<HashMap<TableKey, DataTableDef>> {
        let primary = catalog_path.to_path_buf();
        let backup = catalog_path.with_extension("desc.bak");

        for candidate in [&primary, &backup] {
            if !candidate.exists() {
                continue;
            }
            let bytes = fs::read(candidate)?;
            match bincode::deserialize::<Vec<DataTableDef>>(&bytes) {
                Ok(mut defs) => {
                    let mut map = HashMap::new();
                    for mut def in defs.drain(..) {
                        def.rebuild_column_index();
                        map.insert(key_of(&def.schema, &def.name), def);
                    }
                    return Ok(map);
                }
                Err(_) if candidate == &primary => continue, // fall through to backup
                Err(e) => {
                    return Err(StorageError::Corruption(format!(
                        "catalog descriptor unreadable: {e}"
                    )))
                }
            }
        }
        Ok(HashMap::new())
    }

    /// Writes the catalog atomically: temp file, fsync, rotate the
    /// previous `current` to `.bak`, rename temp into place, fsync the
    /// directory entry.
    fn persist(&self) -> Result<()> {
        let defs = self.defs.read();
        let list: Vec<DataTableDef> = defs.values().cloned().collect();
        drop(defs);

        let bytes = bincode::serialize(&list)
            .map_err(|e| StorageError::Serialization(e.to_string()))?;

        let tmp_path = self.catalog_path.with_extension("desc.tmp");
        let bak_path = self.catalog_path.with_extension("desc.bak");

        {
            let mut tmp = File::create(&tmp_path)?;
            use std::io::Write;
            tmp.write_all(&bytes)?;
            tmp.sync_all()?;
        }

        if self.catalog_path.exists() {
            fs::rename(&self.catalog_path, &bak_path)?;
        }
        fs::rename(&tmp_path, &self.catalog_path)?;
        fsync_dir(&self.data_dir)?;
        Ok(())
    }

    pub fn create_table(&self, def: DataTableDef) -> Result<Arc<MasterTable>> {
        let key = key_of(&def.schema, &def.name);
        {
            let defs = self.defs.read();
            if defs.contains_key(&key) {
                return Err(StorageError::TableExists(format!("{}.{}", def.schema, def.name)));
            }
        }

        let table = Arc::new(MasterTable::create(def.clone(), &self.data_dir)?);

        self.defs.write().insert(key.clone(), def);
        self.persist()?;
        self.open.write().insert(key, table.clone());
        Ok(table)
    }

    pub fn drop_table(&self, schema: &str, name: &str) -> Result<()> {
        let key = key_of(schema, name);
        let removed = self.defs.write().remove(&key);
        if removed.is_none() {
            return Err(StorageError::TableNotFound(format!("{schema}.{name}")));
        }
        self.persist()?;

        if let Some(table) = self.open.write().remove(&key) {
            if let Ok(table) = Arc::try_unwrap(table) {
                table.drop_table()?;
            }
            // Otherwise another snapshot still holds a reference; the
            // files are orphaned on disk until the process restarts.
            // TODO: track outstanding Arc holders so drop_table can wait
            // for the last reader instead of leaking the backing file.
        }
        Ok(())
    }

    /// Returns the table, opening its backing files on first access.
    pub fn get_table(&self, schema: &str, name: &str) -> Result<Arc<MasterTable>> {
        let key = key_of(schema, name);
        if let Some(table) = self.open.read().get(&key) {
            return Ok(table.clone());
        }

        let def = self
            .defs
            .read()
            .get(&key)
            .cloned()
            .ok_or_else(|| StorageError::TableNotFound(format!("{schema}.{name}")))?;

        let table = Arc::new(MasterTable::load(def, &self.data_dir)?);
        self.open.write().insert(key, table.clone());
        Ok(table)
    }

    pub fn list_tables(&self) -> Vec<(String, String)> {
        self.defs.read().keys().cloned().collect()
    }

    pub fn table_exists(&self, schema: &str, name: &str) -> bool {
        self.defs.read().contains_key(&key_of(schema, name))
    }

    pub fn rename_table(&self, schema: &str, name: &str, new_name: &str) -> Result<()> {
        let old_key = key_of(schema, name);
        let new_key = key_of(schema, new_name);

        let mut defs = self.defs.write();
        if !defs.contains_key(&old_key) {
            return Err(StorageError::TableNotFound(format!("{schema}.{name}")));
        }
        if defs.contains_key(&new_key) {
            return Err(StorageError::TableExists(format!("{schema}.{new_name}")));
        }
        let mut def = defs.remove(&old_key).unwrap();
        def.name = new_name.to_string();
        defs.insert(new_key.clone(), def);
        drop(defs);
        self.persist()?;

        if let Some(table) = self.open.write().remove(&old_key) {
            table.rename(new_name);
            table.update_file(&self.data_dir)?;
            self.open.write().insert(new_key, table);
        }
        Ok(())
    }
}

fn fsync_dir(path: &Path) -> Result<()> {
    let dir = File::open(path)?;
    #[cfg(unix)]
    {
        use std::os::unix::io::AsRawFd;
        unsafe {
            libc::fsync(dir.as_raw_fd());
        }
    }
    #[cfg(not(unix))]
    {
        let _ = dir;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{CellTag, ColumnDef};
    use tempfile::tempdir;

    fn def(schema: &str, name: &str) -> DataTableDef {
        DataTableDef::new(schema, name, vec![ColumnDef::new("id", CellTag::Numeric)])
    }

    #[test]
    fn create_then_get() {
        let dir = tempdir().unwrap();
        let registry = TableRegistry::open(dir.path()).unwrap();
        registry.create_table(def("APP", "widgets")).unwrap();

        let table = registry.get_table("APP", "widgets").unwrap();
        assert_eq!(table.def().name, "widgets");
    }

    #[test]
    fn create_duplicate_is_rejected() {
        let dir = tempdir().unwrap();
        let registry = TableRegistry::open(dir.path()).unwrap();
        registry.create_table(def("APP", "widgets")).unwrap();
        assert!(registry.create_table(def("APP", "widgets")).is_err());
    }

    #[test]
    fn drop_then_not_found() {
        let dir = tempdir().unwrap();
        let registry = TableRegistry::open(dir.path()).unwrap();
        registry.create_table(def("APP", "widgets")).unwrap();
        registry.drop_table("APP", "widgets").unwrap();
        assert!(!registry.table_exists("APP", "widgets"));
        assert!(registry.get_table("APP", "widgets").is_err());
    }

    #[test]
    fn catalog_survives_reopen() {
        let dir = tempdir().unwrap();
        {
            let registry = TableRegistry::open(dir.path()).unwrap();
            registry.create_table(def("APP", "widgets")).unwrap();
            registry.create_table(def("APP", "orders")).unwrap();
        }

        let registry = TableRegistry::open(dir.path()).unwrap();
        let mut tables = registry.list_tables();
        tables.sort();
        assert_eq!(
            tables,
            vec![
                ("APP".to_string(), "orders".to_string()),
                ("APP".to_string(), "widgets".to_string()),
            ]
        );
    }

    #[test]
    fn rename_updates_catalog_and_file() {
        let dir = tempdir().unwrap();
        let registry = TableRegistry::open(dir.path()).unwrap();
        registry.create_table(def("APP", "widgets")).unwrap();
        // Force the table to be opened before renaming.
        registry.get_table("APP", "widgets").unwrap();

        registry.rename_table("APP", "widgets", "gadgets").unwrap();
        assert!(!registry.table_exists("APP", "widgets"));
        assert!(registry.table_exists("APP", "gadgets"));
        assert!(registry.get_table("APP", "gadgets").is_ok());
    }
}
