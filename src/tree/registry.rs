use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use log::info;
use parking_lot::RwLock;

use super::tree::{Tree, TreeContext};
use crate::common::{DatabaseID, Lsn, Result};
use crate::log_mod::{DbRootInfo, FlushPolicy, LnEntry, LogEntry};

#[derive(Default)]
struct Databases {
    by_name: BTreeMap<String, Arc<Tree>>,
    by_id: HashMap<DatabaseID, Arc<Tree>>,
}

/// All named trees of an environment.
pub struct DatabaseRegistry {
    ctx: Arc<TreeContext>,
    databases: RwLock<Databases>,
    last_db_id: AtomicU32,
}

impl DatabaseRegistry {
    pub fn new(ctx: Arc<TreeContext>, last_db_id: u32) -> Self {
        Self {
            ctx,
            databases: RwLock::new(Databases::default()),
            last_db_id: AtomicU32::new(last_db_id),
        }
    }

    pub fn context(&self) -> &Arc<TreeContext> {
        &self.ctx
    }

    pub fn get(&self, db: DatabaseID) -> Option<Arc<Tree>> {
        self.databases.read().by_id.get(&db).cloned()
    }

    pub fn get_by_name(&self, name: &str) -> Option<Arc<Tree>> {
        self.databases.read().by_name.get(name).cloned()
    }

    /// Returns the named tree, creating it if needed. Creation is durable
    /// before this returns.
    pub fn open_or_create(&self, name: &str) -> Result<Arc<Tree>> {
        if let Some(tree) = self.get_by_name(name) {
            return Ok(tree);
        }

        let mut databases = self.databases.write();
        if let Some(tree) = databases.by_name.get(name) {
            return Ok(tree.clone());
        }
        let db = DatabaseID(self.last_db_id.fetch_add(1, Ordering::AcqRel) + 1);
        let tree = Arc::new(Tree::create(self.ctx.clone(), db, name)?);
        self.ctx
            .log()
            .append(&LogEntry::DbRoot(tree.root_info()), FlushPolicy::Sync)?;

        databases.by_name.insert(name.to_string(), tree.clone());
        databases.by_id.insert(db, tree.clone());
        info!("Created database {} as {}", name, db);
        Ok(tree)
    }

    /// Installs a database known from the log, or moves an existing one to
    /// a newer root.
    pub fn install(&self, info: &DbRootInfo) -> Arc<Tree> {
        self.bump_db_id(info.db.0);
        let mut databases = self.databases.write();
        if let Some(tree) = databases.by_id.get(&info.db) {
            tree.redo_root(info.root_id, info.root_lsn);
            return tree.clone();
        }
        let tree = Arc::new(Tree::open(self.ctx.clone(), info));
        databases.by_name.insert(info.name.clone(), tree.clone());
        databases.by_id.insert(info.db, tree.clone());
        tree
    }

    pub fn trees(&self) -> Vec<Arc<Tree>> {
        self.databases.read().by_id.values().cloned().collect()
    }

    pub fn names(&self) -> Vec<String> {
        self.databases.read().by_name.keys().cloned().collect()
    }

    pub fn root_infos(&self) -> Vec<DbRootInfo> {
        let mut roots: Vec<_> = self.trees().iter().map(|tree| tree.root_info()).collect();
        roots.sort_by_key(|info| info.db);
        roots
    }

    pub fn last_db_id(&self) -> u32 {
        self.last_db_id.load(Ordering::Acquire)
    }

    pub fn bump_db_id(&self, seen: u32) {
        self.last_db_id.fetch_max(seen, Ordering::AcqRel);
    }

    /// Rolls back one logged record write. Returns whether the tree changed.
    pub fn undo(&self, lsn: Lsn, entry: &LnEntry) -> Result<bool> {
        match self.get(entry.db) {
            Some(tree) => tree.undo(&entry.key, lsn, entry.abort_lsn, entry.abort_known_deleted),
            None => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cleaner::UtilizationTracker;
    use crate::common::EnvironmentConfig;
    use crate::log_mod::LogManager;
    use crate::storage::FileManager;
    use crate::tree::NodeCache;
    use tempfile::TempDir;

    fn registry() -> (TempDir, DatabaseRegistry) {
        let dir = TempDir::new().unwrap();
        let config = EnvironmentConfig::without_daemons();
        let files = Arc::new(FileManager::open(dir.path()).unwrap());
        let log = Arc::new(
            LogManager::open(files, &config, Arc::new(UtilizationTracker::new()), None, uuid::Uuid::new_v4()).unwrap(),
        );
        let ctx = Arc::new(TreeContext::new(log, Arc::new(NodeCache::new(config.cache_size)), &config, 0));
        (dir, DatabaseRegistry::new(ctx, 0))
    }

    #[test]
    fn test_open_or_create_is_idempotent() {
        let (_dir, registry) = registry();
        let a = registry.open_or_create("accounts").unwrap();
        let b = registry.open_or_create("accounts").unwrap();
        assert_eq!(a.db(), b.db());

        let c = registry.open_or_create("orders").unwrap();
        assert_ne!(a.db(), c.db());
        assert_eq!(registry.last_db_id(), 2);
        assert_eq!(registry.names(), vec!["accounts".to_string(), "orders".to_string()]);
        assert!(registry.get(c.db()).is_some());
    }

    #[test]
    fn test_install_moves_root_forward_only() {
        let (_dir, registry) = registry();
        let tree = registry.open_or_create("t").unwrap();
        let info = tree.root_info();

        let newer = DbRootInfo {
            root_lsn: Lsn::new(info.root_lsn.file + 1, 0),
            ..info.clone()
        };
        registry.install(&newer);
        assert_eq!(tree.root_info().root_lsn, newer.root_lsn);

        registry.install(&info);
        assert_eq!(tree.root_info().root_lsn, newer.root_lsn);
    }
}
