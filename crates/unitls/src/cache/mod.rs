//
// cache/mod.rs
//
// Global compilation-unit cache indexed by id, canonical path, and file
//

pub mod rank;
pub mod staleness;
pub mod unit;


pub use staleness::Freshness;
pub use unit::{CompilationUnit, UnitGraph, UnitNode, UnitPayload};

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::SystemTime;

/// A cached unit plus the primary-file timestamp observed when it was ingested.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    unit: Arc<CompilationUnit>,
    mod_time: Option<SystemTime>,
}

impl CacheEntry {
    pub fn unit(&self) -> &Arc<CompilationUnit> {
        &self.unit
    }

    pub fn into_unit(self) -> Arc<CompilationUnit> {
        self.unit
    }

    pub fn mod_time(&self) -> Option<SystemTime> {
        self.mod_time
    }
}

/// Case-normalized key for the file index.
fn file_key(path: &Path) -> String {
    path.to_string_lossy().to_lowercase()
}

/// The three indices. Only ever touched through one lock, so a unit is
/// either present in all of the indices it owns or in none of them.
#[derive(Debug, Default)]
struct Indices {
    by_id: HashMap<String, CacheEntry>,
    /// canonical path -> id
    by_path: HashMap<String, String>,
    /// lower-cased file path -> id
    by_file: HashMap<String, String>,
}

impl Indices {
    fn lookup(&self, id: Option<&String>) -> Option<CacheEntry> {
        id.and_then(|id| self.by_id.get(id)).cloned()
    }

    fn put(&mut self, entry: CacheEntry, trace: bool) {
        let id = entry.unit.id().to_string();
        let path = entry.unit.path().to_string();

        self.remove(&id, trace);
        if let Some(previous) = self.by_path.get(&path).cloned() {
            log::debug!(
                "Evicting unit {} from cache: canonical path {} now belongs to {}",
                previous,
                path,
                id
            );
            self.remove(&previous, trace);
        }

        for file in entry.unit.files() {
            if let Some(previous) = self.by_file.insert(file_key(file), id.clone()) {
                if trace {
                    log::debug!("cache: file {} moved from {} to {}", file.display(), previous, id);
                }
            }
        }
        self.by_path.insert(path, id.clone());
        if trace {
            log::debug!("cache: put {}", id);
        }
        self.by_id.insert(id, entry);
    }

    fn remove(&mut self, id: &str, trace: bool) -> Option<CacheEntry> {
        let entry = self.by_id.remove(id)?;
        if self.by_path.get(entry.unit.path()).map(String::as_str) == Some(id) {
            self.by_path.remove(entry.unit.path());
        }
        for file in entry.unit.files() {
            let key = file_key(file);
            // A newer unit may have claimed this file since
            if self.by_file.get(&key).map(String::as_str) == Some(id) {
                self.by_file.remove(&key);
            }
        }
        if trace {
            log::debug!("cache: delete {}", id);
        }
        Some(entry)
    }
}

/// Depth-first ingestion state for one [`GlobalCache::add`] call.
struct Ingest<'a> {
    graph: &'a UnitGraph,
    mod_times: HashMap<&'a str, Option<SystemTime>>,
    seen: HashSet<&'a str>,
    stored: usize,
    trace: bool,
}

impl<'a> Ingest<'a> {
    /// Ingests `id` and everything it reaches. Returns whether `id` is (or
    /// is about to be) live in the cache, i.e. whether an edge to it may be wired.
    fn visit(&mut self, indices: &mut Indices, id: &'a str) -> bool {
        if indices.by_id.contains_key(id) {
            return true;
        }
        let graph = self.graph;
        let Some(node) = graph.nodes.get(id) else {
            log::debug!("Dropping import of unit {}: not in cache or loaded graph", id);
            return false;
        };
        // Already in progress further up the stack (a cycle) or done
        if !self.seen.insert(node.id.as_str()) {
            return true;
        }

        let mut imports = BTreeMap::new();
        for (path, dep) in &node.imports {
            if self.visit(indices, dep.as_str()) {
                imports.insert(path.clone(), dep.clone());
            }
        }

        let entry = CacheEntry {
            unit: Arc::new(CompilationUnit::from_node(node, imports)),
            mod_time: self.mod_times.get(id).copied().flatten(),
        };
        indices.put(entry, self.trace);
        self.stored += 1;
        true
    }
}

/// Concurrent store of compilation units forming a dependency graph.
///
/// All three indices live behind one `RwLock`: mutations take the write
/// lock exactly once per call, lookups and the snapshot phase of
/// [`GlobalCache::walk`] take the read lock. `GlobalCache::default()` is the
/// empty cache; every operation on it returns its identity result.
#[derive(Debug, Default)]
pub struct GlobalCache {
    indices: RwLock<Indices>,
    trace: bool,
}

impl GlobalCache {
    /// Creates an empty cache. `trace` logs every put and delete at debug level.
    pub fn new(trace: bool) -> Self {
        Self {
            indices: RwLock::new(Indices::default()),
            trace,
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, Indices> {
        self.indices.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Indices> {
        self.indices.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Ingests a loaded graph starting from its roots.
    ///
    /// Units whose id is already cached are reused as dependency targets and
    /// not descended into. Everything else is stored children-first. Returns
    /// the number of newly stored units.
    pub fn add(&self, graph: &UnitGraph) -> usize {
        if graph.roots.is_empty() {
            return 0;
        }

        // Stat primary files before taking the lock
        let mod_times = graph
            .nodes
            .values()
            .map(|n| (n.id.as_str(), staleness::primary_mod_time(&n.files)))
            .collect();

        let mut ingest = Ingest {
            graph,
            mod_times,
            seen: HashSet::new(),
            stored: 0,
            trace: self.trace,
        };

        let mut indices = self.write();
        for root in &graph.roots {
            ingest.visit(&mut indices, root.as_str());
        }
        ingest.stored
    }

    /// Looks up the unit importable as `path`.
    pub fn get(&self, path: &str) -> Option<CacheEntry> {
        let indices = self.read();
        indices.lookup(indices.by_path.get(path))
    }

    /// Looks up the unit owning `file`, ignoring case.
    pub fn get_by_file(&self, file: impl AsRef<Path>) -> Option<CacheEntry> {
        let key = file_key(file.as_ref());
        let indices = self.read();
        indices.lookup(indices.by_file.get(&key))
    }

    pub fn get_by_id(&self, id: &str) -> Option<CacheEntry> {
        self.read().by_id.get(id).cloned()
    }

    /// Removes a unit from every index at once.
    pub fn delete(&self, id: &str) -> bool {
        self.write().remove(id, self.trace).is_some()
    }

    /// Removes several units under a single critical section.
    pub fn clean<S: AsRef<str>>(&self, ids: &[S]) -> usize {
        if ids.is_empty() {
            return 0;
        }
        let mut indices = self.write();
        ids.iter()
            .filter(|id| indices.remove(id.as_ref(), self.trace).is_some())
            .count()
    }

    /// Visits every cached unit once, ordered by [`rank::compare`].
    ///
    /// The unit list is snapshotted under the read lock, which is released
    /// before `visit` runs, so visitors may call back into the cache.
    /// Stops at the first error `visit` returns.
    pub fn walk<F, E>(&self, mut visit: F, priority_prefixes: &[String]) -> Result<(), E>
    where
        F: FnMut(&Arc<CompilationUnit>) -> Result<(), E>,
    {
        let mut units: Vec<Arc<CompilationUnit>> =
            self.read().by_id.values().map(|e| e.unit.clone()).collect();
        units.sort_by(|a, b| rank::compare(a.id(), b.id(), priority_prefixes));

        for unit in &units {
            visit(unit)?;
        }
        Ok(())
    }

    /// Resolves the dependency of `unit` imported as `path`.
    ///
    /// Returns `None` for unknown paths and for edges whose target has been
    /// deleted since `unit` was ingested.
    pub fn dependency(&self, unit: &CompilationUnit, path: &str) -> Option<Arc<CompilationUnit>> {
        let id = unit.import_id(path)?;
        let found = self.get_by_id(id).map(CacheEntry::into_unit);
        if found.is_none() {
            log::debug!("Unit {} imports {} ({}), which is no longer cached", unit.id(), path, id);
        }
        found
    }

    /// Resolves all live dependencies of `unit` in canonical-path order,
    /// skipping edges whose target is no longer cached.
    pub fn dependencies(&self, unit: &CompilationUnit) -> Vec<Arc<CompilationUnit>> {
        let indices = self.read();
        unit.imports()
            .filter_map(|(_, id)| indices.by_id.get(id).map(|e| e.unit.clone()))
            .collect()
    }

    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.read().by_id.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.read().by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().by_id.is_empty()
    }

    /// Checks the cross-index invariants. Test-only.
    #[cfg(test)]
    pub(crate) fn check_invariants(&self) -> Result<(), String> {
        let indices = self.read();
        for (id, entry) in &indices.by_id {
            if entry.unit.id() != id {
                return Err(format!("id index key {} holds unit {}", id, entry.unit.id()));
            }
            if indices.by_path.get(entry.unit.path()) != Some(id) {
                return Err(format!("unit {} missing from path index", id));
            }
        }
        for (path, id) in &indices.by_path {
            match indices.by_id.get(id) {
                Some(e) if e.unit.path() == path => {}
                _ => return Err(format!("path {} points at dead unit {}", path, id)),
            }
        }
        for (file, id) in &indices.by_file {
            match indices.by_id.get(id) {
                Some(e) if e.unit.files().iter().any(|f| &file_key(f) == file) => {}
                _ => return Err(format!("file {} points at dead unit {}", file, id)),
            }
        }
        Ok(())
    }
}
