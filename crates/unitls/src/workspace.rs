//
// workspace.rs
//
// Binds the global cache to a loader and applies the cache-style policy
//

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::cache::{CompilationUnit, Freshness, GlobalCache, UnitGraph};
use crate::cancel::RequestScope;
use crate::config::{CacheStyle, Config};
use crate::loader::{Loader, LoaderContext, LoaderFactory};

/// Everything a query needs to turn a file into compilation units.
pub struct Workspace {
    root: Option<PathBuf>,
    build_flags: Vec<String>,
    style: CacheStyle,
    rank_prefixes: Vec<String>,
    trace: bool,
    cache: Arc<GlobalCache>,
    loader: Arc<dyn Loader>,
}

impl std::fmt::Debug for Workspace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Workspace")
            .field("root", &self.root)
            .field("build_flags", &self.build_flags)
            .field("style", &self.style)
            .field("units", &self.cache.len())
            .finish()
    }
}

impl Workspace {
    pub fn new(
        root: Option<PathBuf>,
        config: &Config,
        loaders: &dyn LoaderFactory,
        trace: bool,
    ) -> Self {
        let build_flags = config.build_flags();
        let loader = loaders.create(LoaderContext {
            root: root.clone(),
            build_flags: build_flags.clone(),
            import_prefix: config.local_import_prefix.clone(),
        });
        Self {
            root,
            build_flags,
            style: config.cache_style,
            rank_prefixes: config.rank_prefixes(),
            trace,
            cache: Arc::new(GlobalCache::new(trace)),
            loader,
        }
    }

    /// Prefixes ranked first when walking the cache
    pub fn rank_prefixes(&self) -> &[String] {
        &self.rank_prefixes
    }

    /// The retained cache. Always empty under [`CacheStyle::None`].
    pub fn cache(&self) -> &Arc<GlobalCache> {
        &self.cache
    }

    async fn load_file(&self, file: &Path, scope: &RequestScope) -> anyhow::Result<UnitGraph> {
        scope.checkpoint()?;
        let graph = self.loader.load_file(file, scope).await?;
        scope.checkpoint()?;
        Ok(graph)
    }

    async fn load_workspace(&self, scope: &RequestScope) -> anyhow::Result<UnitGraph> {
        scope.checkpoint()?;
        let graph = self.loader.load_workspace(scope).await?;
        scope.checkpoint()?;
        Ok(graph)
    }

    /// Eagerly ingests the loader's whole workspace graph when the cache
    /// style is `always`. Returns the number of units added.
    pub async fn populate(&self, scope: &RequestScope) -> anyhow::Result<usize> {
        if self.style != CacheStyle::Always {
            return Ok(0);
        }
        let graph = self.load_workspace(scope).await?;
        let added = self.cache.add(&graph);
        log::info!("Loaded {} units into the global cache", added);
        Ok(added)
    }

    /// Finds the unit owning `file`, loading it if it is not cached or its
    /// cached entry is stale.
    ///
    /// Returns `Ok(None)` when the loader produced no unit for the file.
    pub async fn unit_for_file(
        &self,
        file: &Path,
        scope: &RequestScope,
    ) -> anyhow::Result<Option<Arc<CompilationUnit>>> {
        if self.style == CacheStyle::None {
            let scratch = GlobalCache::new(self.trace);
            scratch.add(&self.load_file(file, scope).await?);
            return Ok(scratch.get_by_file(file).map(|e| e.into_unit()));
        }

        if let Some(entry) = self.cache.get_by_file(file) {
            match entry.freshness() {
                Freshness::Fresh | Freshness::Unknown => return Ok(Some(entry.into_unit())),
                Freshness::Stale => {
                    log::debug!("Unit {} is stale; reloading", entry.unit().id());
                    self.cache.delete(entry.unit().id());
                }
            }
        }

        let graph = self.load_file(file, scope).await?;
        self.evict_changed(&graph);
        self.cache.add(&graph);
        Ok(self.cache.get_by_file(file).map(|e| e.into_unit()))
    }

    /// Drops cached units whose file set no longer matches the loaded graph.
    /// `add` reuses any unit whose id is already cached, so without this a
    /// file added to a cached unit would never reach the file index.
    fn evict_changed(&self, graph: &UnitGraph) -> usize {
        let changed: Vec<&str> = graph
            .nodes
            .values()
            .filter(|node| {
                self.cache
                    .get_by_id(&node.id)
                    .is_some_and(|entry| !same_files(entry.unit().files(), &node.files))
            })
            .map(|node| node.id.as_str())
            .collect();
        if changed.is_empty() {
            return 0;
        }
        log::debug!("Reloading units with changed files: {:?}", changed);
        self.cache.clean(changed.as_slice())
    }

    /// The cache that workspace-wide queries should walk.
    ///
    /// Under `none` this is a scratch cache filled from a fresh workspace
    /// load; otherwise it is the retained cache.
    pub async fn searchable(&self, scope: &RequestScope) -> anyhow::Result<Arc<GlobalCache>> {
        if self.style != CacheStyle::None {
            return Ok(self.cache.clone());
        }
        let scratch = GlobalCache::new(self.trace);
        scratch.add(&self.load_workspace(scope).await?);
        Ok(Arc::new(scratch))
    }

    /// Drops the unit that owns `file` so the next query reloads it.
    pub fn invalidate_file(&self, file: &Path) -> bool {
        match self.cache.get_by_file(file) {
            Some(entry) => {
                if self.trace {
                    log::debug!("Invalidating {} for {}", entry.unit().id(), file.display());
                }
                self.cache.delete(entry.unit().id())
            }
            None => false,
        }
    }
}

fn same_files(cached: &[PathBuf], loaded: &[PathBuf]) -> bool {
    cached.iter().collect::<BTreeSet<_>>() == loaded.iter().collect::<BTreeSet<_>>()
}
