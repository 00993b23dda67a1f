//
// loader/mod.rs
//
// Interface to the language-specific loader that produces unit graphs
//

pub mod directory;

pub use directory::{DirectoryLoader, DirectoryLoaderFactory};

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;

use crate::cache::UnitGraph;
use crate::cancel::RequestScope;

/// What a loader is bound to for the lifetime of a session
#[derive(Debug, Clone, Default)]
pub struct LoaderContext {
    /// Workspace root directory, if the client supplied one
    pub root: Option<PathBuf>,
    /// Flags such as `-tags "a b"` selecting which files are included
    pub build_flags: Vec<String>,
    /// Import prefix for units under `root`
    pub import_prefix: String,
}

/// Produces freshly parsed and type-checked unit graphs.
///
/// Loaders may perform I/O or spawn processes; callers poll the request
/// scope before and after each call. Implementations should also check
/// `scope.checkpoint()` between expensive steps.
#[async_trait]
pub trait Loader: Send + Sync {
    /// Loads the graph rooted at the unit that owns `file`.
    async fn load_file(&self, file: &Path, scope: &RequestScope) -> anyhow::Result<UnitGraph>;

    /// Loads every unit reachable from the workspace root.
    async fn load_workspace(&self, scope: &RequestScope) -> anyhow::Result<UnitGraph>;
}

/// Creates a loader at `initialize`, once the root and flags are known.
pub trait LoaderFactory: Send + Sync {
    fn create(&self, context: LoaderContext) -> Arc<dyn Loader>;
}

impl<F> LoaderFactory for F
where
    F: Fn(LoaderContext) -> Arc<dyn Loader> + Send + Sync,
{
    fn create(&self, context: LoaderContext) -> Arc<dyn Loader> {
        self(context)
    }
}
