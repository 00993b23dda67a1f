//
// cache/unit.rs
//
// Compilation units and the loader graphs they are ingested from
//

use std::any::Any;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Opaque syntax/type/diagnostic data attached to a unit by the loader.
///
/// The cache never looks inside; language services downcast it with
/// [`CompilationUnit::payload_as`].
pub type UnitPayload = Arc<dyn Any + Send + Sync>;

fn empty_payload() -> UnitPayload {
    Arc::new(())
}

/// One node of a freshly loaded graph, as produced by a [`crate::loader::Loader`].
#[derive(Clone)]
pub struct UnitNode {
    pub id: String,
    pub name: String,
    /// Canonical import path
    pub path: String,
    /// Member files, primary file first
    pub files: Vec<PathBuf>,
    pub payload: UnitPayload,
    /// Direct dependencies: canonical path -> unit id
    pub imports: BTreeMap<String, String>,
}

impl UnitNode {
    /// Creates a node whose name defaults to the last segment of `path`.
    pub fn new(id: impl Into<String>, path: impl Into<String>) -> Self {
        let path = path.into();
        let name = path.rsplit('/').next().unwrap_or_default().to_string();
        Self {
            id: id.into(),
            name,
            path,
            files: Vec::new(),
            payload: empty_payload(),
            imports: BTreeMap::new(),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_file(mut self, file: impl Into<PathBuf>) -> Self {
        self.files.push(file.into());
        self
    }

    pub fn with_files<I, P>(mut self, files: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        self.files.extend(files.into_iter().map(Into::into));
        self
    }

    pub fn with_payload<T: Any + Send + Sync>(mut self, payload: T) -> Self {
        self.payload = Arc::new(payload);
        self
    }

    /// Records a dependency on the unit `id`, importable as `path`.
    pub fn with_import(mut self, path: impl Into<String>, id: impl Into<String>) -> Self {
        self.imports.insert(path.into(), id.into());
        self
    }
}

impl fmt::Debug for UnitNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UnitNode")
            .field("id", &self.id)
            .field("path", &self.path)
            .field("files", &self.files)
            .field("imports", &self.imports)
            .finish_non_exhaustive()
    }
}

/// A loader result: a flat id-keyed node map plus the ids ingestion starts from.
///
/// Edges are ids, so cyclic graphs are representable without shared ownership.
#[derive(Debug, Clone, Default)]
pub struct UnitGraph {
    pub roots: Vec<String>,
    pub nodes: HashMap<String, UnitNode>,
}

impl UnitGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a node without marking it as a root.
    pub fn with_node(mut self, node: UnitNode) -> Self {
        self.insert(node);
        self
    }

    /// Adds a node and marks it as a root.
    pub fn with_root(mut self, node: UnitNode) -> Self {
        self.roots.push(node.id.clone());
        self.insert(node);
        self
    }

    pub fn insert(&mut self, node: UnitNode) {
        self.nodes.insert(node.id.clone(), node);
    }

    pub fn node(&self, id: &str) -> Option<&UnitNode> {
        self.nodes.get(id)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

/// A compilation unit as stored in the [`super::GlobalCache`].
///
/// Dependencies are held by id and resolved through the cache, so a unit
/// never owns the units it depends on.
pub struct CompilationUnit {
    id: String,
    name: String,
    path: String,
    files: Vec<PathBuf>,
    payload: UnitPayload,
    imports: BTreeMap<String, String>,
}

impl CompilationUnit {
    pub(crate) fn from_node(node: &UnitNode, imports: BTreeMap<String, String>) -> Self {
        Self {
            id: node.id.clone(),
            name: node.name.clone(),
            path: node.path.clone(),
            files: node.files.clone(),
            payload: node.payload.clone(),
            imports,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Canonical import path
    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn files(&self) -> &[PathBuf] {
        &self.files
    }

    pub fn primary_file(&self) -> Option<&Path> {
        self.files.first().map(PathBuf::as_path)
    }

    pub fn payload(&self) -> &UnitPayload {
        &self.payload
    }

    pub fn payload_as<T: Any>(&self) -> Option<&T> {
        self.payload.downcast_ref::<T>()
    }

    /// Dependency edges as `(canonical path, unit id)` in path order.
    pub fn imports(&self) -> impl Iterator<Item = (&str, &str)> {
        self.imports.iter().map(|(p, id)| (p.as_str(), id.as_str()))
    }

    pub fn import_id(&self, path: &str) -> Option<&str> {
        self.imports.get(path).map(String::as_str)
    }
}

impl fmt::Debug for CompilationUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompilationUnit")
            .field("id", &self.id)
            .field("path", &self.path)
            .field("files", &self.files)
            .field("imports", &self.imports)
            .finish_non_exhaustive()
    }
}
