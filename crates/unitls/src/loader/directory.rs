//
// loader/directory.rs
//
// Reference loader: one compilation unit per source directory
//

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use walkdir::WalkDir;

use super::{Loader, LoaderContext, LoaderFactory};
use crate::cache::{UnitGraph, UnitNode};
use crate::cancel::{Cancelled, RequestScope};

/// Payload attached to units produced by [`DirectoryLoader`]
#[derive(Debug, Clone)]
pub struct DirectoryUnit {
    pub dir: PathBuf,
}

/// Treats every directory holding files with the configured extension as a
/// unit without dependencies. Useful as a stand-in until a real
/// type-checking loader is plugged in, and for tests.
#[derive(Debug, Clone)]
pub struct DirectoryLoader {
    context: LoaderContext,
    extension: String,
}

impl DirectoryLoader {
    pub fn new(context: LoaderContext, extension: impl Into<String>) -> Self {
        let extension = extension.into().trim_start_matches('.').to_string();
        if !context.build_flags.is_empty() {
            log::info!(
                "Directory loader ignores build flags {:?}: every *.{} file is included",
                context.build_flags,
                extension
            );
        }
        Self { context, extension }
    }

    fn import_prefix(&self) -> String {
        if !self.context.import_prefix.is_empty() {
            return self.context.import_prefix.trim_end_matches('/').to_string();
        }
        self.context
            .root
            .as_deref()
            .and_then(Path::file_name)
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default()
    }

    /// Canonical path of `dir`: the import prefix joined with its
    /// root-relative components, or the directory itself outside the root.
    fn canonical_path(&self, dir: &Path) -> String {
        let relative = self
            .context
            .root
            .as_deref()
            .and_then(|root| dir.strip_prefix(root).ok());
        match relative {
            Some(rel) => {
                let mut parts = vec![self.import_prefix()];
                parts.extend(rel.components().map(|c| c.as_os_str().to_string_lossy().to_string()));
                parts.retain(|p| !p.is_empty());
                parts.join("/")
            }
            None => dir.to_string_lossy().replace('\\', "/"),
        }
    }

    fn has_extension(&self, path: &Path) -> bool {
        path.extension()
            .map(|e| e.to_string_lossy().eq_ignore_ascii_case(&self.extension))
            .unwrap_or(false)
    }

    fn source_files(&self, dir: &Path) -> Vec<PathBuf> {
        let Ok(entries) = fs::read_dir(dir) else {
            return Vec::new();
        };
        let mut files: Vec<PathBuf> = entries
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.is_file() && self.has_extension(p))
            .collect();
        files.sort();
        files
    }

    fn unit_for_dir(&self, dir: &Path) -> Option<UnitNode> {
        let files = self.source_files(dir);
        if files.is_empty() {
            return None;
        }
        let path = self.canonical_path(dir);
        Some(
            UnitNode::new(path.clone(), path)
                .with_files(files)
                .with_payload(DirectoryUnit {
                    dir: dir.to_path_buf(),
                }),
        )
    }

    fn scan(&self, root: &Path, token: &CancellationToken) -> Result<UnitGraph, Cancelled> {
        let mut units = BTreeMap::new();
        let walker = WalkDir::new(root).into_iter().filter_entry(|e| {
            e.depth() == 0 || !e.file_name().to_string_lossy().starts_with('.')
        });
        for entry in walker.filter_map(|e| e.ok()) {
            if token.is_cancelled() {
                return Err(Cancelled);
            }
            if entry.file_type().is_dir() {
                if let Some(node) = self.unit_for_dir(entry.path()) {
                    units.insert(node.id.clone(), node);
                }
            }
        }

        let mut graph = UnitGraph::new();
        for (_, node) in units {
            graph = graph.with_root(node);
        }
        log::info!("Scanned {} units under {}", graph.len(), root.display());
        Ok(graph)
    }
}

#[async_trait]
impl Loader for DirectoryLoader {
    async fn load_file(&self, file: &Path, scope: &RequestScope) -> anyhow::Result<UnitGraph> {
        scope.checkpoint()?;
        let Some(dir) = file.parent() else {
            return Ok(UnitGraph::new());
        };
        let this = self.clone();
        let dir = dir.to_path_buf();
        let node = tokio::task::spawn_blocking(move || this.unit_for_dir(&dir)).await?;
        Ok(match node {
            Some(node) => UnitGraph::new().with_root(node),
            None => UnitGraph::new(),
        })
    }

    async fn load_workspace(&self, scope: &RequestScope) -> anyhow::Result<UnitGraph> {
        let Some(root) = self.context.root.clone() else {
            log::warn!("No workspace root; nothing to load eagerly");
            return Ok(UnitGraph::new());
        };
        let this = self.clone();
        let token = scope.token().clone();
        let graph = tokio::task::spawn_blocking(move || this.scan(&root, &token)).await??;
        Ok(graph)
    }
}

/// Builds [`DirectoryLoader`]s for a fixed source extension
#[derive(Debug, Clone)]
pub struct DirectoryLoaderFactory {
    pub extension: String,
}

impl DirectoryLoaderFactory {
    pub fn new(extension: impl Into<String>) -> Self {
        Self {
            extension: extension.into(),
        }
    }
}

impl LoaderFactory for DirectoryLoaderFactory {
    fn create(&self, context: LoaderContext) -> Arc<dyn Loader> {
        Arc::new(DirectoryLoader::new(context, self.extension.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn workspace() -> TempDir {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        fs::create_dir_all(root.join("cmd/tool")).unwrap();
        fs::create_dir_all(root.join(".git")).unwrap();
        fs::create_dir_all(root.join("docs")).unwrap();
        fs::write(root.join("main.go"), "package main\n").unwrap();
        fs::write(root.join("cmd/tool/b.go"), "package tool\n").unwrap();
        fs::write(root.join("cmd/tool/a.go"), "package tool\n").unwrap();
        fs::write(root.join(".git/x.go"), "").unwrap();
        fs::write(root.join("docs/readme.md"), "").unwrap();
        dir
    }

    fn loader(root: &Path) -> DirectoryLoader {
        DirectoryLoader::new(
            LoaderContext {
                root: Some(root.to_path_buf()),
                build_flags: Vec::new(),
                import_prefix: "example.com/app".to_string(),
            },
            "go",
        )
    }

    #[tokio::test]
    async fn test_load_file_builds_directory_unit() {
        let dir = workspace();
        let loader = loader(dir.path());
        let graph = loader
            .load_file(&dir.path().join("cmd/tool/a.go"), &RequestScope::detached())
            .await
            .unwrap();

        assert_eq!(graph.roots, vec!["example.com/app/cmd/tool".to_string()]);
        let node = graph.node("example.com/app/cmd/tool").unwrap();
        assert_eq!(node.name, "tool");
        let names: Vec<_> = node
            .files
            .iter()
            .map(|f| f.file_name().unwrap().to_string_lossy().to_string())
            .collect();
        assert_eq!(names, vec!["a.go", "b.go"]);
    }

    #[tokio::test]
    async fn test_load_workspace_skips_hidden_and_empty_dirs() {
        let dir = workspace();
        let graph = loader(dir.path())
            .load_workspace(&RequestScope::detached())
            .await
            .unwrap();
        let mut ids: Vec<_> = graph.nodes.keys().cloned().collect();
        ids.sort();
        assert_eq!(ids, vec!["example.com/app", "example.com/app/cmd/tool"]);
    }

    #[tokio::test]
    async fn test_cancelled_scope_stops_loading() {
        let dir = workspace();
        let registry = Arc::new(crate::cancel::CancellationRegistry::new());
        let scope = registry.register(tower_lsp::jsonrpc::Id::Number(1));
        registry.cancel(&tower_lsp::jsonrpc::Id::Number(1));

        let err = loader(dir.path())
            .load_file(&dir.path().join("main.go"), &scope)
            .await
            .unwrap_err();
        assert!(err.downcast_ref::<Cancelled>().is_some());
    }

    #[test]
    fn test_prefix_defaults_to_root_name() {
        let loader = DirectoryLoader::new(
            LoaderContext {
                root: Some(PathBuf::from("/work/myapp")),
                ..Default::default()
            },
            ".go",
        );
        assert_eq!(loader.canonical_path(Path::new("/work/myapp/internal/db")), "myapp/internal/db");
        assert_eq!(loader.canonical_path(Path::new("/usr/lib/go/fmt")), "/usr/lib/go/fmt");
    }
}
