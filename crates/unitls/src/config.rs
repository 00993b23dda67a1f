//
// config.rs
//
// Server configuration: process options and per-session settings
//

use serde_json::Value;

/// How the global cache is populated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CacheStyle {
    /// Nothing is retained; every lookup loads a fresh graph
    None,
    /// Units are loaded lazily the first time a query needs them
    #[default]
    OnDemand,
    /// The whole reachable graph is loaded during `initialize`
    Always,
}

impl CacheStyle {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "none" => Some(CacheStyle::None),
            "on-demand" | "ondemand" => Some(CacheStyle::OnDemand),
            "always" => Some(CacheStyle::Always),
            _ => None,
        }
    }
}

/// When diagnostics are published after a document mutation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DiagnosticsStyle {
    None,
    /// After open and every change
    Instant,
    /// After open and save
    #[default]
    OnSave,
}

impl DiagnosticsStyle {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "none" => Some(DiagnosticsStyle::None),
            "instant" => Some(DiagnosticsStyle::Instant),
            "onsave" | "on-save" => Some(DiagnosticsStyle::OnSave),
            _ => None,
        }
    }
}

/// Whether read-only queries run concurrently
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DispatchMode {
    /// Reads run in their own tasks and may complete out of order
    #[default]
    Concurrent,
    /// Every message is handled to completion before the next is read
    Serial,
}

/// Process-level options, fixed when the binary starts.
#[derive(Debug, Clone)]
pub struct ServerOptions {
    pub dispatch_mode: DispatchMode,
    /// Log every cache put/delete at debug level
    pub trace_cache: bool,
    /// Source file extension the directory loader picks up
    pub source_extension: String,
    /// Session defaults that `initializationOptions` are merged over
    pub defaults: Config,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            dispatch_mode: DispatchMode::Concurrent,
            trace_cache: false,
            source_extension: "go".to_string(),
            defaults: Config::default(),
        }
    }
}

/// Per-session settings, merged once at `initialize`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Build tags handed to the loader
    pub build_tags: Vec<String>,
    /// Import-path prefix of the workspace's own units; used for import
    /// grouping and to rank local units first in traversals
    pub local_import_prefix: String,
    pub cache_style: CacheStyle,
    pub diagnostics_style: DiagnosticsStyle,
    /// Maximum number of workspace symbol results
    pub workspace_symbol_limit: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            build_tags: Vec::new(),
            local_import_prefix: String::new(),
            cache_style: CacheStyle::OnDemand,
            diagnostics_style: DiagnosticsStyle::OnSave,
            workspace_symbol_limit: 100,
        }
    }
}

impl Config {
    /// Merges client `initializationOptions` over `self`.
    ///
    /// Only keys present in `options` are applied; absent keys and values of
    /// the wrong type keep their current value. Unknown enum values are
    /// logged and ignored.
    pub fn apply(&self, options: Option<&Value>) -> Config {
        let mut config = self.clone();
        let Some(options) = options.filter(|o| o.is_object()) else {
            return config;
        };

        if let Some(tags) = options.get("buildTags").and_then(|v| v.as_array()) {
            config.build_tags = tags
                .iter()
                .filter_map(|t| t.as_str())
                .filter(|t| !t.is_empty())
                .map(str::to_string)
                .collect();
        }
        if let Some(prefix) = options
            .get("localImportPrefix")
            .or_else(|| options.get("goimportsLocalPrefix"))
            .and_then(|v| v.as_str())
        {
            config.local_import_prefix = prefix.to_string();
        }
        if let Some(style) = options.get("globalCacheStyle").and_then(|v| v.as_str()) {
            match CacheStyle::parse(style) {
                Some(style) => config.cache_style = style,
                None => log::warn!("Ignoring unknown globalCacheStyle: {}", style),
            }
        }
        if let Some(style) = options.get("diagnosticsStyle").and_then(|v| v.as_str()) {
            match DiagnosticsStyle::parse(style) {
                Some(style) => config.diagnostics_style = style,
                None => log::warn!("Ignoring unknown diagnosticsStyle: {}", style),
            }
        }
        if let Some(limit) = options.get("workspaceSymbolLimit").and_then(|v| v.as_u64()) {
            config.workspace_symbol_limit = limit as usize;
        }

        log::info!("Session configuration:");
        log::info!("  build_tags: {:?}", config.build_tags);
        log::info!("  local_import_prefix: {:?}", config.local_import_prefix);
        log::info!("  cache_style: {:?}", config.cache_style);
        log::info!("  diagnostics_style: {:?}", config.diagnostics_style);
        log::info!("  workspace_symbol_limit: {}", config.workspace_symbol_limit);

        config
    }

    /// Loader flags derived from the build tags (`-tags "a b"`).
    pub fn build_flags(&self) -> Vec<String> {
        if self.build_tags.is_empty() {
            return Vec::new();
        }
        vec!["-tags".to_string(), self.build_tags.join(" ")]
    }

    /// Prefixes that should sort first when walking the cache
    pub fn rank_prefixes(&self) -> Vec<String> {
        if self.local_import_prefix.is_empty() {
            Vec::new()
        } else {
            vec![self.local_import_prefix.clone()]
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_default_values() {
        let config = Config::default();
        assert!(config.build_tags.is_empty());
        assert!(config.local_import_prefix.is_empty());
        assert_eq!(config.cache_style, CacheStyle::OnDemand);
        assert_eq!(config.diagnostics_style, DiagnosticsStyle::OnSave);
        assert_eq!(config.workspace_symbol_limit, 100);
        assert!(config.build_flags().is_empty());
    }

    #[test]
    fn test_apply_overrides_present_fields_only() {
        let defaults = Config {
            workspace_symbol_limit: 7,
            ..Config::default()
        };
        let options = json!({
            "buildTags": ["integration", "linux"],
            "globalCacheStyle": "always"
        });
        let config = defaults.apply(Some(&options));
        assert_eq!(config.build_tags, vec!["integration", "linux"]);
        assert_eq!(config.cache_style, CacheStyle::Always);
        // Absent fields retain the default
        assert_eq!(config.diagnostics_style, DiagnosticsStyle::OnSave);
        assert_eq!(config.workspace_symbol_limit, 7);
        assert_eq!(config.build_flags(), vec!["-tags", "integration linux"]);
    }

    #[test]
    fn test_apply_ignores_unknown_values() {
        let options = json!({
            "globalCacheStyle": "sometimes",
            "diagnosticsStyle": 3,
            "workspaceSymbolLimit": "many"
        });
        let config = Config::default().apply(Some(&options));
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_apply_without_options() {
        assert_eq!(Config::default().apply(None), Config::default());
        assert_eq!(Config::default().apply(Some(&Value::Null)), Config::default());
    }

    #[test]
    fn test_legacy_import_prefix_key() {
        let options = json!({ "goimportsLocalPrefix": "example.com/app" });
        let config = Config::default().apply(Some(&options));
        assert_eq!(config.local_import_prefix, "example.com/app");
        assert_eq!(config.rank_prefixes(), vec!["example.com/app"]);
    }
}
