//
// session.rs
//
// Per-connection lifecycle state machine and the world built at initialize
//

use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};

use serde_json::json;
use tower_lsp::lsp_types::*;
use url::Url;

use crate::cancel::CancellationRegistry;
use crate::config::{Config, ServerOptions};
use crate::error::DispatchError;
use crate::loader::LoaderFactory;
use crate::workspace::Workspace;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    Uninitialized,
    Initialized,
    ShuttingDown,
    Closed,
}

/// State created by a successful `initialize`
#[derive(Debug)]
pub struct World {
    pub config: Arc<Config>,
    pub workspace: Arc<Workspace>,
    pub root_uri: Option<Url>,
}

/// One client connection.
///
/// The cancellation registry exists from the moment the connection is
/// accepted so that requests rejected before `initialize` still get a scope.
pub struct Session {
    state: Mutex<Lifecycle>,
    world: OnceLock<World>,
    registry: Arc<CancellationRegistry>,
    loaders: Arc<dyn LoaderFactory>,
    options: ServerOptions,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("state", &self.state())
            .field("world", &self.world.get())
            .field("inflight", &self.registry.len())
            .finish()
    }
}

impl Session {
    pub fn new(options: ServerOptions, loaders: Arc<dyn LoaderFactory>) -> Self {
        Self {
            state: Mutex::new(Lifecycle::Uninitialized),
            world: OnceLock::new(),
            registry: Arc::new(CancellationRegistry::new()),
            loaders,
            options,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Lifecycle> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn state(&self) -> Lifecycle {
        *self.lock()
    }

    pub fn options(&self) -> &ServerOptions {
        &self.options
    }

    pub fn registry(&self) -> &Arc<CancellationRegistry> {
        &self.registry
    }

    pub fn world(&self) -> Option<&World> {
        self.world.get()
    }

    /// Gate for every method other than the lifecycle ones: the world, if
    /// the session is serving.
    pub fn ready(&self) -> Result<&World, DispatchError> {
        match self.state() {
            Lifecycle::Uninitialized => Err(DispatchError::NotInitialized),
            Lifecycle::ShuttingDown | Lifecycle::Closed => Err(DispatchError::ShuttingDown),
            Lifecycle::Initialized => self.world.get().ok_or(DispatchError::NotInitialized),
        }
    }

    /// First half of `initialize`: merges the configuration and builds the
    /// world without publishing it. The caller runs the eager load and then
    /// hands the world to [`Session::commit`].
    pub fn prepare(&self, params: InitializeParams) -> Result<World, DispatchError> {
        match self.state() {
            Lifecycle::Uninitialized => {}
            Lifecycle::Initialized => return Err(DispatchError::AlreadyInitialized),
            Lifecycle::ShuttingDown | Lifecycle::Closed => return Err(DispatchError::ShuttingDown),
        }

        log::info!("Initializing unitls");
        let config = self
            .options
            .defaults
            .apply(params.initialization_options.as_ref());

        #[allow(deprecated)]
        let root_uri = normalize_root(params.root_uri, params.root_path.as_deref());
        let root = root_uri.as_ref().and_then(|uri| uri.to_file_path().ok());
        match &root {
            Some(root) => log::info!("Workspace root: {}", root.display()),
            None => log::info!("No workspace root"),
        }

        let workspace = Workspace::new(
            root,
            &config,
            self.loaders.as_ref(),
            self.options.trace_cache,
        );
        Ok(World {
            config: Arc::new(config),
            workspace: Arc::new(workspace),
            root_uri,
        })
    }

    /// Publishes a prepared world and answers with the server capabilities.
    ///
    /// Until this runs the session stays uninitialized, so a failed eager
    /// load leaves `initialize` free to be retried.
    pub fn commit(&self, world: World) -> Result<InitializeResult, DispatchError> {
        {
            let mut state = self.lock();
            match *state {
                Lifecycle::Uninitialized => {}
                Lifecycle::Initialized => return Err(DispatchError::AlreadyInitialized),
                Lifecycle::ShuttingDown | Lifecycle::Closed => {
                    return Err(DispatchError::ShuttingDown)
                }
            }
            if self.world.set(world).is_err() {
                return Err(DispatchError::AlreadyInitialized);
            }
            *state = Lifecycle::Initialized;
        }

        Ok(InitializeResult {
            capabilities: capabilities(),
            server_info: Some(ServerInfo {
                name: String::from("unitls"),
                version: Some(String::from(env!("CARGO_PKG_VERSION"))),
            }),
        })
    }

    /// Moves to `ShuttingDown`. A repeated shutdown is logged and succeeds.
    pub fn shutdown(&self) -> Result<(), DispatchError> {
        let mut state = self.lock();
        match *state {
            Lifecycle::Uninitialized => Err(DispatchError::NotInitialized),
            Lifecycle::Initialized => {
                log::info!("Shutting down");
                *state = Lifecycle::ShuttingDown;
                Ok(())
            }
            Lifecycle::ShuttingDown | Lifecycle::Closed => {
                log::warn!("Received shutdown but the server is already shut down");
                Ok(())
            }
        }
    }

    /// Closes the session from any state and cancels in-flight requests.
    pub fn exit(&self) {
        let previous = std::mem::replace(&mut *self.lock(), Lifecycle::Closed);
        if previous != Lifecycle::ShuttingDown {
            log::warn!("Received exit in state {:?} without a prior shutdown", previous);
        }
        self.registry.cancel_all();
    }
}

/// Picks the workspace root: `rootUri` first, then the deprecated
/// `rootPath`, which may hold either a URI or a plain path.
pub fn normalize_root(root_uri: Option<Url>, root_path: Option<&str>) -> Option<Url> {
    if let Some(uri) = root_uri {
        return Some(uri);
    }
    let path = root_path.map(str::trim).filter(|p| !p.is_empty())?;
    if path.contains("://") {
        match Url::parse(path) {
            Ok(uri) => {
                log::warn!("rootPath holds a URI ({}); clients should send rootUri", uri);
                return Some(uri);
            }
            Err(e) => {
                log::warn!("Ignoring unparsable rootPath {}: {}", path, e);
                return None;
            }
        }
    }
    match Url::from_file_path(PathBuf::from(path)) {
        Ok(uri) => Some(uri),
        Err(()) => {
            log::warn!("Ignoring rootPath that is not an absolute path: {}", path);
            None
        }
    }
}

/// The fixed capability set. Code actions are routed but not advertised.
pub fn capabilities() -> ServerCapabilities {
    ServerCapabilities {
        text_document_sync: Some(TextDocumentSyncCapability::Options(TextDocumentSyncOptions {
            open_close: Some(true),
            change: Some(TextDocumentSyncKind::INCREMENTAL),
            ..Default::default()
        })),
        completion_provider: Some(CompletionOptions {
            trigger_characters: Some(vec![String::from(".")]),
            ..Default::default()
        }),
        definition_provider: Some(OneOf::Left(true)),
        type_definition_provider: Some(TypeDefinitionProviderCapability::Simple(true)),
        implementation_provider: Some(ImplementationProviderCapability::Simple(true)),
        document_formatting_provider: Some(OneOf::Left(true)),
        document_range_formatting_provider: Some(OneOf::Left(true)),
        document_symbol_provider: Some(OneOf::Left(true)),
        hover_provider: Some(HoverProviderCapability::Simple(true)),
        references_provider: Some(OneOf::Left(true)),
        rename_provider: Some(OneOf::Left(true)),
        workspace_symbol_provider: Some(OneOf::Left(true)),
        signature_help_provider: Some(SignatureHelpOptions {
            trigger_characters: Some(vec![String::from("("), String::from(",")]),
            ..Default::default()
        }),
        experimental: Some(json!({
            "xdefinitionProvider": true,
            "xworkspaceReferencesProvider": true,
            "xworkspaceSymbolByProperties": true,
        })),
        ..Default::default()
    }
}
