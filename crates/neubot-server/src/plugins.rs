//! Plugin loader: lets auxiliary test modules attach to the wired server.
//!
//! The bootstrap does not know which tests exist. It hands a
//! [`PluginContext`] to a [`PluginLoader`], and each plugin mounts its own
//! handlers and negotiate modules.

use crate::backend::StorageBackend;
use crate::config::ServerConfig;
use crate::event_loop::LoopHandle;
use crate::negotiate::NegotiateServer;
use crate::router::Router;
use neubot_core::NeubotResult;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Collaborators available to plugins at load time.
pub struct PluginContext<'a> {
    pub router: &'a mut Router,
    /// `None` when `server.negotiate` is disabled.
    pub negotiate: Option<Arc<NegotiateServer>>,
    pub backend: Arc<dyn StorageBackend>,
    pub config: &'a ServerConfig,
    pub event_loop: LoopHandle,
}

/// An auxiliary test module.
pub trait ServerPlugin: Send + Sync {
    fn name(&self) -> &str;

    /// Attach to the server. `mode` is the role the process runs in
    /// (`"server"` for this binary).
    fn attach(&self, mode: &str, context: &mut PluginContext<'_>) -> NeubotResult<()>;
}

pub trait PluginLoader {
    /// Offer `context` to every plugin under `root` matching `namespace_hint`.
    ///
    /// Returns the names of the plugins that attached.
    fn discover(
        &self,
        root: &Path,
        namespace_hint: &str,
        mode: &str,
        context: &mut PluginContext<'_>,
    ) -> Vec<String>;
}

/// Plugins compiled into the binary.
pub struct BuiltinPlugins {
    plugins: Vec<Box<dyn ServerPlugin>>,
}

impl Default for BuiltinPlugins {
    fn default() -> Self {
        Self::new()
    }
}

impl BuiltinPlugins {
    pub fn new() -> Self {
        Self { plugins: Vec::new() }
    }

    /// Every plugin shipped with the server.
    pub fn standard() -> Self {
        let mut plugins = Self::new();
        plugins.register(Box::new(crate::dash::DashPlugin));
        plugins
    }

    pub fn register(&mut self, plugin: Box<dyn ServerPlugin>) {
        self.plugins.push(plugin);
    }
}

/// A plugin matches when the hint is empty, `*`, or a prefix of its name.
fn matches_hint(name: &str, hint: &str) -> bool {
    hint.is_empty() || hint == "*" || name.starts_with(hint)
}

impl PluginLoader for BuiltinPlugins {
    fn discover(
        &self,
        root: &Path,
        namespace_hint: &str,
        mode: &str,
        context: &mut PluginContext<'_>,
    ) -> Vec<String> {
        debug!(root = %root.display(), hint = namespace_hint, mode, "discovering plugins");
        let mut attached = Vec::new();
        for plugin in self.plugins.iter().filter(|p| matches_hint(p.name(), namespace_hint)) {
            match plugin.attach(mode, context) {
                Ok(()) => {
                    info!(plugin = plugin.name(), "plugin attached");
                    attached.push(plugin.name().to_string());
                }
                Err(e) => warn!(plugin = plugin.name(), error = %e, "plugin failed to attach"),
            }
        }
        attached
    }
}
