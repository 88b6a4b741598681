//! DASH (adaptive streaming) test.

pub mod negotiate;
pub mod server;

use crate::plugins::{PluginContext, ServerPlugin};
use neubot_core::{NeubotError, NeubotResult};
use std::sync::Arc;
use tracing::debug;

pub use negotiate::DashNegotiateServer;
pub use server::DashServer;

/// Mounts the DASH negotiate module and the download handler.
pub struct DashPlugin;

impl ServerPlugin for DashPlugin {
    fn name(&self) -> &str {
        "dash"
    }

    fn attach(&self, mode: &str, context: &mut PluginContext<'_>) -> NeubotResult<()> {
        if mode != "server" {
            return Err(NeubotError::Other(format!("dash: unsupported mode {mode}")));
        }
        let negotiate = context
            .negotiate
            .as_ref()
            .ok_or_else(|| NeubotError::Other("dash: negotiate server is disabled".into()))?;

        let dash = Arc::new(DashNegotiateServer::new(context.backend.clone()));
        negotiate.register_module("dash", dash.clone());
        context
            .router
            .register_child("/dash/", Arc::new(DashServer::new(dash)));
        debug!("dash: module registered");
        Ok(())
    }
}
