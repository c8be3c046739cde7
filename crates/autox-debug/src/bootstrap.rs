//! Wiring from configuration to a running debug connection.

use std::sync::Arc;

use autox_config::AutoxConfig;

use crate::context::DebugHost;
use crate::error::DebugResult;
use crate::registry::DebugPointRegistry;
use crate::server::{DebugConnection, DebugServer};

/// A live debug session: interpreters consult `registry` before each location.
pub struct DebugRuntime {
    pub registry: Arc<DebugPointRegistry>,
    pub connection: DebugConnection,
}

/// Start the debug server described by `config`, blocking until a debugger has connected and
/// completed its handshake. Returns `None` when the server is disabled.
pub fn start(
    config: &AutoxConfig,
    host: Arc<dyn DebugHost>,
) -> DebugResult<Option<DebugRuntime>> {
    if !config.debug.enabled {
        tracing::debug!(target: "autox.debug", "debug server disabled");
        return Ok(None);
    }
    config.validate()?;

    let registry = DebugPointRegistry::new(host);
    let server = DebugServer::bind(&config.debug, registry.clone())?;
    tracing::info!(
        target: "autox.debug",
        port = config.debug.port,
        "waiting for debugger to connect"
    );
    let connection = server.start()?;
    Ok(Some(DebugRuntime {
        registry,
        connection,
    }))
}
