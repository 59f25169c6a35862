//! Server-Compatibility Adapters (section 4.6): last-mile per-provider quirk
//! handling applied just outside the Protocol Validator boundary. Adapter
//! selection (`routing::CompatAdapter`) is already resolved at routing-table
//! build time; this module only implements each adapter's behavior.

pub mod generic;
pub mod lmstudio;
pub mod modelscope;

use std::collections::HashMap;

use serde_json::Value;

use crate::error::GatewayError;
use crate::routing::CompatAdapter;

/// Adapters act on the raw upstream-dialect JSON, after the Protocol
/// Validator on descent and before it on ascent — they reshape within the
/// target dialect, never introduce fields the dialect doesn't have.
pub trait CompatibilityAdapter {
    /// Applied to the outgoing request body just before dispatch.
    fn adapt_request(&self, body: &mut Value) -> Result<(), GatewayError>;

    /// Applied to the raw upstream response body before the response-direction
    /// Transformer parses it. Returns the (possibly rewritten) body.
    fn adapt_response(&self, body: Vec<u8>) -> Result<Vec<u8>, GatewayError>;
}

/// `settings` is the binding's provider-level free-form config map
/// (section 6's `providers.<name>.settings`); lmstudio reads `modelRemap`
/// and `knownLoadedModels` out of it, other adapters ignore it.
pub fn adapter_for(kind: CompatAdapter, settings: &HashMap<String, Value>) -> Box<dyn CompatibilityAdapter + Send> {
    match kind {
        CompatAdapter::LmStudio => Box::new(lmstudio::LmStudioAdapter::from_settings(settings)),
        CompatAdapter::ModelScope => Box::new(modelscope::ModelScopeAdapter),
        CompatAdapter::Generic => Box::new(generic::GenericAdapter),
    }
}
