//! Pass-through adapter: no provider-specific quirks to correct for.

use serde_json::Value;

use crate::error::GatewayError;

use super::CompatibilityAdapter;

pub struct GenericAdapter;

impl CompatibilityAdapter for GenericAdapter {
    fn adapt_request(&self, _body: &mut Value) -> Result<(), GatewayError> {
        Ok(())
    }

    fn adapt_response(&self, body: Vec<u8>) -> Result<Vec<u8>, GatewayError> {
        Ok(body)
    }
}
