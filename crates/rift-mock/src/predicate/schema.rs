use crate::error::RuleError;
use serde_json::Value;
use std::fmt;
use std::sync::Arc;

/// JSON-schema precondition on the request body.
#[derive(Clone)]
pub struct SchemaGate {
    validator: Arc<jsonschema::Validator>,
}

impl SchemaGate {
    pub fn compile(rule: &str, schema: &Value) -> Result<Self, RuleError> {
        let validator = jsonschema::validator_for(schema).map_err(|e| RuleError::InvalidSchema {
            rule: rule.to_string(),
            message: e.to_string(),
        })?;
        Ok(Self {
            validator: Arc::new(validator),
        })
    }

    /// A missing or non-JSON body never passes.
    pub fn allows(&self, body: Option<&Value>) -> bool {
        body.map(|v| self.validator.is_valid(v)).unwrap_or(false)
    }
}

impl fmt::Debug for SchemaGate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SchemaGate")
    }
}
