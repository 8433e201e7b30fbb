//! Schema boundary: injected compilation and validation.
//!
//! The engine never inspects schema internals. A schema is an opaque
//! `serde_json::Value` handed to the injected [`SchemaCompiler`], which
//! produces a [`Validator`]; the engine only consumes the success/data/faults
//! envelope. The crate ships [`AcceptAll`] as the permissive default.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::{Result, ValidationFault};

/// Result of validating one value against a compiled schema.
#[derive(Debug, Clone)]
pub enum ValidationOutcome {
    /// The value passed, possibly coerced or defaulted by the validator.
    Valid(Value),
    /// The value was rejected.
    Invalid(Vec<ValidationFault>),
}

impl ValidationOutcome {
    /// Whether the value passed.
    pub fn success(&self) -> bool {
        matches!(self, Self::Valid(_))
    }

    /// Convert into a plain result.
    pub fn into_result(self) -> std::result::Result<Value, Vec<ValidationFault>> {
        match self {
            Self::Valid(value) => Ok(value),
            Self::Invalid(faults) => Err(faults),
        }
    }
}

/// A compiled validator for one schema.
#[async_trait]
pub trait Validator: Send + Sync {
    /// Validate a value, returning the (possibly coerced) data or faults.
    async fn validate(&self, value: Value) -> ValidationOutcome;
}

/// Compiles opaque schema values into validators.
#[async_trait]
pub trait SchemaCompiler: Send + Sync {
    /// Compile a schema. Compilation may be asynchronous and may fail.
    async fn compile(&self, schema: &Value) -> Result<Arc<dyn Validator>>;
}

/// Permissive compiler: every value passes unchanged.
pub struct AcceptAll;

#[async_trait]
impl Validator for AcceptAll {
    async fn validate(&self, value: Value) -> ValidationOutcome {
        ValidationOutcome::Valid(value)
    }
}

#[async_trait]
impl SchemaCompiler for AcceptAll {
    async fn compile(&self, _schema: &Value) -> Result<Arc<dyn Validator>> {
        Ok(Arc::new(AcceptAll))
    }
}

/// A validator that accepts everything, without going through a compiler.
///
/// Used for channels whose schema is undeclared.
pub fn permissive() -> Arc<dyn Validator> {
    Arc::new(AcceptAll)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn accept_all_passes_values_unchanged() {
        let validator = AcceptAll.compile(&json!({"whatever": true})).await.unwrap();
        let outcome = validator.validate(json!({"x": 5})).await;
        assert!(outcome.success());
        assert_eq!(outcome.into_result().unwrap(), json!({"x": 5}));
    }

    #[tokio::test]
    async fn outcome_into_result() {
        let invalid = ValidationOutcome::Invalid(vec![ValidationFault::root("nope")]);
        let faults = invalid.into_result().unwrap_err();
        assert_eq!(faults.len(), 1);
        assert_eq!(faults[0].message, "nope");
    }
}
