//! JSON Schema validation of request parts.
use jsonschema::Validator;
use serde_json::{Map, Value, json};

use crate::core::{
    error::{HttpError, RouteError},
    options::ValidationSchemas,
    request::Request,
};

/// Schemas compiled at registration time.
#[derive(Default)]
pub struct CompiledValidation {
    params: Option<Validator>,
    query: Option<Validator>,
    headers: Option<Validator>,
    body: Option<Validator>,
}

impl std::fmt::Debug for CompiledValidation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompiledValidation")
            .field("params", &self.params.is_some())
            .field("query", &self.query.is_some())
            .field("headers", &self.headers.is_some())
            .field("body", &self.body.is_some())
            .finish()
    }
}

fn compile_one(
    path: &str,
    location: &str,
    schema: &Option<Value>,
) -> Result<Option<Validator>, RouteError> {
    schema
        .as_ref()
        .map(|schema| {
            jsonschema::validator_for(schema).map_err(|e| RouteError::InvalidSchema {
                path: path.to_string(),
                location: location.to_string(),
                message: e.to_string(),
            })
        })
        .transpose()
}

impl CompiledValidation {
    pub fn compile(path: &str, schemas: &ValidationSchemas) -> Result<Self, RouteError> {
        Ok(Self {
            params: compile_one(path, "params", &schemas.params)?,
            query: compile_one(path, "query", &schemas.query)?,
            headers: compile_one(path, "headers", &schemas.headers)?,
            body: compile_one(path, "body", &schemas.body)?,
        })
    }

    pub fn is_empty(&self) -> bool {
        self.params.is_none() && self.query.is_none() && self.headers.is_none() && self.body.is_none()
    }

    /// Check every declared part of `req`, collecting all failures.
    pub fn validate(&self, req: &Request) -> Result<(), HttpError> {
        let mut errors: Vec<Value> = Vec::new();

        if let Some(validator) = &self.params {
            let params: Map<String, Value> = req
                .params()
                .iter()
                .map(|(k, v)| (k.clone(), Value::String(v.clone())))
                .collect();
            collect(validator, "params", &Value::Object(params), &mut errors);
        }
        if let Some(validator) = &self.query {
            collect(validator, "query", &Value::Object(req.query().clone()), &mut errors);
        }
        if let Some(validator) = &self.headers {
            let headers: Map<String, Value> = req
                .headers()
                .iter()
                .filter_map(|(name, value)| {
                    value
                        .to_str()
                        .ok()
                        .map(|v| (name.as_str().to_string(), Value::String(v.to_string())))
                })
                .collect();
            collect(validator, "headers", &Value::Object(headers), &mut errors);
        }
        if let Some(validator) = &self.body {
            collect(validator, "body", &req.payload().to_value(), &mut errors);
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(HttpError::Validation {
                detail: json!({ "errors": errors }),
            })
        }
    }
}

fn collect(validator: &Validator, location: &str, instance: &Value, errors: &mut Vec<Value>) {
    for error in validator.iter_errors(instance) {
        errors.push(json!({
            "location": location,
            "message": error.to_string(),
        }));
    }
}
