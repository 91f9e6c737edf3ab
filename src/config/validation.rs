use std::{collections::HashSet, net::SocketAddr, path::Path};

use crate::config::models::{PayloadLimits, RouterConfig, ServerConfig, ShutdownConfig, TlsConfig};

/// Validation result type alias
pub type ValidationResult<T> = Result<T, ValidationError>;

/// Validation error types
#[derive(Debug, thiserror::Error, Clone)]
pub enum ValidationError {
    #[error("Invalid field '{field}': {message}")]
    InvalidField { field: String, message: String },

    #[error("Invalid listen address '{address}': {reason}")]
    InvalidListenAddress { address: String, reason: String },

    #[error("Invalid TLS configuration: {message}")]
    InvalidTls { message: String },

    #[error("Router conflict detected: {message}")]
    RouterConflict { message: String },

    #[error("Validation failed: {message}")]
    ValidationFailed { message: String },
}

/// Server configuration validator
pub struct ServerConfigValidator;

impl ServerConfigValidator {
    /// Validate the entire server configuration, reporting every problem at once
    pub fn validate(config: &ServerConfig) -> ValidationResult<()> {
        let mut errors = Vec::new();

        if let Err(e) = Self::validate_listen_address(&config.listen_addr) {
            errors.push(e);
        }

        if let Some(tls_config) = &config.tls {
            if let Err(e) = Self::validate_tls_config(tls_config) {
                errors.push(e);
            }
        }

        errors.extend(Self::validate_shutdown(&config.shutdown));
        errors.extend(Self::validate_payload_limits(&config.payload));

        let mut names = HashSet::new();
        for router in &config.routers {
            if !names.insert(router.name.as_str()) {
                errors.push(ValidationError::RouterConflict {
                    message: format!("Router name '{}' is used more than once", router.name),
                });
            }
            errors.extend(Self::validate_router(router));
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ValidationError::ValidationFailed {
                message: Self::format_multiple_errors(errors),
            })
        }
    }

    /// Validate listen address format
    fn validate_listen_address(address: &str) -> ValidationResult<()> {
        if address.parse::<SocketAddr>().is_err() {
            return Err(ValidationError::InvalidListenAddress {
                address: address.to_string(),
                reason: "Must be in format 'IP:PORT' (e.g., '127.0.0.1:3000' or '0.0.0.0:8080')"
                    .to_string(),
            });
        }
        Ok(())
    }

    /// Validate TLS configuration
    fn validate_tls_config(config: &TlsConfig) -> ValidationResult<()> {
        if !Path::new(&config.cert_path).exists() {
            return Err(ValidationError::InvalidTls {
                message: format!("Certificate file does not exist: {}", config.cert_path),
            });
        }
        if !Path::new(&config.key_path).exists() {
            return Err(ValidationError::InvalidTls {
                message: format!("Private key file does not exist: {}", config.key_path),
            });
        }
        Ok(())
    }

    fn validate_shutdown(config: &ShutdownConfig) -> Vec<ValidationError> {
        let mut errors = Vec::new();
        if let Err(e) = config.request_grace_period() {
            errors.push(ValidationError::InvalidField {
                field: "shutdown.request_grace_period".to_string(),
                message: format!("'{}' is not a duration: {e}", config.request_grace_period),
            });
        }
        if let Err(e) = config.socket_close_timeout() {
            errors.push(ValidationError::InvalidField {
                field: "shutdown.socket_close_timeout".to_string(),
                message: format!("'{}' is not a duration: {e}", config.socket_close_timeout),
            });
        }
        errors
    }

    fn validate_payload_limits(limits: &PayloadLimits) -> Vec<ValidationError> {
        [
            ("payload.max_bytes", limits.max_bytes),
            ("payload.max_parts", limits.max_parts),
            ("payload.max_field_name_bytes", limits.max_field_name_bytes),
            ("payload.max_field_value_bytes", limits.max_field_value_bytes),
            ("payload.max_file_bytes", limits.max_file_bytes),
        ]
        .into_iter()
        .filter(|(_, value)| *value == 0)
        .map(|(field, _)| ValidationError::InvalidField {
            field: field.to_string(),
            message: "Must be greater than zero".to_string(),
        })
        .collect()
    }

    fn validate_router(router: &RouterConfig) -> Vec<ValidationError> {
        let mut errors = Vec::new();

        if router.name.trim().is_empty() {
            errors.push(ValidationError::InvalidField {
                field: "routers.name".to_string(),
                message: "Router name must not be empty".to_string(),
            });
        }

        if !router.base_path.is_empty() && !router.base_path.starts_with('/') {
            errors.push(ValidationError::InvalidField {
                field: format!("router '{}' base_path", router.name),
                message: "Base paths must be empty or start with '/'".to_string(),
            });
        }

        for dir in &router.directories {
            if !Path::new(dir).is_dir() {
                errors.push(ValidationError::InvalidField {
                    field: format!("router '{}' directories", router.name),
                    message: format!("Route directory '{dir}' does not exist"),
                });
            }
        }

        errors
    }

    /// Format multiple validation errors into a single message
    fn format_multiple_errors(errors: Vec<ValidationError>) -> String {
        if errors.is_empty() {
            return "No errors".to_string();
        }

        if errors.len() == 1 {
            return errors[0].to_string();
        }

        let mut message = format!("Found {} validation errors:\n", errors.len());
        for (i, error) in errors.iter().enumerate() {
            message.push_str(&format!("  {}. {}\n", i + 1, error));
        }
        message
    }
}
