//! Unified error types for netferry

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Main error type for netferry operations
#[derive(Error, Debug)]
pub enum Error {
    // IO errors
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    // Config errors
    #[error("Failed to read config file '{path}': {source}")]
    ConfigRead { path: PathBuf, source: io::Error },

    #[error("Failed to parse config: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("Config validation failed: {0}")]
    ConfigValidation(String),

    // Store errors
    #[error("Store error: {0}")]
    Store(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    // Lookup errors
    #[error("Network '{0}' not found")]
    NetworkNotFound(String),

    #[error("Endpoint '{0}' not found")]
    EndpointNotFound(String),

    #[error("No route for {0}")]
    RouteNotFound(String),

    // Namespace errors
    #[error("Namespace for network '{network}' failed: {message}")]
    Namespace { network: String, message: String },

    // Overlay errors
    #[error("Overlay step '{step}' failed for network '{network}': {source}")]
    Overlay {
        network: String,
        step: String,
        source: Box<Error>,
    },

    #[error("Netlink error: {0}")]
    Netlink(String),

    // Allocation errors
    #[error("Address {address} is unavailable in network '{network}'")]
    AddressUnavailable { address: String, network: String },

    #[error("No free address left in network '{0}'")]
    RangeExhausted(String),

    #[error("Invalid CIDR '{0}'")]
    InvalidCidr(String),

    // Tunnel errors
    #[error("Tunnel error: {0}")]
    Tunnel(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Command '{command}' failed: {message}")]
    CommandFailed { command: String, message: String },

    #[error("Background task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

impl Error {
    /// Wrap an error with the overlay step that produced it
    pub fn overlay(network: &str, step: impl Into<String>, source: Error) -> Self {
        Error::Overlay {
            network: network.to_string(),
            step: step.into(),
            source: Box::new(source),
        }
    }

    /// HTTP status surfaced to API clients
    pub fn status_code(&self) -> u16 {
        match self {
            Error::NetworkNotFound(_) | Error::EndpointNotFound(_) | Error::RouteNotFound(_) => 404,
            Error::AddressUnavailable { .. }
            | Error::RangeExhausted(_)
            | Error::InvalidCidr(_)
            | Error::InvalidRequest(_)
            | Error::Json(_) => 400,
            _ => 500,
        }
    }
}

/// Result type alias for netferry operations
pub type Result<T> = std::result::Result<T, Error>;
