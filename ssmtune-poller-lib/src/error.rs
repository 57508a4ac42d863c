use derive_more::{Display, Error, From};
use ssmtune_protocol_lib::ProtocolError;

/// Errors from building a coalesced query or decoding its response.
#[derive(Debug, Display, Error, From)]
pub enum QueryError {
    #[display("{count} addresses exceed the {max} address limit of one query; split the parameter set")]
    AddressMapTooLarge { count: usize, max: usize },
    #[display("parameter {id} reads outside the 24-bit address space")]
    AddressOutOfRange { id: String },
    #[display("response carries {actual} bytes but {expected} addresses were queried")]
    ProtocolParseError { expected: usize, actual: usize },
    #[display("{_0}")]
    #[from]
    Protocol(ProtocolError),
}

/// Errors loading configuration or definition files.
#[derive(Debug, Display, Error, From)]
pub enum ConfigError {
    #[display("cannot read config: {_0}")]
    #[from]
    Io(std::io::Error),
    #[display("invalid config JSON: {_0}")]
    #[from]
    Json(serde_json::Error),
}
