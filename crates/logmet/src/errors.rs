// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

/// Errors raised while interpreting a log frame or one of its tuples.
/// These are never fatal; the parser skips the offending item and moves on.
#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    #[error("Malformed frame header: {0}")]
    MalformedFrame(String),

    #[error("Value is not a finite float: {0}")]
    BadValue(String),

    #[error("Tuple has no value: {0}")]
    MissingValue(String),
}

/// Admission failures on the ingress path. All of these map to a 400.
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("Missing authorization header")]
    MissingHeader,

    #[error("Malformed authorization header")]
    MalformedHeader,

    #[error("Credentials failed to decrypt")]
    Decrypt,
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Bucket not found in store")]
    NotFound,

    #[error("Undecodable bucket key: {0}")]
    BadKey(String),

    #[error("Redis error: {0}")]
    Backend(#[from] redis::RedisError),
}

#[derive(Debug, thiserror::Error)]
pub enum EgressError {
    #[error("Transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("Failed request: code={code} resp-body={body}")]
    Status { code: u16, body: String },

    #[error("Credentials are not in user:pass form")]
    Credentials,

    #[error("All delivery attempts failed")]
    Exhausted,
}

/// Startup misconfiguration. The only error kind that terminates the process.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Must set: {0}")]
    MissingEnv(&'static str),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let error = ConfigError::MissingEnv("SECRETS");
        assert_eq!(error.to_string(), "Must set: SECRETS");

        let error = EgressError::Status {
            code: 500,
            body: "oops".to_string(),
        };
        assert_eq!(error.to_string(), "Failed request: code=500 resp-body=oops");
    }
}
