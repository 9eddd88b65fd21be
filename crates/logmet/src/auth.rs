// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Credential codec for the ingress and egress paths.
//!
//! Producers authenticate with an HTTP basic header whose user field is an
//! encrypted blob of the tenant's upstream API credentials. Being able to
//! decrypt the blob is the admission check; the plaintext is only needed
//! much later, when an outlet signs an upstream request with it.

use crate::errors::{AuthError, ConfigError};
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use fernet::{Fernet, MultiFernet};

pub struct Credentials {
    keyring: MultiFernet,
}

impl Credentials {
    /// Build a keyring from the colon-separated `SECRETS` keys. The first
    /// key encrypts; all keys are tried on decrypt so keys can rotate.
    pub fn new(secrets: &[String]) -> Result<Self, ConfigError> {
        if secrets.is_empty() {
            return Err(ConfigError::MissingEnv("SECRETS"));
        }
        let mut fernets = Vec::with_capacity(secrets.len());
        for key in secrets {
            match Fernet::new(key) {
                Some(f) => fernets.push(f),
                None => {
                    return Err(ConfigError::Invalid(
                        "SECRETS must be 32-byte url-safe base64 fernet keys".to_string(),
                    ))
                }
            }
        }
        Ok(Self {
            keyring: MultiFernet::new(fernets),
        })
    }

    pub fn encrypt(&self, plain: &str) -> String {
        self.keyring.encrypt(plain.as_bytes())
    }

    pub fn decrypt(&self, blob: &str) -> Result<String, AuthError> {
        let plain = self.keyring.decrypt(blob).map_err(|_| AuthError::Decrypt)?;
        String::from_utf8(plain).map_err(|_| AuthError::Decrypt)
    }

    /// Extract the encrypted blob from an `Authorization: Basic` header.
    /// The blob rides in the user field; the password field is ignored.
    pub fn parse_header(header: Option<&str>) -> Result<String, AuthError> {
        let decoded = decode_basic(header)?;
        Ok(decoded
            .split_once(':')
            .map(|(user, _)| user.to_string())
            .unwrap_or(decoded))
    }

    /// Issue a blob for the basic credentials carried on a `/sign` request.
    pub fn sign(&self, header: Option<&str>) -> Result<String, AuthError> {
        let decoded = decode_basic(header)?;
        Ok(self.encrypt(&decoded))
    }
}

fn decode_basic(header: Option<&str>) -> Result<String, AuthError> {
    let (scheme, payload) = header
        .ok_or(AuthError::MissingHeader)?
        .split_once(' ')
        .ok_or(AuthError::MalformedHeader)?;
    if !scheme.eq_ignore_ascii_case("basic") {
        return Err(AuthError::MalformedHeader);
    }
    let raw = STANDARD
        .decode(payload.trim())
        .map_err(|_| AuthError::MalformedHeader)?;
    String::from_utf8(raw).map_err(|_| AuthError::MalformedHeader)
}
