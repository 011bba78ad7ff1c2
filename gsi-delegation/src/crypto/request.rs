// SPDX-License-Identifier: MIT
// Copyright (c) Microsoft Corporation.

use openssl::{
    error::ErrorStack,
    hash::MessageDigest,
    pkey::{PKey, Public},
    rsa::Rsa,
    x509::{X509Ref, X509ReqBuilder},
};

use crate::error::DelegationError;

/// The smallest key size, in bits, the generator will produce unless configured otherwise.
pub const DEFAULT_MINIMUM_KEY_SIZE: u32 = 1024;

/// A freshly generated key pair and the certificate request for it.
#[derive(Debug, Clone)]
pub struct NewRequest {
    /// The PEM-encoded PKCS#10 certificate request.
    pub certificate_request: String,
    /// The PEM-encoded, unencrypted PKCS#8 private key matching the request.
    pub private_key: String,
    /// The public key embedded in the request.
    pub public_key: PKey<Public>,
}

/// Generates one key pair and certificate request per delegation round.
#[derive(Debug, Clone, Copy)]
pub struct ProxyRequestGenerator {
    minimum_key_size: u32,
}

impl Default for ProxyRequestGenerator {
    fn default() -> Self {
        Self::new(DEFAULT_MINIMUM_KEY_SIZE)
    }
}

impl ProxyRequestGenerator {
    pub fn new(minimum_key_size: u32) -> Self {
        Self { minimum_key_size }
    }

    /// Generate an RSA key pair and a certificate request with the issuer's subject.
    ///
    /// The request carries no proxy CN component; that is added by the client when it signs.
    /// Requests for keys smaller than the configured minimum are raised to the minimum.
    pub fn new_request(
        &self,
        issuer: &X509Ref,
        key_size: u32,
    ) -> Result<NewRequest, DelegationError> {
        let bits = if key_size < self.minimum_key_size {
            tracing::warn!(
                requested = key_size,
                minimum = self.minimum_key_size,
                "Requested proxy key size is below the minimum; using the minimum"
            );
            self.minimum_key_size
        } else {
            key_size
        };

        build_request(issuer, bits).map_err(|error| {
            tracing::error!(?error, bits, "Failed to generate a proxy certificate request");
            DelegationError::KeyGeneration(error.to_string())
        })
    }
}

fn build_request(issuer: &X509Ref, bits: u32) -> Result<NewRequest, ErrorStack> {
    let key = PKey::from_rsa(Rsa::generate(bits)?)?;

    let mut builder = X509ReqBuilder::new()?;
    builder.set_version(0)?;
    builder.set_subject_name(issuer.subject_name())?;
    builder.set_pubkey(&key)?;
    builder.sign(&key, MessageDigest::sha256())?;
    let request = builder.build();

    let certificate_request = String::from_utf8_lossy(&request.to_pem()?).into_owned();
    let private_key = String::from_utf8_lossy(&key.private_key_to_pem_pkcs8()?).into_owned();
    let public_key = PKey::public_key_from_der(&key.public_key_to_der()?)?;

    Ok(NewRequest {
        certificate_request,
        private_key,
        public_key,
    })
}
