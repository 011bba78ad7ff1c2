// SPDX-License-Identifier: MIT
// Copyright (c) Microsoft Corporation.

//! Derivation of delegation and cache identifiers.
//!
//! A delegation ID names one delegation relationship. Clients may omit it, in which case it is
//! derived from their DN and VOMS attributes, so derivation must be deterministic. Pending
//! requests are stored under a cache ID, which appends a digest of the generated public key so
//! that two rounds for the same delegation never land in the same slot.

use openssl::{
    error::ErrorStack,
    pkey::{HasPublic, PKeyRef},
    sha::sha1,
};

/// Number of digest bytes kept in a delegation ID.
pub const DELEGATION_ID_BYTES: usize = 20;

/// Number of digest bytes kept in a session ID.
pub const SESSION_ID_BYTES: usize = 8;

/// Separates the delegation ID from the session ID in a cache ID.
pub const CACHE_ID_SEPARATOR: char = '+';

/// Derive the delegation ID for a DN and its VOMS attributes.
///
/// The DN and each attribute are concatenated in order and digested with SHA-1. An empty
/// attribute list is valid and yields an ID derived from the DN alone.
pub fn gen_delegation_id<S: AsRef<str>>(owner_dn: &str, voms_attributes: &[S]) -> String {
    let mut material = String::from(owner_dn);
    for attribute in voms_attributes {
        material.push_str(attribute.as_ref());
    }
    truncated_digest(material.as_bytes(), DELEGATION_ID_BYTES)
}

/// Derive the session ID for a generated public key.
///
/// The key is digested in its DER-encoded SubjectPublicKeyInfo form.
pub fn gen_session_id<T: HasPublic>(public_key: &PKeyRef<T>) -> Result<String, ErrorStack> {
    let der = public_key.public_key_to_der()?;
    Ok(truncated_digest(&der, SESSION_ID_BYTES))
}

/// The key a pending request is stored under.
pub fn cache_id(delegation_id: &str, session_id: &str) -> String {
    format!("{delegation_id}{CACHE_ID_SEPARATOR}{session_id}")
}

fn truncated_digest(data: &[u8], length: usize) -> String {
    let digest = sha1(data);
    hex::encode(&digest[..length.min(digest.len())])
}
