// SPDX-License-Identifier: MIT
// Copyright (c) Microsoft Corporation.

//! The identity of the caller, as established by the authentication layer.
//!
//! The delegation service never authenticates clients itself. Whatever terminates the client's
//! TLS session builds a [`SecurityContext`] and passes it explicitly into each operation.

use openssl::{
    error::ErrorStack,
    x509::{X509NameRef, X509Ref, X509},
};

/// The authenticated caller of a delegation operation.
#[derive(Debug, Clone)]
pub struct SecurityContext {
    owner_dn: String,
    voms_attributes: Vec<String>,
    client_chain: Vec<X509>,
}

impl SecurityContext {
    /// Create a context from values already resolved by the authentication layer.
    ///
    /// The `client_chain` starts with the client's leaf certificate. It may be empty for
    /// administrative callers that never request new proxies.
    pub fn new(owner_dn: String, voms_attributes: Vec<String>, client_chain: Vec<X509>) -> Self {
        Self {
            owner_dn,
            voms_attributes,
            client_chain,
        }
    }

    /// Create a context from the chain the client authenticated with.
    ///
    /// Clients commonly authenticate with a proxy of their own, so the owner DN is the subject
    /// of the first certificate, starting from the leaf, that isn't a proxy of its issuer.
    pub fn from_client_chain(
        client_chain: Vec<X509>,
        voms_attributes: Vec<String>,
    ) -> Result<Self, ErrorStack> {
        let mut owner_dn = None;
        for certificate in &client_chain {
            let subject = dn_string(certificate.subject_name())?;
            let issuer = dn_string(certificate.issuer_name())?;
            if !is_proxy_name(&subject, &issuer) {
                owner_dn = Some(subject);
                break;
            }
        }
        // A chain made only of proxies is truncated; the best available owner is the issuer
        // of the last one.
        let owner_dn = match (owner_dn, client_chain.last()) {
            (Some(owner_dn), _) => owner_dn,
            (None, Some(last)) => dn_string(last.issuer_name())?,
            (None, None) => String::new(),
        };

        Ok(Self::new(owner_dn, voms_attributes, client_chain))
    }

    pub fn owner_dn(&self) -> &str {
        &self.owner_dn
    }

    pub fn voms_attributes(&self) -> &[String] {
        &self.voms_attributes
    }

    pub fn client_chain(&self) -> &[X509] {
        &self.client_chain
    }

    /// The certificate the client authenticated with, if any.
    pub fn client_certificate(&self) -> Option<&X509Ref> {
        self.client_chain.first().map(|cert| cert.as_ref())
    }
}

/// Render an X.509 name in the slash-separated form, e.g. `/O=Grid/CN=Alice`.
pub fn dn_string(name: &X509NameRef) -> Result<String, ErrorStack> {
    let mut dn = String::new();
    for entry in name.entries() {
        let object = entry.object();
        let key = object
            .nid()
            .short_name()
            .map(str::to_string)
            .unwrap_or_else(|_| object.to_string());
        let value = entry.data().to_string()?;
        dn.push('/');
        dn.push_str(&key);
        dn.push('=');
        dn.push_str(&value);
    }
    Ok(dn)
}

/// Returns true if `issuer` is `owner`, or a proxy of it (`owner` followed by `/CN=` components).
pub fn issued_by_owner(issuer: &str, owner: &str) -> bool {
    if owner.is_empty() {
        return false;
    }
    match issuer.strip_prefix(owner) {
        Some("") => true,
        Some(rest) => rest
            .split("/CN=")
            .skip(1)
            .all(|component| !component.is_empty() && !component.contains('/'))
            && rest.starts_with("/CN="),
        None => false,
    }
}

// A proxy's subject is its issuer's subject with exactly one CN component appended.
fn is_proxy_name(subject: &str, issuer: &str) -> bool {
    subject
        .strip_prefix(issuer)
        .and_then(|rest| rest.strip_prefix("/CN="))
        .is_some_and(|cn| !cn.is_empty() && !cn.contains('/'))
}
