// SPDX-License-Identifier: MIT
// Copyright (c) Microsoft Corporation.

use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, Utc};
use openssl::{
    asn1::Asn1Integer,
    bn::BigNum,
    hash::MessageDigest,
    pkey::{PKeyRef, Private},
    x509::{extension::KeyUsage, X509Builder, X509NameBuilder, X509Ref, X509ReqRef, X509},
};

use super::{asn1_to_datetime, chain_to_pem, datetime_to_asn1};

/// Backdate proxies slightly so small clock differences don't make them "not yet valid".
const CLOCK_SKEW_ALLOWANCE: Duration = Duration::from_secs(300);

/// The validity window of a proxy certificate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Validity {
    pub not_before: DateTime<Utc>,
    pub not_after: DateTime<Utc>,
}

impl Validity {
    /// A window starting now (less a small allowance for clock skew) lasting `lifetime`.
    pub fn for_lifetime(lifetime: Duration) -> anyhow::Result<Self> {
        let now = Utc::now();
        Ok(Self {
            not_before: now - chrono::Duration::from_std(CLOCK_SKEW_ALLOWANCE)?,
            not_after: now + chrono::Duration::from_std(lifetime)?,
        })
    }
}

/// The certificate-issuing side of delegation.
///
/// Clients use this to turn the service's certificate request into a proxy certificate.
pub trait ProxySigner {
    /// Check the request is well-formed and signed by the key it carries.
    fn verify(&self, request: &X509ReqRef) -> anyhow::Result<bool>;

    /// Issue a proxy certificate for `request`, signed by `issuer_key`.
    fn sign(
        &self,
        request: &X509ReqRef,
        issuer: &X509Ref,
        issuer_key: &PKeyRef<Private>,
        validity: Validity,
    ) -> anyhow::Result<X509>;
}

/// Issues legacy-style proxy certificates using OpenSSL.
///
/// The proxy's subject is the issuer's subject with a `CN=<serial number>` component appended,
/// and its lifetime never extends past the issuer's.
#[derive(Debug, Clone, Copy, Default)]
pub struct OpenSslProxySigner;

impl OpenSslProxySigner {
    /// Sign `request` and assemble the chain `putProxy` expects: the proxy followed by the
    /// issuer and the rest of its chain.
    pub fn delegate(
        &self,
        request_pem: &str,
        issuer_chain: &[X509],
        issuer_key: &PKeyRef<Private>,
        validity: Validity,
    ) -> anyhow::Result<String> {
        let request = openssl::x509::X509Req::from_pem(request_pem.as_bytes())
            .context("The certificate request is not valid PEM")?;
        let issuer = issuer_chain
            .first()
            .ok_or_else(|| anyhow::anyhow!("The issuer chain is empty"))?;
        let proxy = self.sign(&request, issuer, issuer_key, validity)?;
        chain_to_pem(std::iter::once(&*proxy).chain(issuer_chain.iter().map(|cert| &**cert)))
    }
}

impl ProxySigner for OpenSslProxySigner {
    fn verify(&self, request: &X509ReqRef) -> anyhow::Result<bool> {
        let public_key = request.public_key()?;
        Ok(request.verify(&public_key)?)
    }

    fn sign(
        &self,
        request: &X509ReqRef,
        issuer: &X509Ref,
        issuer_key: &PKeyRef<Private>,
        validity: Validity,
    ) -> anyhow::Result<X509> {
        if !self.verify(request)? {
            return Err(anyhow::anyhow!(
                "The certificate request signature does not verify"
            ));
        }

        let mut serial_number = [0; 8];
        openssl::rand::rand_bytes(&mut serial_number)?;
        let mut serial_number = BigNum::from_slice(&serial_number)?;
        serial_number.set_negative(false);

        let mut subject = X509NameBuilder::new()?;
        for entry in issuer.subject_name().entries() {
            subject.append_entry(entry)?;
        }
        subject.append_entry_by_nid(
            openssl::nid::Nid::COMMONNAME,
            &serial_number.to_dec_str()?,
        )?;
        let subject = subject.build();

        let issuer_not_after = asn1_to_datetime(issuer.not_after())?;
        let not_after = validity.not_after.min(issuer_not_after);

        let serial_number = Asn1Integer::from_bn(&serial_number)?;
        let request_key = request.public_key()?;

        let mut builder = X509Builder::new()?;
        builder.set_version(2)?;
        builder.set_serial_number(&serial_number)?;
        builder.set_subject_name(&subject)?;
        builder.set_issuer_name(issuer.subject_name())?;
        builder.set_pubkey(&request_key)?;
        builder.set_not_before(datetime_to_asn1(&validity.not_before)?.as_ref())?;
        builder.set_not_after(datetime_to_asn1(&not_after)?.as_ref())?;
        builder.append_extension(
            KeyUsage::new()
                .critical()
                .digital_signature()
                .key_encipherment()
                .build()?,
        )?;
        builder.sign(issuer_key, MessageDigest::sha256())?;

        Ok(builder.build())
    }
}
