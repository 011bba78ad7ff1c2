// SPDX-License-Identifier: MIT
// Copyright (c) Microsoft Corporation.

//! All the cryptography-related operations are in this module.
//!
//! OpenSSL is used for key generation, certificate requests, and proxy certificates.

use anyhow::Context;
use chrono::{DateTime, Utc};
use openssl::{
    asn1::{Asn1Time, Asn1TimeRef},
    x509::{X509Ref, X509},
};

mod request;
mod signer;

pub use request::{NewRequest, ProxyRequestGenerator, DEFAULT_MINIMUM_KEY_SIZE};
pub use signer::{OpenSslProxySigner, ProxySigner, Validity};

/// Parse a PEM stream into its certificates, in order.
///
/// Other PEM blocks, such as private keys, are skipped.
pub fn parse_chain(pem: &str) -> anyhow::Result<Vec<X509>> {
    X509::stack_from_pem(pem.as_bytes()).context("The certificate chain is not valid PEM")
}

/// Encode certificates as a single PEM stream.
pub fn chain_to_pem<'a, I>(chain: I) -> anyhow::Result<String>
where
    I: IntoIterator<Item = &'a X509Ref>,
{
    let mut pem = String::new();
    for certificate in chain {
        pem.push_str(std::str::from_utf8(&certificate.to_pem()?)?);
    }
    Ok(pem)
}

/// Convert an ASN.1 time to a UTC timestamp with second precision.
pub fn asn1_to_datetime(time: &Asn1TimeRef) -> anyhow::Result<DateTime<Utc>> {
    let epoch = Asn1Time::from_unix(0)?;
    let diff = epoch.diff(time)?;
    let seconds = i64::from(diff.days) * 86_400 + i64::from(diff.secs);
    DateTime::from_timestamp(seconds, 0)
        .ok_or_else(|| anyhow::anyhow!("{time} is outside the supported range"))
}

/// Convert a UTC timestamp to an ASN.1 time, dropping sub-second precision.
pub fn datetime_to_asn1(time: &DateTime<Utc>) -> anyhow::Result<Asn1Time> {
    Ok(Asn1Time::from_unix(time.timestamp())?)
}
