// SPDX-License-Identifier: MIT
// Copyright (c) Microsoft Corporation.

//! A throwaway PKI and helpers to drive the delegation protocol as a client would.

use std::path::Path;

use chrono::{DateTime, Utc};
use gsi_delegation::{
    config::Config,
    crypto::{OpenSslProxySigner, Validity},
    storage::{self, CredentialCache, StorageConfig},
    DelegationService, SecurityContext,
};
use openssl::{
    asn1::{Asn1Integer, Asn1Time, Asn1TimeRef},
    bn::BigNum,
    hash::MessageDigest,
    nid::Nid,
    pkey::{PKey, Private},
    rsa::Rsa,
    x509::{
        extension::{BasicConstraints, KeyUsage},
        X509Builder, X509NameBuilder, X509,
    },
};

pub const VOMS_ATTRIBUTES: &[&str] = &["/vo/Role=NULL"];

/// A certificate authority and the end-entity certificates it issued.
pub struct Pki {
    ca: X509,
    ca_key: PKey<Private>,
}

/// An end-entity that authenticates to the service and signs proxies for it.
pub struct User {
    pub certificate: X509,
    pub key: PKey<Private>,
    pub chain: Vec<X509>,
}

impl Pki {
    pub fn new() -> anyhow::Result<Self> {
        let ca_key = PKey::from_rsa(Rsa::generate(2048)?)?;
        let mut name = X509NameBuilder::new()?;
        name.append_entry_by_nid(Nid::ORGANIZATIONNAME, "Grid")?;
        name.append_entry_by_nid(Nid::COMMONNAME, "Test CA")?;
        let name = name.build();

        let serial_number = BigNum::from_u32(1)?;
        let serial_number = Asn1Integer::from_bn(&serial_number)?;
        let mut builder = X509Builder::new()?;
        builder.set_version(2)?;
        builder.set_serial_number(&serial_number)?;
        builder.set_subject_name(&name)?;
        builder.set_issuer_name(&name)?;
        builder.set_pubkey(&ca_key)?;
        builder.set_not_before(Asn1Time::days_from_now(0)?.as_ref())?;
        builder.set_not_after(Asn1Time::days_from_now(30)?.as_ref())?;
        builder.append_extension(BasicConstraints::new().critical().ca().build()?)?;
        builder.append_extension(KeyUsage::new().critical().key_cert_sign().build()?)?;
        builder.sign(&ca_key, MessageDigest::sha256())?;

        Ok(Self {
            ca: builder.build(),
            ca_key,
        })
    }

    /// Issue a user certificate for `/O=Grid/CN=<common_name>`, valid for the next week.
    pub fn user(&self, common_name: &str) -> anyhow::Result<User> {
        let not_before = Asn1Time::days_from_now(0)?;
        let not_after = Asn1Time::days_from_now(7)?;
        self.user_with_validity(common_name, &not_before, &not_after)
    }

    /// Issue a user certificate for `/O=Grid/CN=<common_name>` with an arbitrary validity.
    pub fn user_with_validity(
        &self,
        common_name: &str,
        not_before: &Asn1TimeRef,
        not_after: &Asn1TimeRef,
    ) -> anyhow::Result<User> {
        let key = PKey::from_rsa(Rsa::generate(1024)?)?;
        let mut name = X509NameBuilder::new()?;
        name.append_entry_by_nid(Nid::ORGANIZATIONNAME, "Grid")?;
        name.append_entry_by_nid(Nid::COMMONNAME, common_name)?;
        let name = name.build();

        let serial_number = BigNum::from_u32(2)?;
        let serial_number = Asn1Integer::from_bn(&serial_number)?;
        let mut builder = X509Builder::new()?;
        builder.set_version(2)?;
        builder.set_serial_number(&serial_number)?;
        builder.set_subject_name(&name)?;
        builder.set_issuer_name(self.ca.subject_name())?;
        builder.set_pubkey(&key)?;
        builder.set_not_before(not_before)?;
        builder.set_not_after(not_after)?;
        builder.sign(&self.ca_key, MessageDigest::sha256())?;
        let certificate = builder.build();

        Ok(User {
            chain: vec![certificate.clone(), self.ca.clone()],
            certificate,
            key,
        })
    }
}

impl User {
    /// The security context the authentication layer would produce for this user.
    pub fn context(&self) -> anyhow::Result<SecurityContext> {
        let voms_attributes = VOMS_ATTRIBUTES.iter().map(|a| a.to_string()).collect();
        Ok(SecurityContext::from_client_chain(
            self.chain.clone(),
            voms_attributes,
        )?)
    }

    /// Sign the service's certificate request, returning the chain to submit with `put_proxy`.
    pub fn sign(&self, request: &str, validity: Validity) -> anyhow::Result<String> {
        OpenSslProxySigner.delegate(request, &self.chain, &self.key, validity)
    }
}

/// An ASN.1 time `offset` seconds from now.
pub fn asn1_from_now(offset: i64) -> anyhow::Result<Asn1Time> {
    Ok(Asn1Time::from_unix(now()?.timestamp() + offset)?)
}

/// The current time, truncated to the precision of certificate timestamps.
pub fn now() -> anyhow::Result<DateTime<Utc>> {
    DateTime::from_timestamp(Utc::now().timestamp(), 0)
        .ok_or_else(|| anyhow::anyhow!("the clock is out of range"))
}

/// A validity window relative to now, in seconds.
pub fn validity(not_before: i64, not_after: i64) -> anyhow::Result<Validity> {
    let now = now()?;
    Ok(Validity {
        not_before: now + chrono::Duration::seconds(not_before),
        not_after: now + chrono::Duration::seconds(not_after),
    })
}

/// A configuration for each storage backend, rooted in `directory`.
pub fn backends(directory: &Path) -> Vec<StorageConfig> {
    vec![
        StorageConfig::Sqlite {
            database: directory
                .join("delegation.sqlite")
                .display()
                .to_string(),
        },
        StorageConfig::Filesystem {
            directory: directory.join("proxycache"),
        },
    ]
}

/// A service using `storage`, along with a separate handle on the same storage.
pub async fn start_service(
    storage: &StorageConfig,
) -> anyhow::Result<(DelegationService, Box<dyn CredentialCache>)> {
    let config = Config {
        key_size: 1024,
        storage: storage.clone(),
        ..Default::default()
    };
    let service = DelegationService::from_config(&config).await;
    anyhow::ensure!(!service.is_misconfigured(), "{storage:?} could not be opened");
    let cache = storage::open(storage).await?;
    Ok((service, cache))
}
