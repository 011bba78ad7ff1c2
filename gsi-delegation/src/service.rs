// SPDX-License-Identifier: MIT
// Copyright (c) Microsoft Corporation.

//! The delegation protocol state machine.
//!
//! Each `(delegation_id, owner_dn)` pair is in one of four states, observed across the two
//! storage areas:
//!
//! * absent: nothing is stored,
//! * pending: a certificate request is waiting for the client's signed proxy,
//! * active: a delegated credential is stored,
//! * expired: active, but past its termination time. Expired credentials are not purged here;
//!   consumers check [`DelegationService::get_termination_time`] before use.
//!
//! Pending requests are keyed by a cache ID that includes a digest of the request's public key,
//! so concurrent rounds for one delegation ID never share a slot. No locks are held across calls.

use std::cmp::Ordering;

use chrono::{DateTime, Utc};
use openssl::{
    asn1::Asn1Time,
    x509::{X509Req, X509},
};
use serde::{Deserialize, Serialize};
use tracing::{instrument, Span};

use crate::{
    config::Config,
    context::{dn_string, issued_by_owner, SecurityContext},
    crypto::{asn1_to_datetime, chain_to_pem, parse_chain, ProxyRequestGenerator},
    error::{DelegationError, StorageError},
    identity,
    storage::{self, CredentialCache, DelegatedCredential, DelegationRequest},
};

/// A certificate request along with the delegation ID it was issued under.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewProxyRequest {
    pub delegation_id: String,
    /// The PEM-encoded certificate request the client should sign.
    pub proxy_request: String,
}

/// Serves the delegation operations for authenticated callers.
pub struct DelegationService {
    /// [`None`] if the storage backend could not be opened; every operation then fails.
    cache: Option<Box<dyn CredentialCache>>,
    generator: ProxyRequestGenerator,
    key_size: u32,
}

impl std::fmt::Debug for DelegationService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DelegationService")
            .field("misconfigured", &self.cache.is_none())
            .field("generator", &self.generator)
            .field("key_size", &self.key_size)
            .finish()
    }
}

impl DelegationService {
    /// Create a service using an already-opened storage backend.
    pub fn new(
        cache: Box<dyn CredentialCache>,
        generator: ProxyRequestGenerator,
        key_size: u32,
    ) -> Self {
        Self {
            cache: Some(cache),
            generator,
            key_size,
        }
    }

    /// Create a service from its configuration, opening the configured storage backend.
    ///
    /// If the backend can't be opened the failure is logged and the service is returned in a
    /// misconfigured state: every operation fails with [`DelegationError::MisconfiguredService`]
    /// without attempting any storage access.
    pub async fn from_config(config: &Config) -> Self {
        let cache = storage::open(&config.storage)
            .await
            .inspect_err(|error| {
                tracing::error!(
                    ?error,
                    "Unable to open the credential storage; all delegation operations will fail"
                );
            })
            .ok();
        Self {
            cache,
            generator: ProxyRequestGenerator::new(config.minimum_key_size),
            key_size: config.key_size,
        }
    }

    /// Returns true if the storage backend could not be set up.
    pub fn is_misconfigured(&self) -> bool {
        self.cache.is_none()
    }

    /// Issue a certificate request for a new delegation.
    ///
    /// If `delegation_id` is [`None`] (or empty), it's derived from the caller's identity. If a
    /// credential is already stored under the ID this fails with
    /// [`DelegationError::DuplicateDelegation`]; use [`DelegationService::renew_proxy_req`] to
    /// replace it. Calling this again while a request is pending issues a fresh request.
    #[instrument(skip_all, err, fields(owner = ctx.owner_dn(), delegation_id = ?delegation_id))]
    pub async fn get_proxy_req(
        &self,
        ctx: &SecurityContext,
        delegation_id: Option<&str>,
    ) -> Result<String, DelegationError> {
        let cache = self.cache()?;
        let delegation_id = resolve_delegation_id(ctx, delegation_id);

        if cache
            .find_credential(&delegation_id, ctx.owner_dn())
            .await
            .map_err(storage_failure)?
            .is_some()
        {
            return Err(DelegationError::DuplicateDelegation { delegation_id });
        }

        self.issue_request(cache, ctx, &delegation_id).await
    }

    /// Issue a certificate request to replace a delegated credential.
    ///
    /// Unlike [`DelegationService::get_proxy_req`] this never fails because a credential exists,
    /// and renewing a delegation that was never made simply starts a new one.
    #[instrument(skip_all, err, fields(owner = ctx.owner_dn(), delegation_id = ?delegation_id))]
    pub async fn renew_proxy_req(
        &self,
        ctx: &SecurityContext,
        delegation_id: Option<&str>,
    ) -> Result<String, DelegationError> {
        let cache = self.cache()?;
        let delegation_id = resolve_delegation_id(ctx, delegation_id);

        if cache
            .find_credential(&delegation_id, ctx.owner_dn())
            .await
            .map_err(storage_failure)?
            .is_none()
        {
            tracing::info!(
                delegation_id,
                "No credential to renew; issuing a request for a new delegation"
            );
        }

        self.issue_request(cache, ctx, &delegation_id).await
    }

    /// Issue a certificate request under the delegation ID derived from the caller's identity.
    ///
    /// The ID is returned alongside the request so the client doesn't need to derive it. As with
    /// renewal, an existing credential doesn't cause a failure.
    #[instrument(skip_all, err, fields(owner = ctx.owner_dn(), delegation_id))]
    pub async fn get_new_proxy_req(
        &self,
        ctx: &SecurityContext,
    ) -> Result<NewProxyRequest, DelegationError> {
        let cache = self.cache()?;
        let delegation_id = resolve_delegation_id(ctx, None);
        Span::current().record("delegation_id", delegation_id.as_str());
        let proxy_request = self.issue_request(cache, ctx, &delegation_id).await?;

        Ok(NewProxyRequest {
            delegation_id,
            proxy_request,
        })
    }

    /// Store the proxy the client signed in response to a pending request.
    ///
    /// `proxy_chain` is the PEM-encoded proxy certificate followed by its issuer chain. The proxy
    /// must be issued by the caller, be within its validity period, and carry exactly the public
    /// key of a request issued by this service under the same delegation ID. The stored
    /// credential replaces any existing one and consumes the pending request.
    #[instrument(skip_all, err, fields(owner = ctx.owner_dn(), delegation_id = ?delegation_id, cache_id))]
    pub async fn put_proxy(
        &self,
        ctx: &SecurityContext,
        delegation_id: Option<&str>,
        proxy_chain: &str,
    ) -> Result<(), DelegationError> {
        let cache = self.cache()?;

        let chain = parse_chain(proxy_chain)
            .map_err(|error| DelegationError::InvalidProxy(format!("{error:#}")))?;
        let leaf = chain.first().ok_or_else(|| {
            DelegationError::InvalidProxy("no certificates were provided".to_string())
        })?;
        check_validity(&chain)?;

        let issuer = dn_string(leaf.issuer_name()).map_err(invalid_proxy)?;
        if !issued_by_owner(&issuer, ctx.owner_dn()) {
            return Err(DelegationError::IssuerMismatch {
                issuer,
                owner: ctx.owner_dn().to_string(),
            });
        }

        let delegation_id = resolve_delegation_id(ctx, delegation_id);
        let public_key = leaf.public_key().map_err(invalid_proxy)?;
        let session_id = identity::gen_session_id(&public_key).map_err(invalid_proxy)?;
        let cache_id = identity::cache_id(&delegation_id, &session_id);
        Span::current().record("cache_id", cache_id.as_str());

        let request = cache
            .find_request(&cache_id, ctx.owner_dn())
            .await
            .map_err(storage_failure)?
            .ok_or_else(|| DelegationError::NoSuchPendingRequest {
                delegation_id: delegation_id.clone(),
            })?;

        let requested_key = X509Req::from_pem(request.certificate_request.as_bytes())
            .and_then(|request| request.public_key())
            .map_err(|error| storage_failure(StorageError::Corrupt(error.to_string())))?;
        if !requested_key.public_eq(&public_key) {
            return Err(DelegationError::KeyMismatch);
        }

        let certificate_chain = splice_private_key(&chain, &request.private_key)?;
        let termination_time = asn1_to_datetime(leaf.not_after())
            .map_err(|error| DelegationError::InvalidProxy(format!("{error:#}")))?;
        let credential = DelegatedCredential {
            delegation_id,
            owner_dn: ctx.owner_dn().to_string(),
            voms_attributes: ctx.voms_attributes().to_vec(),
            certificate_chain,
            termination_time,
        };

        // A round that completes concurrently may already have consumed the request.
        let committed = cache.commit_credential(&credential, &cache_id).await;
        let eviction_error = match committed {
            Ok(eviction_error) => eviction_error,
            Err(StorageError::NotFound) => {
                return Err(DelegationError::NoSuchPendingRequest {
                    delegation_id: credential.delegation_id,
                })
            }
            Err(error) => return Err(storage_failure(error)),
        };
        if let Some(error) = eviction_error {
            tracing::warn!(
                ?error,
                "Failed to remove the fulfilled certificate request; the credential was stored"
            );
        }
        tracing::info!(%termination_time, "Stored delegated credential");

        Ok(())
    }

    /// Remove a delegated credential.
    ///
    /// Pending requests under the same delegation ID are left in place.
    #[instrument(skip_all, err, fields(owner = ctx.owner_dn(), delegation_id = ?delegation_id))]
    pub async fn destroy(
        &self,
        ctx: &SecurityContext,
        delegation_id: Option<&str>,
    ) -> Result<(), DelegationError> {
        let cache = self.cache()?;
        let delegation_id = resolve_delegation_id(ctx, delegation_id);

        let deleted = cache
            .delete_credential(&delegation_id, ctx.owner_dn())
            .await;
        match deleted {
            Ok(()) => {
                tracing::info!("Destroyed delegated credential");
                Ok(())
            }
            Err(StorageError::NotFound) => Err(DelegationError::NoSuchCredential { delegation_id }),
            Err(error) => Err(storage_failure(error)),
        }
    }

    /// The time the delegated credential stops being valid.
    ///
    /// The stored value is returned as-is, even if it has already passed.
    #[instrument(skip_all, err, fields(owner = ctx.owner_dn(), delegation_id = ?delegation_id))]
    pub async fn get_termination_time(
        &self,
        ctx: &SecurityContext,
        delegation_id: Option<&str>,
    ) -> Result<DateTime<Utc>, DelegationError> {
        let cache = self.cache()?;
        let delegation_id = resolve_delegation_id(ctx, delegation_id);

        let credential = cache
            .find_credential(&delegation_id, ctx.owner_dn())
            .await
            .map_err(storage_failure)?;
        credential
            .map(|credential| credential.termination_time)
            .ok_or(DelegationError::NoSuchCredential { delegation_id })
    }

    fn cache(&self) -> Result<&dyn CredentialCache, DelegationError> {
        self.cache
            .as_deref()
            .ok_or(DelegationError::MisconfiguredService)
    }

    async fn issue_request(
        &self,
        cache: &dyn CredentialCache,
        ctx: &SecurityContext,
        delegation_id: &str,
    ) -> Result<String, DelegationError> {
        let issuer = ctx
            .client_certificate()
            .ok_or(DelegationError::Unauthenticated)?
            .to_owned();

        let generator = self.generator;
        let key_size = self.key_size;
        let span = Span::current();
        let new_request = tokio::task::spawn_blocking(move || {
            let _enter = span.enter();
            generator.new_request(&issuer, key_size)
        })
        .await
        .map_err(|error| DelegationError::KeyGeneration(error.to_string()))??;

        let session_id = identity::gen_session_id(&new_request.public_key)
            .map_err(|error| DelegationError::KeyGeneration(error.to_string()))?;
        let request = DelegationRequest {
            cache_id: identity::cache_id(delegation_id, &session_id),
            delegation_id: delegation_id.to_string(),
            owner_dn: ctx.owner_dn().to_string(),
            voms_attributes: ctx.voms_attributes().to_vec(),
            certificate_request: new_request.certificate_request,
            private_key: new_request.private_key,
        };

        let existing = cache
            .find_request(&request.cache_id, &request.owner_dn)
            .await
            .map_err(storage_failure)?;
        let stored = if existing.is_some() {
            cache.update_request(&request).await
        } else {
            cache.insert_request(&request).await
        };
        stored.map_err(storage_failure)?;
        tracing::info!(
            cache_id = request.cache_id.as_str(),
            "Issued proxy certificate request"
        );

        Ok(request.certificate_request)
    }
}

fn resolve_delegation_id(ctx: &SecurityContext, delegation_id: Option<&str>) -> String {
    match delegation_id {
        Some(delegation_id) if !delegation_id.is_empty() => delegation_id.to_string(),
        _ => identity::gen_delegation_id(ctx.owner_dn(), ctx.voms_attributes()),
    }
}

fn storage_failure(error: StorageError) -> DelegationError {
    tracing::error!(?error, "Credential storage operation failed");
    DelegationError::InternalStorage
}

fn invalid_proxy(error: openssl::error::ErrorStack) -> DelegationError {
    DelegationError::InvalidProxy(error.to_string())
}

// Every certificate in the chain must be valid right now.
fn check_validity(chain: &[X509]) -> Result<(), DelegationError> {
    let now = Asn1Time::days_from_now(0).map_err(invalid_proxy)?;
    for (index, certificate) in chain.iter().enumerate() {
        let not_after = certificate.not_after();
        if not_after.compare(&now).map_err(invalid_proxy)? == Ordering::Less {
            return Err(DelegationError::ExpiredProxy {
                index,
                subject: dn_string(certificate.subject_name()).map_err(invalid_proxy)?,
                not_after: not_after.to_string(),
            });
        }
        let not_before = certificate.not_before();
        if not_before.compare(&now).map_err(invalid_proxy)? == Ordering::Greater {
            return Err(DelegationError::NotYetValid {
                index,
                subject: dn_string(certificate.subject_name()).map_err(invalid_proxy)?,
                not_before: not_before.to_string(),
            });
        }
    }
    Ok(())
}

// Consumers expect the proxy's private key immediately after the proxy certificate.
fn splice_private_key(chain: &[X509], private_key: &str) -> Result<String, DelegationError> {
    let (leaf, issuers) = chain.split_first().ok_or_else(|| {
        DelegationError::InvalidProxy("no certificates were provided".to_string())
    })?;
    let leaf = chain_to_pem(std::iter::once(&**leaf))
        .map_err(|error| DelegationError::InvalidProxy(format!("{error:#}")))?;
    let issuers = chain_to_pem(issuers.iter().map(|cert| &**cert))
        .map_err(|error| DelegationError::InvalidProxy(format!("{error:#}")))?;

    let mut certificate_chain = leaf;
    certificate_chain.push_str(private_key);
    if !certificate_chain.ends_with('\n') {
        certificate_chain.push('\n');
    }
    certificate_chain.push_str(&issuers);
    Ok(certificate_chain)
}
