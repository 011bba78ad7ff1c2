// SPDX-License-Identifier: MIT
// Copyright (c) Microsoft Corporation.

//! Persistence for pending certificate requests and delegated credentials.
//!
//! Backends store and retrieve entries; they never decide whether an operation is allowed.
//! Uniqueness, expiry, and the protocol's state transitions are the service's concern.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::instrument;

pub use crate::error::StorageError;

pub mod filesystem;
pub mod sqlite;

pub use filesystem::FilesystemCache;
pub use sqlite::SqliteCache;

/// A pending certificate request: the first half of a delegation round.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DelegationRequest {
    /// The per-round key, `<delegation_id>+<session_id>`.
    pub cache_id: String,
    pub delegation_id: String,
    pub owner_dn: String,
    pub voms_attributes: Vec<String>,
    /// The PEM-encoded PKCS#10 request returned to the client.
    pub certificate_request: String,
    /// The PEM-encoded private key matching the request's public key.
    pub private_key: String,
}

/// A delegated proxy credential.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DelegatedCredential {
    pub delegation_id: String,
    pub owner_dn: String,
    pub voms_attributes: Vec<String>,
    /// The proxy certificate, its private key, and the issuer chain, PEM-encoded in that order.
    pub certificate_chain: String,
    /// The proxy certificate's notAfter time.
    pub termination_time: DateTime<Utc>,
}

/// Storage for the two areas used by the delegation protocol.
///
/// Requests are keyed by `(cache_id, owner_dn)` and credentials by
/// `(delegation_id, owner_dn)`. Inserting an existing key or updating/deleting a missing one
/// is an error.
#[async_trait::async_trait]
pub trait CredentialCache: Send + Sync {
    async fn insert_request(&self, request: &DelegationRequest) -> Result<(), StorageError>;

    async fn update_request(&self, request: &DelegationRequest) -> Result<(), StorageError>;

    async fn find_request(
        &self,
        cache_id: &str,
        owner_dn: &str,
    ) -> Result<Option<DelegationRequest>, StorageError>;

    async fn delete_request(&self, cache_id: &str, owner_dn: &str) -> Result<(), StorageError>;

    async fn insert_credential(&self, credential: &DelegatedCredential)
        -> Result<(), StorageError>;

    async fn update_credential(&self, credential: &DelegatedCredential)
        -> Result<(), StorageError>;

    async fn find_credential(
        &self,
        delegation_id: &str,
        owner_dn: &str,
    ) -> Result<Option<DelegatedCredential>, StorageError>;

    async fn delete_credential(
        &self,
        delegation_id: &str,
        owner_dn: &str,
    ) -> Result<(), StorageError>;

    /// Store `credential`, replacing any credential already stored under its key.
    ///
    /// Concurrent calls for one key must each either insert or replace as a whole; readers see
    /// one complete credential or the other.
    async fn store_credential(&self, credential: &DelegatedCredential)
        -> Result<(), StorageError>;

    /// Store `credential` and remove the request with `cache_id` it was issued for.
    ///
    /// Once the credential is stored the request is stale, so failing to remove it is returned
    /// as `Ok(Some(error))` rather than as a failure. Backends that can perform both steps in
    /// one transaction should override this. They then return [`StorageError::NotFound`] if the
    /// request has already been removed, and store nothing.
    async fn commit_credential(
        &self,
        credential: &DelegatedCredential,
        cache_id: &str,
    ) -> Result<Option<StorageError>, StorageError> {
        self.store_credential(credential).await?;
        Ok(self
            .delete_request(cache_id, &credential.owner_dn)
            .await
            .err())
    }
}

/// Selects and configures the storage backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "backend", rename_all = "lowercase")]
pub enum StorageConfig {
    /// An SQLite database.
    Sqlite {
        /// The database URL or path, e.g. `/var/lib/gsi-delegation/delegation.sqlite` or
        /// `sqlite::memory:`.
        database: String,
    },
    /// A directory tree with one file per stored attribute.
    Filesystem {
        /// The root directory; it is created if it doesn't exist.
        directory: PathBuf,
    },
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self::Sqlite {
            database: "/var/lib/gsi-delegation/delegation.sqlite".to_string(),
        }
    }
}

/// Open the configured backend, creating and migrating it as needed.
#[instrument(err)]
pub async fn open(config: &StorageConfig) -> Result<Box<dyn CredentialCache>, StorageError> {
    let cache: Box<dyn CredentialCache> = match config {
        StorageConfig::Sqlite { database } => {
            let cache = SqliteCache::connect(database).await?;
            cache.migrate().await?;
            Box::new(cache)
        }
        StorageConfig::Filesystem { directory } => {
            Box::new(FilesystemCache::create(directory.clone()).await?)
        }
    };
    Ok(cache)
}
