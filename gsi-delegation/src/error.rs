// SPDX-License-Identifier: MIT
// Copyright (c) Microsoft Corporation.

//! Error types for the delegation service and its storage backends.

/// Errors returned by the delegation protocol operations.
///
/// Every variant is reported to the remote caller, so messages never include details of the
/// storage backend. Use [`DelegationError::kind`] for a stable, machine-readable name.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum DelegationError {
    /// A credential is already stored for this delegation ID.
    ///
    /// Retrying will not succeed; the caller should renew the delegation instead.
    #[error("a credential is already delegated with ID '{delegation_id}'; renew it instead")]
    DuplicateDelegation { delegation_id: String },

    /// The submitted proxy chain was empty or could not be parsed.
    #[error("the proxy certificate chain is invalid: {0}")]
    InvalidProxy(String),

    /// A certificate in the submitted chain is past its notAfter time.
    #[error("certificate {index} in the proxy chain ({subject}) expired at {not_after}")]
    ExpiredProxy {
        index: usize,
        subject: String,
        not_after: String,
    },

    /// A certificate in the submitted chain has a notBefore time in the future.
    ///
    /// This may be due to clock skew between the client and the service, in which case a
    /// retry after the notBefore time will succeed.
    #[error("certificate {index} in the proxy chain ({subject}) is not valid before {not_before}")]
    NotYetValid {
        index: usize,
        subject: String,
        not_before: String,
    },

    /// The proxy was not issued by the authenticated client.
    #[error("the proxy was issued by '{issuer}', which does not belong to '{owner}'")]
    IssuerMismatch { issuer: String, owner: String },

    /// No certificate request is waiting for the submitted proxy.
    ///
    /// Either the request was never made, it was already completed, or the proxy was issued for
    /// a different key.
    #[error("no pending certificate request for delegation ID '{delegation_id}'")]
    NoSuchPendingRequest { delegation_id: String },

    /// The proxy's public key differs from the key in the pending certificate request.
    #[error("the proxy's public key does not match the certificate request")]
    KeyMismatch,

    /// No credential is stored for this delegation ID.
    #[error("no delegated credential with ID '{delegation_id}'")]
    NoSuchCredential { delegation_id: String },

    /// A key pair or certificate request could not be generated.
    ///
    /// This is likely a problem with the OpenSSL library; retrying is not recommended.
    #[error("failed to generate the proxy key or certificate request: {0}")]
    KeyGeneration(String),

    /// The storage backend failed.
    ///
    /// Details are logged by the service but are not part of this error. Retrying may help if
    /// the failure was transient.
    #[error("an internal storage error occurred")]
    InternalStorage,

    /// The storage backend could not be set up when the service started.
    ///
    /// Every operation fails with this error until the service is reconfigured and restarted.
    #[error("the delegation service is misconfigured")]
    MisconfiguredService,

    /// The security context carries no client certificate.
    #[error("the client did not authenticate with a certificate")]
    Unauthenticated,
}

impl DelegationError {
    /// A stable name for the error, suitable for the remote caller to match on.
    pub fn kind(&self) -> &'static str {
        match self {
            DelegationError::DuplicateDelegation { .. } => "DuplicateDelegation",
            DelegationError::InvalidProxy(_) => "InvalidProxy",
            DelegationError::ExpiredProxy { .. } => "ExpiredProxy",
            DelegationError::NotYetValid { .. } => "NotYetValid",
            DelegationError::IssuerMismatch { .. } => "IssuerMismatch",
            DelegationError::NoSuchPendingRequest { .. } => "NoSuchPendingRequest",
            DelegationError::KeyMismatch => "KeyMismatch",
            DelegationError::NoSuchCredential { .. } => "NoSuchCredential",
            DelegationError::KeyGeneration(_) => "KeyGeneration",
            DelegationError::InternalStorage => "InternalStorage",
            DelegationError::MisconfiguredService => "MisconfiguredService",
            DelegationError::Unauthenticated => "Unauthenticated",
        }
    }
}

/// Errors raised by [`crate::storage::CredentialCache`] implementations.
///
/// These are never returned to remote callers; the service logs them and reports
/// [`DelegationError::InternalStorage`].
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum StorageError {
    /// The database returned an error.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Database migrations could not be applied.
    #[error("database migration failed: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// A filesystem operation failed.
    #[error("an I/O error occurred: {0}")]
    Io(#[from] std::io::Error),

    /// A stored value could not be encoded or decoded.
    #[error("failed to (de)serialize a stored value: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The entry to update or delete does not exist.
    #[error("no such entry")]
    NotFound,

    /// The stored entry exists but is unreadable.
    #[error("the stored entry is corrupt: {0}")]
    Corrupt(String),

    /// A blocking storage task panicked or was cancelled.
    #[error("storage task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}
