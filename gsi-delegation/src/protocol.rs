// SPDX-License-Identifier: MIT
// Copyright (c) Microsoft Corporation.

//! The remote interface to the delegation service.
//!
//! Requests and responses are JSON objects, internally tagged with the operation name. The
//! transport carrying them, and the authentication that produces the [`SecurityContext`], are
//! left to the embedding server.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{context::SecurityContext, error::DelegationError, service::DelegationService};

pub use crate::service::NewProxyRequest;

/// The version of the delegation interface this crate implements.
pub const INTERFACE_VERSION: &str = "2.0.0";

/// An operation requested by a client.
///
/// Omitting `delegation_id` (or sending an empty one) selects the ID derived from the caller's
/// identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "operation", rename_all = "snake_case")]
#[allow(clippy::exhaustive_enums)]
pub enum Request {
    GetVersion {},
    GetProxyReq {
        #[serde(default)]
        delegation_id: Option<String>,
    },
    RenewProxyReq {
        #[serde(default)]
        delegation_id: Option<String>,
    },
    GetNewProxyReq {},
    PutProxy {
        #[serde(default)]
        delegation_id: Option<String>,
        /// The signed proxy certificate followed by its issuer chain, PEM-encoded.
        proxy: String,
    },
    Destroy {
        #[serde(default)]
        delegation_id: Option<String>,
    },
    GetTerminationTime {
        #[serde(default)]
        delegation_id: Option<String>,
    },
}

/// The service's reply to a [`Request`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
#[allow(clippy::exhaustive_enums)]
pub enum Response {
    Version {
        version: String,
        interface_version: String,
    },
    ProxyRequest {
        proxy_request: String,
    },
    NewProxyRequest(NewProxyRequest),
    TerminationTime {
        termination_time: DateTime<Utc>,
    },
    Success {},
    /// The operation failed; `kind` is one of the [`DelegationError::kind`] names.
    Fault {
        kind: String,
        message: String,
    },
}

impl From<DelegationError> for Response {
    fn from(error: DelegationError) -> Self {
        Response::Fault {
            kind: error.kind().to_string(),
            message: error.to_string(),
        }
    }
}

/// Run `request` on behalf of the caller described by `ctx`.
///
/// Errors are returned to the caller as [`Response::Fault`].
pub async fn dispatch(
    service: &DelegationService,
    ctx: &SecurityContext,
    request: Request,
) -> Response {
    let result = match request {
        Request::GetVersion {} => Ok(Response::Version {
            version: env!("CARGO_PKG_VERSION").to_string(),
            interface_version: INTERFACE_VERSION.to_string(),
        }),
        Request::GetProxyReq { delegation_id } => service
            .get_proxy_req(ctx, delegation_id.as_deref())
            .await
            .map(|proxy_request| Response::ProxyRequest { proxy_request }),
        Request::RenewProxyReq { delegation_id } => service
            .renew_proxy_req(ctx, delegation_id.as_deref())
            .await
            .map(|proxy_request| Response::ProxyRequest { proxy_request }),
        Request::GetNewProxyReq {} => service
            .get_new_proxy_req(ctx)
            .await
            .map(Response::NewProxyRequest),
        Request::PutProxy {
            delegation_id,
            proxy,
        } => service
            .put_proxy(ctx, delegation_id.as_deref(), &proxy)
            .await
            .map(|()| Response::Success {}),
        Request::Destroy { delegation_id } => service
            .destroy(ctx, delegation_id.as_deref())
            .await
            .map(|()| Response::Success {}),
        Request::GetTerminationTime { delegation_id } => service
            .get_termination_time(ctx, delegation_id.as_deref())
            .await
            .map(|termination_time| Response::TerminationTime { termination_time }),
    };

    result.unwrap_or_else(Response::from)
}
