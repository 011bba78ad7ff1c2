// SPDX-License-Identifier: MIT
// Copyright (c) Microsoft Corporation.

/*!
# GSI delegation

This crate implements the server side of the GSI proxy-certificate delegation protocol. A client
that has authenticated with its X.509 certificate (and optionally asserted VOMS attributes) uses
the protocol to hand the service a short-lived proxy credential without its private key ever
leaving the client.

## Protocol

The delegation happens in two rounds:

1. The client asks for a certificate request ([`service::DelegationService::get_proxy_req`]).
   The service generates a fresh key pair, stores the private key alongside the request in its
   request cache, and returns the PEM-encoded request.
2. The client signs the request with its own credential, producing a proxy certificate, and
   sends the proxy plus its certificate chain back
   ([`service::DelegationService::put_proxy`]). The service checks the proxy was issued by the
   authenticated client for the exact key it generated, joins the cached private key with the
   chain, and moves the result into the durable delegation store.

Requests and credentials are keyed by a delegation ID derived from the client's DN and VOMS
attributes (see [`identity`]); pending requests are additionally keyed by a digest of the
generated public key so concurrent rounds never share a slot.

## Storage

Storage is pluggable through [`storage::CredentialCache`]. Two backends are provided: an SQLite
database and a directory tree on the local filesystem. The backend is selected by the
[`config::StorageConfig`] in the service configuration.

## Crate features

* **cli** -
  Build the `gsi-delegation` administrative CLI. This is not enabled by default.
*/

pub mod config;
pub mod context;
pub mod crypto;
pub mod error;
pub mod identity;
pub mod protocol;
pub mod service;
pub mod storage;

pub use context::SecurityContext;
pub use error::DelegationError;
pub use service::DelegationService;
