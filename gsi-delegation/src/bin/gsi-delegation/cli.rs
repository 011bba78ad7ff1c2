// SPDX-License-Identifier: MIT
// Copyright (c) Microsoft Corporation.

//! Define the command-line interface.
//!
//! This is where subcommands, the arguments, and their types are defined.

use std::path::PathBuf;

use clap::Parser;

/// Administer the GSI delegation service's credential storage.
///
/// To begin, you'll need to provide a configuration file. For an example of the current
/// format, consult the `config` subcommand. Then prepare the configured storage with the
/// `migrate` subcommand.
///
/// Be aware that these commands should be run with the same user the service runs as, since the
/// stored credentials are only readable by that user.
#[derive(Debug, Parser)]
#[command(version)]
pub struct Cli {
    /// The path to the service's configuration file.
    ///
    /// If no path is provided, the defaults are used. To view the service configuration,
    /// run the `config` subcommand.
    #[arg(long, short, env = "GSI_DELEGATION_CONFIG")]
    pub config: Option<PathBuf>,

    /// A set of one or more comma-separated directives to filter logs.
    ///
    /// The general format is "target_name[span_name{field=value}]=level" where level is
    /// one of TRACE, DEBUG, INFO, WARN, ERROR.
    ///
    /// Details: https://docs.rs/tracing-subscriber/0.3.19/tracing_subscriber/filter/struct.EnvFilter.html#directives
    #[arg(
        long,
        env = "GSI_DELEGATION_LOG",
        default_value = "WARN,gsi_delegation=INFO"
    )]
    pub log_filter: String,
    #[command(subcommand)]
    pub command: Command,
}

#[derive(clap::Subcommand, Debug)]
pub enum Command {
    /// See the current service configuration.
    Config,

    /// Create the configured storage, applying any outstanding database migrations.
    Migrate,

    /// Print when a delegated credential expires.
    TerminationTime {
        #[command(flatten)]
        delegation: Delegation,
    },

    /// Remove a delegated credential.
    Destroy {
        #[command(flatten)]
        delegation: Delegation,
    },
}

/// Identifies a delegated credential.
#[derive(clap::Args, Debug)]
pub struct Delegation {
    /// The distinguished name of the credential's owner, e.g. "/O=Grid/CN=Alice".
    #[arg(long)]
    pub owner_dn: String,

    /// A VOMS attribute the credential was delegated with; repeat for each attribute, in order.
    #[arg(long)]
    pub voms_attribute: Vec<String>,

    /// The delegation ID.
    ///
    /// If not provided, it's derived from the owner DN and VOMS attributes.
    #[arg(long)]
    pub delegation_id: Option<String>,
}
