// SPDX-License-Identifier: MIT
// Copyright (c) Microsoft Corporation.

use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use gsi_delegation::{
    config::{load_config, Config},
    storage, DelegationService, SecurityContext,
};
use tracing_subscriber::{fmt::format::FmtSpan, layer::SubscriberExt, EnvFilter};

mod cli;

// The path, relative to $CONFIGURATION_DIRECTORY, of the default config file location.
const DEFAULT_CONFIG: &str = "gsi-delegation/delegation.toml";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let opts = cli::Cli::parse();

    // Unfortunately we can't use clap's value_parser since EnvFilter does not
    // implement Clone.
    let log_filter = EnvFilter::builder().parse(&opts.log_filter).context(
        "GSI_DELEGATION_LOG contains an invalid log directive; refer to \
        https://docs.rs/tracing-subscriber/0.3.19/tracing_subscriber/\
        filter/struct.EnvFilter.html#directives for format details.",
    )?;

    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_span_events(FmtSpan::CLOSE)
        .with_writer(std::io::stderr);
    let registry = tracing_subscriber::registry()
        .with(stderr_layer)
        .with(log_filter);
    tracing::subscriber::set_global_default(registry)
        .expect("Programming error: set_global_default should only be called once.");

    let config = load_config::<Config>(opts.config, PathBuf::from(DEFAULT_CONFIG).as_path())?;

    match opts.command {
        cli::Command::Config => {
            println!("# This is the current configuration\n\n{config}\n# This concludes the configuration.\n");
        }
        cli::Command::Migrate => {
            storage::open(&config.storage)
                .await
                .context("Failed to prepare the credential storage")?;
            println!("Credential storage is ready");
        }
        cli::Command::TerminationTime { delegation } => {
            let (service, ctx) = connect(&config, &delegation).await?;
            let termination_time = service
                .get_termination_time(&ctx, delegation.delegation_id.as_deref())
                .await?;
            println!("{}", termination_time.to_rfc3339());
        }
        cli::Command::Destroy { delegation } => {
            let (service, ctx) = connect(&config, &delegation).await?;
            service
                .destroy(&ctx, delegation.delegation_id.as_deref())
                .await?;
            println!("Destroyed the delegated credential");
        }
    };

    Ok(())
}

async fn connect(
    config: &Config,
    delegation: &cli::Delegation,
) -> anyhow::Result<(DelegationService, SecurityContext)> {
    let service = DelegationService::from_config(config).await;
    if service.is_misconfigured() {
        return Err(anyhow::anyhow!(
            "The credential storage could not be opened; check the configuration with the `config` subcommand"
        ));
    }
    let ctx = SecurityContext::new(
        delegation.owner_dn.clone(),
        delegation.voms_attribute.clone(),
        vec![],
    );
    Ok((service, ctx))
}
