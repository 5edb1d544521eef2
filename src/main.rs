//! PKI CMP - command line client and mock responder
//!
//! Without `-port` the configured CMP command is executed as a client,
//! `-repeat` times. With `-port` the mock server is served over HTTP until
//! `-max_msgs` messages were answered.

use anyhow::{bail, Context, Result};
use pki_cmp::client::{credential_loader, verify_params, CmpClient};
use pki_cmp::configs::AppConfig;
use pki_cmp::mock_server::setup_mock_server;
use pki_cmp::options::{parse_args, usage};
use pki_cmp::server::run_responder;
use std::sync::Arc;

/// Map the syslog-style `verbosity` (0..8) onto a log filter
fn log_filter(verbosity: i64) -> &'static str {
    match verbosity {
        i64::MIN..=3 => "error",
        4 => "warn",
        5 | 6 => "info",
        7 => "debug",
        _ => "trace",
    }
}

fn run_server(config: &AppConfig, port: &str) -> Result<()> {
    if config.run.use_mock_srv {
        bail!("-port and -use_mock_srv options are mutually exclusive");
    }
    if config.server.server.is_some() {
        bail!("-port and -server options are mutually exclusive");
    }
    let loader = credential_loader(config)?;
    let params = verify_params(config)?;
    let server = setup_mock_server(config, &loader, &params).context("Failed to set up mock server")?;
    println!("✓ CMP responder listening on port {}", port);
    let max_msgs = config.mock.max_msgs.max(0) as u64;
    let served = run_responder(port, max_msgs, server).context("CMP responder failed")?;
    println!("✓ Served {} messages", served);
    Ok(())
}

fn main() -> Result<()> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let config = parse_args(&args).context("Failed to parse options")?;

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(log_filter(config.verbosity)))
        .init();

    if config.help {
        println!("{}", usage());
        return Ok(());
    }

    if let Some(port) = config.mock.port.clone() {
        return run_server(&config, &port);
    }

    let mut client = CmpClient::setup(Arc::new(config)).context("Failed to set up CMP client")?;
    let command = client.command();
    let outcomes = client
        .run()
        .with_context(|| format!("CMP {} transaction failed", command.name()))?;
    for outcome in &outcomes {
        match &outcome.new_cert {
            Some(_) => println!("✓ {} succeeded, new certificate received ({})", command.name(), outcome.status),
            None => println!("✓ {} succeeded ({})", command.name(), outcome.status),
        }
    }
    Ok(())
}
