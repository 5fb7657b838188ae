use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(name = "varmed", about = "Autonomous HVAC controller for a home-automation hub")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the controller against the configured hub
    Run {
        /// Path to the YAML configuration file
        #[arg(long, env = "VARMED_CONFIG", default_value = "varmed.yaml")]
        config: PathBuf,
    },
    /// Print the running controller's state as a key-value record
    Status {
        /// Admin endpoint of the running daemon
        #[arg(long, default_value = "http://127.0.0.1:8126")]
        admin_url: String,
    },
    /// Force an immediate conditions refresh and evaluation
    Trigger {
        /// Admin endpoint of the running daemon
        #[arg(long, default_value = "http://127.0.0.1:8126")]
        admin_url: String,
    },
}

pub async fn print_status(admin_url: &str) -> Result<()> {
    let status: serde_json::Value = reqwest::get(format!("{admin_url}/status"))
        .await
        .context("querying the controller")?
        .error_for_status()
        .context("controller refused the status query")?
        .json()
        .await
        .context("decoding the status record")?;

    let record = status.as_object().context("unexpected status payload")?;
    for (key, value) in record {
        match value.as_str() {
            Some(text) => println!("{key}: {text}"),
            None => println!("{key}: {value}"),
        }
    }
    Ok(())
}

pub async fn trigger(admin_url: &str) -> Result<()> {
    reqwest::Client::new()
        .post(format!("{admin_url}/trigger"))
        .send()
        .await
        .context("reaching the controller")?
        .error_for_status()
        .context("controller refused the trigger")?;
    println!("evaluation triggered");
    Ok(())
}
