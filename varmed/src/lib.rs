pub mod cli;
pub mod config;
pub mod controller;
pub mod http;
pub mod machine;
pub mod telemetry;

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{error, info};

use hub_client::HubClient;

use crate::config::Config;
use crate::machine::Machine;

/// Run the controller until a fatal error or ctrl-c.
///
/// Auth and configuration failures surface as Err, which the binary turns
/// into a non-zero exit.
pub async fn run(cfg: Config) -> Result<()> {
    let cfg = Arc::new(cfg);

    let client = HubClient::connect(cfg.hass_options.clone())
        .await
        .context("connecting to the hub")?;
    let events = client
        .subscribe_state_changed()
        .await
        .context("subscribing to state_changed events")?;

    let machine = Machine::spawn(Arc::new(cfg.hvac_options.clone()), Arc::new(client.clone()));
    let (handle, mut controller_task) =
        controller::spawn(Arc::clone(&cfg), client.clone(), machine.clone(), events);

    let admin = tokio::spawn(http::serve(cfg.admin.bind, handle));

    let outcome = tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown requested");
            Ok(())
        }
        res = &mut controller_task => {
            let err = match res {
                Ok(Ok(())) => anyhow::anyhow!("controller exited unexpectedly"),
                Ok(Err(err)) => err,
                Err(join) => anyhow::Error::from(join).context("controller task"),
            };
            error!(%err, "controller failed");
            Err(err)
        }
        res = admin => {
            let err = match res {
                Ok(Ok(())) => anyhow::anyhow!("admin endpoint exited unexpectedly"),
                Ok(Err(err)) => err,
                Err(join) => anyhow::Error::from(join).context("admin task"),
            };
            error!(%err, "admin endpoint failed");
            Err(err)
        }
    };

    // park every entity before leaving, whatever got us here
    controller_task.abort();
    machine.shutdown().await;
    machine.wait_for(varme_core::fsm::FsmState::Stopped).await;
    client.disconnect().await;

    outcome
}
