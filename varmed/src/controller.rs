use std::sync::Arc;

use anyhow::anyhow;
use chrono::{Datelike, Local, Timelike};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{info, warn};

use hub_client::{HubClient, StateChangedEvent, sensor};
use varme_core::conditions::Conditions;
use varme_core::fsm::FsmState;

use crate::config::Config;
use crate::machine::MachineHandle;

const TRIGGER_QUEUE: usize = 4;

/// Status record served to the CLI.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Status {
    pub state: FsmState,
    pub connected: bool,
    pub entities: usize,
    pub sensor: String,
}

/// Cheap handle for the admin surface: read status, request an evaluation.
#[derive(Clone)]
pub struct ControllerHandle {
    trigger_tx: mpsc::Sender<()>,
    machine: MachineHandle,
    client: HubClient,
    cfg: Arc<Config>,
}

impl ControllerHandle {
    pub fn status(&self) -> Status {
        Status {
            state: self.machine.state(),
            connected: self.client.is_connected(),
            entities: self.cfg.hvac_options.entities.len(),
            sensor: self.cfg.hvac_options.temp_sensor.clone(),
        }
    }

    pub async fn trigger_evaluation(&self) {
        let _ = self.trigger_tx.send(()).await;
    }
}

/// Wires the pieces together: drains hub events into conditions updates,
/// refreshes readings on a timer, and feeds the machine.
pub struct Controller {
    cfg: Arc<Config>,
    client: HubClient,
    machine: MachineHandle,
    conditions: Conditions,
}

pub fn spawn(
    cfg: Arc<Config>,
    client: HubClient,
    machine: MachineHandle,
    events: mpsc::Receiver<StateChangedEvent>,
) -> (ControllerHandle, JoinHandle<anyhow::Result<()>>) {
    let (trigger_tx, trigger_rx) = mpsc::channel(TRIGGER_QUEUE);
    let handle = ControllerHandle {
        trigger_tx,
        machine: machine.clone(),
        client: client.clone(),
        cfg: Arc::clone(&cfg),
    };
    let controller = Controller { cfg, client, machine, conditions: Conditions::default() };
    let task = tokio::spawn(controller.run(events, trigger_rx));
    (handle, task)
}

impl Controller {
    async fn run(
        mut self,
        mut events: mpsc::Receiver<StateChangedEvent>,
        mut trigger_rx: mpsc::Receiver<()>,
    ) -> anyhow::Result<()> {
        let watcher = self.client.clone();
        let fatal = watcher.closed();
        tokio::pin!(fatal);

        // the first tick fires immediately and seeds the machine
        let mut refresh = tokio::time::interval(self.cfg.hass_options.state_check_interval());
        refresh.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                err = &mut fatal => {
                    return Err(anyhow!("hub connection failed: {err}"));
                }
                _ = refresh.tick() => self.refresh().await,
                Some(()) = trigger_rx.recv() => {
                    info!("manual evaluation requested");
                    self.refresh().await;
                }
                event = events.recv() => match event {
                    Some(event) => self.on_event(event).await,
                    None => return Err(anyhow!("hub event stream ended")),
                },
            }
        }
    }

    /// Indoor from the event, outdoor re-queried, then push.
    async fn on_event(&mut self, event: StateChangedEvent) {
        let now = Local::now();
        let Some(delta) = sensor::conditions_delta(&event, &self.cfg.hvac_options.temp_sensor, now)
        else {
            return;
        };
        self.conditions.apply(delta);
        self.conditions.outdoor_c = sensor::read_outdoor_temperature(&self.client).await;
        self.push().await;
    }

    /// Full refresh: both sensors re-read, wall clock re-sampled.
    async fn refresh(&mut self) {
        let now = Local::now();
        self.conditions.hour = now.hour() as u8;
        self.conditions.is_weekday = now.weekday().number_from_monday() <= 5;

        self.conditions.indoor_c =
            match sensor::read_temperature(&self.client, &self.cfg.hvac_options.temp_sensor).await {
                Ok(value) => Some(value),
                Err(err) => {
                    warn!(sensor = %self.cfg.hvac_options.temp_sensor, %err, "indoor temperature unavailable");
                    None
                }
            };
        self.conditions.outdoor_c = sensor::read_outdoor_temperature(&self.client).await;
        self.push().await;
    }

    async fn push(&self) {
        self.machine.push_conditions(self.conditions).await;
    }
}
