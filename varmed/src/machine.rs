use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::json;
use tokio::sync::{mpsc, watch};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use hub_client::{ClientError, HubApi};
use varme_core::conditions::Conditions;
use varme_core::config::{Entity, HvacOptions};
use varme_core::decision::{DefrostClock, decide};
use varme_core::fsm::{FsmEvent, FsmState, transition};

/// Cadence of the periodic self-evaluation.
pub const TICK_INTERVAL: Duration = Duration::from_secs(5);

const MAILBOX: usize = 16;

#[derive(Debug)]
pub enum MachineMsg {
    Conditions(Conditions),
    Shutdown,
}

/// What the machine publishes after every committed transition.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MachineStatus {
    pub state: FsmState,
    pub clock: DefrostClock,
}

#[derive(Clone)]
pub struct MachineHandle {
    tx: mpsc::Sender<MachineMsg>,
    status_rx: watch::Receiver<MachineStatus>,
}

impl MachineHandle {
    pub async fn push_conditions(&self, conds: Conditions) {
        let _ = self.tx.send(MachineMsg::Conditions(conds)).await;
    }

    pub async fn shutdown(&self) {
        let _ = self.tx.send(MachineMsg::Shutdown).await;
    }

    pub fn state(&self) -> FsmState {
        self.status_rx.borrow().state
    }

    pub fn status(&self) -> MachineStatus {
        *self.status_rx.borrow()
    }

    /// Wait until the machine reaches `target`.
    pub async fn wait_for(&self, target: FsmState) {
        let mut rx = self.status_rx.clone();
        while rx.borrow_and_update().state != target {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}

/// The runtime half of the state machine: owns the payload, consumes
/// conditions pushed by the controller, ticks every five seconds, and runs
/// entry side effects through the hub. One transition at a time; a tick that
/// arrives mid-transition waits its turn in the select loop.
pub struct Machine {
    cfg: Arc<HvacOptions>,
    hub: Arc<dyn HubApi>,
    state: FsmState,
    conditions: Option<Conditions>,
    clock: DefrostClock,
    status_tx: watch::Sender<MachineStatus>,
}

impl Machine {
    pub fn spawn(cfg: Arc<HvacOptions>, hub: Arc<dyn HubApi>) -> MachineHandle {
        let (tx, rx) = mpsc::channel(MAILBOX);
        let (status_tx, status_rx) =
            watch::channel(MachineStatus { state: FsmState::Initial, clock: DefrostClock::default() });
        let machine = Machine {
            cfg,
            hub,
            state: FsmState::Initial,
            conditions: None,
            clock: DefrostClock::default(),
            status_tx,
        };
        tokio::spawn(machine.run(rx));
        MachineHandle { tx, status_rx }
    }

    async fn run(mut self, mut rx: mpsc::Receiver<MachineMsg>) {
        let mut ticker = tokio::time::interval(TICK_INTERVAL);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                msg = rx.recv() => match msg {
                    Some(MachineMsg::Conditions(conds)) => {
                        self.conditions = Some(conds);
                    }
                    Some(MachineMsg::Shutdown) | None => {
                        self.shutdown().await;
                        return;
                    }
                },
                _ = ticker.tick() => self.tick().await,
            }
        }
    }

    /// One evaluation: snapshot the payload, ask the decision engine,
    /// attempt the transition if it proposed one. The tick itself never
    /// mutates state.
    async fn tick(&mut self) {
        if self.state == FsmState::Stopped {
            return;
        }
        let Some(conds) = self.conditions else {
            debug!("no conditions yet, skipping tick");
            return;
        };
        if let Some(event) = decide(&self.cfg, &conds, self.state, &self.clock, Utc::now()) {
            self.apply(event).await;
        }
    }

    async fn apply(&mut self, event: FsmEvent) {
        let next = match transition(self.state, event) {
            Ok(next) => next,
            Err(rejected) => {
                warn!(%rejected, "transition rejected");
                return;
            }
        };

        match self.enter(next, event).await {
            Ok(()) => {
                info!(from = %self.state, to = %next, event = %event, "state change");
                self.commit(next, event);
            }
            Err(failed) if next == FsmState::Stopped => {
                // terminal regardless; nothing left to retry
                error!(entities = ?failed, "mode-off failed during shutdown");
                self.commit(next, event);
            }
            Err(failed) => {
                warn!(
                    entities = ?failed,
                    state = %self.state,
                    event = %event,
                    "entity commands failed, transition not committed"
                );
            }
        }
    }

    fn commit(&mut self, next: FsmState, event: FsmEvent) {
        let now = Utc::now();
        if self.state == FsmState::Defrost && next != FsmState::Defrost {
            if matches!(event, FsmEvent::CompleteDefrost | FsmEvent::ResumeHeating) {
                self.clock.last_defrost = Some(now);
            }
            self.clock.defrost_started = None;
        }
        if next == FsmState::Defrost {
            self.clock.defrost_started = Some(now);
        }
        self.state = next;
        let _ = self.status_tx.send(MachineStatus { state: next, clock: self.clock });
    }

    /// Entry side effects for `next`. Err carries the entities whose
    /// commands failed; the caller then leaves the machine where it was.
    async fn enter(&self, next: FsmState, event: FsmEvent) -> Result<(), Vec<String>> {
        match next {
            FsmState::Heating => {
                self.engage("heat", &self.cfg.heating.preset_mode, self.cfg.heating.setpoint_c)
                    .await
            }
            FsmState::Cooling => {
                self.engage("cool", &self.cfg.cooling.preset_mode, self.cfg.cooling.setpoint_c)
                    .await
            }
            FsmState::Defrost => self.start_defrost().await,
            FsmState::Idle
                if matches!(
                    event,
                    FsmEvent::StopHeating | FsmEvent::StopCooling | FsmEvent::CompleteDefrost
                ) =>
            {
                self.all_off().await
            }
            FsmState::Stopped => self.all_off().await,
            _ => Ok(()),
        }
    }

    async fn engage(&self, mode: &str, preset: &str, setpoint: f64) -> Result<(), Vec<String>> {
        let mut failed = Vec::new();
        for entity in self.cfg.enabled_entities() {
            if let Err(err) = self.command_entity(entity, mode, preset, setpoint).await {
                warn!(entity_id = %entity.entity_id, mode, %err, "entity command failed");
                failed.push(entity.entity_id.clone());
            }
        }
        if failed.is_empty() { Ok(()) } else { Err(failed) }
    }

    /// Mode, preset, setpoint, in that order. The first failure marks the
    /// whole entity failed.
    async fn command_entity(
        &self,
        entity: &Entity,
        mode: &str,
        preset: &str,
        setpoint: f64,
    ) -> Result<(), ClientError> {
        self.hub
            .call_service(
                "climate",
                "set_hvac_mode",
                json!({"entity_id": entity.entity_id, "hvac_mode": mode}),
            )
            .await?;
        self.hub
            .call_service(
                "climate",
                "set_preset_mode",
                json!({"entity_id": entity.entity_id, "preset_mode": preset}),
            )
            .await?;
        self.hub
            .call_service(
                "climate",
                "set_temperature",
                json!({"entity_id": entity.entity_id, "temperature": setpoint}),
            )
            .await?;
        Ok(())
    }

    /// The hub drives heat-pump defrost by forcing cool mode on the
    /// defrost-capable units; everything else is left alone.
    async fn start_defrost(&self) -> Result<(), Vec<String>> {
        let mut failed = Vec::new();
        for entity in self.cfg.enabled_entities().filter(|e| e.defrost_capable) {
            if let Err(err) = self
                .hub
                .call_service(
                    "climate",
                    "set_hvac_mode",
                    json!({"entity_id": entity.entity_id, "hvac_mode": "cool"}),
                )
                .await
            {
                warn!(entity_id = %entity.entity_id, %err, "defrost command failed");
                failed.push(entity.entity_id.clone());
            }
        }
        if failed.is_empty() { Ok(()) } else { Err(failed) }
    }

    async fn all_off(&self) -> Result<(), Vec<String>> {
        let mut failed = Vec::new();
        for entity in self.cfg.enabled_entities() {
            if let Err(err) = self
                .hub
                .call_service(
                    "climate",
                    "set_hvac_mode",
                    json!({"entity_id": entity.entity_id, "hvac_mode": "off"}),
                )
                .await
            {
                warn!(entity_id = %entity.entity_id, %err, "mode-off failed");
                failed.push(entity.entity_id.clone());
            }
        }
        if failed.is_empty() { Ok(()) } else { Err(failed) }
    }

    async fn shutdown(&mut self) {
        if self.state == FsmState::Stopped {
            return;
        }
        if transition(self.state, FsmEvent::Shutdown).is_err() {
            // never left Initial, nothing was ever engaged
            self.state = FsmState::Stopped;
            let _ = self.status_tx.send(MachineStatus { state: self.state, clock: self.clock });
            return;
        }
        self.apply(FsmEvent::Shutdown).await;
    }
}
