use chrono::{DateTime, Utc};

use crate::conditions::Conditions;
use crate::config::{DefrostParams, HvacOptions, SystemMode, Thresholds};
use crate::fsm::{FsmEvent, FsmState};

/// Defrost bookkeeping carried in the machine payload.
///
/// `defrost_started` is Some exactly while the machine is in `Defrost`;
/// `last_defrost` never moves backwards once set.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct DefrostClock {
    pub last_defrost: Option<DateTime<Utc>>,
    pub defrost_started: Option<DateTime<Utc>>,
}

/// Pick the next event for the machine, or None to stay put.
///
/// Pure in its inputs: the same (conditions, config, state, clock, now)
/// always yields the same answer.
pub fn decide(
    cfg: &HvacOptions,
    conds: &Conditions,
    state: FsmState,
    clock: &DefrostClock,
    now: DateTime<Utc>,
) -> Option<FsmEvent> {
    match state {
        FsmState::Initial => return Some(FsmEvent::Initialize),
        FsmState::Stopped => return None,
        FsmState::Defrost => {
            if let Some(started) = clock.defrost_started {
                let elapsed = (now - started).num_seconds();
                if elapsed >= cfg.heating.defrost.duration_seconds as i64 {
                    let resume = operable_now(cfg, conds)
                        && should_heat(conds, &cfg.heating.thresholds);
                    return Some(if resume {
                        FsmEvent::ResumeHeating
                    } else {
                        FsmEvent::CompleteDefrost
                    });
                }
            }
            // Mid-cycle defrost falls through: an off mode or closed hours
            // may still abort it below.
        }
        _ => {}
    }

    // Never act on partial data.
    let (Some(indoor), Some(outdoor)) = (conds.indoor_c, conds.outdoor_c) else {
        tracing::debug!(state = %state, "incomplete conditions, skipping evaluation");
        return None;
    };

    let mode = effective_mode(cfg, conds, indoor, outdoor);
    tracing::trace!(state = %state, mode = ?mode, indoor, outdoor, "evaluating");

    match mode {
        SystemMode::HeatOnly => {
            if !operable_now(cfg, conds) {
                return stop_event(state);
            }
            if state == FsmState::Heating && need_defrost(outdoor, &cfg.heating.defrost, clock, now)
            {
                return Some(FsmEvent::StartDefrost);
            }
            let heat = should_heat(conds, &cfg.heating.thresholds);
            match state {
                FsmState::Idle if heat => Some(FsmEvent::StartHeating),
                FsmState::Heating if !heat => Some(FsmEvent::StopHeating),
                _ => None,
            }
        }
        SystemMode::CoolOnly => {
            if !operable_now(cfg, conds) {
                return match state {
                    FsmState::Cooling => Some(FsmEvent::StopCooling),
                    _ => None,
                };
            }
            let cool = should_cool(conds, &cfg.cooling.thresholds);
            match state {
                FsmState::Idle if cool => Some(FsmEvent::StartCooling),
                FsmState::Cooling if !cool => Some(FsmEvent::StopCooling),
                _ => None,
            }
        }
        SystemMode::Off => stop_event(state),
        SystemMode::Auto => unreachable!("auto is resolved by effective_mode"),
    }
}

/// Resolve `auto` into a concrete mode for this tick; other modes pass
/// through unchanged.
fn effective_mode(cfg: &HvacOptions, conds: &Conditions, indoor: f64, outdoor: f64) -> SystemMode {
    if cfg.system_mode != SystemMode::Auto {
        return cfg.system_mode;
    }

    let heat_th = &cfg.heating.thresholds;
    let cool_th = &cfg.cooling.thresholds;
    let operable = operable_now(cfg, conds);

    if indoor < heat_th.indoor_min {
        return if outdoor_in_range(outdoor, heat_th) && operable {
            SystemMode::HeatOnly
        } else {
            SystemMode::Off
        };
    }
    if indoor > cool_th.indoor_max {
        return if outdoor_in_range(outdoor, cool_th) && operable {
            SystemMode::CoolOnly
        } else {
            SystemMode::Off
        };
    }

    let heat_ok = outdoor_in_range(outdoor, heat_th) && operable;
    let cool_ok = outdoor_in_range(outdoor, cool_th) && operable;
    match (heat_ok, cool_ok) {
        (true, true) => {
            let midpoint = (heat_th.outdoor_max + cool_th.outdoor_min) / 2.0;
            if outdoor <= midpoint { SystemMode::HeatOnly } else { SystemMode::CoolOnly }
        }
        (true, false) => SystemMode::HeatOnly,
        (false, true) => SystemMode::CoolOnly,
        (false, false) => SystemMode::Off,
    }
}

fn stop_event(state: FsmState) -> Option<FsmEvent> {
    match state {
        FsmState::Heating => Some(FsmEvent::StopHeating),
        FsmState::Cooling => Some(FsmEvent::StopCooling),
        FsmState::Defrost => Some(FsmEvent::CompleteDefrost),
        _ => None,
    }
}

/// Hours-only gate; outdoor bounds belong to the mode predicates.
/// Both endpoints are inclusive.
fn operable_now(cfg: &HvacOptions, conds: &Conditions) -> bool {
    let start = cfg.active_hours.start_for(conds.is_weekday);
    conds.hour >= start && conds.hour <= cfg.active_hours.end_hour
}

fn outdoor_in_range(outdoor: f64, th: &Thresholds) -> bool {
    outdoor >= th.outdoor_min && outdoor <= th.outdoor_max
}

fn should_heat(conds: &Conditions, th: &Thresholds) -> bool {
    match (conds.indoor_c, conds.outdoor_c) {
        (Some(indoor), Some(outdoor)) => indoor < th.indoor_min && outdoor_in_range(outdoor, th),
        _ => false,
    }
}

fn should_cool(conds: &Conditions, th: &Thresholds) -> bool {
    match (conds.indoor_c, conds.outdoor_c) {
        (Some(indoor), Some(outdoor)) => indoor > th.indoor_max && outdoor_in_range(outdoor, th),
        _ => false,
    }
}

/// A defrost is due while heating when the coil-side outdoor temperature is
/// at or below the threshold and at least `period_seconds` have passed since
/// the previous cycle (equality counts).
fn need_defrost(outdoor: f64, params: &DefrostParams, clock: &DefrostClock, now: DateTime<Utc>) -> bool {
    if outdoor > params.temperature_threshold_c {
        return false;
    }
    match clock.last_defrost {
        None => true,
        Some(last) => (now - last).num_seconds() >= params.period_seconds as i64,
    }
}
