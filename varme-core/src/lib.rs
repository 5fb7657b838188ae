pub mod conditions;
pub mod config;
pub mod decision;
pub mod fsm;
