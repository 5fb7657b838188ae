pub mod client;
pub mod protocol;
pub mod sensor;

pub use client::{ClientError, HubApi, HubClient, REQUEST_TIMEOUT};
pub use protocol::{EntitySnapshot, StateChangedEvent};
