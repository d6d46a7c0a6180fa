//! HTTP delivery layer: item feeds, payload downloads and manual poll
//! triggers, plus the `herald` binary wiring everything together.

pub mod routes;
pub mod state;
