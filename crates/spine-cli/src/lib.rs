// Market Spine CLI
//
// Design Decision: Use clap derive for ergonomic argument parsing.
// Design Decision: Two binaries (schedule_finra, schedule_prices) sharing
//                  this library for startup, registration, and output.
// Design Decision: Registries are built and populated in main: explicit
//                  imports at startup, never auto-discovery.

pub mod output;
pub mod registration;
pub mod startup;
