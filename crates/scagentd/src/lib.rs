//! Host agent: conditional reboots and artifact materialization.
//!
//! The daemon wires four independent subsystems together: the
//! conditional-reboot engine (`reboot`), the source-to-sink
//! materialization engines (`materialize`), the secret-store
//! credential lifecycle (`vault`), and the admin API (`server`,
//! `routes`). `config` turns the YAML document into runtime objects;
//! everything runs under one cancellation tree.

pub mod config;
pub mod materialize;
pub mod metrics;
pub mod reboot;
pub mod routes;
pub mod server;
pub mod vault;
