//! hostsync-kernel : collecte des hôtes depuis plusieurs sources, fusion
//! dans une table canonique et synchronisation vers la plateforme de supervision.

pub mod collectors;
pub mod config;
pub mod failsafe;
pub mod gc;
pub mod health;
pub mod http;
pub mod mapping;
pub mod merger;
pub mod models;
pub mod modifiers;
pub mod platform;
pub mod resilience;
pub mod source;
pub mod state;
pub mod store;
pub mod sync;
pub mod units;
pub mod worker;
