//! Distributed DoubleTree topology discovery.
//!
//! A leader ([`lease::LeaseManager`]) splits a target list into ranges and
//! leases them to monitors ([`monitor::Monitor`]). Each monitor traces every
//! address of its range forward and backward ([`trace::ProbeEngine`]), stopping
//! at links already recorded in the shared stop sets ([`stopset`]).

// Public API - data types, algorithms and export functions
pub mod cli;
pub mod config;
pub mod export;
pub mod lease;
pub mod monitor;
pub mod rpc;
pub mod state;
pub mod stopset;
pub mod trace;

// Collaborators the engine is generic over
pub mod lookup;
pub mod probe;
