//! Ingress workers (C6): long-running producer tasks that feed typed
//! `Sample`s onto the single bounded router channel, plus the Router (C7)
//! itself, the sole consumer of that channel.

pub mod adc_producer;
pub mod router;
pub mod serial_producer;
