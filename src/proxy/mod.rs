//! Proxy engine and admission control.

pub mod admission;
pub mod engine;

pub use admission::{AdmissionGate, AdmissionPermit, AdmissionRejected};
pub use engine::ProxyEngine;
