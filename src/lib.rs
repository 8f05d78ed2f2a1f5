#![allow(missing_docs)] // TODO: enforce once the public API surface settles

//! Straylight — a governed autonomy kernel.
//!
//! Every tool invocation an agent attempts is mediated by the kernel:
//! contract validation, risk-classified approval, enforced state machine,
//! post-condition verification, compensation on failure, and a
//! hash-chained audit trail. See [`kernel::facade::Kernel`] for the
//! inward-facing API.

pub mod config;
pub mod kernel;
pub mod logging;
pub mod memory;
pub mod orchestrator;
pub mod types;
