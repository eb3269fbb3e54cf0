//! Kiln — resource rendering and recipe deployment.
//!
//! Manual resources render into output graphs of cloud resources whose
//! values resolve after deployment. Recipe resources run Bicep or Terraform
//! templates. Every run is recorded as BLAKE3-hashed state and JSONL events.

pub mod cli;
pub mod core;
pub mod drivers;
pub mod installer;
pub mod renderers;
pub mod tripwire;
