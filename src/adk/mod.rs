// SPDX-License-Identifier: MIT

//! Collaborator seams and shared error types
//!
//! - `agent` - dispatching tasks to the external agent service
//! - `notifier` - delivering notifications raised by action nodes
//! - `error` - the crate's error hierarchy

pub mod agent;
pub mod error;
pub mod notifier;
