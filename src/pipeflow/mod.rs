// SPDX-License-Identifier: MIT

//! Pipeline workflow engine
//!
//! A pipeline is a directed graph of typed nodes started by a single
//! trigger. The [`registry::PipelineRegistry`] manages pipelines and admits
//! runs; the [`coordinator::Coordinator`] drives each run over the graph,
//! dispatching ready nodes to their [`executor`] and recording every state
//! change in the [`store`].

pub mod condition;
pub mod config;
pub mod context;
pub mod coordinator;
pub mod events;
pub mod executor;
pub mod pipeline;
pub mod registry;
pub mod store;
