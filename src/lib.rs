//! `weave`: an incremental, content-addressed build orchestrator for
//! static-site generation pipelines.
//!
//! A pipeline is a DAG of [`node::Node`]s. Each node declares its
//! dependencies (implicitly, via references embedded in its configuration,
//! or explicitly) and emits one or more named outputs. The [`pipeline::Pipeline`]
//! resolves the DAG, schedules nodes, and hands each one a [`context::Context`]
//! exposing input resolution, the [`cache`] store, and the [`worker_pool`].
//!
//! This crate is a library: it ships no binary and no CLI. A pipeline
//! definition is an ordinary Rust program that constructs nodes and calls
//! [`pipeline::Pipeline::run`].

use derive_more::Display;

pub mod cache;
pub mod config;
pub mod context;
pub mod fs;
pub mod hash;
pub mod input;
pub mod node;
pub mod nodes;
pub mod output_shaping;
pub mod path;
pub mod pipeline;
pub mod runtime;
pub mod worker_pool;

/// The associated type's state is unlocked.
/// Used for the typestate pattern.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Display, Default)]
pub struct Unlocked;

/// The associated type's state is locked.
/// Used for the typestate pattern.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Display, Default)]
pub struct Locked;
