#![forbid(unsafe_code)]
#![doc = include_str!("../README.md")]

mod core;
mod error;

pub mod config;
pub mod engine;
pub mod pipeline;
pub mod tool;
pub mod utils;

pub use crate::core::{ArcStr, Hash32};
pub use crate::engine::{
    BuildGraph, Dependencies, Diagnostics, Edge, Handle, Journal, Key, NodeRef, Outputs, Params,
    Registry, Resolved, Rule, RunOptions, Runner, Stage, Target, TaskContext, TaskExecution,
    TaskKind, WeightChain,
};
pub use crate::error::*;
