#![allow(deprecated)]

#[macro_use]
extern crate tracing;

pub mod cloud_gateway;
pub mod config;
pub mod controller;
pub mod convergence;
pub mod converger;
pub mod error;
pub mod events;
pub mod executor;
pub mod gatherer;
pub mod lock;
pub mod model;
pub mod planner;
pub mod store;
