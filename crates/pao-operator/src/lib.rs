//! Performance profile operator: controller runner, webhooks and CLI support

#![deny(missing_docs)]

pub mod config;
pub mod controller_runner;
pub mod render;
pub mod startup;
pub mod webhook;
