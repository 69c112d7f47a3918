//! Agora Library
//!
//! A multi-agent trading decision loop: a panel of analysts votes on each
//! market slice, an adaptive weighted consensus decides, regime dispatch
//! shapes the order and a risk gate admits or rejects it.
//!
//! # Layout
//!
//! - `core`: agents, consensus, regime, strategy, risk
//! - `broker`: execution gateways
//! - `data`: slice feed and state persistence
//! - `engine`: the per-slice decision cycle

pub mod broker;
pub mod config;
pub mod core;
pub mod data;
pub mod engine;
