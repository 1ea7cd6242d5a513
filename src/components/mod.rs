//! Stack components, leaves first.
//!
//! Each constructor takes a [`Context`](crate::core::graph::Context) and the
//! outputs of the components it depends on, registers its resources under its
//! own component node, and returns deferred handles to what it publishes.

pub mod application;
pub mod loadbalancer;
pub mod network;
pub mod registry;
pub mod stack;
pub mod web_api;
pub mod web_ui;
