//! # Meshbridge - HTTP bridge for Meshtastic radios
//!
//! Meshbridge attaches to a Meshtastic radio over USB/UART and exposes it to
//! ordinary HTTP clients: inbound text messages become a Server-Sent Events
//! stream, and `POST /send` transmits text onto the mesh.
//!
//! ## Features
//!
//! - **Live Message Stream**: `GET /messages` relays classified text messages with periodic heartbeats.
//! - **Device Queries**: `/health`, `/info` and `/nodes` report link state, radio identity and the node registry.
//! - **Lazy Reconnect**: a dead serial link is repaired on the next request, one attempt at a time.
//! - **Bounded Relay**: inbound messages are buffered in a 100-entry drop-oldest queue.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use meshbridge::config::Config;
//! use meshbridge::gateway::{self, BridgeContext};
//! use meshbridge::link::{ConnectionSupervisor, DeviceLink};
//! use meshbridge::meshtastic::serial::SerialDriver;
//! use meshbridge::relay::{inbound_sink, RelayQueue};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load("config.toml").await?;
//!     let relay = Arc::new(RelayQueue::new());
//!     let driver = Arc::new(SerialDriver::from_config(&config.meshtastic));
//!     let link = DeviceLink::new(driver, inbound_sink(Arc::clone(&relay)));
//!     let supervisor = Arc::new(ConnectionSupervisor::new(link));
//!     let (_shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
//!     let ctx = BridgeContext::new(supervisor, relay, config.heartbeat(), shutdown_rx);
//!     let listener = tokio::net::TcpListener::bind(config.bind_addr()?).await?;
//!     gateway::serve(listener, ctx).await
//! }
//! ```
//!
//! ## Module Organization
//!
//! - [`gateway`] - axum HTTP/SSE surface
//! - [`link`] - device session ownership and connection supervision
//! - [`relay`] - packet classification and the bounded relay queue
//! - [`meshtastic`] - driver contract and the serial implementation
//! - [`protobuf`] - Meshtastic protobuf messages
//! - [`config`] - configuration loading and validation
//! - [`validation`] - `/send` request validation
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────┐
//! │  HTTP Gateway   │ ← /health /info /nodes /send /messages
//! └─────────────────┘
//!     │         ▲
//! ┌────────┐ ┌────────┐
//! │  Link  │ │ Relay  │ ← supervisor / classifier + queue
//! └────────┘ └────────┘
//!     │         ▲
//! ┌─────────────────┐
//! │   Meshtastic    │ ← serial driver, rx thread
//! └─────────────────┘
//! ```

pub mod config;
pub mod gateway;
pub mod link;
pub mod logutil;
pub mod meshtastic;
pub mod protobuf;
pub mod relay;
pub mod validation;
