//! Signaling Module - Bus und Nachrichtenformate
//!
//! Dieses Modul verwaltet die Kommunikation zwischen den Teilnehmern:
//! - SignalBus Abstraktion (Publish/Subscribe pro Topic)
//! - In-Process Bus und WebSocket-Relay Client
//! - Presence- und Signaling-Nachrichten
//!

mod bus;
mod client;
mod messages;

pub use bus::{BusError, MemoryBus, SignalBus, Subscription};
pub use client::WebSocketBus;
pub use messages::*;
