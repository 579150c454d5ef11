//! Connection engine for the capnrpc protocol.
//!
//! A connection task owns the question, answer, export and import tables for one
//! peer. `RpcSystem` keeps one connection per peer over a `VatNetwork`;
//! `TwoPartyClient` and `TwoPartyServer` cover the common case of two vats
//! joined by a single byte stream.

mod client;
pub mod config;
pub mod connection;
pub mod logging;
pub mod system;
pub mod two_party;

pub use config::RpcConfig;
pub use connection::{
    spawn_connection, ConnectionHandle, ConnectionStats, ConnectionStatus, ProtocolError,
};
pub use logging::{init_logging, init_test_logging};
pub use system::{BootstrapFactory, PeerId, RpcSystem, VatNetwork};
pub use two_party::{Side, TwoPartyClient, TwoPartyServer, TwoPartyVatNetwork};
