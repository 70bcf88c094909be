//! A peer-to-peer virtual network daemon: bridges a local tunnel interface
//! with a mesh of encrypted peer connections, relaying link-layer frames
//! and maintaining distance-vector routing so a frame finds its
//! destination peer by hardware address.
//!
//! The core (connection state machine, route table, codec, queues) is
//! single-threaded and cooperative: the only suspension point is the
//! readiness multiplexer driven from [`context`].

#[macro_use]
extern crate error_chain;

pub mod broadcast;
pub mod channel;
pub mod codec;
pub mod config;
pub mod connection;
pub mod context;
pub mod dispatch;
pub mod driver;
pub mod error;
pub mod hwaddr;
pub mod peer_id;
pub mod registry;
pub mod route;
pub mod squeue;
pub mod status;
pub mod tunnel;

pub use error::{MeshError, MeshErrorKind, MeshResult};
