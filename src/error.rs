//! Error kinds for the connection and route subsystems.
//!
//! Every handler in the core returns either a quiet success or one of these
//! kinds; the dispatcher maps the kind to a connection-level action
//! (continue / close / retry) rather than unwinding.

use std::io;

error_chain! {
    types {
        MeshError, MeshErrorKind, MeshResultExt, MeshResult;
    }

    errors {
        /// Configuration failed to parse or was missing a required field. Fatal.
        ConfigInvalid(detail: String) {
            description("configuration is invalid")
            display("configuration is invalid: {}", detail)
        }
        /// The transport handshake failed. Closes the connection, retries if configured.
        TransportHandshake(detail: String) {
            description("transport handshake failed")
            display("transport handshake failed: {}", detail)
        }
        /// A peer violated the wire protocol. Closes the connection, no retry this tick.
        ProtocolViolation(detail: String) {
            description("protocol violation")
            display("protocol violation: {}", detail)
        }
        /// A protocol (control) queue overflowed. Indicates a design error; fatal.
        ProtoQueueFull {
            description("protocol queue overflowed")
            display("protocol queue overflowed, this indicates a design error")
        }
    }

    foreign_links {
        Io(io::Error);
    }
}

/// Benign, non-fatal outcomes that are not modeled as `MeshError` because the
/// dispatcher handles them inline rather than logging and closing.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SoftError {
    /// A data packet queue was full; the packet was dropped, not an error.
    DataQueueFull,
    /// A peer's remote route table would have exceeded its cap; the update
    /// was rejected and a resync requested.
    RouteCapExceeded,
}
