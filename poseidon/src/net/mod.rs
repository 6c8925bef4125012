//! The network driver: one edge-triggered readiness multiplexer owning
//! every live socket.

mod driver;
pub use driver::NetworkDriver;

mod slots;

mod tls;
