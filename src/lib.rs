pub mod circuit;
pub mod components;
pub mod error;
pub mod mna;
pub mod solver;

// Re-export commonly used types
pub use circuit::{Circuit, Node, NodeId, GROUND};
pub use components::{
    Capacitor, Component, CurrentSource, Diode, Inductor, Resistor, Transformer, VoltageSource,
};
pub use error::{Error, Result};

// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const DESCRIPTION: &str = env!("CARGO_PKG_DESCRIPTION");
