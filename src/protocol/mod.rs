//! Drive command protocol: transport framing, typed sessions, value
//! parsing.

mod session;
mod transport;
mod value;

pub use session::{DriveSession, NonDefaultParam};
pub use value::{parse_float, parse_int, Value};
