pub mod dns;
pub mod geo;
pub mod public_ip;
pub mod rdns;
pub mod version;

pub use dns::*;
pub use geo::*;
pub use public_ip::*;
pub use rdns::*;
pub use version::*;
