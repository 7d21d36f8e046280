pub mod mtu;
pub mod ping;
pub mod traceroute;

pub use mtu::*;
pub use ping::*;
pub use traceroute::*;
