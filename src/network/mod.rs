pub mod dht;
pub mod transport;

pub use transport::{Dispatcher, TcpTransport, Transport};
