//! Socket-backed channels
//!
//! - [`TcpChannel`]: command channel over TCP
//! - [`UdpDataChannelFactory`]: optional UDP data channel

mod tcp;
mod udp;

pub use tcp::TcpChannel;
pub use udp::UdpDataChannelFactory;
