#![doc = include_str!("../README.md")]

pub mod addr;
pub mod context;
pub mod queue;
pub mod reactor;
pub mod socket;
pub mod sys;

#[cfg_attr(target_family = "unix", path = "poller/mod.rs")]
pub mod poller;

pub use addr::{Inet4Address, Inet6Address, SocketAddress, UnixAddress};
pub use context::{ContextBuilder, SocketContext};
pub use queue::EventQueue;
pub use reactor::{IoReactor, Reactor, Subscription};
pub use socket::{ActiveSocket, PassiveSocket, Socket, SocketOption, SocketOptions};
