pub mod addr;
pub mod config;
pub mod daemon;
pub mod engine;
pub mod error;
pub mod frame;
pub mod options;
pub mod pool;
pub mod server;
pub mod store;

pub use addr::{HwAddr, Ipv4};
pub use config::Config;
pub use engine::Engine;
pub use error::{Error, Result};
pub use frame::BootpFrame;
pub use options::{DhcpOption, MessageType};
pub use pool::{Lease, NetworkPool};
pub use server::InterfaceWorker;
