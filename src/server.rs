//! Interface workers: one tokio task per served interface.
//!
//! Each worker owns its socket, engine, and pool outright, so nothing
//! here needs a lock. A worker that fails to set up its socket logs and
//! dies alone; the other interfaces keep serving.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::path::PathBuf;

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::process::Command;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::addr::{HwAddr, Ipv4};
use crate::config::InterfaceConfig;
use crate::engine::{Engine, Event, Outbound};
use crate::error::{Error, Result};
use crate::frame::BootpFrame;
use crate::pool::NetworkPool;
use crate::store;

pub const DHCP_SERVER_PORT: u16 = 67;
pub const DHCP_CLIENT_PORT: u16 = 68;

const RECV_BUFFER_SIZE: usize = 1500;
const IPTOS_LOWDELAY: u32 = 0x10;
const ARP_PROGRAM: &str = "/sbin/arp";

pub struct InterfaceWorker {
    name: String,
    engine: Engine,
    lease_file: PathBuf,
    socket: UdpSocket,
}

impl InterfaceWorker {
    /// Loads persisted leases, builds the pool and engine, and binds the
    /// interface socket.
    pub fn new(name: String, config: &InterfaceConfig) -> Result<Self> {
        let leases = match store::load(&config.lease_file) {
            Ok(leases) => leases,
            Err(err) => {
                warn!(
                    "Couldn't read lease file {}: {}",
                    config.lease_file.display(),
                    err
                );
                Vec::new()
            }
        };

        let pool = NetworkPool::new(config, &leases);
        let socket = create_socket(&name)?;

        Ok(Self {
            engine: Engine::new(name.clone(), pool),
            lease_file: config.lease_file.clone(),
            name,
            socket,
        })
    }

    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!("Started BOOTP receiver for {}", self.name);
        let mut buffer = [0u8; RECV_BUFFER_SIZE];

        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                received = self.socket.recv_from(&mut buffer) => match received {
                    Ok((size, _source)) => {
                        debug!("Got {} bytes on {}", size, self.name);
                        self.process(&buffer[..size]).await;
                    }
                    Err(err) => {
                        warn!("Socket read error on {}: {}", self.name, err);
                    }
                },
            }
        }

        info!("Stopping BOOTP receiver for {}", self.name);
    }

    async fn process(&mut self, data: &[u8]) {
        let frame = match BootpFrame::decode(data) {
            Ok(frame) => frame,
            Err(err) => {
                warn!("Failed to decode BOOTP message on {}: {}", self.name, err);
                return;
            }
        };

        let handled = self.engine.handle(frame);

        // Side effects first: the ARP entry must exist before the reply
        // is sent to an address the kernel cannot resolve yet.
        for event in &handled.events {
            match *event {
                Event::AddArpEntry { ip, hw } => self.add_arp_entry(ip, hw).await,
                Event::LeasesChanged => self.persist_leases(),
            }
        }

        if let Some(outbound) = handled.reply {
            self.send_reply(outbound).await;
        }
    }

    async fn add_arp_entry(&self, ip: Ipv4, hw: HwAddr) {
        let ip = ip.to_string();
        let hw = hw.to_string();
        debug!(
            "Executing: {} -i {} -s {} {}",
            ARP_PROGRAM, self.name, ip, hw
        );

        let status = Command::new(ARP_PROGRAM)
            .args(["-i", &self.name, "-s", &ip, &hw])
            .status()
            .await;

        match status {
            Ok(status) if status.success() => {}
            Ok(status) => error!(
                "{} exited with {} while adding the entry for {}",
                ARP_PROGRAM, status, ip
            ),
            Err(err) => error!("Failed to execute {}: {}", ARP_PROGRAM, err),
        }
    }

    fn persist_leases(&self) {
        if let Err(err) = store::save(&self.lease_file, &self.engine.leases()) {
            warn!(
                "Couldn't write to lease file {}: {}",
                self.lease_file.display(),
                err
            );
        }
    }

    async fn send_reply(&self, outbound: Outbound) {
        let target = SocketAddr::V4(SocketAddrV4::new(
            outbound.target.into(),
            DHCP_CLIENT_PORT,
        ));
        debug!(
            "Sending {} bytes to {} on {}",
            outbound.data.len(),
            outbound.target,
            self.name
        );

        match self.socket.send_to(&outbound.data, target).await {
            Ok(sent) if sent == outbound.data.len() => {}
            Ok(sent) => warn!(
                "Short write on {}: sent {} of {} bytes",
                self.name,
                sent,
                outbound.data.len()
            ),
            Err(err) => warn!("Socket write error on {}: {}", self.name, err),
        }
    }
}

/// Binds the DHCP server socket to one interface.
///
/// `SO_BINDTODEVICE` confines the socket to its broadcast domain and is
/// required; broadcast and TOS tuning failures are only warnings.
fn create_socket(interface: &str) -> Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))
        .map_err(|err| Error::Socket(format!("failed to create socket: {}", err)))?;

    socket
        .set_reuse_address(true)
        .map_err(|err| Error::Socket(format!("failed to set SO_REUSEADDR: {}", err)))?;

    socket.bind_device(Some(interface.as_bytes())).map_err(|err| {
        Error::Socket(format!(
            "failed to bind to device {}: {}",
            interface, err
        ))
    })?;

    if let Err(err) = socket.set_broadcast(true) {
        warn!("Failed to set SO_BROADCAST on {}: {}", interface, err);
    }

    if let Err(err) = socket.set_tos(IPTOS_LOWDELAY) {
        warn!("Failed to set IP_TOS on {}: {}", interface, err);
    }

    socket
        .set_nonblocking(true)
        .map_err(|err| Error::Socket(format!("failed to set non-blocking: {}", err)))?;

    let bind_addr = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, DHCP_SERVER_PORT);
    socket
        .bind(&bind_addr.into())
        .map_err(|err| Error::Socket(format!("failed to bind to {}: {}", bind_addr, err)))?;

    let std_socket: std::net::UdpSocket = socket.into();
    UdpSocket::from_std(std_socket)
        .map_err(|err| Error::Socket(format!("failed to register socket: {}", err)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ports() {
        assert_eq!(DHCP_SERVER_PORT, 67);
        assert_eq!(DHCP_CLIENT_PORT, 68);
    }
}
