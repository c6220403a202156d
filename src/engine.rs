//! Per-interface DHCP message engine.
//!
//! One engine per served interface. It consumes decoded frames and
//! produces at most one outbound frame plus side-effect events; all I/O
//! (sockets, ARP, lease files) stays with the caller. The pending-offer
//! map bridges the DISCOVER and REQUEST halves of the allocation
//! handshake and is the only state here beyond the pool itself.

use std::collections::HashMap;

use chrono::Utc;
use tracing::{debug, error, info, warn};

use crate::addr::{HwAddr, Ipv4};
use crate::frame::{BOOTREPLY, BOOTREQUEST, BootpFrame};
use crate::options::{DhcpOption, MessageType, OptionTag};
use crate::pool::{Lease, NetworkPool};

/// How long a pending offer waits for the client's REQUEST before the
/// sweep discards it.
pub const OFFER_TTL_SECS: i64 = 60;

/// An encoded response and the address it should be sent to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outbound {
    pub target: Ipv4,
    pub data: Vec<u8>,
}

/// Side effects the surrounding worker must apply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    /// Install a static ARP entry on the receiving interface. Emitted
    /// with every offer: the target has no address yet, so the kernel
    /// cannot resolve it on its own.
    AddArpEntry { ip: Ipv4, hw: HwAddr },
    /// The lease table changed and should be flushed to disk.
    LeasesChanged,
}

/// The outcome of one inbound frame.
#[derive(Debug, Default)]
pub struct Handled {
    pub reply: Option<Outbound>,
    pub events: Vec<Event>,
}

struct PendingOffer {
    frame: BootpFrame,
    created: i64,
}

pub struct Engine {
    iface: String,
    pool: NetworkPool,
    offers: HashMap<HwAddr, PendingOffer>,
}

impl Engine {
    pub fn new(iface: String, pool: NetworkPool) -> Self {
        Self {
            iface,
            pool,
            offers: HashMap::new(),
        }
    }

    /// Snapshot of the pool's lease table, for persistence.
    pub fn leases(&self) -> Vec<Lease> {
        self.pool.all_leases()
    }

    fn now() -> i64 {
        Utc::now().timestamp()
    }

    pub fn handle(&mut self, frame: BootpFrame) -> Handled {
        self.sweep_offers();

        let Some(message_type) = frame.message_type() else {
            debug!("Message without a DHCP message type on {}, dropping", self.iface);
            return Handled::default();
        };

        match message_type {
            MessageType::Discover => {
                info!("Handling DISCOVER from {}", frame.chaddr);
                self.handle_discover(frame)
            }
            MessageType::Request => {
                info!("Handling REQUEST from {}", frame.chaddr);
                self.handle_request(frame)
            }
            MessageType::Release => {
                info!("Handling RELEASE from {}", frame.chaddr);
                self.handle_release(frame)
            }
            MessageType::Decline => {
                info!("Handling DECLINE (as a release) from {}", frame.chaddr);
                self.handle_release(frame)
            }
            other => {
                debug!("Ignoring {} from {}", other, frame.chaddr);
                Handled::default()
            }
        }
    }

    fn sweep_offers(&mut self) {
        let now = Self::now();
        self.offers
            .retain(|_, offer| now - offer.created <= OFFER_TTL_SECS);
    }

    fn handle_discover(&mut self, frame: BootpFrame) -> Handled {
        let mut handled = Handled::default();

        if frame.op != BOOTREQUEST {
            debug!(
                "DISCOVER from {} does not carry the request opcode, dropping",
                frame.chaddr
            );
            return handled;
        }

        let Some(address) = self.pool.available(frame.chaddr) else {
            warn!(
                "Address pool on {} is exhausted, not offering anything to {}",
                self.iface, frame.chaddr
            );
            return handled;
        };

        let mut offer = frame.clone();
        offer.op = BOOTREPLY;
        offer.yiaddr = address;
        self.install_offer_options(&frame, &mut offer);

        match offer.encode() {
            Ok(data) => {
                info!("Offering {} to {}", address, frame.chaddr);
                handled.events.push(Event::AddArpEntry {
                    ip: address,
                    hw: frame.chaddr,
                });
                handled.reply = Some(Outbound {
                    target: address,
                    data,
                });
                self.offers.insert(
                    frame.chaddr,
                    PendingOffer {
                        frame: offer,
                        created: Self::now(),
                    },
                );
            }
            Err(err) => error!("{}; the offer to {} will not be sent", err, frame.chaddr),
        }

        handled
    }

    fn handle_request(&mut self, frame: BootpFrame) -> Handled {
        let mut handled = Handled::default();
        let chaddr = frame.chaddr;

        if !self.offers.contains_key(&chaddr) {
            // No offer in flight. A client we already have a lease for is
            // renewing across a restart; anyone else gets a NAK.
            match self.pool.lookup_by_hw(chaddr).copied() {
                None => {
                    info!("Sending NAK to unknown client {}", chaddr);
                    let mut nak = frame;
                    self.make_nak(&mut nak);
                    match nak.encode() {
                        Ok(data) => {
                            handled.reply = Some(Outbound {
                                target: self.pool.broadcast(),
                                data,
                            });
                        }
                        Err(err) => {
                            error!("{}; the NAK to {} will not be sent", err, chaddr);
                        }
                    }
                    return handled;
                }
                Some(lease) => {
                    let mut offer = frame.clone();
                    offer.op = BOOTREPLY;
                    offer.yiaddr = lease.ip;
                    self.install_offer_options(&frame, &mut offer);
                    self.offers.insert(
                        chaddr,
                        PendingOffer {
                            frame: offer,
                            created: Self::now(),
                        },
                    );
                }
            }
        }

        // The offer is consumed here no matter how the request ends.
        let Some(pending) = self.offers.remove(&chaddr) else {
            return handled;
        };
        let mut response = pending.frame;

        let requested = frame.requested_ip();
        let effective = self
            .pool
            .available_with(chaddr, requested)
            .unwrap_or(Ipv4::UNSPECIFIED);

        if response.yiaddr != requested || effective != requested {
            info!(
                "Sending NAK to {}: offered {}, requested {}, pool answered {}",
                chaddr, response.yiaddr, requested, effective
            );
            self.make_nak(&mut response);
        } else if self.pool.reserve(chaddr, effective) {
            response
                .options
                .insert(DhcpOption::MessageType(MessageType::Ack));
            info!("Sending ACK for {} to {}", effective, chaddr);
            handled.events.push(Event::LeasesChanged);
        } else {
            info!(
                "Sending NAK to {}: reservation of {} failed",
                chaddr, effective
            );
            self.make_nak(&mut response);
        }

        match response.encode() {
            Ok(data) => {
                handled.reply = Some(Outbound {
                    target: effective,
                    data,
                });
            }
            Err(err) => error!("{}; the response to {} will not be sent", err, chaddr),
        }

        handled
    }

    fn handle_release(&mut self, frame: BootpFrame) -> Handled {
        info!("Releasing {} held by {}", frame.ciaddr, frame.chaddr);
        self.pool.release(frame.ciaddr);
        Handled {
            reply: None,
            events: vec![Event::LeasesChanged],
        }
    }

    fn make_nak(&self, frame: &mut BootpFrame) {
        frame.op = BOOTREPLY;
        frame.yiaddr = Ipv4::UNSPECIFIED;
        frame.ciaddr = Ipv4::UNSPECIFIED;
        frame.options.clear();
        frame
            .options
            .insert(DhcpOption::MessageType(MessageType::Nak));
        frame
            .options
            .insert(DhcpOption::ServerId(self.pool.server_id()));
    }

    /// Installs the full offer option set: the base options every client
    /// needs, plus T1/T2 when the parameter request list asks for them.
    fn install_offer_options(&self, request: &BootpFrame, offer: &mut BootpFrame) {
        offer.options.clear();
        offer
            .options
            .insert(DhcpOption::MessageType(MessageType::Offer));
        offer
            .options
            .insert(DhcpOption::ServerId(self.pool.server_id()));
        offer
            .options
            .insert(DhcpOption::LeaseTime(self.pool.lease_time()));
        offer
            .options
            .insert(DhcpOption::SubnetMask(self.pool.subnet_mask()));
        offer.options.insert(DhcpOption::Router(self.pool.router()));
        offer
            .options
            .insert(DhcpOption::DnsServers(self.pool.dns_servers().to_vec()));
        offer
            .options
            .insert(DhcpOption::Broadcast(self.pool.broadcast()));

        for &tag in request.parameter_list() {
            if tag == OptionTag::RenewalTime as u8 {
                offer
                    .options
                    .insert(DhcpOption::RenewalTime(self.pool.renewal_time()));
            } else if tag == OptionTag::RebindingTime as u8 {
                offer
                    .options
                    .insert(DhcpOption::RebindingTime(self.pool.rebinding_time()));
            }
        }

        debug!(
            "Parameter request from {} - {}",
            request.chaddr,
            describe_parameter_list(request.parameter_list())
        );
    }
}

fn parameter_name(tag: u8) -> Option<&'static str> {
    match tag {
        1 => Some("SubnetMask"),
        3 => Some("Routers"),
        6 => Some("DNS"),
        28 => Some("Broadcast"),
        50 => Some("RequestedIp"),
        51 => Some("LeaseTime"),
        54 => Some("ServerIdentifier"),
        58 => Some("RenewalTime"),
        59 => Some("RebindingTime"),
        _ => None,
    }
}

fn describe_parameter_list(tags: &[u8]) -> String {
    if tags.is_empty() {
        return "[empty or unspecified]".to_string();
    }

    let names: Vec<String> = tags
        .iter()
        .map(|&tag| match parameter_name(tag) {
            Some(name) => format!("{}/{}", tag, name),
            None => tag.to_string(),
        })
        .collect();
    names.join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::InterfaceConfig;
    use crate::frame::{HLEN_ETHERNET, HTYPE_ETHERNET};
    use crate::options::OptionMap;
    use std::collections::HashMap as StdHashMap;
    use std::path::PathBuf;

    fn ip(text: &str) -> Ipv4 {
        Ipv4::parse(text).unwrap()
    }

    fn test_config() -> InterfaceConfig {
        InterfaceConfig {
            network: ip("192.168.200.0"),
            prefix: 24,
            routers: ip("192.168.200.1"),
            server_id: ip("192.168.200.1"),
            dhcp_first: ip("192.168.200.100"),
            dhcp_last: ip("192.168.200.254"),
            dns_servers: vec![ip("192.168.200.1"), ip("8.8.8.8")],
            lease_time: 3600,
            renewal_time: 1800,
            rebinding_time: 3150,
            lease_file: PathBuf::from("leases.bin"),
            reservations: StdHashMap::new(),
        }
    }

    fn test_engine() -> Engine {
        Engine::new(
            "eth0".to_string(),
            NetworkPool::new(&test_config(), &[]),
        )
    }

    fn base_frame(hw: u64, message_type: MessageType) -> BootpFrame {
        let mut options = OptionMap::new();
        options.insert(DhcpOption::MessageType(message_type));
        BootpFrame {
            op: BOOTREQUEST,
            htype: HTYPE_ETHERNET,
            hlen: HLEN_ETHERNET,
            hops: 0,
            xid: 0x1234_5678,
            secs: 0,
            flags: 0x8000,
            ciaddr: Ipv4::UNSPECIFIED,
            yiaddr: Ipv4::UNSPECIFIED,
            siaddr: Ipv4::UNSPECIFIED,
            giaddr: Ipv4::UNSPECIFIED,
            chaddr: HwAddr(hw),
            options,
        }
    }

    fn request_for(hw: u64, requested: Ipv4) -> BootpFrame {
        let mut frame = base_frame(hw, MessageType::Request);
        frame.options.insert(DhcpOption::RequestedIp(requested));
        frame
    }

    fn decode_reply(handled: &Handled) -> BootpFrame {
        BootpFrame::decode(&handled.reply.as_ref().unwrap().data).unwrap()
    }

    #[test]
    fn test_discover_produces_offer() {
        let mut engine = test_engine();
        let mut discover = base_frame(0xAABBCCDDEEFF, MessageType::Discover);
        discover
            .options
            .insert(DhcpOption::ParameterList(vec![1, 3, 6, 51, 54]));

        let handled = engine.handle(discover);

        let outbound = handled.reply.as_ref().unwrap();
        assert_eq!(outbound.target, ip("192.168.200.100"));
        assert_eq!(
            handled.events,
            vec![Event::AddArpEntry {
                ip: ip("192.168.200.100"),
                hw: HwAddr(0xAABBCCDDEEFF),
            }]
        );

        let offer = decode_reply(&handled);
        assert_eq!(offer.op, BOOTREPLY);
        assert_eq!(offer.xid, 0x1234_5678);
        assert_eq!(offer.yiaddr, ip("192.168.200.100"));
        assert_eq!(offer.message_type(), Some(MessageType::Offer));
        for tag in [
            OptionTag::SubnetMask,
            OptionTag::Router,
            OptionTag::DnsServers,
            OptionTag::Broadcast,
            OptionTag::LeaseTime,
            OptionTag::ServerId,
        ] {
            assert!(offer.options.contains(tag), "offer missing tag {:?}", tag);
        }
        assert_eq!(
            offer.options.get(OptionTag::LeaseTime),
            Some(&DhcpOption::LeaseTime(3600))
        );
    }

    #[test]
    fn test_discover_with_reply_opcode_dropped() {
        let mut engine = test_engine();
        let mut discover = base_frame(1, MessageType::Discover);
        discover.op = BOOTREPLY;

        let handled = engine.handle(discover);
        assert!(handled.reply.is_none());
        assert!(handled.events.is_empty());
        assert!(engine.offers.is_empty());
    }

    #[test]
    fn test_missing_message_type_dropped() {
        let mut engine = test_engine();
        let mut frame = base_frame(1, MessageType::Discover);
        frame.options.clear();

        let handled = engine.handle(frame);
        assert!(handled.reply.is_none());
        assert!(handled.events.is_empty());
    }

    #[test]
    fn test_discover_then_request_acks() {
        let mut engine = test_engine();

        engine.handle(base_frame(0xAABBCCDDEEFF, MessageType::Discover));
        let handled = engine.handle(request_for(0xAABBCCDDEEFF, ip("192.168.200.100")));

        let ack = decode_reply(&handled);
        assert_eq!(ack.message_type(), Some(MessageType::Ack));
        assert_eq!(ack.yiaddr, ip("192.168.200.100"));
        assert_eq!(handled.reply.as_ref().unwrap().target, ip("192.168.200.100"));
        assert_eq!(handled.events, vec![Event::LeasesChanged]);

        let lease = engine.pool.lookup_by_hw(HwAddr(0xAABBCCDDEEFF)).unwrap();
        assert_eq!(lease.ip, ip("192.168.200.100"));
        assert!(engine.offers.is_empty());
    }

    #[test]
    fn test_request_mismatch_naks_without_reserving() {
        let mut engine = test_engine();

        engine.handle(base_frame(0xAABBCCDDEEFF, MessageType::Discover));
        let handled = engine.handle(request_for(0xAABBCCDDEEFF, ip("192.168.200.101")));

        let nak = decode_reply(&handled);
        assert_eq!(nak.message_type(), Some(MessageType::Nak));
        assert!(nak.yiaddr.is_unspecified());
        assert!(nak.ciaddr.is_unspecified());
        assert!(handled.events.is_empty());

        assert!(engine.pool.lookup_by_hw(HwAddr(0xAABBCCDDEEFF)).is_none());
        assert!(engine.offers.is_empty());
    }

    #[test]
    fn test_request_from_unknown_client_naks_to_broadcast() {
        let mut engine = test_engine();

        let handled = engine.handle(request_for(0x42, ip("192.168.200.100")));

        let outbound = handled.reply.as_ref().unwrap();
        assert_eq!(outbound.target, ip("192.168.200.255"));

        let nak = BootpFrame::decode(&outbound.data).unwrap();
        assert_eq!(nak.message_type(), Some(MessageType::Nak));
        assert_eq!(nak.op, BOOTREPLY);
        assert!(nak.yiaddr.is_unspecified());
        assert!(nak.ciaddr.is_unspecified());
    }

    #[test]
    fn test_request_renews_persisted_lease_without_discover() {
        let seed = [Lease {
            start_time: Engine::now() - 10,
            hw: HwAddr(0x42),
            ip: ip("192.168.200.123"),
        }];
        let mut engine = Engine::new(
            "eth0".to_string(),
            NetworkPool::new(&test_config(), &seed),
        );

        let handled = engine.handle(request_for(0x42, ip("192.168.200.123")));

        let ack = decode_reply(&handled);
        assert_eq!(ack.message_type(), Some(MessageType::Ack));
        assert_eq!(ack.yiaddr, ip("192.168.200.123"));
        assert_eq!(handled.events, vec![Event::LeasesChanged]);
    }

    #[test]
    fn test_repeated_request_is_renewal() {
        let mut engine = test_engine();

        engine.handle(base_frame(0x42, MessageType::Discover));
        engine.handle(request_for(0x42, ip("192.168.200.100")));
        let first_start = engine.pool.lookup_by_hw(HwAddr(0x42)).unwrap().start_time;

        // Same REQUEST again, no new DISCOVER: rebuilt from the lease.
        let handled = engine.handle(request_for(0x42, ip("192.168.200.100")));
        let ack = decode_reply(&handled);
        assert_eq!(ack.message_type(), Some(MessageType::Ack));

        let renewed = engine.pool.lookup_by_hw(HwAddr(0x42)).unwrap();
        assert_eq!(renewed.ip, ip("192.168.200.100"));
        assert!(renewed.start_time >= first_start);
    }

    #[test]
    fn test_repeated_discover_replaces_offer() {
        let mut engine = test_engine();

        engine.handle(base_frame(0x42, MessageType::Discover));
        engine.handle(base_frame(0x42, MessageType::Discover));

        assert_eq!(engine.offers.len(), 1);
        let handled = engine.handle(request_for(0x42, ip("192.168.200.100")));
        assert_eq!(decode_reply(&handled).message_type(), Some(MessageType::Ack));
    }

    #[test]
    fn test_release_drops_lease_and_persists() {
        let mut engine = test_engine();

        engine.handle(base_frame(0x42, MessageType::Discover));
        engine.handle(request_for(0x42, ip("192.168.200.100")));

        let mut release = base_frame(0x42, MessageType::Release);
        release.ciaddr = ip("192.168.200.100");
        let handled = engine.handle(release);

        assert!(handled.reply.is_none());
        assert_eq!(handled.events, vec![Event::LeasesChanged]);
        assert!(engine.pool.lookup_by_hw(HwAddr(0x42)).is_none());
    }

    #[test]
    fn test_decline_treated_as_release() {
        let mut engine = test_engine();

        engine.handle(base_frame(0x42, MessageType::Discover));
        engine.handle(request_for(0x42, ip("192.168.200.100")));

        let mut decline = base_frame(0x42, MessageType::Decline);
        decline.ciaddr = ip("192.168.200.100");
        let handled = engine.handle(decline);

        assert!(handled.reply.is_none());
        assert!(engine.pool.lookup_by_ip(ip("192.168.200.100")).is_none());
    }

    #[test]
    fn test_client_message_types_ignored() {
        let mut engine = test_engine();
        for message_type in [MessageType::Offer, MessageType::Ack, MessageType::Nak] {
            let handled = engine.handle(base_frame(0x42, message_type));
            assert!(handled.reply.is_none());
            assert!(handled.events.is_empty());
        }
    }

    #[test]
    fn test_exhausted_pool_drops_discover() {
        let config = InterfaceConfig {
            dhcp_first: ip("192.168.200.100"),
            dhcp_last: ip("192.168.200.100"),
            ..test_config()
        };
        let mut engine = Engine::new("eth0".to_string(), NetworkPool::new(&config, &[]));

        engine.handle(base_frame(1, MessageType::Discover));
        engine.handle(request_for(1, ip("192.168.200.100")));

        let handled = engine.handle(base_frame(2, MessageType::Discover));
        assert!(handled.reply.is_none());
        assert!(handled.events.is_empty());
    }

    #[test]
    fn test_stale_offers_swept() {
        let mut engine = test_engine();

        engine.handle(base_frame(0x42, MessageType::Discover));
        engine.offers.get_mut(&HwAddr(0x42)).unwrap().created =
            Engine::now() - OFFER_TTL_SECS - 1;

        // Any inbound traffic triggers the sweep.
        engine.handle(base_frame(0x43, MessageType::Discover));
        assert!(!engine.offers.contains_key(&HwAddr(0x42)));
        assert!(engine.offers.contains_key(&HwAddr(0x43)));
    }

    #[test]
    fn test_timers_only_on_request() {
        let mut engine = test_engine();

        let mut discover = base_frame(0x42, MessageType::Discover);
        discover
            .options
            .insert(DhcpOption::ParameterList(vec![1, 58, 59]));
        let handled = engine.handle(discover);
        let offer = decode_reply(&handled);
        assert_eq!(
            offer.options.get(OptionTag::RenewalTime),
            Some(&DhcpOption::RenewalTime(1800))
        );
        assert_eq!(
            offer.options.get(OptionTag::RebindingTime),
            Some(&DhcpOption::RebindingTime(3150))
        );

        let handled = engine.handle(base_frame(0x43, MessageType::Discover));
        let offer = decode_reply(&handled);
        assert!(!offer.options.contains(OptionTag::RenewalTime));
        assert!(!offer.options.contains(OptionTag::RebindingTime));
    }

    #[test]
    fn test_describe_parameter_list() {
        assert_eq!(describe_parameter_list(&[]), "[empty or unspecified]");
        assert_eq!(
            describe_parameter_list(&[1, 3, 200]),
            "1/SubnetMask, 3/Routers, 200"
        );
    }
}
