//! Wire-level allocation handshake: captured-style byte frames in,
//! decoded replies out, driven through the engine exactly as the socket
//! worker would.

use std::collections::HashMap;
use std::path::PathBuf;

use leased::config::InterfaceConfig;
use leased::engine::{Engine, Event, Handled};
use leased::options::OptionTag;
use leased::{BootpFrame, HwAddr, Ipv4, MessageType, NetworkPool};

const MAGIC_COOKIE: [u8; 4] = [0x63, 0x82, 0x53, 0x63];

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
        dns_servers: vec![ip("192.168.200.1")],
        lease_time: 3600,
        renewal_time: 1800,
        rebinding_time: 3150,
        lease_file: PathBuf::from("leases.bin"),
        reservations: HashMap::new(),
    }
}

fn test_engine() -> Engine {
    Engine::new("eth0".to_string(), NetworkPool::new(&test_config(), &[]))
}

/// A 300-byte DISCOVER as a client would put it on the wire:
/// `chaddr` AA:BB:CC:DD:EE:FF, parameter request list {1, 3, 6, 51, 54}.
fn discover_bytes() -> Vec<u8> {
    let mut data = vec![0u8; 300];

    data[0] = 1; // BOOTREQUEST
    data[1] = 1; // Ethernet
    data[2] = 6;
    data[4..8].copy_from_slice(&0xDEADBEEFu32.to_be_bytes());
    data[10..12].copy_from_slice(&0x8000u16.to_be_bytes());
    data[28..34].copy_from_slice(&[0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF]);
    data[236..240].copy_from_slice(&MAGIC_COOKIE);

    data[240..243].copy_from_slice(&[53, 1, 1]);
    data[243..250].copy_from_slice(&[55, 5, 1, 3, 6, 51, 54]);
    data[250] = 255;

    data
}

fn request_bytes(requested: Ipv4) -> Vec<u8> {
    let mut data = discover_bytes();
    data[242] = 3; // REQUEST
    // Insert option 50 where the End tag was.
    data[250] = 50;
    data[251] = 4;
    data[252..256].copy_from_slice(&requested.octets());
    data[256] = 255;
    data
}

fn drive(engine: &mut Engine, bytes: &[u8]) -> Handled {
    engine.handle(BootpFrame::decode(bytes).unwrap())
}

#[test]
fn discover_on_the_wire_yields_a_complete_offer() {
    let mut engine = test_engine();

    let handled = drive(&mut engine, &discover_bytes());

    let outbound = handled.reply.expect("DISCOVER should produce an offer");
    assert_eq!(outbound.target, ip("192.168.200.100"));
    assert!(outbound.data.len() >= 300);

    assert_eq!(
        handled.events,
        vec![Event::AddArpEntry {
            ip: ip("192.168.200.100"),
            hw: HwAddr(0xAABBCCDDEEFF),
        }]
    );

    let offer = BootpFrame::decode(&outbound.data).unwrap();
    assert_eq!(offer.op, 2);
    assert_eq!(offer.xid, 0xDEADBEEF);
    assert_eq!(offer.yiaddr, ip("192.168.200.100"));
    assert_eq!(offer.chaddr, HwAddr(0xAABBCCDDEEFF));
    assert_eq!(offer.message_type(), Some(MessageType::Offer));

    for tag in [
        OptionTag::SubnetMask,
        OptionTag::Router,
        OptionTag::DnsServers,
        OptionTag::LeaseTime,
        OptionTag::ServerId,
    ] {
        assert!(offer.options.contains(tag), "offer missing option {:?}", tag);
    }
}

#[test]
fn matching_request_completes_with_an_ack() {
    let mut engine = test_engine();

    drive(&mut engine, &discover_bytes());
    let handled = drive(&mut engine, &request_bytes(ip("192.168.200.100")));

    let outbound = handled.reply.expect("matching REQUEST should be answered");
    let ack = BootpFrame::decode(&outbound.data).unwrap();
    assert_eq!(ack.message_type(), Some(MessageType::Ack));
    assert_eq!(ack.yiaddr, ip("192.168.200.100"));
    assert!(handled.events.contains(&Event::LeasesChanged));

    let lease = engine.leases();
    assert_eq!(lease.len(), 1);
    assert_eq!(lease[0].ip, ip("192.168.200.100"));
    assert_eq!(lease[0].hw, HwAddr(0xAABBCCDDEEFF));
}

#[test]
fn mismatched_request_is_refused_and_nothing_is_leased() {
    let mut engine = test_engine();

    drive(&mut engine, &discover_bytes());
    let handled = drive(&mut engine, &request_bytes(ip("192.168.200.101")));

    let outbound = handled.reply.expect("mismatched REQUEST should be refused");
    let nak = BootpFrame::decode(&outbound.data).unwrap();
    assert_eq!(nak.message_type(), Some(MessageType::Nak));
    assert!(nak.yiaddr.is_unspecified());

    assert!(engine.leases().is_empty());
}
