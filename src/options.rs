//! DHCP option model: tags, message types, and the tagged payload variant.

use std::collections::BTreeMap;
use std::fmt;

use crate::addr::Ipv4;
use crate::error::{Error, Result};

/// Option tags recognized by the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OptionTag {
    Pad = 0,
    SubnetMask = 1,
    Router = 3,
    DnsServers = 6,
    Broadcast = 28,
    RequestedIp = 50,
    LeaseTime = 51,
    MessageType = 53,
    ServerId = 54,
    ParameterList = 55,
    RenewalTime = 58,
    RebindingTime = 59,
    End = 255,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    Discover = 1,
    Offer = 2,
    Request = 3,
    Decline = 4,
    Ack = 5,
    Nak = 6,
    Release = 7,
}

impl TryFrom<u8> for MessageType {
    type Error = u8;

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::Discover),
            2 => Ok(Self::Offer),
            3 => Ok(Self::Request),
            4 => Ok(Self::Decline),
            5 => Ok(Self::Ack),
            6 => Ok(Self::Nak),
            7 => Ok(Self::Release),
            other => Err(other),
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Discover => write!(f, "DISCOVER"),
            Self::Offer => write!(f, "OFFER"),
            Self::Request => write!(f, "REQUEST"),
            Self::Decline => write!(f, "DECLINE"),
            Self::Ack => write!(f, "ACK"),
            Self::Nak => write!(f, "NAK"),
            Self::Release => write!(f, "RELEASE"),
        }
    }
}

/// A decoded option payload.
///
/// One variant per recognized tag; the payload shape is fixed by the tag.
/// Unknown tags never reach this type, the TLV walk skips them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DhcpOption {
    SubnetMask(Ipv4),
    Router(Ipv4),
    DnsServers(Vec<Ipv4>),
    Broadcast(Ipv4),
    RequestedIp(Ipv4),
    LeaseTime(u32),
    MessageType(MessageType),
    ServerId(Ipv4),
    /// Requested tag bytes, order and duplicates preserved.
    ParameterList(Vec<u8>),
    RenewalTime(u32),
    RebindingTime(u32),
}

fn single_ip(tag: &str, data: &[u8]) -> Result<Ipv4> {
    if data.len() != 4 {
        return Err(Error::Frame(format!(
            "{} option must carry exactly one IPv4 address, got {} bytes",
            tag,
            data.len()
        )));
    }
    Ok(Ipv4::from_octets([data[0], data[1], data[2], data[3]]))
}

fn ip_list(tag: &str, data: &[u8]) -> Result<Vec<Ipv4>> {
    if data.is_empty() || data.len() % 4 != 0 {
        return Err(Error::Frame(format!(
            "{} option length {} is not a multiple of 4",
            tag,
            data.len()
        )));
    }
    Ok(data
        .chunks_exact(4)
        .map(|chunk| Ipv4::from_octets([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect())
}

fn seconds(tag: &str, data: &[u8]) -> Result<u32> {
    if data.len() != 4 {
        return Err(Error::Frame(format!(
            "{} option must be 4 bytes, got {}",
            tag,
            data.len()
        )));
    }
    Ok(u32::from_be_bytes([data[0], data[1], data[2], data[3]]))
}

impl DhcpOption {
    /// Parses the payload of a known tag.
    ///
    /// `Ok(None)` means the option is well-formed but carries nothing we
    /// track (an unknown tag, or a Message Type value outside the DHCP
    /// enumeration) and should be skipped. Length violations of known
    /// tags fail the whole decode.
    pub fn parse(tag: u8, data: &[u8]) -> Result<Option<Self>> {
        let option = match tag {
            t if t == OptionTag::SubnetMask as u8 => {
                Self::SubnetMask(single_ip("Subnet Mask", data)?)
            }
            t if t == OptionTag::Router as u8 => Self::Router(single_ip("Router", data)?),
            t if t == OptionTag::DnsServers as u8 => Self::DnsServers(ip_list("DNS", data)?),
            t if t == OptionTag::Broadcast as u8 => Self::Broadcast(single_ip("Broadcast", data)?),
            t if t == OptionTag::RequestedIp as u8 => {
                Self::RequestedIp(single_ip("Requested IP", data)?)
            }
            t if t == OptionTag::LeaseTime as u8 => Self::LeaseTime(seconds("Lease Time", data)?),
            t if t == OptionTag::MessageType as u8 => {
                if data.len() != 1 {
                    return Err(Error::Frame(format!(
                        "Message Type option must be 1 byte, got {}",
                        data.len()
                    )));
                }
                match MessageType::try_from(data[0]) {
                    Ok(message_type) => Self::MessageType(message_type),
                    // Not a message we speak; the frame surfaces with no
                    // type and dispatch drops it.
                    Err(_) => return Ok(None),
                }
            }
            t if t == OptionTag::ServerId as u8 => {
                Self::ServerId(single_ip("Server Identifier", data)?)
            }
            t if t == OptionTag::ParameterList as u8 => Self::ParameterList(data.to_vec()),
            t if t == OptionTag::RenewalTime as u8 => {
                Self::RenewalTime(seconds("Renewal Time", data)?)
            }
            t if t == OptionTag::RebindingTime as u8 => {
                Self::RebindingTime(seconds("Rebinding Time", data)?)
            }
            _ => return Ok(None),
        };
        Ok(Some(option))
    }

    pub fn tag(&self) -> u8 {
        match self {
            Self::SubnetMask(_) => OptionTag::SubnetMask as u8,
            Self::Router(_) => OptionTag::Router as u8,
            Self::DnsServers(_) => OptionTag::DnsServers as u8,
            Self::Broadcast(_) => OptionTag::Broadcast as u8,
            Self::RequestedIp(_) => OptionTag::RequestedIp as u8,
            Self::LeaseTime(_) => OptionTag::LeaseTime as u8,
            Self::MessageType(_) => OptionTag::MessageType as u8,
            Self::ServerId(_) => OptionTag::ServerId as u8,
            Self::ParameterList(_) => OptionTag::ParameterList as u8,
            Self::RenewalTime(_) => OptionTag::RenewalTime as u8,
            Self::RebindingTime(_) => OptionTag::RebindingTime as u8,
        }
    }

    /// Encodes the full TLV: tag byte, length byte, payload.
    pub fn encode(&self) -> Vec<u8> {
        match self {
            Self::SubnetMask(addr)
            | Self::Router(addr)
            | Self::Broadcast(addr)
            | Self::RequestedIp(addr)
            | Self::ServerId(addr) => {
                let mut result = vec![self.tag(), 4];
                result.extend_from_slice(&addr.octets());
                result
            }
            Self::DnsServers(addrs) => {
                let mut result = vec![self.tag(), (addrs.len() * 4) as u8];
                for addr in addrs {
                    result.extend_from_slice(&addr.octets());
                }
                result
            }
            Self::LeaseTime(value) | Self::RenewalTime(value) | Self::RebindingTime(value) => {
                let mut result = vec![self.tag(), 4];
                result.extend_from_slice(&value.to_be_bytes());
                result
            }
            Self::MessageType(message_type) => {
                vec![self.tag(), 1, *message_type as u8]
            }
            Self::ParameterList(params) => {
                let mut result = vec![self.tag(), params.len() as u8];
                result.extend_from_slice(params);
                result
            }
        }
    }
}

/// The option set of one frame: at most one entry per tag, iterated in
/// ascending tag order so encoding is stable.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OptionMap(BTreeMap<u8, DhcpOption>);

impl OptionMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts an option, replacing any previous entry with the same tag.
    pub fn insert(&mut self, option: DhcpOption) {
        self.0.insert(option.tag(), option);
    }

    pub fn get(&self, tag: OptionTag) -> Option<&DhcpOption> {
        self.0.get(&(tag as u8))
    }

    pub fn contains(&self, tag: OptionTag) -> bool {
        self.0.contains_key(&(tag as u8))
    }

    pub fn clear(&mut self) {
        self.0.clear();
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &DhcpOption> {
        self.0.values()
    }
}
