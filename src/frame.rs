//! Bit-exact BOOTP frame serialization and deserialization.

use crate::addr::{HwAddr, Ipv4};
use crate::error::{Error, Result};
use crate::options::{DhcpOption, MessageType, OptionMap, OptionTag};

const MAGIC_COOKIE: [u8; 4] = [0x63, 0x82, 0x53, 0x63];

pub const BOOTREQUEST: u8 = 1;
pub const BOOTREPLY: u8 = 2;
pub const HTYPE_ETHERNET: u8 = 1;
pub const HLEN_ETHERNET: u8 = 6;

/// Smallest frame that can carry the fixed header, the cookie, and one
/// option byte.
pub const MIN_FRAME_LEN: usize = 241;

/// BOOTP legacy minimum size on the wire; shorter encodings are padded.
pub const MIN_WIRE_LEN: usize = 300;

/// A decoded BOOTP/DHCP frame.
///
/// `sname` and `file` are not retained: the server never populates them
/// and always writes them as zeros.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootpFrame {
    pub op: u8,
    pub htype: u8,
    pub hlen: u8,
    pub hops: u8,
    pub xid: u32,
    pub secs: u16,
    pub flags: u16,
    pub ciaddr: Ipv4,
    pub yiaddr: Ipv4,
    pub siaddr: Ipv4,
    pub giaddr: Ipv4,
    pub chaddr: HwAddr,
    pub options: OptionMap,
}

impl BootpFrame {
    /// Decodes a frame from a received datagram.
    ///
    /// Fails on anything shorter than [`MIN_FRAME_LEN`], a bad magic
    /// cookie, a TLV that overruns the buffer, or an option list that
    /// ends without the End tag. Unknown tags with a well-formed length
    /// are skipped.
    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() < MIN_FRAME_LEN {
            return Err(Error::Frame(format!(
                "frame too short: {} bytes (minimum {})",
                data.len(),
                MIN_FRAME_LEN
            )));
        }

        if data[236..240] != MAGIC_COOKIE {
            return Err(Error::Frame("bad magic cookie".to_string()));
        }

        let options = Self::decode_options(&data[240..])?;

        Ok(Self {
            op: data[0],
            htype: data[1],
            hlen: data[2],
            hops: data[3],
            xid: u32::from_be_bytes([data[4], data[5], data[6], data[7]]),
            secs: u16::from_be_bytes([data[8], data[9]]),
            flags: u16::from_be_bytes([data[10], data[11]]),
            ciaddr: Ipv4::from_octets([data[12], data[13], data[14], data[15]]),
            yiaddr: Ipv4::from_octets([data[16], data[17], data[18], data[19]]),
            siaddr: Ipv4::from_octets([data[20], data[21], data[22], data[23]]),
            giaddr: Ipv4::from_octets([data[24], data[25], data[26], data[27]]),
            chaddr: HwAddr::from_bytes(&data[28..34]),
            options,
        })
    }

    fn decode_options(data: &[u8]) -> Result<OptionMap> {
        let mut options = OptionMap::new();
        let mut index = 0;

        loop {
            if index >= data.len() {
                return Err(Error::Frame("option list not terminated".to_string()));
            }

            let tag = data[index];

            if tag == OptionTag::Pad as u8 {
                index += 1;
                continue;
            }

            if tag == OptionTag::End as u8 {
                return Ok(options);
            }

            if index + 1 >= data.len() {
                return Err(Error::Frame("option length missing".to_string()));
            }

            let length = data[index + 1] as usize;
            if index + 2 + length > data.len() {
                return Err(Error::Frame("option data truncated".to_string()));
            }

            if let Some(option) = DhcpOption::parse(tag, &data[index + 2..index + 2 + length])? {
                options.insert(option);
            }

            index += 2 + length;
        }
    }

    /// Encodes the frame for transmission.
    ///
    /// Message Type and Server Identifier are written first, the rest of
    /// the options follow in tag order, and the result is zero-padded to
    /// [`MIN_WIRE_LEN`]. Fails if either required option is absent; that
    /// is a server bug, not a client error.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let message_type = self
            .options
            .get(OptionTag::MessageType)
            .ok_or_else(|| Error::Encode("Message Type option is missing".to_string()))?;
        let server_id = self
            .options
            .get(OptionTag::ServerId)
            .ok_or_else(|| Error::Encode("Server Identifier option is missing".to_string()))?;

        let mut data = Vec::with_capacity(MIN_WIRE_LEN);

        data.push(self.op);
        data.push(self.htype);
        data.push(self.hlen);
        data.push(self.hops);

        data.extend_from_slice(&self.xid.to_be_bytes());
        data.extend_from_slice(&self.secs.to_be_bytes());
        data.extend_from_slice(&self.flags.to_be_bytes());

        data.extend_from_slice(&self.ciaddr.octets());
        data.extend_from_slice(&self.yiaddr.octets());
        data.extend_from_slice(&self.siaddr.octets());
        data.extend_from_slice(&self.giaddr.octets());

        // chaddr: the 6 hardware bytes followed by 10 bytes of padding.
        data.extend_from_slice(&self.chaddr.octets());
        data.extend_from_slice(&[0u8; 10]);

        // sname and file, unused.
        data.extend_from_slice(&[0u8; 64]);
        data.extend_from_slice(&[0u8; 128]);

        data.extend_from_slice(&MAGIC_COOKIE);

        data.extend_from_slice(&message_type.encode());
        data.extend_from_slice(&server_id.encode());

        for option in self.options.iter() {
            let tag = option.tag();
            if tag == OptionTag::MessageType as u8 || tag == OptionTag::ServerId as u8 {
                continue;
            }
            data.extend_from_slice(&option.encode());
        }

        data.push(OptionTag::End as u8);

        while data.len() < MIN_WIRE_LEN {
            data.push(0);
        }

        Ok(data)
    }

    pub fn message_type(&self) -> Option<MessageType> {
        match self.options.get(OptionTag::MessageType) {
            Some(DhcpOption::MessageType(message_type)) => Some(*message_type),
            _ => None,
        }
    }

    /// Requested IP (option 50), or the unspecified address when absent.
    pub fn requested_ip(&self) -> Ipv4 {
        match self.options.get(OptionTag::RequestedIp) {
            Some(DhcpOption::RequestedIp(ip)) => *ip,
            _ => Ipv4::UNSPECIFIED,
        }
    }

    /// Parameter Request List tag bytes, empty when absent.
    pub fn parameter_list(&self) -> &[u8] {
        match self.options.get(OptionTag::ParameterList) {
            Some(DhcpOption::ParameterList(params)) => params,
            _ => &[],
        }
    }
}
