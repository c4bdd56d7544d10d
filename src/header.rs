use pnet::packet::ip::IpNextHeaderProtocol;
use pnet::packet::ipv4::{self, Ipv4Flags, MutableIpv4Packet};
use pnet::packet::udp::MutableUdpPacket;
use std::net::Ipv4Addr;

pub const IPV4_HEADER_LEN: usize = 20;
pub const UDP_HEADER_LEN: usize = 8;

const DEFAULT_TTL: u8 = 64;

/// Reusable IPv4 header. Addresses and lengths are stamped in place and the
/// checksum is recomputed on every change.
#[derive(Debug, Clone)]
pub struct Ipv4Header {
    buf: [u8; IPV4_HEADER_LEN],
}

impl Ipv4Header {
    pub fn new(protocol: IpNextHeaderProtocol) -> Self {
        let mut header = Self {
            buf: [0u8; IPV4_HEADER_LEN],
        };

        {
            let mut ip = header.view();
            ip.set_version(4);
            ip.set_header_length((IPV4_HEADER_LEN / 4) as u8);
            ip.set_total_length(IPV4_HEADER_LEN as u16);
            ip.set_flags(Ipv4Flags::DontFragment);
            ip.set_ttl(DEFAULT_TTL);
            ip.set_next_level_protocol(protocol);
        }
        header.update_checksum();
        header
    }

    pub fn set_addresses(&mut self, source: Ipv4Addr, destination: Ipv4Addr) {
        {
            let mut ip = self.view();
            ip.set_source(source);
            ip.set_destination(destination);
        }
        self.update_checksum();
    }

    /// Total length covers the IPv4 header plus everything after it
    pub fn set_payload_length(&mut self, payload_len: u16) {
        self.view()
            .set_total_length(IPV4_HEADER_LEN as u16 + payload_len);
        self.update_checksum();
    }

    pub fn marshal(&self) -> &[u8; IPV4_HEADER_LEN] {
        &self.buf
    }

    fn update_checksum(&mut self) {
        let mut ip = self.view();
        let checksum = ipv4::checksum(&ip.to_immutable());
        ip.set_checksum(checksum);
    }

    fn view(&mut self) -> MutableIpv4Packet<'_> {
        MutableIpv4Packet::new(&mut self.buf).expect("buffer holds a full IPv4 header")
    }
}

/// Reusable UDP header. The checksum is left at zero, which IPv4 permits.
#[derive(Debug, Clone)]
pub struct UdpHeader {
    buf: [u8; UDP_HEADER_LEN],
}

impl UdpHeader {
    pub fn new(source_port: u16, destination_port: u16) -> Self {
        let mut header = Self {
            buf: [0u8; UDP_HEADER_LEN],
        };

        {
            let mut udp = header.view();
            udp.set_source(source_port);
            udp.set_destination(destination_port);
            udp.set_length(UDP_HEADER_LEN as u16);
            udp.set_checksum(0);
        }
        header
    }

    /// UDP length is the header plus `payload_len` bytes of payload
    pub fn set_length(&mut self, payload_len: u16) {
        self.view().set_length(UDP_HEADER_LEN as u16 + payload_len);
    }

    pub fn marshal(&self) -> &[u8; UDP_HEADER_LEN] {
        &self.buf
    }

    fn view(&mut self) -> MutableUdpPacket<'_> {
        MutableUdpPacket::new(&mut self.buf).expect("buffer holds a full UDP header")
    }
}
