use anyhow::{Result, ensure};
use pnet::packet::ip::IpNextHeaderProtocols;
use std::net::Ipv4Addr;
use tracing::debug;

use crate::header::{IPV4_HEADER_LEN, Ipv4Header, UDP_HEADER_LEN, UdpHeader};
use crate::packet::{Category, MTU, Packet};
use crate::samples::SampleCatalog;

/// Largest sample that still fits one MTU-sized frame
pub const MAX_SAMPLE_LEN: usize = MTU - IPV4_HEADER_LEN - UDP_HEADER_LEN;

/// Frames catalog samples for every simulated source
pub struct PacketAssembler<'a> {
    catalog: &'a SampleCatalog,
    sources: &'a [Ipv4Addr],
    target: Ipv4Addr,
    source_port: u16,
    target_port: u16,
}

impl<'a> PacketAssembler<'a> {
    pub fn new(
        catalog: &'a SampleCatalog,
        sources: &'a [Ipv4Addr],
        target: Ipv4Addr,
        source_port: u16,
        target_port: u16,
    ) -> Self {
        Self {
            catalog,
            sources,
            target,
            source_port,
            target_port,
        }
    }

    /// One packet per (sample, source) pair: every source for the first
    /// sample, then every source for the next one.
    pub fn assemble(&self, category: Category) -> Result<Vec<Packet>> {
        let samples = self.catalog.samples(category);
        ensure!(!self.sources.is_empty(), "no simulated sources configured");
        ensure!(!samples.is_empty(), "no {} samples in catalog", category);

        for (index, sample) in samples.iter().enumerate() {
            ensure!(
                sample.len() <= MAX_SAMPLE_LEN,
                "{} sample #{} is {} bytes, frames hold at most {}",
                category,
                index,
                sample.len(),
                MAX_SAMPLE_LEN
            );
        }

        let mut ip = Ipv4Header::new(IpNextHeaderProtocols::Udp);
        let mut udp = UdpHeader::new(self.source_port, self.target_port);
        let mut packets = Vec::with_capacity(samples.len() * self.sources.len());

        for sample in samples {
            // bounded by MAX_SAMPLE_LEN above
            let sample_len = sample.len() as u16;
            udp.set_length(sample_len);
            ip.set_payload_length(UDP_HEADER_LEN as u16 + sample_len);

            for &source in self.sources {
                ip.set_addresses(source, self.target);

                let mut payload = vec![0u8; MTU];
                let udp_start = IPV4_HEADER_LEN;
                let data_start = udp_start + UDP_HEADER_LEN;
                let length = data_start + sample.len();

                payload[..udp_start].copy_from_slice(ip.marshal());
                payload[udp_start..data_start].copy_from_slice(udp.marshal());
                payload[data_start..length].copy_from_slice(sample);

                packets.push(Packet::new(payload, length, category, source));
            }
        }

        debug!(
            "Assembled {} {} packets ({} samples x {} sources)",
            packets.len(),
            category,
            samples.len(),
            self.sources.len()
        );

        Ok(packets)
    }
}
