use anyhow::{Context, Result};
use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use std::io;
use std::net::{Ipv4Addr, SocketAddrV4};
use tracing::{debug, warn};

// IPPROTO_RAW: the kernel sends our IPv4 header as-is
const IPPROTO_RAW: i32 = 255;
const SEND_BUFFER_SIZE: usize = 4 * 1024 * 1024;

/// Sink for fully assembled IPv4 packets
pub trait RawTransport: Send + Sync {
    fn send(&self, bytes: &[u8]) -> io::Result<usize>;
}

/// Raw IPv4 socket with header inclusion, so spoofed source addresses
/// written by the assembler go out untouched.
pub struct RawConn {
    socket: Socket,
    destination: SockAddr,
}

impl RawConn {
    pub fn new(target: Ipv4Addr) -> Result<Self> {
        let socket = Socket::new(Domain::IPV4, Type::RAW, Some(Protocol::from(IPPROTO_RAW)))
            .context("Failed to create raw socket (CAP_NET_RAW is required)")?;

        socket
            .set_header_included_v4(true)
            .context("Failed to enable IP_HDRINCL on raw socket")?;

        if let Err(e) = socket.set_send_buffer_size(SEND_BUFFER_SIZE) {
            warn!("Failed to set send buffer for raw socket: {}", e);
        }

        debug!("Raw socket ready for {}", target);

        Ok(Self {
            socket,
            destination: SockAddr::from(SocketAddrV4::new(target, 0)),
        })
    }
}

impl RawTransport for RawConn {
    fn send(&self, bytes: &[u8]) -> io::Result<usize> {
        self.socket.send_to(bytes, &self.destination)
    }
}

/// Accepts every packet without sending it; measures the pipeline alone
#[derive(Debug, Default)]
pub struct DryRun;

impl RawTransport for DryRun {
    fn send(&self, bytes: &[u8]) -> io::Result<usize> {
        Ok(bytes.len())
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dry_run_accepts_everything() {
        let transport = DryRun;
        assert_eq!(transport.send(&[0u8; 64]).unwrap(), 64);
        assert_eq!(transport.send(&[]).unwrap(), 0);
    }

    #[test]
    fn test_capture_respects_limit() {
        let transport = testing::CaptureTransport::new(2);
        for i in 0..5u8 {
            transport.send(&[i]).unwrap();
        }

        assert_eq!(transport.sends(), 5);
        assert_eq!(transport.packets(), vec![vec![0], vec![1]]);
    }

    #[test]
    fn test_capture_cancels_on_nth_send() {
        let shutdown = crate::dispatch::Shutdown::new();
        let transport = testing::CaptureTransport::cancelling_after(3, shutdown.clone());

        transport.send(&[0]).unwrap();
        transport.send(&[1]).unwrap();
        assert!(!shutdown.is_cancelled());
        transport.send(&[2]).unwrap();
        assert!(shutdown.is_cancelled());
    }
}
