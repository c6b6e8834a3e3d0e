use std::io;
use std::net::SocketAddr;

use tokio::net::UdpSocket;

use burrow_types::protocol::types::HEADER_MASK_TC;

/// The port DNS servers listen on.
pub const DNS_PORT: u16 = 53;

/// The largest response datagram this server will send.  Anything
/// bigger is cut off at this size with the TC flag set; there is no
/// TCP fallback.
pub const MAX_UDP_PAYLOAD: usize = 512;

/// Write a serialised message to a connected UDP socket, setting or
/// clearing the TC flag as appropriate.
pub async fn send_udp_bytes(sock: &UdpSocket, bytes: &mut [u8]) -> Result<(), io::Error> {
    if bytes.len() > MAX_UDP_PAYLOAD {
        bytes[2] |= HEADER_MASK_TC;
        sock.send(&bytes[..MAX_UDP_PAYLOAD]).await?;
    } else {
        bytes[2] &= !HEADER_MASK_TC;
        sock.send(bytes).await?;
    }

    Ok(())
}

/// Like `send_udp_bytes` but sends to the given address.
pub async fn send_udp_bytes_to(
    sock: &UdpSocket,
    target: SocketAddr,
    bytes: &mut [u8],
) -> Result<(), io::Error> {
    if bytes.len() > MAX_UDP_PAYLOAD {
        bytes[2] |= HEADER_MASK_TC;
        sock.send_to(&bytes[..MAX_UDP_PAYLOAD], target).await?;
    } else {
        bytes[2] &= !HEADER_MASK_TC;
        sock.send_to(bytes, target).await?;
    }

    Ok(())
}
