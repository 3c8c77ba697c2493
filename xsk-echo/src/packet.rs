//! # In-place ICMP echo transform
//!
//! Rewrites an ICMP echo request into the matching echo reply inside the UMEM
//! frame it arrived in, so the same frame can go straight back out on the TX
//! ring without a copy. Header validation uses `etherparse` slices; the
//! mutation itself works on fixed offsets because only a handful of bytes
//! change.
//!
//! Packets that are not well-formed ICMPv4 echo requests are left untouched
//! and reported as such; the caller drops them.

use etherparse::{EtherType, Ethernet2HeaderSlice, IpNumber, Ipv4HeaderSlice};

const ETH_HDR_LEN: usize = 14;
const ICMP_HDR_LEN: usize = 8;
const ICMP_ECHO_REQUEST: u8 = 8;
const ICMP_ECHO_REPLY: u8 = 0;

/// Turns an echo request into an echo reply in place.
///
/// Swaps the Ethernet source/destination, swaps the IPv4 source/destination,
/// flips the ICMP type and recomputes both checksums. The ICMP checksum
/// covers the whole ICMP message, header and payload.
///
/// Returns `false` without modifying the frame when the packet is not an
/// IPv4 ICMP echo request of plausible length.
pub fn icmp_echo_reply(frame: &mut [u8]) -> bool {
    let Ok(eth) = Ethernet2HeaderSlice::from_slice(frame) else {
        return false;
    };
    if eth.ether_type() != EtherType::IPV4 {
        return false;
    }
    let Ok(ip) = Ipv4HeaderSlice::from_slice(&frame[ETH_HDR_LEN..]) else {
        return false;
    };
    if ip.protocol() != IpNumber::ICMP {
        return false;
    }
    let ihl = ip.ihl() as usize * 4;
    let total_len = ip.total_len() as usize;
    if total_len < ihl + ICMP_HDR_LEN || ETH_HDR_LEN + total_len > frame.len() {
        return false;
    }
    let icmp_off = ETH_HDR_LEN + ihl;
    let icmp_len = total_len - ihl;
    if frame[icmp_off] != ICMP_ECHO_REQUEST {
        return false;
    }

    for i in 0..6 {
        frame.swap(i, i + 6);
    }
    for i in 0..4 {
        frame.swap(ETH_HDR_LEN + 12 + i, ETH_HDR_LEN + 16 + i);
    }
    frame[icmp_off] = ICMP_ECHO_REPLY;

    frame[ETH_HDR_LEN + 10] = 0;
    frame[ETH_HDR_LEN + 11] = 0;
    let ip_sum = checksum(&frame[ETH_HDR_LEN..ETH_HDR_LEN + ihl]);
    frame[ETH_HDR_LEN + 10..ETH_HDR_LEN + 12].copy_from_slice(&ip_sum.to_be_bytes());

    frame[icmp_off + 2] = 0;
    frame[icmp_off + 3] = 0;
    let icmp_sum = checksum(&frame[icmp_off..icmp_off + icmp_len]);
    frame[icmp_off + 2..icmp_off + 4].copy_from_slice(&icmp_sum.to_be_bytes());

    true
}

/// Internet checksum (RFC 1071): ones'-complement sum of big-endian 16-bit
/// words, odd trailing byte zero-padded, complemented.
pub fn checksum(data: &[u8]) -> u16 {
    let mut sum = 0u32;
    let mut chunks = data.chunks_exact(2);
    for pair in &mut chunks {
        sum += u32::from(u16::from_be_bytes([pair[0], pair[1]]));
    }
    if let [last] = chunks.remainder() {
        sum += u32::from(u16::from_be_bytes([*last, 0]));
    }
    while sum > 0xffff {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    !(sum as u16)
}

#[cfg(test)]
pub(crate) mod testing {
    use etherparse::PacketBuilder;

    pub(crate) const SRC_MAC: [u8; 6] = [0x02, 0x00, 0x00, 0x00, 0x00, 0x01];
    pub(crate) const DST_MAC: [u8; 6] = [0x02, 0x00, 0x00, 0x00, 0x00, 0x02];
    pub(crate) const SRC_IP: [u8; 4] = [10, 0, 0, 1];
    pub(crate) const DST_IP: [u8; 4] = [10, 0, 0, 2];

    /// Builds a well-formed ICMPv4 echo request frame for tests.
    pub(crate) fn echo_request(payload: &[u8]) -> Vec<u8> {
        let builder = PacketBuilder::ethernet2(SRC_MAC, DST_MAC)
            .ipv4(SRC_IP, DST_IP, 64)
            .icmpv4_echo_request(0x1234, 7);
        let mut packet = Vec::with_capacity(builder.size(payload.len()));
        builder.write(&mut packet, payload).unwrap();
        packet
    }
}

#[cfg(test)]
mod tests {
    use super::testing::{DST_IP, DST_MAC, SRC_IP, SRC_MAC, echo_request};
    use super::*;
    use etherparse::PacketBuilder;

    #[test]
    fn echo_request_becomes_validated_reply() {
        let mut frame = echo_request(b"ping payload");
        assert!(icmp_echo_reply(&mut frame));

        // Addressing fields (A, B) came back as (B, A).
        assert_eq!(&frame[0..6], &SRC_MAC);
        assert_eq!(&frame[6..12], &DST_MAC);
        assert_eq!(&frame[26..30], &DST_IP);
        assert_eq!(&frame[30..34], &SRC_IP);

        let icmp_off = 14 + 20;
        assert_eq!(frame[icmp_off], ICMP_ECHO_REPLY);

        // A checksummed region sums to zero when it includes its own
        // checksum field.
        assert_eq!(checksum(&frame[14..34]), 0);
        assert_eq!(checksum(&frame[icmp_off..]), 0);

        // Identifier, sequence and payload are untouched.
        assert_eq!(&frame[icmp_off + 4..icmp_off + 6], &0x1234u16.to_be_bytes());
        assert_eq!(&frame[icmp_off + 8..], b"ping payload");
    }

    #[test]
    fn reply_parses_back_as_icmp() {
        let mut frame = echo_request(b"x");
        assert!(icmp_echo_reply(&mut frame));
        let ip = Ipv4HeaderSlice::from_slice(&frame[14..]).unwrap();
        assert_eq!(ip.protocol(), IpNumber::ICMP);
        assert_eq!(ip.source(), DST_IP);
        assert_eq!(ip.destination(), SRC_IP);
    }

    #[test]
    fn non_icmp_packet_is_left_alone() {
        let builder = PacketBuilder::ethernet2(SRC_MAC, DST_MAC)
            .ipv4(SRC_IP, DST_IP, 64)
            .udp(1234, 5678);
        let mut packet = Vec::new();
        builder.write(&mut packet, b"not a ping").unwrap();
        let before = packet.clone();
        assert!(!icmp_echo_reply(&mut packet));
        assert_eq!(packet, before);
    }

    #[test]
    fn echo_reply_in_is_not_transformed_again() {
        let mut frame = echo_request(b"abc");
        assert!(icmp_echo_reply(&mut frame));
        let reply = frame.clone();
        assert!(!icmp_echo_reply(&mut frame));
        assert_eq!(frame, reply);
    }

    #[test]
    fn truncated_frames_are_rejected() {
        let frame = echo_request(b"payload");
        for cut in [0, 10, 14, 20, 33] {
            let mut short = frame[..cut.min(frame.len())].to_vec();
            assert!(!icmp_echo_reply(&mut short));
        }
    }

    #[test]
    fn checksum_matches_rfc1071_example() {
        // 0x0001 + 0xf203 + 0xf4f5 + 0xf6f7 = 0x2ddf0 -> fold 0xddf2
        let data = [0x00, 0x01, 0xf2, 0x03, 0xf4, 0xf5, 0xf6, 0xf7];
        assert_eq!(checksum(&data), !0xddf2);
    }

    #[test]
    fn checksum_pads_odd_length() {
        assert_eq!(checksum(&[0xff]), !0xff00);
    }
}
