//! IPv4/TCP packet parsing and rewriting.
//!
//! The datapath embeds authentication tokens in a vendor TCP option
//! (kind 34). Inserting grows the option section, NOP-padded to a
//! 4-byte boundary, and recomputes the IP total length, TCP data
//! offset, and both checksums. Stripping overwrites the option with
//! NOPs in place so the segment length is preserved and downstream
//! middleboxes see a well-formed segment.

use std::net::Ipv4Addr;

use thiserror::Error;

/// Vendor-reserved TCP option kind carrying the authentication token.
pub const AUTH_OPTION_KIND: u8 = 34;

/// Wire version of the authentication option.
pub const AUTH_OPTION_VERSION: u8 = 1;

/// Maximum total length of the authentication option, header included.
///
/// Two bytes below the 40-byte TCP option budget so the section can
/// always be NOP-rounded to a 4-byte boundary.
pub const MAX_AUTH_OPTION_LEN: usize = 38;

/// Maximum token payload inside the option.
pub const MAX_TOKEN_LEN: usize = MAX_AUTH_OPTION_LEN - AUTH_OPTION_HEADER_LEN;

/// Fixed option header: kind, length, version, flags.
pub const AUTH_OPTION_HEADER_LEN: usize = 4;

/// Total TCP option budget of a segment.
const TCP_OPTIONS_BUDGET: usize = 40;

const TCP_NOP: u8 = 0x01;
const TCP_EOL: u8 = 0x00;

/// TCP flag bits.
pub mod flags {
    /// FIN.
    pub const FIN: u8 = 0x01;
    /// SYN.
    pub const SYN: u8 = 0x02;
    /// RST.
    pub const RST: u8 = 0x04;
    /// PSH.
    pub const PSH: u8 = 0x08;
    /// ACK.
    pub const ACK: u8 = 0x10;
    /// URG.
    pub const URG: u8 = 0x20;
}

/// Errors produced by packet parsing and rewriting.
#[derive(Debug, Error)]
pub enum PacketError {
    /// The buffer is shorter than its headers claim.
    #[error("truncated packet: {have} bytes, need {need}")]
    Truncated {
        /// Bytes available.
        have: usize,
        /// Bytes required.
        need: usize,
    },

    /// Not an IPv4 packet.
    #[error("not an IPv4 packet (version {version})")]
    NotIpv4 {
        /// Version nibble seen.
        version: u8,
    },

    /// Not a TCP segment.
    #[error("not a TCP segment (protocol {protocol})")]
    NotTcp {
        /// IP protocol number seen.
        protocol: u8,
    },

    /// A header field was structurally invalid.
    #[error("invalid header: {reason}")]
    InvalidHeader {
        /// What was wrong.
        reason: &'static str,
    },

    /// Adding the option would exceed the TCP option budget.
    ///
    /// The packet is left unmodified.
    #[error("option overflow: need {need} option bytes, budget {budget}")]
    OptionOverflow {
        /// Option bytes after the insertion.
        need: usize,
        /// The 40-byte budget.
        budget: usize,
    },
}

/// Flag bits of the authentication option.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AuthOptionFlags {
    /// The token carries a claims block.
    pub has_claims: bool,
    /// The option rides on a SYN/ACK segment.
    pub synack: bool,
}

impl AuthOptionFlags {
    const fn to_wire(self) -> u8 {
        (self.has_claims as u8) | ((self.synack as u8) << 1)
    }

    const fn from_wire(byte: u8) -> Self {
        Self {
            has_claims: byte & 0x01 != 0,
            synack: byte & 0x02 != 0,
        }
    }
}

/// The 4-tuple identifying a flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FourTuple {
    /// Source address.
    pub src_ip: Ipv4Addr,
    /// Source port.
    pub src_port: u16,
    /// Destination address.
    pub dst_ip: Ipv4Addr,
    /// Destination port.
    pub dst_port: u16,
}

impl FourTuple {
    /// The same flow seen from the opposite direction.
    #[must_use]
    pub const fn reversed(&self) -> Self {
        Self {
            src_ip: self.dst_ip,
            src_port: self.dst_port,
            dst_ip: self.src_ip,
            dst_port: self.src_port,
        }
    }
}

impl std::fmt::Display for FourTuple {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}:{}->{}:{}",
            self.src_ip, self.src_port, self.dst_ip, self.dst_port
        )
    }
}

/// An owned, parsed IPv4/TCP segment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TcpPacket {
    buf: Vec<u8>,
    ip_header_len: usize,
    tcp_header_len: usize,
}

impl TcpPacket {
    /// Parses a raw IPv4/TCP packet.
    ///
    /// # Errors
    ///
    /// Returns a [`PacketError`] for anything that is not a
    /// well-formed IPv4 TCP segment.
    pub fn parse(buf: Vec<u8>) -> Result<Self, PacketError> {
        if buf.len() < 20 {
            return Err(PacketError::Truncated {
                have: buf.len(),
                need: 20,
            });
        }

        let version = buf[0] >> 4;
        if version != 4 {
            return Err(PacketError::NotIpv4 { version });
        }

        let ip_header_len = usize::from(buf[0] & 0x0f) * 4;
        if ip_header_len < 20 {
            return Err(PacketError::InvalidHeader {
                reason: "IP header length below 20",
            });
        }

        let total_len = usize::from(u16::from_be_bytes([buf[2], buf[3]]));
        if total_len != buf.len() {
            return Err(PacketError::Truncated {
                have: buf.len(),
                need: total_len,
            });
        }

        let protocol = buf[9];
        if protocol != 6 {
            return Err(PacketError::NotTcp { protocol });
        }

        if buf.len() < ip_header_len + 20 {
            return Err(PacketError::Truncated {
                have: buf.len(),
                need: ip_header_len + 20,
            });
        }

        let tcp_header_len = usize::from(buf[ip_header_len + 12] >> 4) * 4;
        if tcp_header_len < 20 {
            return Err(PacketError::InvalidHeader {
                reason: "TCP data offset below 5",
            });
        }
        if buf.len() < ip_header_len + tcp_header_len {
            return Err(PacketError::Truncated {
                have: buf.len(),
                need: ip_header_len + tcp_header_len,
            });
        }

        Ok(Self {
            buf,
            ip_header_len,
            tcp_header_len,
        })
    }

    /// The raw packet bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    /// Consumes the packet, returning the raw bytes.
    #[must_use]
    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }

    /// Source address.
    #[must_use]
    pub fn src_ip(&self) -> Ipv4Addr {
        Ipv4Addr::new(self.buf[12], self.buf[13], self.buf[14], self.buf[15])
    }

    /// Destination address.
    #[must_use]
    pub fn dst_ip(&self) -> Ipv4Addr {
        Ipv4Addr::new(self.buf[16], self.buf[17], self.buf[18], self.buf[19])
    }

    /// Source port.
    #[must_use]
    pub fn src_port(&self) -> u16 {
        let o = self.ip_header_len;
        u16::from_be_bytes([self.buf[o], self.buf[o + 1]])
    }

    /// Destination port.
    #[must_use]
    pub fn dst_port(&self) -> u16 {
        let o = self.ip_header_len;
        u16::from_be_bytes([self.buf[o + 2], self.buf[o + 3]])
    }

    /// The flow 4-tuple in packet direction.
    #[must_use]
    pub fn four_tuple(&self) -> FourTuple {
        FourTuple {
            src_ip: self.src_ip(),
            src_port: self.src_port(),
            dst_ip: self.dst_ip(),
            dst_port: self.dst_port(),
        }
    }

    /// The TCP flags byte.
    #[must_use]
    pub fn tcp_flags(&self) -> u8 {
        self.buf[self.ip_header_len + 13]
    }

    /// Returns `true` for a SYN without ACK.
    #[must_use]
    pub fn is_syn(&self) -> bool {
        self.tcp_flags() & (flags::SYN | flags::ACK) == flags::SYN
    }

    /// Returns `true` for a SYN/ACK.
    #[must_use]
    pub fn is_syn_ack(&self) -> bool {
        self.tcp_flags() & (flags::SYN | flags::ACK) == flags::SYN | flags::ACK
    }

    /// Returns `true` for an ACK without SYN.
    #[must_use]
    pub fn is_ack(&self) -> bool {
        self.tcp_flags() & (flags::SYN | flags::ACK) == flags::ACK
    }

    /// Returns `true` if the RST flag is set.
    #[must_use]
    pub fn is_rst(&self) -> bool {
        self.tcp_flags() & flags::RST != 0
    }

    fn options_range(&self) -> std::ops::Range<usize> {
        let start = self.ip_header_len + 20;
        start..self.ip_header_len + self.tcp_header_len
    }

    /// Locates the authentication option, returning
    /// `(offset, total_len)` of the option within the buffer.
    fn find_auth_option(&self) -> Option<(usize, usize)> {
        let range = self.options_range();
        let options = &self.buf[range.clone()];
        let mut i = 0usize;

        while i < options.len() {
            match options[i] {
                TCP_EOL => return None,
                TCP_NOP => i += 1,
                kind => {
                    let len = usize::from(*options.get(i + 1)?);
                    if len < 2 || i + len > options.len() {
                        return None;
                    }
                    if kind == AUTH_OPTION_KIND {
                        return Some((range.start + i, len));
                    }
                    i += len;
                },
            }
        }

        None
    }

    /// Extracts the authentication token, if present.
    #[must_use]
    pub fn extract_token(&self) -> Option<(AuthOptionFlags, &[u8])> {
        let (offset, len) = self.find_auth_option()?;
        if len < AUTH_OPTION_HEADER_LEN {
            return None;
        }
        if self.buf[offset + 2] != AUTH_OPTION_VERSION {
            return None;
        }
        let opt_flags = AuthOptionFlags::from_wire(self.buf[offset + 3]);
        Some((opt_flags, &self.buf[offset + AUTH_OPTION_HEADER_LEN..offset + len]))
    }

    /// Inserts an authentication option carrying `token`.
    ///
    /// The option is appended after any existing options and the
    /// section is NOP-padded to a 4-byte boundary. IP total length,
    /// TCP data offset, and both checksums are recomputed.
    ///
    /// # Errors
    ///
    /// Returns [`PacketError::OptionOverflow`] without mutating the
    /// packet if the option section would exceed 40 bytes.
    pub fn insert_token(
        &mut self,
        token: &[u8],
        opt_flags: AuthOptionFlags,
    ) -> Result<(), PacketError> {
        let opt_len = AUTH_OPTION_HEADER_LEN + token.len();
        if opt_len > MAX_AUTH_OPTION_LEN {
            return Err(PacketError::OptionOverflow {
                need: opt_len,
                budget: MAX_AUTH_OPTION_LEN,
            });
        }

        let padded_len = (opt_len + 3) & !3;
        let existing = self.tcp_header_len - 20;
        if existing + padded_len > TCP_OPTIONS_BUDGET {
            return Err(PacketError::OptionOverflow {
                need: existing + padded_len,
                budget: TCP_OPTIONS_BUDGET,
            });
        }

        let mut option = Vec::with_capacity(padded_len);
        option.push(AUTH_OPTION_KIND);
        #[allow(clippy::cast_possible_truncation)]
        option.push(opt_len as u8);
        option.push(AUTH_OPTION_VERSION);
        option.push(opt_flags.to_wire());
        option.extend_from_slice(token);
        option.resize(padded_len, TCP_NOP);

        let insert_at = self.ip_header_len + self.tcp_header_len;
        self.buf.splice(insert_at..insert_at, option);

        self.tcp_header_len += padded_len;
        let data_offset_byte = self.ip_header_len + 12;
        #[allow(clippy::cast_possible_truncation)]
        let words = (self.tcp_header_len / 4) as u8;
        self.buf[data_offset_byte] = (words << 4) | (self.buf[data_offset_byte] & 0x0f);

        #[allow(clippy::cast_possible_truncation)]
        let total_len = self.buf.len() as u16;
        self.buf[2..4].copy_from_slice(&total_len.to_be_bytes());

        self.recompute_checksums();
        Ok(())
    }

    /// Overwrites the authentication option with NOPs in place.
    ///
    /// Length-preserving; only the TCP checksum changes. A packet
    /// without the option is returned unchanged.
    pub fn strip_token(&mut self) {
        if let Some((offset, len)) = self.find_auth_option() {
            for byte in &mut self.buf[offset..offset + len] {
                *byte = TCP_NOP;
            }
            self.set_tcp_checksum();
        }
    }

    /// Recomputes the IP header checksum and the TCP checksum.
    pub fn recompute_checksums(&mut self) {
        self.set_ip_checksum();
        self.set_tcp_checksum();
    }

    fn set_ip_checksum(&mut self) {
        self.buf[10] = 0;
        self.buf[11] = 0;
        let sum = internet_checksum(&[&self.buf[..self.ip_header_len]]);
        self.buf[10..12].copy_from_slice(&sum.to_be_bytes());
    }

    fn set_tcp_checksum(&mut self) {
        let tcp_start = self.ip_header_len;
        let tcp_len = self.buf.len() - tcp_start;

        self.buf[tcp_start + 16] = 0;
        self.buf[tcp_start + 17] = 0;

        #[allow(clippy::cast_possible_truncation)]
        let pseudo = [
            self.buf[12],
            self.buf[13],
            self.buf[14],
            self.buf[15],
            self.buf[16],
            self.buf[17],
            self.buf[18],
            self.buf[19],
            0,
            6,
            (tcp_len >> 8) as u8,
            (tcp_len & 0xff) as u8,
        ];
        let sum = internet_checksum(&[&pseudo, &self.buf[tcp_start..]]);
        self.buf[tcp_start + 16..tcp_start + 18].copy_from_slice(&sum.to_be_bytes());
    }

    /// Builds a minimal IPv4/TCP segment.
    ///
    /// Used to synthesize control segments (RSTs) and handshake
    /// packets in tests.
    #[must_use]
    pub fn build(tuple: FourTuple, tcp_flags: u8, seq: u32, ack: u32) -> Self {
        let mut buf = vec![0u8; 40];

        buf[0] = 0x45;
        buf[2..4].copy_from_slice(&40u16.to_be_bytes());
        buf[8] = 64;
        buf[9] = 6;
        buf[12..16].copy_from_slice(&tuple.src_ip.octets());
        buf[16..20].copy_from_slice(&tuple.dst_ip.octets());

        buf[20..22].copy_from_slice(&tuple.src_port.to_be_bytes());
        buf[22..24].copy_from_slice(&tuple.dst_port.to_be_bytes());
        buf[24..28].copy_from_slice(&seq.to_be_bytes());
        buf[28..32].copy_from_slice(&ack.to_be_bytes());
        buf[32] = 5 << 4;
        buf[33] = tcp_flags;
        buf[34..36].copy_from_slice(&8192u16.to_be_bytes());

        let mut packet = Self {
            buf,
            ip_header_len: 20,
            tcp_header_len: 20,
        };
        packet.recompute_checksums();
        packet
    }
}

/// Standard Internet checksum over the concatenation of `parts`.
fn internet_checksum(parts: &[&[u8]]) -> u16 {
    let mut sum = 0u32;
    let mut carry_byte: Option<u8> = None;

    for part in parts {
        for &byte in *part {
            match carry_byte.take() {
                Some(high) => sum += u32::from(u16::from_be_bytes([high, byte])),
                None => carry_byte = Some(byte),
            }
        }
    }
    if let Some(high) = carry_byte {
        sum += u32::from(u16::from_be_bytes([high, 0]));
    }

    while sum >> 16 != 0 {
        sum = (sum & 0xffff) + (sum >> 16);
    }

    !(sum as u16)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tuple() -> FourTuple {
        FourTuple {
            src_ip: Ipv4Addr::new(10, 0, 0, 1),
            src_port: 40000,
            dst_ip: Ipv4Addr::new(10, 0, 0, 2),
            dst_port: 80,
        }
    }

    fn verify_checksums(packet: &TcpPacket) {
        let buf = packet.as_bytes();
        let ip_len = usize::from(buf[0] & 0x0f) * 4;
        assert_eq!(internet_checksum(&[&buf[..ip_len]]), 0);

        let tcp_len = buf.len() - ip_len;
        #[allow(clippy::cast_possible_truncation)]
        let pseudo = [
            buf[12],
            buf[13],
            buf[14],
            buf[15],
            buf[16],
            buf[17],
            buf[18],
            buf[19],
            0,
            6,
            (tcp_len >> 8) as u8,
            (tcp_len & 0xff) as u8,
        ];
        assert_eq!(internet_checksum(&[&pseudo, &buf[ip_len..]]), 0);
    }

    #[test]
    fn test_build_and_parse() {
        let packet = TcpPacket::build(tuple(), flags::SYN, 1000, 0);
        let parsed = TcpPacket::parse(packet.as_bytes().to_vec()).unwrap();

        assert_eq!(parsed.four_tuple(), tuple());
        assert!(parsed.is_syn());
        assert!(!parsed.is_syn_ack());
        verify_checksums(&parsed);
    }

    #[test]
    fn test_insert_extract_round_trip() {
        let mut packet = TcpPacket::build(tuple(), flags::SYN, 1000, 0);
        let token = [0xABu8; 30];
        let opt_flags = AuthOptionFlags {
            has_claims: true,
            synack: false,
        };

        packet.insert_token(&token, opt_flags).unwrap();
        verify_checksums(&packet);

        // Survives a reparse of the raw bytes.
        let parsed = TcpPacket::parse(packet.as_bytes().to_vec()).unwrap();
        let (got_flags, got_token) = parsed.extract_token().unwrap();
        assert_eq!(got_flags, opt_flags);
        assert_eq!(got_token, token);
    }

    #[test]
    fn test_insert_strip_restores_shape() {
        let original = TcpPacket::build(tuple(), flags::SYN, 1000, 0);
        let mut packet = original.clone();

        packet.insert_token(&[0x42; 20], AuthOptionFlags::default()).unwrap();
        packet.strip_token();
        verify_checksums(&packet);

        assert!(packet.extract_token().is_none());
        // Header fields the local stack sees are unchanged.
        assert_eq!(packet.four_tuple(), original.four_tuple());
        assert_eq!(packet.tcp_flags(), original.tcp_flags());
    }

    #[test]
    fn test_oversized_token_rejected_unmutated() {
        let mut packet = TcpPacket::build(tuple(), flags::SYN, 1000, 0);
        let before = packet.clone();

        let result = packet.insert_token(&[0u8; MAX_TOKEN_LEN + 1], AuthOptionFlags::default());

        assert!(matches!(result, Err(PacketError::OptionOverflow { .. })));
        assert_eq!(packet, before);
    }

    #[test]
    fn test_option_budget_enforced() {
        let mut packet = TcpPacket::build(tuple(), flags::SYN, 1000, 0);
        packet.insert_token(&[0u8; 20], AuthOptionFlags::default()).unwrap();
        let before = packet.clone();

        // A second full-size option no longer fits in the 40-byte
        // section.
        let result = packet.insert_token(&[0u8; 20], AuthOptionFlags::default());

        assert!(matches!(result, Err(PacketError::OptionOverflow { .. })));
        assert_eq!(packet, before);
    }

    #[test]
    fn test_non_tcp_rejected() {
        let packet = TcpPacket::build(tuple(), flags::SYN, 0, 0);
        let mut buf = packet.into_bytes();
        buf[9] = 17; // UDP

        assert!(matches!(
            TcpPacket::parse(buf),
            Err(PacketError::NotTcp { protocol: 17 })
        ));
    }

    #[test]
    fn test_truncated_rejected() {
        let packet = TcpPacket::build(tuple(), flags::SYN, 0, 0);
        let buf = packet.into_bytes();

        assert!(matches!(
            TcpPacket::parse(buf[..30].to_vec()),
            Err(PacketError::Truncated { .. })
        ));
    }

    #[test]
    fn test_reversed_tuple() {
        let t = tuple();
        let r = t.reversed();

        assert_eq!(r.src_ip, t.dst_ip);
        assert_eq!(r.dst_port, t.src_port);
        assert_eq!(r.reversed(), t);
    }
}
