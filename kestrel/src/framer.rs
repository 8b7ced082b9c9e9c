// Copyright (c) 2023 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Affero General Public License that can be found
// in the LICENSE file.

//! Cuts a raw byte stream into complete control packets.

use bytes::BytesMut;
use codec::{ControlPacket, MAX_PACKET_LEN};

/// One framed unit from the byte stream.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    /// A complete, well formed control packet.
    Packet(ControlPacket),

    /// A packet that could not be decoded; carries the offending bytes.
    ///
    /// Receiving this is a protocol violation and the connection is closed
    /// with a DISCONNECT carrying reason code 0x81.
    Malformed(Vec<u8>),
}

/// Incremental packet framer.
///
/// Bytes are fed in as they arrive from the transport; complete packets come
/// out. Bytes of a partially received packet are retained across calls and
/// never dropped.
pub struct Framer {
    buf: BytesMut,
    max_packet_size: usize,
}

impl Framer {
    /// Create a framer which treats packets larger than `max_packet_size`
    /// bytes as malformed.
    #[must_use]
    pub fn new(max_packet_size: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(4096),
            max_packet_size: max_packet_size.min(MAX_PACKET_LEN),
        }
    }

    /// Append bytes read from the transport.
    pub fn feed(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Number of buffered, not yet framed bytes.
    #[must_use]
    pub fn pending_bytes(&self) -> usize {
        self.buf.len()
    }

    /// Take the next complete frame out of the buffer, or `None` when more
    /// bytes are needed.
    pub fn next_frame(&mut self) -> Option<Frame> {
        if self.buf.len() < 2 {
            return None;
        }

        // Decode the remaining-length var int which follows the first byte.
        let mut remaining_length: usize = 0;
        let mut multiplier: usize = 1;
        let mut len_bytes = 0;
        loop {
            let Some(byte) = self.buf.get(1 + len_bytes).copied() else {
                // Length field itself is still incomplete.
                return None;
            };
            len_bytes += 1;
            remaining_length += ((byte & 0x7f) as usize) * multiplier;
            if byte & 0x80 == 0 {
                break;
            }
            if len_bytes == 4 {
                log::error!("framer: var int continuation bit set after 4 bytes");
                return Some(self.take_malformed(self.buf.len()));
            }
            multiplier *= 128;
        }

        let total = 1 + len_bytes + remaining_length;
        if total > self.max_packet_size {
            log::error!(
                "framer: packet of {total} bytes exceeds maximum packet size {}",
                self.max_packet_size
            );
            return Some(self.take_malformed(self.buf.len().min(total)));
        }
        if self.buf.len() < total {
            return None;
        }

        let packet_bytes = self.buf.split_to(total);
        match ControlPacket::decode(&packet_bytes) {
            Ok(packet) => Some(Frame::Packet(packet)),
            Err(err) => {
                log::error!("framer: failed to decode packet: {err:?}");
                Some(Frame::Malformed(packet_bytes.to_vec()))
            }
        }
    }

    fn take_malformed(&mut self, len: usize) -> Frame {
        let bytes = self.buf.split_to(len);
        Frame::Malformed(bytes.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use codec::{EncodePacket, PacketId, PingResponsePacket, PublishAckPacket, PublishPacket, QoS};

    #[test]
    fn test_framer_partial_packet() {
        let mut publish = PublishPacket::new("a/b", QoS::AtLeastOnce, b"payload").unwrap();
        publish.set_packet_id(PacketId::new(4));
        let mut bytes = Vec::new();
        publish.encode(&mut bytes).unwrap();

        let mut framer = Framer::new(1024);
        framer.feed(&bytes[..3]);
        assert!(framer.next_frame().is_none());
        assert_eq!(framer.pending_bytes(), 3);

        framer.feed(&bytes[3..]);
        let frame = framer.next_frame().unwrap();
        assert_eq!(frame, Frame::Packet(codec::ControlPacket::Publish(publish)));
        assert_eq!(framer.pending_bytes(), 0);
    }

    #[test]
    fn test_framer_multiple_packets_in_one_read() {
        let mut bytes = Vec::new();
        PublishAckPacket::new(PacketId::new(1))
            .encode(&mut bytes)
            .unwrap();
        PingResponsePacket::new().encode(&mut bytes).unwrap();

        let mut framer = Framer::new(1024);
        framer.feed(&bytes);
        assert!(matches!(framer.next_frame(), Some(Frame::Packet(_))));
        assert!(matches!(framer.next_frame(), Some(Frame::Packet(_))));
        assert!(framer.next_frame().is_none());
    }

    #[test]
    fn test_framer_malformed_var_int() {
        let mut framer = Framer::new(1024);
        framer.feed(&[0x30, 0xff, 0xff, 0xff, 0xff, 0x01]);
        assert!(matches!(framer.next_frame(), Some(Frame::Malformed(_))));
    }

    #[test]
    fn test_framer_oversized_packet() {
        let mut framer = Framer::new(16);
        // Publish packet of 100 remaining bytes.
        framer.feed(&[0x30, 100]);
        assert!(matches!(framer.next_frame(), Some(Frame::Malformed(_))));
    }

    #[test]
    fn test_framer_malformed_packet_keeps_bytes() {
        // SUBSCRIBE flag nibble on a packet of one zero byte body.
        let bytes = [0x80, 0x01, 0x00];
        let mut framer = Framer::new(1024);
        framer.feed(&bytes);
        let Some(Frame::Malformed(kept)) = framer.next_frame() else {
            panic!("expected malformed frame");
        };
        assert_eq!(kept, bytes.to_vec());
    }
}
