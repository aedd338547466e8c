//! RTP packetisation and paced emission, `SPEC_FULL.md` §4.11.
//!
//! Grounded on RFC 3550's 12-byte fixed header layout and the teacher's
//! `transport.rs` single-socket send loop shape, adapted from "receive and
//! dispatch" to "packetise and pace": a `RtpPacketizer` owns the running
//! sequence number, timestamp, and SSRC, and `send_paced` schedules each
//! packet against an absolute deadline rather than a cumulative sleep so
//! jitter in one send doesn't drift every packet after it.

use std::net::SocketAddr;
use std::time::Duration;

use rand::RngCore;
use tokio::net::UdpSocket;
use tokio::time::Instant;

use crate::media::ulaw::SILENCE_FILL;

const VERSION_NO_EXT: u8 = 0x80; // V=2, P=X=CC=0
const PT_PCMU: u8 = 0;
const SAMPLES_PER_PACKET: usize = 160; // 20ms @ 8kHz
const PACKET_INTERVAL: Duration = Duration::from_millis(20);

/// Builds one 12-byte RTP header (RFC 3550 §5.1) for a PCMU payload.
fn build_header(seq: u16, timestamp: u32, ssrc: u32, marker: bool) -> [u8; 12] {
    let mut header = [0u8; 12];
    header[0] = VERSION_NO_EXT;
    header[1] = if marker { 0x80 | PT_PCMU } else { PT_PCMU };
    header[2..4].copy_from_slice(&seq.to_be_bytes());
    header[4..8].copy_from_slice(&timestamp.to_be_bytes());
    header[8..12].copy_from_slice(&ssrc.to_be_bytes());
    header
}

/// Owns the per-call running sequence number, timestamp, and SSRC. Sequence
/// wraps at 2^16, timestamp at 2^32, both via wrapping arithmetic per RFC
/// 3550 — neither is a protocol error, just modular counters.
pub struct RtpPacketizer {
    ssrc: u32,
    seq: u16,
    timestamp: u32,
}

impl RtpPacketizer {
    /// A fresh packetizer with a random starting sequence number and
    /// timestamp and a random SSRC, as RFC 3550 §5.1 requires for
    /// collision resistance.
    pub fn new() -> RtpPacketizer {
        let mut bytes = [0u8; 10];
        rand::rng().fill_bytes(&mut bytes);
        RtpPacketizer {
            ssrc: u32::from_be_bytes(bytes[0..4].try_into().unwrap()),
            seq: u16::from_be_bytes(bytes[4..6].try_into().unwrap()),
            timestamp: u32::from_be_bytes(bytes[6..10].try_into().unwrap()),
        }
    }

    /// Wraps one 160-byte μ-law payload (padding a short final frame with
    /// [`SILENCE_FILL`]) in an RTP header and advances seq/timestamp for the
    /// next call. `marker` should be set on the first packet of a talkspurt;
    /// the dialer's player sets it only on the very first packet sent.
    pub fn packetize(&mut self, ulaw_payload: &[u8], marker: bool) -> Vec<u8> {
        let mut payload = ulaw_payload.to_vec();
        payload.resize(SAMPLES_PER_PACKET, SILENCE_FILL);

        let header = build_header(self.seq, self.timestamp, self.ssrc, marker);
        let mut packet = Vec::with_capacity(12 + SAMPLES_PER_PACKET);
        packet.extend_from_slice(&header);
        packet.extend_from_slice(&payload);

        self.seq = self.seq.wrapping_add(1);
        self.timestamp = self.timestamp.wrapping_add(SAMPLES_PER_PACKET as u32);
        packet
    }
}

impl Default for RtpPacketizer {
    fn default() -> Self {
        Self::new()
    }
}

/// Sends `ulaw_frames` (already chunked to 160-byte payloads) as RTP packets
/// on `socket` to `dest`, paced at `t0 + k*20ms` using absolute deadlines so
/// per-packet send latency never accumulates into audible drift. Stops early
/// if `deadline` (an absolute `Instant`, e.g. a duration cap) is reached.
pub async fn send_paced(
    socket: &UdpSocket,
    dest: SocketAddr,
    packetizer: &mut RtpPacketizer,
    ulaw_frames: &[Vec<u8>],
    deadline: Option<Instant>,
) {
    let t0 = Instant::now();
    for (k, frame) in ulaw_frames.iter().enumerate() {
        let target = t0 + PACKET_INTERVAL * k as u32;
        if let Some(stop) = deadline {
            if target >= stop {
                break;
            }
        }
        tokio::time::sleep_until(target).await;

        let marker = k == 0;
        let packet = packetizer.packetize(frame, marker);
        if let Err(err) = socket.send_to(&packet, dest).await {
            tracing::warn!(%dest, error = %err, "RTP send failed");
            break;
        }
    }
}

/// Splits μ-law-encoded samples into fixed 160-byte chunks (20ms at 8kHz),
/// the last of which may be shorter than 160 bytes (padded by
/// [`RtpPacketizer::packetize`] at send time).
pub fn chunk_into_frames(ulaw: &[u8]) -> Vec<Vec<u8>> {
    ulaw.chunks(SAMPLES_PER_PACKET).map(|c| c.to_vec()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_has_correct_version_and_payload_type() {
        let header = build_header(0, 0, 0, false);
        assert_eq!(header[0], 0x80);
        assert_eq!(header[1], 0);
    }

    #[test]
    fn marker_bit_is_set_on_marked_packets() {
        let header = build_header(0, 0, 0, true);
        assert_eq!(header[1], 0x80);
    }

    #[test]
    fn packetize_advances_seq_and_timestamp() {
        let mut p = RtpPacketizer::new();
        let first_seq = p.seq;
        let first_ts = p.timestamp;
        let payload = vec![0u8; SAMPLES_PER_PACKET];
        p.packetize(&payload, false);
        assert_eq!(p.seq, first_seq.wrapping_add(1));
        assert_eq!(p.timestamp, first_ts.wrapping_add(SAMPLES_PER_PACKET as u32));
    }

    #[test]
    fn packetize_pads_short_final_frame_with_silence_fill() {
        let mut p = RtpPacketizer::new();
        let short = vec![0u8; 40];
        let packet = p.packetize(&short, false);
        assert_eq!(packet.len(), 12 + SAMPLES_PER_PACKET);
        assert!(packet[12 + 40..].iter().all(|&b| b == SILENCE_FILL));
    }

    #[test]
    fn chunk_into_frames_splits_on_160_byte_boundaries() {
        let ulaw = vec![0u8; 400];
        let frames = chunk_into_frames(&ulaw);
        assert_eq!(frames.len(), 3);
        assert_eq!(frames[0].len(), 160);
        assert_eq!(frames[1].len(), 160);
        assert_eq!(frames[2].len(), 80);
    }

    #[test]
    fn seq_wraps_at_u16_boundary() {
        let mut p = RtpPacketizer { ssrc: 1, seq: u16::MAX, timestamp: 0 };
        let payload = vec![0u8; SAMPLES_PER_PACKET];
        p.packetize(&payload, false);
        assert_eq!(p.seq, 0);
    }
}
