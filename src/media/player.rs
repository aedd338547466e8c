//! RTP media player, `SPEC_FULL.md` §4.11.
//!
//! Ties `media::wav`, `media::ulaw`, and `media::rtp` together the way the
//! teacher's `transport.rs` binds a socket to a single receive loop: one
//! bound UDP socket, one destination, one decode-encode-packetise-pace
//! pipeline, closed promptly when the file is exhausted or the duration cap
//! elapses.

use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::time::Instant;

use crate::error::Result;
use crate::media::rtp::{chunk_into_frames, send_paced, RtpPacketizer};
use crate::media::ulaw::encode_buffer;
use crate::media::wav;

/// Plays `wav_path` as PCMU/8000 RTP from a freshly bound UDP socket on
/// `local_port` to `remote`, capped at `duration` if given. Closes the
/// socket before returning in every case — exhausted media, duration cap,
/// or a mid-stream send error.
pub async fn play_wav_as_rtp(
    wav_path: impl AsRef<Path>,
    local_port: u16,
    remote: SocketAddr,
    duration: Option<Duration>,
) -> Result<()> {
    let pcm = wav::load_as_pcm8k(wav_path)?;
    let ulaw = encode_buffer(&pcm.samples);
    let frames = chunk_into_frames(&ulaw);

    let local_addr: SocketAddr = format!("0.0.0.0:{local_port}").parse().expect("valid socket addr");
    let socket = UdpSocket::bind(local_addr).await?;

    let mut packetizer = RtpPacketizer::new();
    let deadline = duration.map(|d| Instant::now() + d);
    send_paced(&socket, remote, &mut packetizer, &frames, deadline).await;

    drop(socket);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_test_wav(path: &Path) {
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate: 8000,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut writer = hound::WavWriter::create(path, spec).unwrap();
        for i in 0..1600i16 {
            writer.write_sample(i % 500).unwrap();
        }
        writer.finalize().unwrap();
    }

    #[tokio::test]
    async fn plays_short_wav_to_completion_without_duration_cap() {
        let dir = std::env::temp_dir().join(format!("playertest-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let wav_path = dir.join("tone.wav");
        write_test_wav(&wav_path);

        let listener = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let remote = listener.local_addr().unwrap();

        let result = play_wav_as_rtp(&wav_path, 0, remote, None).await;
        assert!(result.is_ok());

        let mut buf = [0u8; 512];
        let (len, _) = tokio::time::timeout(Duration::from_millis(500), listener.recv_from(&mut buf)).await.unwrap().unwrap();
        assert_eq!(len, 12 + 160);
        assert_eq!(buf[1] & 0x7F, 0);

        std::fs::remove_dir_all(&dir).ok();
    }

    #[tokio::test]
    async fn duration_cap_stops_playback_early() {
        let dir = std::env::temp_dir().join(format!("playertest-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let wav_path = dir.join("long.wav");
        let spec = hound::WavSpec { channels: 1, sample_rate: 8000, bits_per_sample: 16, sample_format: hound::SampleFormat::Int };
        let mut writer = hound::WavWriter::create(&wav_path, spec).unwrap();
        for i in 0..80000i16 {
            writer.write_sample(i % 500).unwrap();
        }
        writer.finalize().unwrap();

        let listener = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let remote = listener.local_addr().unwrap();

        let start = std::time::Instant::now();
        play_wav_as_rtp(&wav_path, 0, remote, Some(Duration::from_millis(60))).await.unwrap();
        assert!(start.elapsed() < Duration::from_secs(2));

        std::fs::remove_dir_all(&dir).ok();
        let _ = std::io::stdout().flush();
    }
}
