//! SDP inspector, `SPEC_FULL.md` §4.9.
//!
//! Grounded on `examples/original_source/sipcore/sdp_parser.py`: the exact
//! RFC 3551 static payload-type table and the `call_type` derivation rules
//! (`AUDIO`, `VIDEO`, `AUDIO+VIDEO`, or a `+`-joined sorted upper-case union
//! for anything else).

/// RFC 3551 static payload type -> codec name, consulted only when a media
/// section had no `a=rtpmap` lines at all.
const STATIC_PAYLOAD_TYPES: &[(u8, &str)] = &[
    (0, "PCMU"),
    (3, "GSM"),
    (4, "G723"),
    (5, "DVI4"),
    (6, "DVI4"),
    (7, "LPC"),
    (8, "PCMA"),
    (9, "G722"),
    (10, "L16"),
    (11, "L16"),
    (12, "QCELP"),
    (13, "CN"),
    (14, "MPA"),
    (15, "G728"),
    (16, "DVI4"),
    (17, "DVI4"),
    (18, "G729"),
];

fn static_codec_name(payload_type: &str) -> Option<&'static str> {
    let pt: u8 = payload_type.parse().ok()?;
    STATIC_PAYLOAD_TYPES.iter().find(|(p, _)| *p == pt).map(|(_, name)| *name)
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SdpInfo {
    pub media_types: Vec<String>,
    pub codecs: Vec<String>,
    pub call_type: String,
    pub codec_str: String,
}

struct CodecEntry {
    name: String,
    media: String,
}

/// Parses an SDP body, returning media types (sorted, deduplicated),
/// codec names (insertion order, deduplicated), `call_type`, and
/// `codec_str`. An empty or undecodable body yields an all-empty
/// [`SdpInfo`] rather than an error (SDP inspection never fails the caller).
pub fn parse_sdp(body: &[u8]) -> SdpInfo {
    if body.is_empty() {
        return SdpInfo::default();
    }

    let text = String::from_utf8_lossy(body);

    let mut media_types: Vec<String> = Vec::new();
    let mut codecs: Vec<CodecEntry> = Vec::new();
    let mut current_media: Option<String> = None;
    let mut media_fmt_lists: Vec<(String, Vec<String>)> = Vec::new();

    for raw_line in text.lines() {
        let line = raw_line.trim();
        if line.is_empty() {
            continue;
        }

        if let Some(rest) = line.strip_prefix("m=") {
            let parts: Vec<&str> = rest.split_whitespace().collect();
            if parts.len() >= 4 {
                let media_type = parts[0].to_string();
                if !media_types.contains(&media_type) {
                    media_types.push(media_type.clone());
                }
                media_fmt_lists.push((media_type.clone(), parts[3..].iter().map(|s| s.to_string()).collect()));
                current_media = Some(media_type);
            }
        } else if let Some(rest) = line.strip_prefix("a=rtpmap:") {
            let parts: Vec<&str> = rest.split_whitespace().collect();
            if parts.len() >= 2 {
                let codec_name = parts[1].split('/').next().unwrap_or("").to_string();
                if let Some(media) = &current_media {
                    let already = codecs.iter().any(|c| c.media == *media && c.name == codec_name);
                    if !already && !codec_name.is_empty() {
                        codecs.push(CodecEntry { name: codec_name, media: media.clone() });
                    }
                }
            }
        }
    }

    if codecs.is_empty() && !media_types.is_empty() {
        for (media, fmts) in &media_fmt_lists {
            for pt in fmts {
                if let Some(name) = static_codec_name(pt) {
                    let already = codecs.iter().any(|c| c.media == *media && c.name == name);
                    if !already {
                        codecs.push(CodecEntry { name: name.to_string(), media: media.clone() });
                    }
                }
            }
        }
    }

    let call_type = generate_call_type(&media_types);

    let mut codec_names = Vec::new();
    for c in &codecs {
        if !codec_names.contains(&c.name) {
            codec_names.push(c.name.clone());
        }
    }
    let codec_str = codec_names.join(", ");

    let mut sorted_media = media_types.clone();
    sorted_media.sort();

    SdpInfo { media_types: sorted_media, codecs: codec_names, call_type, codec_str }
}

fn generate_call_type(media_types: &[String]) -> String {
    if media_types.is_empty() {
        return String::new();
    }
    let has_audio = media_types.iter().any(|m| m == "audio");
    let has_video = media_types.iter().any(|m| m == "video");

    if has_audio && has_video {
        "AUDIO+VIDEO".to_string()
    } else if has_video {
        "VIDEO".to_string()
    } else if has_audio {
        "AUDIO".to_string()
    } else {
        let mut others: Vec<String> = media_types.iter().map(|m| m.to_uppercase()).collect();
        others.sort();
        others.join("+")
    }
}

/// Simplified interface: `(call_type, codec_str)`.
pub fn extract_sdp_info(body: &[u8]) -> (String, String) {
    let info = parse_sdp(body);
    (info.call_type, info.codec_str)
}

/// Generates a minimal SDP offer/answer body advertising PCMU at the given
/// RTP port, `a=sendrecv` (`SPEC_FULL.md` §6). Used by the auto-dialer.
pub fn build_pcmu_offer(local_ip: &str, rtp_port: u16, session_id: u64) -> Vec<u8> {
    format!(
        "v=0\r\n\
o=- {sid} {sid} IN IP4 {ip}\r\n\
s=ims-sip-core\r\n\
c=IN IP4 {ip}\r\n\
t=0 0\r\n\
m=audio {port} RTP/AVP 0\r\n\
a=rtpmap:0 PCMU/8000\r\n\
a=sendrecv\r\n",
        sid = session_id,
        ip = local_ip,
        port = rtp_port
    )
    .into_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_body_yields_empty_info() {
        let info = parse_sdp(b"");
        assert_eq!(info, SdpInfo::default());
    }

    #[test]
    fn audio_only_via_rtpmap() {
        let sdp = b"v=0\r\no=- 1 1 IN IP4 1.2.3.4\r\ns=-\r\nc=IN IP4 1.2.3.4\r\nt=0 0\r\nm=audio 49170 RTP/AVP 0 8 18\r\na=rtpmap:0 PCMU/8000\r\na=rtpmap:8 PCMA/8000\r\na=rtpmap:18 G729/8000\r\n";
        let (call_type, codec_str) = extract_sdp_info(sdp);
        assert_eq!(call_type, "AUDIO");
        assert_eq!(codec_str, "PCMU, PCMA, G729");
    }

    #[test]
    fn audio_and_video() {
        let sdp = b"m=audio 1 RTP/AVP 0 8\r\na=rtpmap:0 PCMU/8000\r\na=rtpmap:8 PCMA/8000\r\nm=video 2 RTP/AVP 96\r\na=rtpmap:96 H264/90000\r\n";
        let (call_type, codec_str) = extract_sdp_info(sdp);
        assert_eq!(call_type, "AUDIO+VIDEO");
        assert_eq!(codec_str, "PCMU, PCMA, H264");
    }

    #[test]
    fn falls_back_to_static_table_without_rtpmap() {
        let sdp = b"m=audio 1 RTP/AVP 0 8\r\n";
        let (call_type, codec_str) = extract_sdp_info(sdp);
        assert_eq!(call_type, "AUDIO");
        assert_eq!(codec_str, "PCMU, PCMA");
    }

    #[test]
    fn other_media_type_union() {
        let sdp = b"m=application 1 RTP/AVP 100\r\nm=text 2 RTP/AVP 101\r\n";
        let info = parse_sdp(sdp);
        assert_eq!(info.call_type, "APPLICATION+TEXT");
    }
}
