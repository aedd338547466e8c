//! A small structural SIP URI parser.
//!
//! Replaces string-regex poking at URIs (`SPEC_FULL.md` §9, "String regex on
//! SIP URIs"): parameters such as `;ob` and `;transport=*` are stripped by
//! removing list entries, not by substring surgery.

use std::fmt;

/// `sip:user@host:port;param=value;param2`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SipUri {
    pub scheme: String,
    pub user: Option<String>,
    pub host: String,
    pub port: Option<u16>,
    pub parameters: Vec<(String, Option<String>)>,
}

impl SipUri {
    pub fn parse(raw: &str) -> Option<SipUri> {
        let raw = raw.trim();
        let raw = raw.strip_prefix('<').and_then(|s| s.strip_suffix('>')).unwrap_or(raw);

        let (scheme, rest) = raw.split_once(':')?;
        if scheme.is_empty() {
            return None;
        }

        let mut parts = rest.splitn(2, ';');
        let userhost = parts.next().unwrap_or("");
        let param_str = parts.next().unwrap_or("");

        let (user, hostport) = match userhost.rsplit_once('@') {
            Some((u, h)) => (Some(u.to_string()), h),
            None => (None, userhost),
        };

        let (host, port) = match hostport.rsplit_once(':') {
            Some((h, p)) => match p.parse::<u16>() {
                Ok(p) => (h.to_string(), Some(p)),
                Err(_) => (hostport.to_string(), None),
            },
            None => (hostport.to_string(), None),
        };

        if host.is_empty() {
            return None;
        }

        let parameters = parse_params(param_str);

        Some(SipUri {
            scheme: scheme.to_string(),
            user,
            host,
            port,
            parameters,
        })
    }

    /// The Address-of-Record form: `sip:user@host`, all parameters and port stripped.
    pub fn aor(&self) -> String {
        match &self.user {
            Some(u) => format!("{}:{}@{}", self.scheme, u, self.host),
            None => format!("{}:{}", self.scheme, self.host),
        }
    }

    pub fn param(&self, name: &str) -> Option<&str> {
        self.parameters
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .and_then(|(_, v)| v.as_deref())
    }

    pub fn has_param(&self, name: &str) -> bool {
        self.parameters.iter().any(|(k, _)| k.eq_ignore_ascii_case(name))
    }

    /// Returns a copy with the given parameter names removed (case-insensitive).
    pub fn without_params(&self, names: &[&str]) -> SipUri {
        let mut uri = self.clone();
        uri.parameters
            .retain(|(k, _)| !names.iter().any(|n| k.eq_ignore_ascii_case(n)));
        uri
    }

    /// Returns a copy with host/port rewritten (NAT-learned contact rewriting).
    pub fn with_host_port(&self, host: &str, port: u16) -> SipUri {
        let mut uri = self.clone();
        uri.host = host.to_string();
        uri.port = Some(port);
        uri
    }

    pub fn socket_host_port(&self) -> (String, u16) {
        (self.host.clone(), self.port.unwrap_or(5060))
    }
}

fn parse_params(s: &str) -> Vec<(String, Option<String>)> {
    if s.is_empty() {
        return Vec::new();
    }
    s.split(';')
        .filter(|p| !p.is_empty())
        .map(|p| match p.split_once('=') {
            Some((k, v)) => (k.to_string(), Some(v.to_string())),
            None => (p.to_string(), None),
        })
        .collect()
}

impl fmt::Display for SipUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:", self.scheme)?;
        if let Some(user) = &self.user {
            write!(f, "{}@", user)?;
        }
        write!(f, "{}", self.host)?;
        if let Some(port) = self.port {
            write!(f, ":{}", port)?;
        }
        for (k, v) in &self.parameters {
            match v {
                Some(v) => write!(f, ";{}={}", k, v)?,
                None => write!(f, ";{}", k)?,
            }
        }
        Ok(())
    }
}

/// Extracts the bracketed or bare URI out of a header value such as
/// `"1001" <sip:1001@192.168.8.50:5061>;tag=abc`.
pub fn extract_uri(header_value: &str) -> Option<&str> {
    if let Some(start) = header_value.find('<') {
        let end = header_value[start..].find('>')? + start;
        Some(&header_value[start + 1..end])
    } else {
        // No display-name/angle-brackets form: the URI runs up to the first
        // `;` that starts a header parameter (not a URI parameter).
        Some(header_value.split(';').next().unwrap_or(header_value).trim())
    }
}

/// Extracts a named parameter that sits *outside* the URI (e.g. `tag=` on a
/// From/To header), as opposed to `SipUri::param` which looks inside the URI.
pub fn extract_header_param<'a>(header_value: &'a str, name: &str) -> Option<&'a str> {
    let tail = match header_value.find('>') {
        Some(idx) => &header_value[idx + 1..],
        None => header_value,
    };
    for part in tail.split(';') {
        let part = part.trim();
        if let Some((k, v)) = part.split_once('=') {
            if k.eq_ignore_ascii_case(name) {
                return Some(v.trim_matches('"'));
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_basic_uri() {
        let uri = SipUri::parse("sip:1001@192.168.8.50:5061").unwrap();
        assert_eq!(uri.user.as_deref(), Some("1001"));
        assert_eq!(uri.host, "192.168.8.50");
        assert_eq!(uri.port, Some(5061));
        assert!(uri.parameters.is_empty());
    }

    #[test]
    fn parses_parameters() {
        let uri = SipUri::parse("sip:1001@10.0.0.1:5060;ob;transport=udp").unwrap();
        assert!(uri.has_param("ob"));
        assert_eq!(uri.param("transport"), Some("udp"));
    }

    #[test]
    fn strips_angle_brackets() {
        let uri = SipUri::parse("<sip:1002@192.168.8.51:5062>").unwrap();
        assert_eq!(uri.host, "192.168.8.51");
    }

    #[test]
    fn without_params_drops_only_named() {
        let uri = SipUri::parse("sip:1001@10.0.0.1;ob;transport=udp;foo=bar").unwrap();
        let stripped = uri.without_params(&["ob", "transport"]);
        assert!(!stripped.has_param("ob"));
        assert!(!stripped.has_param("transport"));
        assert_eq!(stripped.param("foo"), Some("bar"));
    }

    #[test]
    fn aor_strips_port_and_params() {
        let uri = SipUri::parse("sip:1001@10.0.0.1:5070;ob").unwrap();
        assert_eq!(uri.aor(), "sip:1001@10.0.0.1");
    }

    #[test]
    fn extract_uri_from_bracketed_header() {
        let v = r#""1001" <sip:1001@192.168.8.50:5061>;tag=abc123"#;
        assert_eq!(extract_uri(v), Some("sip:1001@192.168.8.50:5061"));
        assert_eq!(extract_header_param(v, "tag"), Some("abc123"));
    }

    #[test]
    fn extract_uri_bare() {
        let v = "sip:1002@192.168.8.51:5062;expires=3600";
        assert_eq!(extract_uri(v), Some("sip:1002@192.168.8.51:5062"));
    }
}
