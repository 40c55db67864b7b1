use std::fmt;

use thiserror::Error;

pub const URI_PREFIX: &str = "aqueduct:";

#[derive(Error, Debug, Clone, PartialEq)]
pub enum UriError {
    #[error("channel must start with '{URI_PREFIX}': {0}")]
    MissingPrefix(String),
    #[error("unknown media '{0}'")]
    UnknownMedia(String),
    #[error("malformed param '{0}'")]
    MalformedParam(String),
    #[error("invalid value for '{0}': {1}")]
    InvalidValue(&'static str, String),
    #[error("udp channel requires an endpoint or control address")]
    MissingEndpoint,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Media {
    Udp,
    Ipc,
}

impl fmt::Display for Media {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Media::Udp => write!(f, "udp"),
            Media::Ipc => write!(f, "ipc"),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum ControlMode {
    #[default]
    None,
    Manual,
    Dynamic,
}

/// Parsed channel URI: `aqueduct:<media>?<key>=<value>|<key>=<value>|…`.
///
/// `aqueduct:ipc` addresses the shared-memory transport; `aqueduct:udp`
/// requires an `endpoint` (or `control` for multi-destination-cast).
#[derive(Clone, Debug, PartialEq)]
pub struct ChannelUri {
    pub media: Media,
    pub endpoint: Option<String>,
    pub interface: Option<String>,
    pub control: Option<String>,
    pub control_mode: ControlMode,
    pub ttl: Option<u8>,
    pub mtu: Option<usize>,
    pub term_length: Option<usize>,
    pub initial_term_id: Option<i32>,
    pub term_id: Option<i32>,
    pub term_offset: Option<usize>,
    pub session_id: Option<i32>,
    pub reliable: Option<bool>,
    pub tags: Option<String>,
}

impl ChannelUri {
    pub fn parse(channel: &str) -> Result<Self, UriError> {
        let rest = channel
            .strip_prefix(URI_PREFIX)
            .ok_or_else(|| UriError::MissingPrefix(channel.to_string()))?;

        let (media_str, params_str) = match rest.split_once('?') {
            Some((m, p)) => (m, Some(p)),
            None => (rest, None),
        };

        let media = match media_str {
            "udp" => Media::Udp,
            "ipc" => Media::Ipc,
            other => return Err(UriError::UnknownMedia(other.to_string())),
        };

        let mut uri = ChannelUri {
            media,
            endpoint: None,
            interface: None,
            control: None,
            control_mode: ControlMode::None,
            ttl: None,
            mtu: None,
            term_length: None,
            initial_term_id: None,
            term_id: None,
            term_offset: None,
            session_id: None,
            reliable: None,
            tags: None,
        };

        if let Some(params_str) = params_str {
            for param in params_str.split('|').filter(|p| !p.is_empty()) {
                let (key, value) =
                    param.split_once('=').ok_or_else(|| UriError::MalformedParam(param.to_string()))?;
                uri.apply(key, value)?;
            }
        }

        if media == Media::Udp && uri.endpoint.is_none() && uri.control.is_none() {
            return Err(UriError::MissingEndpoint);
        }

        Ok(uri)
    }

    fn apply(&mut self, key: &str, value: &str) -> Result<(), UriError> {
        match key {
            "endpoint" => self.endpoint = Some(value.to_string()),
            "interface" => self.interface = Some(value.to_string()),
            "control" => self.control = Some(value.to_string()),
            "control-mode" => {
                self.control_mode = match value {
                    "manual" => ControlMode::Manual,
                    "dynamic" => ControlMode::Dynamic,
                    other => return Err(UriError::InvalidValue("control-mode", other.to_string())),
                }
            }
            "ttl" => self.ttl = Some(parse_num("ttl", value)?),
            "mtu" => self.mtu = Some(parse_num("mtu", value)?),
            "term-length" => self.term_length = Some(parse_num("term-length", value)?),
            "init-term-id" => self.initial_term_id = Some(parse_num("init-term-id", value)?),
            "term-id" => self.term_id = Some(parse_num("term-id", value)?),
            "term-offset" => self.term_offset = Some(parse_num("term-offset", value)?),
            "session-id" => self.session_id = Some(parse_num("session-id", value)?),
            "reliable" => {
                self.reliable = Some(match value {
                    "true" => true,
                    "false" => false,
                    other => return Err(UriError::InvalidValue("reliable", other.to_string())),
                })
            }
            "tags" => self.tags = Some(value.to_string()),
            other => return Err(UriError::MalformedParam(other.to_string())),
        }
        Ok(())
    }

    #[inline]
    pub fn is_ipc(&self) -> bool {
        self.media == Media::Ipc
    }

    #[inline]
    pub fn is_multicast(&self) -> bool {
        // endpoint in 224.0.0.0/4 or an explicit control address
        self.endpoint
            .as_deref()
            .and_then(|e| e.split(':').next())
            .and_then(|host| host.split('.').next())
            .and_then(|first| first.parse::<u8>().ok())
            .is_some_and(|first| (224..=239).contains(&first))
    }

    /// Stable identity for socket sharing: the connectivity-defining params
    /// only, so streams differing in stream-local params (mtu, term-length,
    /// session-id, reliable) share one endpoint.
    pub fn canonical_form(&self) -> String {
        let mut canonical = format!("{}", self.media);
        if let Some(endpoint) = &self.endpoint {
            canonical.push_str("?endpoint=");
            canonical.push_str(endpoint);
        }
        if let Some(control) = &self.control {
            canonical.push_str("|control=");
            canonical.push_str(control);
        }
        if let Some(interface) = &self.interface {
            canonical.push_str("|interface=");
            canonical.push_str(interface);
        }
        if let Some(tags) = &self.tags {
            canonical.push_str("|tags=");
            canonical.push_str(tags);
        }
        canonical
    }
}

fn parse_num<T: std::str::FromStr>(key: &'static str, value: &str) -> Result<T, UriError> {
    value.parse().map_err(|_| UriError::InvalidValue(key, value.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_udp_with_params() {
        let uri = ChannelUri::parse(
            "aqueduct:udp?endpoint=127.0.0.1:40123|mtu=1408|term-length=65536|reliable=false",
        )
        .unwrap();
        assert_eq!(uri.media, Media::Udp);
        assert_eq!(uri.endpoint.as_deref(), Some("127.0.0.1:40123"));
        assert_eq!(uri.mtu, Some(1408));
        assert_eq!(uri.term_length, Some(65536));
        assert_eq!(uri.reliable, Some(false));
    }

    #[test]
    fn parses_ipc() {
        let uri = ChannelUri::parse("aqueduct:ipc").unwrap();
        assert!(uri.is_ipc());
        assert_eq!(uri.canonical_form(), "ipc");
    }

    #[test]
    fn rejects_bad_uris() {
        assert!(matches!(ChannelUri::parse("udp?endpoint=x"), Err(UriError::MissingPrefix(_))));
        assert!(matches!(
            ChannelUri::parse("aqueduct:tcp?endpoint=x"),
            Err(UriError::UnknownMedia(_))
        ));
        assert!(matches!(ChannelUri::parse("aqueduct:udp"), Err(UriError::MissingEndpoint)));
        assert!(matches!(
            ChannelUri::parse("aqueduct:udp?endpoint=x|bogus"),
            Err(UriError::MalformedParam(_))
        ));
        assert!(matches!(
            ChannelUri::parse("aqueduct:udp?endpoint=x|reliable=maybe"),
            Err(UriError::InvalidValue("reliable", _))
        ));
    }

    #[test]
    fn canonical_form_ignores_stream_params() {
        let a = ChannelUri::parse("aqueduct:udp?endpoint=127.0.0.1:40123|mtu=1408").unwrap();
        let b = ChannelUri::parse("aqueduct:udp?endpoint=127.0.0.1:40123|term-length=131072")
            .unwrap();
        assert_eq!(a.canonical_form(), b.canonical_form());

        let c = ChannelUri::parse("aqueduct:udp?endpoint=127.0.0.1:40124").unwrap();
        assert_ne!(a.canonical_form(), c.canonical_form());
    }

    #[test]
    fn multicast_detection() {
        assert!(ChannelUri::parse("aqueduct:udp?endpoint=224.10.9.8:40456")
            .unwrap()
            .is_multicast());
        assert!(!ChannelUri::parse("aqueduct:udp?endpoint=127.0.0.1:40456")
            .unwrap()
            .is_multicast());
    }

    #[test]
    fn control_mode_parse() {
        let uri = ChannelUri::parse(
            "aqueduct:udp?control=127.0.0.1:40000|control-mode=manual",
        )
        .unwrap();
        assert_eq!(uri.control_mode, ControlMode::Manual);
    }
}
