//! ICE server discovery from RFC 8288 Link headers
//!
//! A WHIP endpoint advertises STUN/TURN servers as `rel="ice-server"` links:
//!
//! ```text
//! <stun:stun.example.net>; rel="ice-server", <turn:turn.example.net?transport=udp>; rel="ice-server"; username="user"; credential="pass"; credential-type="password"
//! ```
//!
//! Parsing is a plain text transform. Malformed entries are dropped, never
//! reported as errors.

use tracing::{debug, warn};

/// Link relation marking an ICE server entry
const ICE_SERVER_REL: &str = "rel=\"ice-server\"";

/// ICE server advertised by a WHIP endpoint
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IceServer {
    /// STUN server, `url` is `host[:port]`
    Stun { url: String },
    /// TURN server over UDP/TCP
    Turn {
        url: String,
        username: String,
        credential: String,
    },
    /// TURN server over TLS
    Turns {
        url: String,
        username: String,
        credential: String,
    },
}

impl IceServer {
    /// URI scheme of this server
    pub fn scheme(&self) -> &'static str {
        match self {
            IceServer::Stun { .. } => "stun",
            IceServer::Turn { .. } => "turn",
            IceServer::Turns { .. } => "turns",
        }
    }

    /// Server address with the scheme stripped
    pub fn url(&self) -> &str {
        match self {
            IceServer::Stun { url }
            | IceServer::Turn { url, .. }
            | IceServer::Turns { url, .. } => url,
        }
    }
}

/// Fields collected from the members of one Link entry
#[derive(Debug, Default)]
struct LinkFields<'a> {
    stun: Option<&'a str>,
    turn: Option<&'a str>,
    turns: Option<&'a str>,
    username: Option<&'a str>,
    credential: Option<&'a str>,
    credential_type: Option<&'a str>,
}

/// Parse a Link header value into ICE servers
///
/// Entries are separated by `", "`, members of an entry by `"; "`. Only entries
/// carrying `rel="ice-server"` are considered. A STUN URL in an entry wins over
/// any TURN/TURNS URL in the same entry. TURN/TURNS entries need a username, a
/// credential and `credential-type="password"`.
///
/// # Example
///
/// ```
/// use whipsink::link_header::{parse, IceServer};
///
/// let servers = parse("<stun:stun.example.net:3478>; rel=\"ice-server\"");
/// assert_eq!(servers, vec![IceServer::Stun { url: "stun.example.net:3478".to_string() }]);
/// ```
pub fn parse(link_header: &str) -> Vec<IceServer> {
    link_header
        .split(", ")
        .filter(|entry| contains_ignore_ascii_case(entry, ICE_SERVER_REL))
        .filter_map(|entry| {
            let server = ice_server_from_fields(&collect_fields(entry));
            match &server {
                Some(server) => debug!("Link header ICE server: {}:{}", server.scheme(), server.url()),
                None => warn!("Ignoring unusable ice-server link: {}", redact(entry)),
            }
            server
        })
        .collect()
}

fn collect_fields(entry: &str) -> LinkFields<'_> {
    let mut fields = LinkFields::default();

    for member in entry.split("; ") {
        let member = member.trim();
        if let Some(value) = strip_prefix_ignore_ascii_case(member, "<stun:") {
            fields.stun = non_empty(strip_delimiter(value, '>'));
        } else if let Some(value) = strip_prefix_ignore_ascii_case(member, "<turn:") {
            fields.turn = non_empty(strip_delimiter(value, '>'));
        } else if let Some(value) = strip_prefix_ignore_ascii_case(member, "<turns:") {
            fields.turns = non_empty(strip_delimiter(value, '>'));
        } else if let Some(value) = strip_prefix_ignore_ascii_case(member, "username=\"") {
            fields.username = non_empty(strip_delimiter(value, '"'));
        } else if let Some(value) = strip_prefix_ignore_ascii_case(member, "credential=\"") {
            fields.credential = non_empty(strip_delimiter(value, '"'));
        } else if let Some(value) = strip_prefix_ignore_ascii_case(member, "credential-type: \"")
            .or_else(|| strip_prefix_ignore_ascii_case(member, "credential-type=\""))
        {
            fields.credential_type = non_empty(strip_delimiter(value, '"'));
        }
    }

    fields
}

fn ice_server_from_fields(fields: &LinkFields<'_>) -> Option<IceServer> {
    if let Some(url) = fields.stun {
        return Some(IceServer::Stun {
            url: url.to_string(),
        });
    }

    let password_auth = fields
        .credential_type
        .is_some_and(|kind| kind.eq_ignore_ascii_case("password"));

    let (username, credential) = match (password_auth, fields.username, fields.credential) {
        (true, Some(username), Some(credential)) => (username.to_string(), credential.to_string()),
        _ => return None,
    };

    if let Some(url) = fields.turn {
        Some(IceServer::Turn {
            url: url.to_string(),
            username,
            credential,
        })
    } else {
        fields.turns.map(|url| IceServer::Turns {
            url: url.to_string(),
            username,
            credential,
        })
    }
}

fn strip_prefix_ignore_ascii_case<'a>(s: &'a str, prefix: &str) -> Option<&'a str> {
    let head = s.get(..prefix.len())?;
    if head.eq_ignore_ascii_case(prefix) {
        Some(&s[prefix.len()..])
    } else {
        None
    }
}

fn contains_ignore_ascii_case(haystack: &str, needle: &str) -> bool {
    haystack
        .as_bytes()
        .windows(needle.len())
        .any(|window| window.eq_ignore_ascii_case(needle.as_bytes()))
}

fn strip_delimiter(value: &str, delimiter: char) -> &str {
    value.strip_suffix(delimiter).unwrap_or(value)
}

fn non_empty(value: &str) -> Option<&str> {
    if value.is_empty() {
        None
    } else {
        Some(value)
    }
}

/// Hide credentials before an entry goes to the log
fn redact(entry: &str) -> String {
    entry
        .split("; ")
        .map(|member| {
            if strip_prefix_ignore_ascii_case(member, "credential=\"").is_some() {
                "credential=\"***\""
            } else {
                member
            }
        })
        .collect::<Vec<_>>()
        .join("; ")
}
