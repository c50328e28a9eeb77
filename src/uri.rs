use std::fmt;
use std::str::FromStr;

use snafu::{OptionExt, Snafu, ensure};

/// Destination scheme of a collection URI.
///
/// `FileFlush` is a file destination synced to disk after every record.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Scheme {
    File,
    FileFlush,
    Tcp,
    Udp,
}

impl Scheme {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::File => "file",
            Self::FileFlush => "flush",
            Self::Tcp => "tcp",
            Self::Udp => "udp",
        }
    }

    fn parse(token: &str) -> Option<Self> {
        Some(match token {
            "file" => Self::File,
            "flush" => Self::FileFlush,
            "tcp" => Self::Tcp,
            "udp" => Self::Udp,
            _ => return None,
        })
    }

    pub fn is_file(self) -> bool {
        matches!(self, Self::File | Self::FileFlush)
    }

    pub fn is_network(self) -> bool {
        matches!(self, Self::Tcp | Self::Udp)
    }
}

impl fmt::Display for Scheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A collection destination of the form `[scheme:]host[:service]`.
///
/// IPv6 hosts are written in brackets; colons inside the brackets belong to
/// the address. File destinations carry no service.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CollectionUri {
    pub scheme: Option<Scheme>,
    pub host: String,
    pub service: Option<String>,
}

#[derive(Debug, PartialEq, Snafu)]
pub enum UriError {
    #[snafu(display("collection URI is empty"))]
    EmptyUri,
    #[snafu(display("collection URI {uri:?} has no hostname or path"))]
    MissingHost { uri: String },
    #[snafu(display("collection URI {uri:?} has an unterminated address bracket"))]
    UnterminatedBracket { uri: String },
    #[snafu(display("file URI {uri:?} must not carry a service"))]
    ServiceOnFileUri { uri: String },
    #[snafu(display("collection URI {uri:?} has trailing tokens"))]
    TrailingTokens { uri: String },
}

impl CollectionUri {
    pub fn parse(uri: &str) -> Result<Self, UriError> {
        ensure!(!uri.is_empty(), EmptyUriSnafu);

        if let Some(open) = uri.find('[') {
            return Self::parse_bracketed(uri, open);
        }

        let mut tokens = uri.splitn(3, ':');
        let first = tokens.next().unwrap_or_default();
        let second = tokens.next();
        let third = tokens.next();

        match (second, third) {
            (None, _) => {
                ensure!(!first.is_empty(), MissingHostSnafu { uri });
                // A bare token that happens to spell a scheme is a likely
                // user error; take it as a hostname but say so.
                if Scheme::parse(first).is_some() {
                    warn!(
                        message = "Collection URI looks like a bare scheme; treating it as a hostname.",
                        uri = %uri,
                    );
                }
                Ok(Self {
                    scheme: None,
                    host: first.to_owned(),
                    service: None,
                })
            }
            (Some(second), None) => {
                ensure!(
                    !first.is_empty() && !second.is_empty(),
                    MissingHostSnafu { uri }
                );
                match Scheme::parse(first) {
                    Some(scheme) => Ok(Self {
                        scheme: Some(scheme),
                        host: second.to_owned(),
                        service: None,
                    }),
                    None => Ok(Self {
                        scheme: None,
                        host: first.to_owned(),
                        service: Some(second.to_owned()),
                    }),
                }
            }
            (Some(second), Some(third)) => {
                ensure!(
                    !first.is_empty() && !second.is_empty() && !third.is_empty(),
                    MissingHostSnafu { uri }
                );
                let scheme = match Scheme::parse(first) {
                    Some(scheme) if scheme.is_file() => {
                        return ServiceOnFileUriSnafu { uri }.fail();
                    }
                    Some(scheme) => scheme,
                    None => {
                        warn!(
                            message = "Collection URI has an unknown scheme; assuming tcp.",
                            uri = %uri,
                            scheme = %first,
                        );
                        Scheme::Tcp
                    }
                };
                Ok(Self {
                    scheme: Some(scheme),
                    host: second.to_owned(),
                    service: Some(third.to_owned()),
                })
            }
        }
    }

    fn parse_bracketed(uri: &str, open: usize) -> Result<Self, UriError> {
        let close = uri[open..]
            .find(']')
            .map(|i| open + i)
            .context(UnterminatedBracketSnafu { uri })?;
        let host = &uri[open + 1..close];
        ensure!(!host.is_empty(), MissingHostSnafu { uri });

        let scheme = match uri[..open].strip_suffix(':') {
            None if open == 0 => None,
            Some(token) if !token.is_empty() && !token.contains(':') => {
                match Scheme::parse(token) {
                    Some(scheme) if scheme.is_file() => None, // `file:[..]` makes no sense
                    Some(scheme) => Some(scheme),
                    None => {
                        warn!(
                            message = "Collection URI has an unknown scheme; assuming tcp.",
                            uri = %uri,
                            scheme = %token,
                        );
                        Some(Scheme::Tcp)
                    }
                }
            }
            _ => return MissingHostSnafu { uri }.fail(),
        };

        let service = match &uri[close + 1..] {
            "" => None,
            rest => Some(
                rest.strip_prefix(':')
                    .filter(|s| !s.is_empty() && !s.contains(':'))
                    .context(TrailingTokensSnafu { uri })?
                    .to_owned(),
            ),
        };

        Ok(Self {
            scheme,
            host: host.to_owned(),
            service,
        })
    }
}

impl FromStr for CollectionUri {
    type Err = UriError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for CollectionUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(scheme) = self.scheme {
            write!(f, "{scheme}:")?;
        }
        if self.host.contains(':') {
            write!(f, "[{}]", self.host)?;
        } else {
            f.write_str(&self.host)?;
        }
        if let Some(service) = &self.service {
            write!(f, ":{service}")?;
        }
        Ok(())
    }
}

/// Resolves a service name or port literal to a port number.
///
/// The system services database is consulted first, then a numeric parse;
/// failing both, the default is returned with a warning.
pub fn resolve_service(service: &str, default: u16) -> u16 {
    if let Some(port) = lookup_services_db(service) {
        return port;
    }
    if let Ok(port) = service.parse::<u16>() {
        return port;
    }
    warn!(
        message = "Could not resolve service; using the default port.",
        service = %service,
        default = %default,
    );
    default
}

fn lookup_services_db(name: &str) -> Option<u16> {
    let db = std::fs::read_to_string("/etc/services").ok()?;
    for line in db.lines() {
        let line = line.split('#').next().unwrap_or("");
        let mut tokens = line.split_whitespace();
        let Some(service) = tokens.next() else {
            continue;
        };
        let Some(port_proto) = tokens.next() else {
            continue;
        };
        let Some((port, _proto)) = port_proto.split_once('/') else {
            continue;
        };
        let aliases: Vec<&str> = tokens.collect();
        if service == name || aliases.contains(&name) {
            if let Ok(port) = port.parse() {
                return Some(port);
            }
        }
    }
    None
}
