/// This module implements `Address` which is used for parsing resource
/// strings like "TCPIP0::192.168.1.20::5025::SOCKET" or "/dev/usbtmc0".
use std::fmt::{self, Display, Formatter};
use std::path::PathBuf;
use std::str::FromStr;

use crate::proto::ProtoError;
use crate::DEFAULT_PORT;

/// Transport to reach the instrument.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Address {
    /// Raw SCPI socket on the LAN
    Tcp { host: String, port: u16 },
    /// Linux usbtmc character device
    UsbTmc { path: PathBuf },
    /// VISA resource string, opened through the installed VISA library
    #[cfg(feature = "visa")]
    Visa { resource: String },
}

fn invalid(addr: &str, reason: &str) -> ProtoError {
    ProtoError::InvalidAddress(format!("{}: {}", addr, reason))
}

fn parse_port(addr: &str, port: &str) -> crate::Result<u16> {
    port.parse::<u16>()
        .map_err(|_| invalid(addr, "invalid port number"))
}

impl Address {
    fn parse_visa(addr: &str, splits: &[&str]) -> crate::Result<Self> {
        let class = splits
            .last()
            .map(|s| s.to_lowercase())
            .unwrap_or_default();
        if class == "instr" {
            return Address::visa_instr(addr);
        }
        if class != "socket" {
            return Err(invalid(addr, "unknown resource class"));
        }
        // TCPIP0::host[::port]::SOCKET
        match splits.len() {
            3 => Ok(Address::Tcp {
                host: splits[1].to_string(),
                port: DEFAULT_PORT,
            }),
            4 => Ok(Address::Tcp {
                host: splits[1].to_string(),
                port: parse_port(addr, splits[2])?,
            }),
            _ => Err(invalid(addr, "expected TCPIP::<host>[::<port>]::SOCKET")),
        }
    }

    #[cfg(feature = "visa")]
    fn visa_instr(addr: &str) -> crate::Result<Self> {
        Ok(Address::Visa {
            resource: addr.trim().to_string(),
        })
    }

    #[cfg(not(feature = "visa"))]
    fn visa_instr(addr: &str) -> crate::Result<Self> {
        Err(invalid(
            addr,
            "VISA INSTR resources need the `visa` feature, use a ::SOCKET resource or a usbtmc device instead",
        ))
    }

    fn parse_host_port(addr: &str, host_port: &str) -> crate::Result<Self> {
        if host_port.is_empty() {
            return Err(invalid(addr, "missing host"));
        }
        // IPv6 literals are written as [::1]:5025
        if let Some(rest) = host_port.strip_prefix('[') {
            let (host, tail) = rest
                .split_once(']')
                .ok_or_else(|| invalid(addr, "unterminated IPv6 literal"))?;
            let port = match tail.strip_prefix(':') {
                Some(port) => parse_port(addr, port)?,
                None if tail.is_empty() => DEFAULT_PORT,
                None => return Err(invalid(addr, "unexpected characters after host")),
            };
            return Ok(Address::Tcp {
                host: host.to_string(),
                port,
            });
        }
        match host_port.rsplit_once(':') {
            Some((host, port)) => Ok(Address::Tcp {
                host: host.to_string(),
                port: parse_port(addr, port)?,
            }),
            None => Ok(Address::Tcp {
                host: host_port.to_string(),
                port: DEFAULT_PORT,
            }),
        }
    }
}

impl FromStr for Address {
    type Err = ProtoError;

    fn from_str(addr: &str) -> crate::Result<Self> {
        let trimmed = addr.trim();
        let lower = trimmed.to_lowercase();
        if trimmed.starts_with("/dev/") {
            return Ok(Address::UsbTmc {
                path: PathBuf::from(trimmed),
            });
        }
        if lower.starts_with("usbtmc::") {
            let path = &trimmed["usbtmc::".len()..];
            if path.is_empty() {
                return Err(invalid(addr, "expected usbtmc::<path>"));
            }
            return Ok(Address::UsbTmc {
                path: PathBuf::from(path),
            });
        }
        if lower.starts_with("tcp::") {
            return Address::parse_host_port(addr, &trimmed["tcp::".len()..]);
        }
        if trimmed.starts_with('[') {
            return Address::parse_host_port(addr, trimmed);
        }
        let splits: Vec<&str> = trimmed.split("::").collect();
        let kind = splits[0].to_lowercase();
        if kind.starts_with("tcpip") {
            Address::parse_visa(addr, &splits)
        } else if kind.starts_with("usb") {
            if splits.last().map(|s| s.eq_ignore_ascii_case("instr")) == Some(true) {
                Address::visa_instr(addr)
            } else {
                Err(invalid(addr, "unknown resource class"))
            }
        } else if splits.len() == 1 {
            Address::parse_host_port(addr, trimmed)
        } else {
            Err(invalid(addr, "unknown address type"))
        }
    }
}

impl Display for Address {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Address::Tcp { host, port } if host.contains(':') => {
                write!(f, "tcp::[{}]:{}", host, port)
            }
            Address::Tcp { host, port } => write!(f, "tcp::{}:{}", host, port),
            Address::UsbTmc { path } => write!(f, "usbtmc::{}", path.display()),
            #[cfg(feature = "visa")]
            Address::Visa { resource } => f.write_str(resource),
        }
    }
}
