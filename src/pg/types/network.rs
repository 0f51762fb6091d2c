//! `inet` and `cidr`.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::str::FromStr;

use bytes::{BufMut, BytesMut};

use super::value::PgValue;
use crate::pg::error::{PgError, PgResult};

const PGSQL_AF_INET: u8 = 2;
const PGSQL_AF_INET6: u8 = 3;

/// A host address with its network mask length.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Inet {
    pub addr: IpAddr,
    pub netmask: u8,
}

impl Inet {
    pub fn new(addr: IpAddr, netmask: u8) -> PgResult<Self> {
        if netmask > max_bits(&addr) {
            return Err(PgError::programming(format!(
                "invalid netmask /{} for {}",
                netmask, addr
            )));
        }
        Ok(Inet { addr, netmask })
    }

    pub fn encode_binary(&self, buf: &mut BytesMut) {
        match self.addr {
            IpAddr::V4(v4) => {
                buf.put_slice(&[PGSQL_AF_INET, self.netmask, 0, 4]);
                buf.put_slice(&v4.octets());
            }
            IpAddr::V6(v6) => {
                buf.put_slice(&[PGSQL_AF_INET6, self.netmask, 0, 16]);
                buf.put_slice(&v6.octets());
            }
        }
    }

    /// Decode `inet` or `cidr`; the `is_cidr` flag is ignored.
    pub fn decode_binary(data: &[u8]) -> PgResult<Self> {
        let invalid = || PgError::decode(format!("invalid INET value of {} bytes", data.len()));
        if data.len() < 4 {
            return Err(invalid());
        }
        let (header, addr) = data.split_at(4);
        let (family, netmask, len) = (header[0], header[1], header[3] as usize);
        if addr.len() != len {
            return Err(invalid());
        }
        let addr = match (family, len) {
            (PGSQL_AF_INET, 4) => {
                let octets: [u8; 4] = addr.try_into().map_err(|_| invalid())?;
                IpAddr::V4(Ipv4Addr::from(octets))
            }
            (PGSQL_AF_INET6, 16) => {
                let octets: [u8; 16] = addr.try_into().map_err(|_| invalid())?;
                IpAddr::V6(Ipv6Addr::from(octets))
            }
            _ => return Err(invalid()),
        };
        Ok(Inet { addr, netmask })
    }
}

fn max_bits(addr: &IpAddr) -> u8 {
    match addr {
        IpAddr::V4(_) => 32,
        IpAddr::V6(_) => 128,
    }
}

impl From<IpAddr> for Inet {
    fn from(addr: IpAddr) -> Self {
        Inet {
            netmask: max_bits(&addr),
            addr,
        }
    }
}

/// Host addresses print without a mask, like the server does.
impl fmt::Display for Inet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.netmask == max_bits(&self.addr) {
            write!(f, "{}", self.addr)
        } else {
            write!(f, "{}/{}", self.addr, self.netmask)
        }
    }
}

impl FromStr for Inet {
    type Err = PgError;

    fn from_str(s: &str) -> PgResult<Self> {
        let invalid = || PgError::decode(format!("invalid INET literal: {:?}", s));
        let (addr, mask) = match s.split_once('/') {
            Some((addr, mask)) => (addr, Some(mask)),
            None => (s, None),
        };
        let addr: IpAddr = addr.trim().parse().map_err(|_| invalid())?;
        match mask {
            Some(mask) => Inet::new(addr, mask.trim().parse().map_err(|_| invalid())?),
            None => Ok(Inet::from(addr)),
        }
    }
}

pub fn decode_inet(data: &[u8]) -> PgResult<PgValue> {
    Inet::decode_binary(data).map(PgValue::Inet)
}
