//! Allocate/release addresses from a configured loopback range, backed by
//! `ipnet`'s CIDR arithmetic.

use std::net::{
    IpAddr,
    Ipv4Addr,
};
use std::sync::Mutex;

use ipnet::Ipv4Net;
use tunnelctl_core::error::{
    Error,
    Result,
};
use tunnelctl_core::ports::IpPool;

/// The canonical loopback address, pinned as allocated at construction and
/// never handed out by `acquire_any`.
const CANONICAL: Ipv4Addr = Ipv4Addr::new(127, 0, 0, 1);

pub struct LoopbackPool {
    network: Ipv4Net,
    held: Mutex<Vec<Ipv4Addr>>,
}

impl LoopbackPool {
    /// `cidr` is the contiguous range the pool backs, e.g. `"127.0.0.0/8"`.
    pub fn new(cidr: &str) -> Result<Self> {
        let network: Ipv4Net = cidr
            .parse()
            .map_err(|e| Error::ResourceExhausted(format!("invalid loopback range '{cidr}': {e}")))?;

        if !network.contains(&CANONICAL) {
            return Err(Error::ResourceExhausted(format!(
                "loopback range '{cidr}' does not contain the canonical address {CANONICAL}"
            )));
        }

        Ok(Self {
            network,
            held: Mutex::new(vec![CANONICAL]),
        })
    }
}

impl IpPool for LoopbackPool {
    fn acquire_any(&self) -> Result<IpAddr> {
        let mut held = self.held.lock().expect("loopback pool lock poisoned");
        for candidate in self.network.hosts() {
            if !held.contains(&candidate) {
                held.push(candidate);
                return Ok(IpAddr::V4(candidate));
            }
        }
        Err(Error::ResourceExhausted(format!(
            "loopback range '{}' is exhausted",
            self.network
        )))
    }

    fn acquire_specific(&self, addr: IpAddr) -> Result<()> {
        let IpAddr::V4(addr) = addr else {
            return Err(Error::ResourceExhausted("only IPv4 loopback addresses are supported".into()));
        };
        if !self.network.contains(&addr) {
            return Err(Error::ResourceExhausted(format!(
                "{addr} is outside the configured loopback range '{}'",
                self.network
            )));
        }

        let mut held = self.held.lock().expect("loopback pool lock poisoned");
        if held.contains(&addr) {
            return Err(Error::ResourceExhausted(format!("{addr} is already allocated")));
        }
        held.push(addr);
        Ok(())
    }

    fn release(&self, addr: IpAddr) -> Result<()> {
        let IpAddr::V4(addr) = addr else {
            return Ok(());
        };
        if addr == CANONICAL {
            return Err(Error::ResourceExhausted(
                "the canonical loopback reservation cannot be released".into(),
            ));
        }

        let mut held = self.held.lock().expect("loopback pool lock poisoned");
        held.retain(|a| *a != addr);
        Ok(())
    }
}
