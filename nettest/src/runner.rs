use crate::veth;
use anyhow::{Context as _, Result, bail};
use std::ffi::CString;
use std::fmt::{Display, Formatter};
use std::future::Future;
use std::io::ErrorKind;
use std::net::Ipv4Addr;
use std::time::Duration;

pub const DEV_PREFIX: &str = "xskVeth";
pub const IP_PREFIX: &str = "192.168.77.";
/// Upper bound for one test body.
pub const TEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Clone, Debug)]
pub struct Host {
    pub if_dev: String,
    pub if_index: u32,
    pub ip_addr: Ipv4Addr,
    pub mac: [u8; 6],
}

impl Display for Host {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Host {{ ip: {}, if_dev: {}, if_index: {} }}",
            self.ip_addr, self.if_dev, self.if_index
        )
    }
}

impl Host {
    pub fn lookup(if_dev: &str, ip: &str) -> Result<Self> {
        let name = CString::new(if_dev)?;
        let if_index = unsafe { libc::if_nametoindex(name.as_ptr()) };
        if if_index == 0 {
            bail!("interface {if_dev} not found");
        }
        Ok(Host {
            if_dev: if_dev.to_string(),
            if_index,
            ip_addr: ip.parse().with_context(|| format!("bad address {ip}"))?,
            mac: veth::mac_address(if_dev)?,
        })
    }
}

/// The two ends of the test veth pair: packets sent on one arrive on the other.
pub struct HostPair {
    pub host0: Host,
    pub host1: Host,
}

impl HostPair {
    pub fn from_prefixes(dev_prefix: &str, ip_prefix: &str) -> Result<Self> {
        Ok(HostPair {
            host0: Host::lookup(&format!("{dev_prefix}0"), &format!("{ip_prefix}100"))?,
            host1: Host::lookup(&format!("{dev_prefix}1"), &format!("{ip_prefix}101"))?,
        })
    }
}

/// Runs `test` against the veth pair, creating it first if needed. A pair
/// created here is removed afterwards whether the test passed or not.
/// The test fails if it takes longer than `TEST_TIMEOUT`.
pub async fn run_test_with_pair<F, Fut>(test: F) -> Result<()>
where
    F: FnOnce(HostPair) -> Fut,
    Fut: Future<Output = Result<()>>,
{
    let created = match veth::check_pair(DEV_PREFIX) {
        Ok(()) => false,
        Err(e) if e.kind() == ErrorKind::NotFound => {
            veth::setup_pair(DEV_PREFIX, IP_PREFIX)?;
            true
        }
        Err(e) => return Err(e.into()),
    };
    let result = match HostPair::from_prefixes(DEV_PREFIX, IP_PREFIX) {
        Ok(pair) => {
            log::info!("running with {} and {}", pair.host0, pair.host1);
            match tokio::time::timeout(TEST_TIMEOUT, test(pair)).await {
                Ok(result) => result,
                Err(_) => Err(anyhow::anyhow!("test timed out after {TEST_TIMEOUT:?}")),
            }
        }
        Err(e) => Err(e),
    };
    if created {
        if let Err(e) = veth::teardown_pair(DEV_PREFIX) {
            log::warn!("failed to remove veth pair: {e}");
        }
    }
    result
}
