use crate::command::execute_sudo_command;
use eui48::MacAddress;
use std::io::{Error, ErrorKind, Result};
use std::str::FromStr as _;

/// Creates `{dev_prefix}0` and `{dev_prefix}1`, addresses them and brings
/// both ends up.
pub fn setup_pair(dev_prefix: &str, ip_prefix: &str) -> Result<()> {
    log::info!("creating veth pair {dev_prefix}0 + {dev_prefix}1");
    execute_sudo_command(&format!(
        "ip link add {dev_prefix}0 type veth peer name {dev_prefix}1"
    ))?;
    for (end, host) in [(0, 100), (1, 101)] {
        let dev = format!("{dev_prefix}{end}");
        disable_ipv6(&dev)?;
        set_ipv4_addr(&dev, &format!("{ip_prefix}{host}"))?;
        set_link_up(&dev)?;
    }
    Ok(())
}

pub fn teardown_pair(prefix: &str) -> Result<()> {
    log::info!("tearing down veth pair {prefix}0");
    execute_sudo_command(&format!("ip link del {prefix}0"))
}

/// `Ok` if the pair exists, `NotFound` otherwise.
pub fn check_pair(prefix: &str) -> Result<()> {
    let output = std::process::Command::new("ip")
        .arg("link")
        .arg("show")
        .arg(format!("{prefix}0"))
        .output()?;
    if output.status.success() {
        Ok(())
    } else {
        Err(Error::new(
            ErrorKind::NotFound,
            format!("veth pair {prefix}0 does not exist"),
        ))
    }
}

pub fn set_link_up(dev: &str) -> Result<()> {
    log::info!("setting interface {dev} up");
    execute_sudo_command(&format!("ip link set {dev} up"))
}

pub fn set_ipv4_addr(dev: &str, addr: &str) -> Result<()> {
    log::info!("setting IPv4 address {addr} on {dev}");
    execute_sudo_command(&format!("ip addr add {addr}/24 dev {dev}"))
}

// keeps router solicitations and DAD probes off the wire
fn disable_ipv6(dev: &str) -> Result<()> {
    execute_sudo_command(&format!("sysctl -qw net.ipv6.conf.{dev}.disable_ipv6=1"))
}

/// Reads the MAC address of `dev` from sysfs.
pub fn mac_address(dev: &str) -> Result<[u8; 6]> {
    let text = std::fs::read_to_string(format!("/sys/class/net/{dev}/address"))?;
    MacAddress::from_str(text.trim())
        .map(|mac| mac.to_array())
        .map_err(|e| Error::new(ErrorKind::InvalidData, format!("{dev}: invalid MAC address: {e}")))
}
