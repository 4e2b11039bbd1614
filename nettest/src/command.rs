use caps::{CapSet, Capability};
use std::ffi::OsString;
use std::io::{Error, Result};
use std::process::{Command, Stdio};

/// Set to re-run the test binary under `sudo` when capabilities are missing.
pub const SUDO_ENV: &str = "NETTEST_SUDO";

pub fn is_root() -> bool {
    unsafe { libc::geteuid() == 0 }
}

/// Runs a shell command as root, through `sudo -n` unless already root.
pub fn execute_sudo_command(command: &str) -> Result<()> {
    let mut cmd = if is_root() {
        Command::new("sh")
    } else {
        let mut sudo = Command::new("sudo");
        sudo.arg("-n").arg("sh");
        sudo
    };
    let output = cmd
        .arg("-c")
        .arg(command)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()?;

    if !output.status.success() {
        return Err(Error::other(format!(
            "command `{command}` failed with status {}: {}",
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }
    log::info!("command succeeded: {command}");
    log::debug!("output: {}", String::from_utf8_lossy(&output.stdout));
    Ok(())
}

pub fn init_logging() {
    let _ = env_logger::builder()
        .filter_level(log::LevelFilter::Info)
        .parse_default_env()
        .try_init();
}

/// Initializes logging and makes `needed` effective, raising them from the
/// permitted set where possible.
///
/// Returns `false` when some capability is still missing. With
/// `NETTEST_SUDO` set, a non-root process re-executes itself under `sudo`
/// instead and does not return.
pub fn setup(needed: &[Capability]) -> Result<bool> {
    init_logging();
    let mut missing = Vec::new();
    for &cap in needed {
        if has_effective(cap) {
            continue;
        }
        let permitted = caps::has_cap(None, CapSet::Permitted, cap).unwrap_or(false);
        if permitted && caps::raise(None, CapSet::Effective, cap).is_ok() {
            log::debug!("raised {cap}");
            continue;
        }
        missing.push(cap);
    }
    if missing.is_empty() {
        return Ok(true);
    }
    log::warn!("missing capabilities: {missing:?}");
    if std::env::var_os(SUDO_ENV).is_some() && !is_root() {
        return Err(reexec_with_sudo());
    }
    Ok(false)
}

fn has_effective(cap: Capability) -> bool {
    caps::has_cap(None, CapSet::Effective, cap).unwrap_or(false)
}

fn reexec_with_sudo() -> Error {
    let args: Vec<OsString> = std::env::args_os().collect();
    log::info!("re-executing {:?} under sudo", args.first());
    let err = exec::Command::new("sudo").arg("-n").arg("-E").args(&args).exec();
    Error::other(format!("failed to re-execute under sudo: {err}"))
}
