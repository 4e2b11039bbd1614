//! # Redirect Program Manager
//!
//! ## Purpose
//!
//! Packets only reach an AF_XDP socket if an XDP program on the interface
//! redirects them into an `XSKMAP`. `RedirectProgram` owns that program and
//! its map for one interface.
//!
//! ## How it works
//!
//! `attach` creates the `XSKMAP` (key: queue id, value: socket fd), assembles
//! the program for the chosen `RedirectPolicy`, loads it and attaches it to
//! the interface. A queue without a map entry gets the fallback action, so
//! an empty map passes traffic to the kernel stack by default.
//!
//! Map updates go through `bpf_map_update_elem`/`bpf_map_delete_elem`, which
//! replace an entry in one step: the datapath sees either the old or the new
//! socket.
//!
//! With `chain` set, an already attached program is taken over atomically
//! with `XDP_FLAGS_REPLACE` and put back on `detach`. Without it an occupied
//! hook is an `AlreadyAttached` error.
//!
//! `detach` is idempotent and also runs on drop. It only removes the program
//! if it is still the one this handle attached.
//!
//! ## Main components
//!
//! - `RedirectProgram`: the attachment handle.
//! - `AttachOptions`, `RedirectPolicy`, `Fallback`, `XdpMode`.

use crate::arena::FramePool;
use crate::error::{Result, XskError, errno_error, permission_denied};
use crate::insn::{self, Insn, XDP_DROP, XDP_PASS};
use crate::socket::{Socket, SocketState};
use caps::{CapSet, Capability};
use std::collections::BTreeMap;
use std::ffi::CString;
use std::mem::size_of;
use std::os::fd::{AsRawFd as _, FromRawFd as _, OwnedFd, RawFd};

const MAP_NAME: &str = "xsks_map";
const PROG_NAME: &str = "xsk_redirect";
const LOG_SIZE: usize = 64 * 1024;

/// Which packets the program redirects.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum RedirectPolicy {
    /// Every packet of a queue with a registered socket.
    AllQueues,
    /// Only Ethernet frames with this EtherType (host byte order, e.g. `0x88b5`).
    EtherType(u16),
}

/// Verdict for packets that are not redirected.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Fallback {
    /// Hand to the kernel network stack.
    Pass,
    Drop,
}

impl Fallback {
    fn action(&self) -> u32 {
        match self {
            Fallback::Pass => XDP_PASS,
            Fallback::Drop => XDP_DROP,
        }
    }
}

/// Where the program runs.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum XdpMode {
    /// Driver mode when available, generic otherwise.
    Auto,
    /// Driver (native) mode only.
    Native,
    /// Generic (skb) mode, works on any interface.
    Generic,
}

impl XdpMode {
    fn flags(&self) -> u32 {
        match self {
            XdpMode::Auto => 0,
            XdpMode::Native => libbpf_sys::XDP_FLAGS_DRV_MODE,
            XdpMode::Generic => libbpf_sys::XDP_FLAGS_SKB_MODE,
        }
    }
}

#[derive(Debug, Copy, Clone)]
pub struct AttachOptions {
    pub policy: RedirectPolicy,
    pub fallback: Fallback,
    pub mode: XdpMode,
    /// Take over an already attached program instead of failing, and restore
    /// it on detach.
    pub chain: bool,
    /// Capacity of the map; queue ids must be below it.
    pub max_queues: u32,
}

impl Default for AttachOptions {
    fn default() -> Self {
        AttachOptions {
            policy: RedirectPolicy::AllQueues,
            fallback: Fallback::Pass,
            mode: XdpMode::Auto,
            chain: false,
            max_queues: 64,
        }
    }
}

/// An XDP redirect program attached to one interface.
pub struct RedirectProgram {
    if_index: u32,
    prog_fd: OwnedFd,
    map_fd: OwnedFd,
    prog_id: u32,
    mode_flags: u32,
    max_queues: u32,
    /// Program replaced by `chain`, restored on detach.
    previous: Option<OwnedFd>,
    entries: BTreeMap<u32, RawFd>,
    attached: bool,
}

impl RedirectProgram {
    /// Loads the redirect program and attaches it to `if_index`.
    pub fn attach(if_index: u32, options: AttachOptions) -> Result<Self> {
        if options.max_queues == 0 {
            return Err(XskError::InvalidConfig("max_queues must be positive".into()));
        }
        if !caps::has_cap(None, CapSet::Effective, Capability::CAP_NET_ADMIN).unwrap_or(false) {
            return Err(permission_denied(
                "XDP attach",
                &[Capability::CAP_NET_ADMIN, Capability::CAP_BPF],
            ));
        }
        let mode_flags = options.mode.flags();

        let current = query_prog_id(if_index, mode_flags)?;
        let previous = match (current, options.chain) {
            (0, _) => None,
            (prog_id, false) => return Err(XskError::AlreadyAttached { if_index, prog_id }),
            (prog_id, true) => {
                let fd = unsafe { libbpf_sys::bpf_prog_get_fd_by_id(prog_id) };
                if fd < 0 {
                    return Err(bpf_error(-fd, "failed to open attached program"));
                }
                log::info!("interface {if_index}: taking over XDP program {prog_id}");
                Some(unsafe { OwnedFd::from_raw_fd(fd) })
            }
        };

        let map_fd = create_xskmap(options.max_queues)?;
        let prog = match options.policy {
            RedirectPolicy::AllQueues => {
                insn::redirect_all(map_fd.as_raw_fd(), options.fallback.action())
            }
            RedirectPolicy::EtherType(ethertype) => insn::redirect_ethertype(
                map_fd.as_raw_fd(),
                ethertype,
                options.fallback.action(),
            ),
        };
        let prog_fd = load_program(&prog)?;

        let mut attach_opts: libbpf_sys::bpf_xdp_attach_opts = unsafe { std::mem::zeroed() };
        attach_opts.sz = size_of::<libbpf_sys::bpf_xdp_attach_opts>() as _;
        let flags = match &previous {
            Some(old) => {
                attach_opts.old_prog_fd = old.as_raw_fd();
                mode_flags | libbpf_sys::XDP_FLAGS_REPLACE
            }
            None => mode_flags | libbpf_sys::XDP_FLAGS_UPDATE_IF_NOEXIST,
        };
        let ret = unsafe {
            libbpf_sys::bpf_xdp_attach(
                if_index as libc::c_int,
                prog_fd.as_raw_fd(),
                flags,
                &attach_opts,
            )
        };
        if ret < 0 {
            return Err(match -ret {
                libc::EEXIST | libc::EBUSY => XskError::AlreadyAttached {
                    if_index,
                    prog_id: query_prog_id(if_index, mode_flags).unwrap_or(0),
                },
                libc::ENODEV => XskError::InterfaceNotFound(format!("index {if_index}")),
                errno => bpf_error(errno, "failed to attach XDP program"),
            });
        }

        let prog_id = query_prog_id(if_index, mode_flags)?;
        log::info!(
            "interface {if_index}: attached redirect program {prog_id} ({:?}, fallback {:?}, {:?} mode)",
            options.policy,
            options.fallback,
            options.mode
        );
        Ok(RedirectProgram {
            if_index,
            prog_fd,
            map_fd,
            prog_id,
            mode_flags,
            max_queues: options.max_queues,
            previous,
            entries: BTreeMap::new(),
            attached: true,
        })
    }

    pub fn if_index(&self) -> u32 {
        self.if_index
    }

    /// Kernel id of the attached program.
    pub fn prog_id(&self) -> u32 {
        self.prog_id
    }

    pub fn is_attached(&self) -> bool {
        self.attached
    }

    /// Routes packets of `queue_id` to `socket`, replacing any earlier entry.
    pub fn update_map<P: FramePool>(&mut self, queue_id: u32, socket: &Socket<P>) -> Result<()> {
        self.expect_attached()?;
        if queue_id >= self.max_queues {
            return Err(XskError::InvalidConfig(format!(
                "queue {queue_id} is outside the map of {} queues",
                self.max_queues
            )));
        }
        if !matches!(socket.state(), SocketState::Bound | SocketState::Active) {
            return Err(XskError::InvalidState {
                expected: "bound",
                found: socket.state().name(),
            });
        }
        check_binding(self.if_index, queue_id, socket.if_index(), socket.queue_id())?;
        let fd = socket.raw_fd().ok_or(XskError::Closed)?;
        let ret = unsafe {
            libbpf_sys::bpf_map_update_elem(
                self.map_fd.as_raw_fd(),
                &queue_id as *const u32 as *const libc::c_void,
                &fd as *const RawFd as *const libc::c_void,
                libbpf_sys::BPF_ANY as u64,
            )
        };
        if ret < 0 {
            return Err(bpf_error(-ret, "failed to update XSKMAP"));
        }
        self.entries.insert(queue_id, fd);
        log::debug!(
            "interface {}: queue {queue_id} -> socket fd {fd}",
            self.if_index
        );
        Ok(())
    }

    /// Removes the entry of `queue_id`; its packets get the fallback action
    /// again. Returns `false` when there was no entry.
    pub fn remove_map(&mut self, queue_id: u32) -> Result<bool> {
        self.expect_attached()?;
        let ret = unsafe {
            libbpf_sys::bpf_map_delete_elem(
                self.map_fd.as_raw_fd(),
                &queue_id as *const u32 as *const libc::c_void,
            )
        };
        if ret < 0 {
            return match -ret {
                libc::ENOENT => {
                    self.entries.remove(&queue_id);
                    Ok(false)
                }
                errno => Err(bpf_error(errno, "failed to delete XSKMAP entry")),
            };
        }
        self.entries.remove(&queue_id);
        Ok(true)
    }

    /// Current `(queue_id, socket fd)` entries, as set through this handle.
    pub fn entries(&self) -> impl Iterator<Item = (u32, RawFd)> + '_ {
        self.entries.iter().map(|(queue, fd)| (*queue, *fd))
    }

    fn expect_attached(&self) -> Result<()> {
        if self.attached {
            return Ok(());
        }
        Err(XskError::InvalidState {
            expected: "attached",
            found: "detached",
        })
    }

    /// Removes the program from the interface, restoring a program taken
    /// over with `chain`. Sockets stay usable but receive nothing further.
    pub fn detach(&mut self) -> Result<()> {
        if !self.attached {
            return Ok(());
        }
        let mut opts: libbpf_sys::bpf_xdp_attach_opts = unsafe { std::mem::zeroed() };
        opts.sz = size_of::<libbpf_sys::bpf_xdp_attach_opts>() as _;
        opts.old_prog_fd = self.prog_fd.as_raw_fd();
        let new_fd = self.previous.as_ref().map_or(-1, |fd| fd.as_raw_fd());
        let ret = unsafe {
            libbpf_sys::bpf_xdp_attach(
                self.if_index as libc::c_int,
                new_fd,
                self.mode_flags | libbpf_sys::XDP_FLAGS_REPLACE,
                &opts,
            )
        };
        let removed = detach_outcome(ret)?;
        self.attached = false;
        self.entries.clear();
        if removed {
            log::info!(
                "interface {}: detached redirect program {}{}",
                self.if_index,
                self.prog_id,
                if self.previous.is_some() {
                    " and restored the previous program"
                } else {
                    ""
                }
            );
        } else {
            log::warn!(
                "interface {}: redirect program {} was no longer attached",
                self.if_index,
                self.prog_id
            );
        }
        Ok(())
    }
}

impl Drop for RedirectProgram {
    fn drop(&mut self) {
        if let Err(e) = self.detach() {
            log::error!("interface {}: {e}", self.if_index);
        }
    }
}

/// Interprets the result of the detaching `bpf_xdp_attach` call: `Ok(true)`
/// when the program was removed, `Ok(false)` when it was already gone. Any
/// error leaves the program attached.
fn detach_outcome(ret: i32) -> Result<bool> {
    if ret >= 0 {
        return Ok(true);
    }
    match -ret {
        // replaced by someone else, or the interface is gone
        libc::EEXIST | libc::ENODEV => Ok(false),
        errno => Err(bpf_error(errno, "failed to detach XDP program")),
    }
}

/// The kernel only delivers a redirect to a socket bound to the same
/// interface and queue the packet arrived on.
fn check_binding(if_index: u32, queue_id: u32, socket_if: u32, socket_queue: u32) -> Result<()> {
    if socket_if != if_index || socket_queue != queue_id {
        return Err(XskError::InvalidConfig(format!(
            "socket is bound to interface {socket_if} queue {socket_queue}, \
             not interface {if_index} queue {queue_id}"
        )));
    }
    Ok(())
}

fn bpf_error(errno: i32, what: &str) -> XskError {
    match errno {
        libc::EPERM | libc::EACCES => permission_denied(
            what,
            &[Capability::CAP_BPF, Capability::CAP_NET_ADMIN],
        ),
        _ => errno_error(errno, what),
    }
}

/// Id of the program attached in `mode_flags` mode, `0` if none.
fn query_prog_id(if_index: u32, mode_flags: u32) -> Result<u32> {
    let mut prog_id: u32 = 0;
    let ret = unsafe {
        libbpf_sys::bpf_xdp_query_id(if_index as libc::c_int, mode_flags as libc::c_int, &mut prog_id)
    };
    if ret < 0 {
        return Err(match -ret {
            libc::ENODEV => XskError::InterfaceNotFound(format!("index {if_index}")),
            errno => bpf_error(errno, "failed to query XDP program"),
        });
    }
    Ok(prog_id)
}

fn create_xskmap(max_entries: u32) -> Result<OwnedFd> {
    let name = CString::new(MAP_NAME).map_err(|e| XskError::Load(e.to_string()))?;
    let fd = unsafe {
        libbpf_sys::bpf_map_create(
            libbpf_sys::BPF_MAP_TYPE_XSKMAP,
            name.as_ptr(),
            size_of::<u32>() as u32,
            size_of::<u32>() as u32,
            max_entries,
            std::ptr::null(),
        )
    };
    if fd < 0 {
        return Err(bpf_error(-fd, "failed to create XSKMAP"));
    }
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

/// Loads the program. On rejection the load is repeated with the verifier
/// log enabled so the error carries the reason.
fn load_program(prog: &[Insn]) -> Result<OwnedFd> {
    let name = CString::new(PROG_NAME).map_err(|e| XskError::Load(e.to_string()))?;
    let license = CString::new("GPL").map_err(|e| XskError::Load(e.to_string()))?;

    let load = |log: Option<&mut Vec<u8>>| unsafe {
        let mut opts: libbpf_sys::bpf_prog_load_opts = std::mem::zeroed();
        opts.sz = size_of::<libbpf_sys::bpf_prog_load_opts>() as _;
        if let Some(buf) = log {
            opts.log_level = 1;
            opts.log_size = buf.len() as u32;
            opts.log_buf = buf.as_mut_ptr() as *mut libc::c_char;
        }
        libbpf_sys::bpf_prog_load(
            libbpf_sys::BPF_PROG_TYPE_XDP,
            name.as_ptr(),
            license.as_ptr(),
            prog.as_ptr() as *const libbpf_sys::bpf_insn,
            prog.len() as _,
            &mut opts,
        )
    };

    let fd = load(None);
    if fd >= 0 {
        return Ok(unsafe { OwnedFd::from_raw_fd(fd) });
    }
    if matches!(-fd, libc::EPERM | libc::EACCES) {
        return Err(bpf_error(-fd, "failed to load XDP program"));
    }

    let mut log = vec![0u8; LOG_SIZE];
    let retry = load(Some(&mut log));
    if retry >= 0 {
        return Ok(unsafe { OwnedFd::from_raw_fd(retry) });
    }
    let end = log.iter().position(|b| *b == 0).unwrap_or(log.len());
    let text = String::from_utf8_lossy(&log[..end]).trim().to_string();
    if text.is_empty() {
        return Err(bpf_error(-fd, "failed to load XDP program"));
    }
    Err(XskError::Load(text))
}
