//! # xsk-socket
//!
//! Userspace AF_XDP: a frame arena registered as UMEM, the four shared
//! descriptor rings, sockets bound to one interface queue, the XDP program
//! that redirects packets into them and a batch loop on top.
//!
//! ```no_run
//! use xsk_socket::{AttachOptions, IoLoop, PollStrategy, RedirectProgram, SocketBuilder, Verdict};
//!
//! # fn main() -> xsk_socket::Result<()> {
//! let if_index = xsk_socket::netdev::if_index("eth0")?;
//! let mut socket = SocketBuilder::new().frame_count(4096).create()?;
//! socket.bind(if_index, 0)?;
//! let mut program = RedirectProgram::attach(if_index, AttachOptions::default())?;
//! program.update_map(0, &socket)?;
//!
//! let mut io = IoLoop::new(socket, 64, PollStrategy::Busy)?;
//! io.run_once(|_packet| Verdict::Recycle)?;
//! # Ok(())
//! # }
//! ```

pub mod arena;
pub mod config;
pub mod error;
pub mod frame;
pub mod insn;
pub mod io_loop;
pub mod mmap;
pub mod netdev;
pub mod poll;
pub mod program;
pub mod ring;
pub mod socket;
pub mod stats;

pub use arena::{Arena, FramePool, SharedArena};
pub use config::{BusyPoll, XdpConfig};
pub use error::{Result, XskError};
pub use frame::Frame;
pub use io_loop::{IoLoop, PollStrategy, Verdict};
pub use poll::{CloseHandle, Interest, Readiness};
pub use program::{AttachOptions, Fallback, RedirectPolicy, RedirectProgram, XdpMode};
pub use ring::{Ring, RingCons, RingProd, XdpDesc};
pub use socket::{Socket, SocketBuilder, SocketState};
pub use stats::{KernelStats, SocketStats};

#[cfg(test)]
mod testing;
#[cfg(test)]
mod tests;
