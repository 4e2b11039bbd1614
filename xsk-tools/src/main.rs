//
// xsk-bench - AF_XDP throughput bench
//
//   rx-drop   receive on one queue and recycle every frame
//   bounce    swap the Ethernet addresses and transmit each frame in place
//   tx-flood  transmit a fixed UDP packet as fast as the TX ring drains
//
// The receive modes attach the redirect program to the interface and map the
// queue to the bench socket. Rates are logged every --interval; Ctrl-C or
// --duration stops the run.
//

mod meter;

use anyhow::{Context as _, Result, anyhow, bail};
use clap::{Parser, ValueEnum};
use etherparse::PacketBuilder;
use eui48::MacAddress;
use meter::Meter;
use std::net::SocketAddrV4;
use std::str::FromStr as _;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use xsk_socket::{
    AttachOptions, BusyPoll, CloseHandle, Frame, Interest, IoLoop, PollStrategy, RedirectProgram,
    Socket, SocketBuilder, Verdict, XdpConfig, XdpMode, XskError, netdev,
};

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
enum Mode {
    RxDrop,
    Bounce,
    TxFlood,
}

#[derive(Parser, Debug, Clone)]
#[command(version, about = "AF_XDP throughput bench")]
struct Args {
    /// interface name
    interface: String,

    #[clap(short, long, value_enum, default_value_t = Mode::RxDrop)]
    mode: Mode,

    /// queue to bind
    #[clap(short, long, default_value_t = 0)]
    queue: u32,

    /// frames per batch
    #[clap(short, long, default_value_t = 64)]
    batch: usize,

    #[clap(long, default_value_t = 4096)]
    frames: u32,

    #[clap(long, default_value_t = 2048)]
    frame_size: u32,

    /// size of each of the four rings
    #[clap(long, default_value_t = 2048)]
    ring_size: u32,

    /// fail instead of falling back to copy mode
    #[clap(long, conflicts_with = "copy")]
    zero_copy: bool,

    /// force copy mode
    #[clap(long)]
    copy: bool,

    /// attach in generic (skb) mode
    #[clap(long)]
    generic: bool,

    /// take over an XDP program already on the interface
    #[clap(long)]
    chain: bool,

    /// enable socket busy polling
    #[clap(long)]
    busy_poll: bool,

    /// sleep in poll() when idle instead of spinning
    #[clap(long)]
    wait: bool,

    /// report interval like 1s or 500ms
    #[clap(long, default_value = "1s", value_parser = humantime::parse_duration)]
    interval: Duration,

    /// stop after this long, like 30s
    #[clap(long, value_parser = humantime::parse_duration)]
    duration: Option<Duration>,

    /// tx-flood source ip:port
    #[clap(long, default_value = "10.0.0.1:9000")]
    src: SocketAddrV4,

    /// tx-flood destination ip:port
    #[clap(long, default_value = "10.0.0.2:9000")]
    dst: SocketAddrV4,

    /// tx-flood destination MAC
    #[clap(long, default_value = "ff:ff:ff:ff:ff:ff")]
    dst_mac: String,

    /// tx-flood frame length including headers
    #[clap(long, default_value_t = 64)]
    packet_size: usize,
}

impl Args {
    fn xdp_config(&self) -> Result<XdpConfig> {
        let mut config = XdpConfig {
            frame_size: self.frame_size,
            frame_count: self.frames,
            fill_size: self.ring_size,
            comp_size: self.ring_size,
            rx_size: self.ring_size,
            tx_size: self.ring_size,
            zero_copy: if self.copy {
                Some(false)
            } else if self.zero_copy {
                Some(true)
            } else {
                None
            },
            copy_fallback: !self.zero_copy,
            busy_poll: self.busy_poll.then(BusyPoll::default),
            ..Default::default()
        };
        match self.mode {
            Mode::RxDrop => {
                config.tx_size = 0;
                config.comp_size = 0;
            }
            Mode::TxFlood => {
                config.rx_size = 0;
                config.fill_size = 0;
            }
            Mode::Bounce => {}
        }
        config.validate()?;
        Ok(config)
    }

    fn strategy(&self) -> PollStrategy {
        if self.wait {
            PollStrategy::Wait(Some(self.interval))
        } else {
            PollStrategy::Busy
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::builder()
        .filter_level(log::LevelFilter::Info)
        .parse_default_env()
        .init();
    let args = Args::parse();

    if !nettest::command::setup(&[
        caps::Capability::CAP_NET_ADMIN,
        caps::Capability::CAP_NET_RAW,
        caps::Capability::CAP_BPF,
    ])? {
        bail!("xsk-bench needs CAP_NET_ADMIN, CAP_NET_RAW and CAP_BPF");
    }

    let shutdown = CancellationToken::new();
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                log::info!("interrupted");
            }
            shutdown.cancel();
        }
    });
    if let Some(limit) = args.duration {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            tokio::time::sleep(limit).await;
            log::info!("time limit reached");
            shutdown.cancel();
        });
    }

    let stop = Arc::new(AtomicBool::new(false));
    let (ready, bound) = oneshot::channel();
    let mut worker = tokio::task::spawn_blocking({
        let stop = stop.clone();
        move || bench(&args, &stop, ready)
    });

    let closer: Option<CloseHandle> = tokio::select! {
        handle = bound => handle.ok(),
        result = &mut worker => return result?,
    };
    tokio::select! {
        _ = shutdown.cancelled() => {}
        result = &mut worker => return result?,
    }
    stop.store(true, Ordering::Relaxed);
    if let Some(closer) = closer {
        closer.close();
    }
    worker.await?
}

fn bench(args: &Args, stop: &AtomicBool, ready: oneshot::Sender<CloseHandle>) -> Result<()> {
    let if_index = netdev::if_index(&args.interface)?;
    let config = args.xdp_config()?;
    let mut socket = SocketBuilder::new().config(config).create()?;
    socket
        .bind(if_index, args.queue)
        .with_context(|| format!("bind {}:{}", args.interface, args.queue))?;
    log::info!(
        "bound {} queue {} in {} mode",
        args.interface,
        args.queue,
        if socket.is_zero_copy() { "zero-copy" } else { "copy" }
    );
    let _ = ready.send(socket.close_handle());

    if args.mode == Mode::TxFlood {
        return flood(args, socket, stop);
    }

    let mut program = RedirectProgram::attach(
        if_index,
        AttachOptions {
            mode: if args.generic { XdpMode::Generic } else { XdpMode::Auto },
            chain: args.chain,
            ..Default::default()
        },
    )?;
    program.update_map(args.queue, &socket)?;
    let mut io = IoLoop::new(socket, args.batch, args.strategy())?;
    let result = receive(&mut io, args, stop);
    if let Err(e) = program.detach() {
        log::error!("failed to detach the redirect program: {e}");
    }
    io.close()?;
    result
}

fn receive(io: &mut IoLoop, args: &Args, stop: &AtomicBool) -> Result<()> {
    let bounce = args.mode == Mode::Bounce;
    let mut meter = Meter::new(args.interval, io.socket().stats());
    while !stop.load(Ordering::Relaxed) {
        let handled = io.run_once(|packet| {
            if bounce && swap_macs(packet) {
                Verdict::Transmit
            } else {
                Verdict::Recycle
            }
        });
        match handled {
            Ok(_) => meter.tick(io.socket().stats()),
            Err(XskError::Closed) => break,
            Err(e) => return Err(e.into()),
        }
    }
    meter.finish(io.socket().stats());
    if let Ok(kernel) = io.socket().kernel_stats() {
        log::info!("kernel: {kernel:?}");
    }
    Ok(())
}

fn swap_macs(packet: &mut [u8]) -> bool {
    if packet.len() < 12 {
        return false;
    }
    let (dst, rest) = packet.split_at_mut(6);
    dst.swap_with_slice(&mut rest[..6]);
    true
}

fn flood(args: &Args, mut socket: Socket, stop: &AtomicBool) -> Result<()> {
    socket.activate()?;
    let src_mac = nettest::veth::mac_address(&args.interface)?;
    let dst_mac = parse_mac(&args.dst_mac)?;
    let template = udp_packet(src_mac, dst_mac, args.src, args.dst, args.packet_size)?;
    log::info!("sending {}-byte packets {} -> {}", template.len(), args.src, args.dst);

    let mut meter = Meter::new(args.interval, socket.stats());
    let mut pending: Vec<Frame> = Vec::with_capacity(args.batch);
    let result = fill_tx(&mut socket, &template, args.batch, &mut pending, &mut meter, stop);

    {
        let mut arena = socket.arena();
        for frame in pending {
            arena.release(frame)?;
        }
    }
    meter.finish(socket.stats());
    socket.close()?;
    result
}

fn fill_tx(
    socket: &mut Socket,
    template: &[u8],
    batch: usize,
    pending: &mut Vec<Frame>,
    meter: &mut Meter,
    stop: &AtomicBool,
) -> Result<()> {
    while !stop.load(Ordering::Relaxed) {
        while pending.len() < batch {
            match socket.allocate_tx() {
                Ok(mut frame) => {
                    socket.arena().write(&mut frame, template)?;
                    pending.push(frame);
                }
                Err(XskError::OutOfFrames(_)) => break,
                Err(XskError::Closed) => return Ok(()),
                Err(e) => return Err(e.into()),
            }
        }
        let sent = match socket.send(pending) {
            Ok(sent) => sent,
            Err(XskError::Closed) => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        if sent == 0 {
            match socket.wait(Interest::Writable, Some(Duration::from_millis(10))) {
                Ok(_) => {}
                Err(XskError::Closed) => return Ok(()),
                Err(e) => return Err(e.into()),
            }
            socket.complete()?;
        }
        meter.tick(socket.stats());
    }
    Ok(())
}

fn udp_packet(
    src_mac: [u8; 6],
    dst_mac: [u8; 6],
    src: SocketAddrV4,
    dst: SocketAddrV4,
    size: usize,
) -> Result<Vec<u8>> {
    let builder = PacketBuilder::ethernet2(src_mac, dst_mac)
        .ipv4(src.ip().octets(), dst.ip().octets(), 64)
        .udp(src.port(), dst.port());
    let payload = vec![0u8; size.saturating_sub(builder.size(0))];
    let mut packet = Vec::with_capacity(builder.size(payload.len()));
    builder.write(&mut packet, &payload)?;
    Ok(packet)
}

fn parse_mac(text: &str) -> Result<[u8; 6]> {
    let mac = MacAddress::from_str(text).map_err(|e| anyhow!("invalid MAC address {text}: {e}"))?;
    Ok(mac.to_array())
}

#[cfg(test)]
mod test {
    use super::*;
    use etherparse::{SlicedPacket, TransportSlice};

    #[test]
    fn args_shape_the_rings() {
        let args = Args::parse_from([
            "xsk-bench", "eth0", "--mode", "tx-flood", "--frames", "256", "--ring-size", "128",
        ]);
        let config = args.xdp_config().unwrap();
        assert_eq!(config.rx_size, 0);
        assert_eq!(config.fill_size, 0);
        assert_eq!(config.tx_size, 128);
        assert_eq!(config.zero_copy, None);
        assert!(config.copy_fallback);

        let args = Args::parse_from(["xsk-bench", "eth0", "--zero-copy", "--interval", "250ms"]);
        let config = args.xdp_config().unwrap();
        assert_eq!(config.tx_size, 0);
        assert_eq!(config.zero_copy, Some(true));
        assert!(!config.copy_fallback);
        assert_eq!(args.interval, Duration::from_millis(250));
    }

    #[test]
    fn oversized_rings_are_rejected() {
        let args =
            Args::parse_from(["xsk-bench", "eth0", "--frames", "64", "--ring-size", "256"]);
        assert!(args.xdp_config().is_err());
    }

    #[test]
    fn flood_packet_has_the_requested_size() {
        let src = "10.0.0.1:9000".parse().unwrap();
        let dst = "10.0.0.2:9001".parse().unwrap();
        let packet = udp_packet([2, 0, 0, 0, 0, 1], [0xff; 6], src, dst, 128).unwrap();
        assert_eq!(packet.len(), 128);
        let sliced = SlicedPacket::from_ethernet(&packet).unwrap();
        let Some(TransportSlice::Udp(udp)) = sliced.transport else {
            panic!("not a UDP packet");
        };
        assert_eq!(udp.destination_port(), 9001);
    }

    #[test]
    fn macs_parse_and_swap() {
        let mac = parse_mac("aa:bb:cc:00:11:22").unwrap();
        assert_eq!(mac, [0xaa, 0xbb, 0xcc, 0, 0x11, 0x22]);
        assert!(parse_mac("aa:bb").is_err());
        assert!(parse_mac("aa:bb:cc:00:11:22:33").is_err());

        let mut frame = [1, 1, 1, 1, 1, 1, 2, 2, 2, 2, 2, 2, 8, 0];
        assert!(swap_macs(&mut frame));
        assert_eq!(&frame[..12], &[2, 2, 2, 2, 2, 2, 1, 1, 1, 1, 1, 1]);
        assert!(!swap_macs(&mut [0u8; 4]));
    }
}
