//
// veth_redirect.rs - end-to-end redirect through a veth pair
//
// An AF_XDP socket on host0 transmits IPv4/UDP probes; host1 runs the redirect
// program in generic mode with a socket bound to queue 0. A probe must only
// reach the host1 socket while its queue has an XSKMAP entry; without one the
// program passes the packet to the kernel stack.
//
// Needs CAP_NET_ADMIN and CAP_NET_RAW. Without them the test logs a warning
// and exits successfully; set NETTEST_SUDO=1 to re-run under sudo instead.
//

use anyhow::{Result, bail, ensure};
use caps::Capability;
use etherparse::{PacketBuilder, SlicedPacket, TransportSlice};
use nettest::{Host, HostPair};
use std::time::{Duration, Instant};
use xsk_socket::{
    AttachOptions, Interest, RedirectPolicy, RedirectProgram, Socket, SocketBuilder, XdpMode,
};

const PROBE_PORT: u16 = 9100;
const ETHERTYPE_IPV4: u16 = 0x0800;

#[tokio::main]
async fn main() -> Result<()> {
    let ready = nettest::command::setup(&[Capability::CAP_NET_ADMIN, Capability::CAP_NET_RAW])?;
    if !ready {
        log::warn!("skipping veth_redirect: CAP_NET_ADMIN and CAP_NET_RAW are required");
        return Ok(());
    }
    let result = nettest::run_test_with_pair(|pair| async move {
        tokio::task::spawn_blocking(move || redirect_follows_map(&pair)).await?
    })
    .await;
    match result {
        Ok(()) => {
            log::info!("veth_redirect passed");
            Ok(())
        }
        Err(e) => {
            log::error!("veth_redirect failed: {e:#}");
            Err(e)
        }
    }
}

fn redirect_follows_map(pair: &HostPair) -> Result<()> {
    let (sender, receiver) = (&pair.host0, &pair.host1);

    let mut rx = SocketBuilder::new()
        .frame_count(256)
        .ring_size(128)
        .tx_size(0)
        .zero_copy(Some(false))
        .create()?;
    rx.bind(receiver.if_index, 0)?;
    rx.activate()?;

    let mut tx = SocketBuilder::new()
        .frame_count(64)
        .ring_size(64)
        .rx_size(0)
        .zero_copy(Some(false))
        .create()?;
    tx.bind(sender.if_index, 0)?;
    tx.activate()?;

    let mut program = RedirectProgram::attach(
        receiver.if_index,
        AttachOptions {
            policy: RedirectPolicy::EtherType(ETHERTYPE_IPV4),
            mode: XdpMode::Generic,
            ..Default::default()
        },
    )?;
    log::info!("redirect program {} on {}", program.prog_id(), receiver.if_dev);

    send_probe(&mut tx, sender, receiver, b"unmapped")?;
    ensure!(
        !received(&mut rx, b"unmapped", Duration::from_millis(300))?,
        "probe redirected without a map entry"
    );

    program.update_map(0, &rx)?;
    send_probe(&mut tx, sender, receiver, b"mapped")?;
    ensure!(
        received(&mut rx, b"mapped", Duration::from_secs(2))?,
        "probe did not reach the mapped socket"
    );

    ensure!(program.remove_map(0)?, "queue 0 had no map entry");
    ensure!(!program.remove_map(0)?, "map entry removed twice");
    send_probe(&mut tx, sender, receiver, b"removed")?;
    ensure!(
        !received(&mut rx, b"removed", Duration::from_millis(300))?,
        "probe redirected after the map entry was removed"
    );

    log::info!("rx: {}", rx.stats());
    log::info!("tx: {}", tx.stats());
    program.detach()?;
    ensure!(!program.is_attached());
    rx.close()?;
    tx.close()?;
    Ok(())
}

fn send_probe(tx: &mut Socket, from: &Host, to: &Host, payload: &[u8]) -> Result<()> {
    let builder = PacketBuilder::ethernet2(from.mac, to.mac)
        .ipv4(from.ip_addr.octets(), to.ip_addr.octets(), 64)
        .udp(PROBE_PORT, PROBE_PORT);
    let mut packet = Vec::with_capacity(builder.size(payload.len()));
    builder.write(&mut packet, payload)?;

    let mut frame = tx.allocate_tx()?;
    tx.arena().write(&mut frame, &packet)?;
    let mut frames = vec![frame];
    let sent = tx.send(&mut frames);
    {
        let mut arena = tx.arena();
        for frame in frames {
            arena.release(frame)?;
        }
    }
    if sent? == 0 {
        bail!("TX ring is full");
    }
    tx.kick()?;
    Ok(())
}

/// Waits up to `within` for a UDP probe carrying `payload`.
fn received(rx: &mut Socket, payload: &[u8], within: Duration) -> Result<bool> {
    let deadline = Instant::now() + within;
    while Instant::now() < deadline {
        rx.wait(Interest::Readable, Some(Duration::from_millis(50)))?;
        let frames = rx.receive(32)?;
        let mut found = false;
        {
            let mut arena = rx.arena();
            for frame in &frames {
                let Ok(packet) = SlicedPacket::from_ethernet(arena.data(frame)?) else {
                    continue;
                };
                if let Some(TransportSlice::Udp(udp)) = &packet.transport {
                    found |= udp.payload() == payload;
                }
            }
        }
        rx.recycle_all(frames)?;
        if found {
            return Ok(true);
        }
    }
    Ok(false)
}
