#![cfg(test)]

use super::{rx_only, small_config};
use crate::arena::{Arena, SharedArena};
use crate::error::XskError;
use crate::io_loop::{IoLoop, PollStrategy, Verdict};
use crate::socket::{Socket, SocketState};
use crate::XdpConfig;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

fn io_loop(
    cfg: XdpConfig,
    batch: usize,
    strategy: PollStrategy,
) -> (IoLoop, crate::testing::KernelSim) {
    let (socket, sim) = Socket::simulated(cfg, Arena::new(&cfg).unwrap()).unwrap();
    (IoLoop::new(socket, batch, strategy).unwrap(), sim)
}

#[test]
fn new_activates_and_checks_batch() {
    let cfg = small_config(8, 4);
    let (socket, _sim) = Socket::simulated(cfg, Arena::new(&cfg).unwrap()).unwrap();
    assert!(matches!(
        IoLoop::new(socket, 0, PollStrategy::Busy),
        Err(XskError::InvalidConfig(_))
    ));

    let (io, _sim) = io_loop(cfg, 16, PollStrategy::Busy);
    assert_eq!(io.socket().state(), SocketState::Active);
}

#[test]
fn bounce_transmits_the_same_frame() {
    let (mut io, mut sim) = io_loop(small_config(8, 4), 16, PollStrategy::Busy);
    assert_eq!(io.socket_mut().arena().free_count(), 4);

    assert!(sim.deliver(b"ping"));
    let handled = io
        .run_once(|packet| {
            packet.copy_from_slice(b"pong");
            Verdict::Transmit
        })
        .unwrap();
    assert_eq!(handled, 1);
    assert_eq!(io.tx_backlog(), 0);
    assert_eq!(sim.transmit(), vec![b"pong".to_vec()]);
    // one frame went back into Fill during receive
    assert_eq!(io.socket_mut().arena().free_count(), 3);

    // an idle round reaps the completion
    assert_eq!(io.run_once(|_| Verdict::Recycle).unwrap(), 0);
    assert_eq!(io.socket_mut().arena().free_count(), 4);
    assert_eq!(io.socket().stats().tx_packets, 1);
}

#[test]
fn recycle_verdict_keeps_frames_circulating() {
    let (mut io, mut sim) = io_loop(rx_only(8, 4), 16, PollStrategy::Busy);
    for packet in [&b"a"[..], b"bb", b"ccc"] {
        assert!(sim.deliver(packet));
    }
    let mut seen = Vec::new();
    let handled = io
        .run_once(|packet| {
            seen.push(packet.len());
            Verdict::Recycle
        })
        .unwrap();
    assert_eq!(handled, 3);
    assert_eq!(seen, vec![1, 2, 3]);

    let stats = io.socket().stats();
    assert_eq!(stats.rx_packets, 3);
    assert_eq!(stats.rx_bytes, 6);
    let socket_arena = io.socket_mut().arena();
    assert_eq!(socket_arena.free_count() as u32 + socket_arena.lost_count(), 4);
    assert!(socket_arena.allocate().is_ok());
}

#[test]
fn wait_strategy_times_out_on_idle() {
    let (mut io, _sim) = io_loop(
        rx_only(8, 4),
        8,
        PollStrategy::Wait(Some(Duration::from_millis(10))),
    );
    let started = Instant::now();
    assert_eq!(io.run_once(|_| Verdict::Recycle).unwrap(), 0);
    assert!(started.elapsed() >= Duration::from_millis(10));
}

#[test]
fn run_until_honours_the_stop_flag() {
    let (mut io, mut sim) = io_loop(rx_only(8, 4), 1, PollStrategy::Busy);
    assert!(sim.deliver(b"one"));
    assert!(sim.deliver(b"two"));

    let stop = AtomicBool::new(false);
    let total = io
        .run_until(&stop, |_| {
            stop.store(true, Ordering::Relaxed);
            Verdict::Recycle
        })
        .unwrap();
    assert_eq!(total, 1);
}

#[test]
fn run_until_returns_when_closed() {
    let (mut io, _sim) = io_loop(rx_only(8, 4), 8, PollStrategy::Wait(None));
    let handle = io.socket().close_handle();
    let closer = std::thread::spawn(move || {
        std::thread::sleep(Duration::from_millis(20));
        handle.close();
    });
    let stop = AtomicBool::new(false);
    assert_eq!(io.run_until(&stop, |_| Verdict::Recycle).unwrap(), 0);
    closer.join().unwrap();
    io.close().unwrap();
}

#[test]
fn drop_releases_the_tx_backlog() {
    let cfg = XdpConfig {
        tx_size: 1,
        ..small_config(8, 4)
    };
    let shared = SharedArena::new(Arena::new(&cfg).unwrap());
    let (socket, mut sim) = Socket::simulated(cfg, shared.clone()).unwrap();
    let mut io = IoLoop::new(socket, 4, PollStrategy::Busy).unwrap();

    assert!(sim.deliver(b"x"));
    assert!(sim.deliver(b"y"));
    assert_eq!(io.run_once(|_| Verdict::Transmit).unwrap(), 2);
    assert_eq!(io.tx_backlog(), 1);
    assert_eq!(sim.transmit().len(), 1);

    drop(io);
    let arena = shared.lock();
    assert_eq!(arena.lost_count(), 0);
    assert_eq!(arena.free_count(), 8);
}

#[test]
fn transmit_on_receive_only_socket_keeps_the_frame() {
    let cfg = rx_only(8, 4);
    let shared = SharedArena::new(Arena::new(&cfg).unwrap());
    let (socket, mut sim) = Socket::simulated(cfg, shared.clone()).unwrap();
    let mut io = IoLoop::new(socket, 4, PollStrategy::Busy).unwrap();

    assert!(sim.deliver(b"echo"));
    assert!(matches!(
        io.run_once(|_| Verdict::Transmit),
        Err(XskError::InvalidState { .. })
    ));
    assert_eq!(io.tx_backlog(), 1);

    io.close().unwrap();
    let arena = shared.lock();
    assert_eq!(arena.lost_count(), 0);
    assert_eq!(arena.free_count(), 8);
}
