#![cfg(test)]

use super::{rx_only, small_config};
use crate::arena::{Arena, SharedArena};
use crate::error::XskError;
use crate::poll::{Interest, Readiness};
use crate::socket::{Socket, SocketState};
use crate::testing::XDP_PACKET_HEADROOM;
use std::time::{Duration, Instant};

fn simulated(cfg: crate::XdpConfig) -> (Socket, crate::testing::KernelSim) {
    let arena = Arena::new(&cfg).unwrap();
    let (mut socket, sim) = Socket::simulated(cfg, arena).unwrap();
    socket.activate().unwrap();
    (socket, sim)
}

#[test]
fn lifecycle_states() {
    let cfg = small_config(16, 8);
    let (mut socket, _sim) = Socket::simulated(cfg, Arena::new(&cfg).unwrap()).unwrap();
    assert_eq!(socket.state(), SocketState::Bound);
    assert!(matches!(
        socket.receive(4),
        Err(XskError::InvalidState { expected: "active", found: "bound" })
    ));
    socket.activate().unwrap();
    assert_eq!(socket.state(), SocketState::Active);
    assert!(matches!(
        socket.activate(),
        Err(XskError::InvalidState { .. })
    ));
    socket.close().unwrap();
    assert_eq!(socket.state(), SocketState::Closed);
    assert!(matches!(socket.receive(4), Err(XskError::Closed)));
}

#[test]
fn activate_primes_fill_ring() {
    // both directions: half of the free frames go to Fill
    let (mut socket, mut sim) = simulated(small_config(16, 8));
    assert_eq!(socket.arena().free_count(), 8);
    assert_eq!(sim.take_fill(16), 8);

    // receive only: the ring size is the limit
    let (mut socket, mut sim) = simulated(rx_only(16, 4));
    assert_eq!(socket.arena().free_count(), 12);
    assert_eq!(sim.take_fill(16), 4);
}

#[test]
fn receive_and_recycle() {
    let (mut socket, mut sim) = simulated(rx_only(8, 4));
    assert!(socket.receive(8).unwrap().is_empty());

    assert!(sim.deliver(b"first"));
    assert!(sim.deliver(b"second"));
    let frames = socket.receive(8).unwrap();
    assert_eq!(frames.len(), 2);
    assert_eq!(frames[0].addr() % 2048, XDP_PACKET_HEADROOM);

    let payloads: Vec<Vec<u8>> = {
        let arena = socket.arena();
        frames
            .iter()
            .map(|f| arena.data(f).unwrap().to_vec())
            .collect()
    };
    assert_eq!(payloads, vec![b"first".to_vec(), b"second".to_vec()]);

    let stats = socket.stats();
    assert_eq!(stats.rx_packets, 2);
    assert_eq!(stats.rx_bytes, 11);
    assert_eq!(stats.rx_batch, 1);

    // eager refill took two more frames from the pool
    assert_eq!(socket.arena().free_count(), 2);
    socket.recycle_all(frames).unwrap();
    // fill ring was already full again, so recycled frames went to the pool
    assert_eq!(socket.arena().free_count(), 4);
}

#[test]
fn recycle_goes_to_fill_when_there_is_room() {
    let (mut socket, mut sim) = simulated(rx_only(8, 4));
    sim.take_fill(4);
    assert!(sim.deliver(b"x"));
    let mut frames = socket.receive(1).unwrap();
    let frame = frames.pop().unwrap();
    // the refill emptied the pool; let the kernel take those frames too
    sim.take_fill(4);
    let free_before = socket.arena().free_count();
    socket.recycle(frame).unwrap();
    assert_eq!(socket.arena().free_count(), free_before);
    assert_eq!(sim.take_fill(4), 1);
}

#[test]
fn rx_wakeup_when_fill_asks_for_it() {
    let (mut socket, sim) = simulated(rx_only(8, 4));
    sim.set_fill_need_wakeup(true);
    assert!(socket.receive(4).unwrap().is_empty());
    assert_eq!(socket.stats().rx_wakeup, 1);
    sim.set_fill_need_wakeup(false);
    assert!(socket.receive(4).unwrap().is_empty());
    assert_eq!(socket.stats().rx_wakeup, 1);
}

#[test]
fn send_then_complete_returns_frames_once() {
    let (mut socket, mut sim) = simulated(small_config(8, 4));
    let free = socket.arena().free_count();

    let mut frame = socket.allocate_tx().unwrap();
    socket.arena().write(&mut frame, b"hello").unwrap();
    let mut frames = vec![frame];
    assert_eq!(socket.send(&mut frames).unwrap(), 1);
    assert!(frames.is_empty());
    assert_eq!(socket.arena().free_count(), free - 1);
    assert_eq!(socket.stats().tx_packets, 1);
    assert_eq!(socket.stats().tx_bytes, 5);

    assert_eq!(sim.transmit(), vec![b"hello".to_vec()]);
    assert_eq!(socket.complete().unwrap(), 1);
    assert_eq!(socket.arena().free_count(), free);
    assert_eq!(socket.complete().unwrap(), 0);
    assert_eq!(socket.arena().free_count(), free);
}

#[test]
fn send_returns_what_does_not_fit() {
    let (mut socket, mut sim) = simulated(small_config(16, 2));
    let mut frames: Vec<_> = (0..3).map(|_| socket.allocate_tx().unwrap()).collect();
    let last = frames[2].index();
    assert_eq!(socket.send(&mut frames).unwrap(), 2);
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0].index(), last);
    assert_eq!(sim.transmit().len(), 2);
    assert_eq!(socket.send(&mut frames).unwrap(), 1);
    assert!(frames.is_empty());
}

#[test]
fn allocate_tx_reaps_completions() {
    let cfg = crate::XdpConfig {
        rx_size: 0,
        fill_size: 0,
        ..small_config(2, 2)
    };
    let (mut socket, mut sim) = simulated(cfg);
    let mut frames = vec![socket.allocate_tx().unwrap(), socket.allocate_tx().unwrap()];
    assert!(matches!(socket.allocate_tx(), Err(XskError::OutOfFrames(_))));
    socket.send(&mut frames).unwrap();
    sim.transmit();
    assert!(socket.allocate_tx().is_ok());
}

#[test]
fn send_on_receive_only_socket() {
    let (mut socket, _sim) = simulated(rx_only(8, 4));
    let mut frames = vec![socket.arena().allocate().unwrap()];
    assert!(matches!(
        socket.send(&mut frames),
        Err(XskError::InvalidState { .. })
    ));
    // the frame is still the caller's to give back
    assert_eq!(frames.len(), 1);
    socket.arena().release(frames.pop().unwrap()).unwrap();
    socket.close().unwrap();
    let arena = socket.arena();
    assert_eq!(arena.free_count(), 8);
    assert_eq!(arena.lost_count(), 0);
}

#[test]
fn send_after_close_handle_keeps_frames() {
    let (mut socket, _sim) = simulated(small_config(8, 4));
    let mut frames = vec![socket.allocate_tx().unwrap(), socket.allocate_tx().unwrap()];
    socket.close_handle().close();
    assert!(matches!(socket.send(&mut frames), Err(XskError::Closed)));
    assert_eq!(frames.len(), 2);
    socket.recycle_all(frames).unwrap();
    socket.close().unwrap();
    let arena = socket.arena();
    assert_eq!(arena.free_count() as u32 + arena.lost_count(), arena.frame_count());
}

#[test]
fn close_is_idempotent() {
    let (mut socket, _sim) = simulated(small_config(8, 4));
    socket.close().unwrap();
    let free = socket.arena().free_count();
    socket.close().unwrap();
    assert_eq!(socket.state(), SocketState::Closed);
    assert_eq!(socket.arena().free_count(), free);
    assert_eq!(free, 8);
    assert_eq!(socket.arena().lost_count(), 0);
}

// two frames consumed from Fill by the kernel and never returned
#[test]
fn close_marks_kernel_held_frames_lost() {
    let (mut socket, mut sim) = simulated(rx_only(8, 4));
    assert_eq!(sim.take_fill(2), 2);

    let started = Instant::now();
    socket.close().unwrap();
    assert!(started.elapsed() >= Duration::from_millis(20));
    assert_eq!(socket.state(), SocketState::Closed);

    let arena = socket.arena();
    assert_eq!(arena.lost_count(), 2);
    assert_eq!(arena.free_count(), 6);
    let frames = arena.allocate_n(6).unwrap();
    assert!(matches!(arena.allocate(), Err(XskError::OutOfFrames(_))));
    drop(frames);
}

#[test]
fn close_drains_delivered_frames() {
    let (mut socket, mut sim) = simulated(rx_only(8, 4));
    sim.take_fill(4);
    assert!(sim.deliver(b"a"));
    assert!(sim.deliver(b"b"));
    assert!(sim.deliver(b"c"));
    assert!(sim.deliver(b"d"));

    socket.close().unwrap();
    let arena = socket.arena();
    assert_eq!(arena.lost_count(), 0);
    assert_eq!(arena.free_count(), 8);
}

#[test]
fn close_with_stalled_tx() {
    let (mut socket, mut sim) = simulated(small_config(8, 4));
    let mut frames = vec![socket.allocate_tx().unwrap()];
    socket.send(&mut frames).unwrap();
    assert_eq!(sim.swallow_tx(), 1);

    socket.close().unwrap();
    assert_eq!(socket.arena().lost_count(), 1);
}

#[test]
fn shared_arena_sockets() {
    let cfg = rx_only(16, 4);
    let shared = SharedArena::new(Arena::new(&cfg).unwrap());
    let (mut a, mut sim_a) = Socket::simulated(cfg, shared.clone()).unwrap();
    let (mut b, _sim_b) = Socket::simulated(cfg, shared.clone()).unwrap();
    a.activate().unwrap();
    b.activate().unwrap();
    assert_eq!(shared.lock().free_count(), 8);

    assert!(sim_a.deliver(b"to a"));
    let frames = a.receive(4).unwrap();
    assert_eq!(frames.len(), 1);
    // frames belong to the arena, not to the socket that received them
    b.recycle_all(frames).unwrap();

    assert_eq!(sim_a.take_fill(1), 1);
    a.close().unwrap();
    b.close().unwrap();
    let arena = shared.lock();
    assert_eq!(arena.lost_count(), 1);
    assert_eq!(arena.free_count(), 15);
}

#[test]
fn wait_times_out() {
    let (mut socket, _sim) = simulated(rx_only(8, 4));
    let readiness = socket
        .wait(Interest::Readable, Some(Duration::from_millis(10)))
        .unwrap();
    assert_eq!(readiness, Readiness::TimedOut);
}

#[test]
fn close_handle_unblocks_waiter() {
    let (mut socket, _sim) = simulated(rx_only(8, 4));
    let handle = socket.close_handle();
    let closer = std::thread::spawn(move || {
        std::thread::sleep(Duration::from_millis(20));
        handle.close();
    });
    let started = Instant::now();
    assert!(matches!(
        socket.wait(Interest::Readable, None),
        Err(XskError::Closed)
    ));
    assert!(started.elapsed() < Duration::from_secs(5));
    closer.join().unwrap();

    assert!(matches!(socket.receive(4), Err(XskError::Closed)));
    socket.close().unwrap();
    assert_eq!(socket.state(), SocketState::Closed);
}
