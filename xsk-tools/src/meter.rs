use std::time::{Duration, Instant};
use xsk_socket::SocketStats;

/// Logs packet and bit rates every `every` from successive stats snapshots.
pub struct Meter {
    every: Duration,
    started: Instant,
    first: SocketStats,
    at: Instant,
    last: SocketStats,
}

impl Meter {
    pub fn new(every: Duration, stats: SocketStats) -> Self {
        let now = Instant::now();
        Meter {
            every,
            started: now,
            first: stats,
            at: now,
            last: stats,
        }
    }

    pub fn tick(&mut self, stats: SocketStats) {
        let elapsed = self.at.elapsed();
        if elapsed < self.every {
            return;
        }
        log::info!("{}", rates(&stats.delta(&self.last), elapsed));
        self.at = Instant::now();
        self.last = stats;
    }

    pub fn finish(&self, stats: SocketStats) {
        let elapsed = self.started.elapsed();
        let shown = Duration::from_millis(elapsed.as_millis() as u64);
        log::info!(
            "total over {}: {}",
            humantime::format_duration(shown),
            rates(&stats.delta(&self.first), elapsed)
        );
        log::info!("{stats}");
    }
}

fn rates(delta: &SocketStats, elapsed: Duration) -> String {
    let secs = elapsed.as_secs_f64().max(f64::EPSILON);
    let mbit = |bytes: u64| bytes as f64 * 8.0 / secs / 1e6;
    format!(
        "rx {:>10.0} pps {:>9.1} Mbit/s | tx {:>10.0} pps {:>9.1} Mbit/s | wakeups rx {} tx {}",
        delta.rx_packets as f64 / secs,
        mbit(delta.rx_bytes),
        delta.tx_packets as f64 / secs,
        mbit(delta.tx_bytes),
        delta.rx_wakeup,
        delta.tx_wakeup,
    )
}
