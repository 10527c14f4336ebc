use comfy_table::{Cell, Table};
use indexmap::IndexMap;
use once_cell::sync::Lazy;
use std::{
    sync::Mutex,
    time::{Duration, Instant},
};

pub static BENCH: Lazy<Mutex<Bench>> = Lazy::new(|| Mutex::new(Bench::new()));

/// Wall-clock span measured from construction.
pub struct Timer {
    start: Instant,
}

impl Timer {
    pub fn new() -> Self {
        Timer {
            start: Instant::now(),
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }
}

#[derive(Debug)]
struct Stat {
    count: u64,
    total: Duration,
    min: Duration,
    max: Duration,
}

impl Stat {
    fn new() -> Self {
        Stat {
            count: 0,
            total: Duration::ZERO,
            min: Duration::MAX,
            max: Duration::ZERO,
        }
    }

    fn record(&mut self, d: Duration) {
        self.count += 1;
        self.total += d;
        self.min = self.min.min(d);
        self.max = self.max.max(d);
    }

    fn avg(&self) -> Duration {
        if self.count == 0 {
            Duration::ZERO
        } else {
            self.total / self.count as u32
        }
    }
}

pub struct Bench {
    // IndexMap keeps insertion order
    stats: IndexMap<&'static str, Stat>,
}

impl Bench {
    pub fn new() -> Self {
        Bench {
            stats: IndexMap::new(),
        }
    }

    /// Record one sample of duration `d` under the key `name`.
    pub fn record(&mut self, name: &'static str, d: Duration) {
        self.stats.entry(name).or_insert_with(Stat::new).record(d);
    }

    /// Emit a debug-level table of avg / min / max / count per key, in the
    /// order each key was first recorded.
    pub fn summary(&self) {
        if self.stats.is_empty() {
            return;
        }

        let mut table = Table::new();
        table.set_header(vec![
            Cell::new("Name"),
            Cell::new("Avg"),
            Cell::new("Min"),
            Cell::new("Max"),
            Cell::new("Count"),
        ]);

        for (&name, st) in &self.stats {
            table.add_row(vec![
                Cell::new(name),
                Cell::new(format!("{:?}", st.avg())),
                Cell::new(format!("{:?}", st.min)),
                Cell::new(format!("{:?}", st.max)),
                Cell::new(st.count),
            ]);
        }

        log::debug!("\n{table}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stats_track_extremes() {
        let mut bench = Bench::new();
        bench.record("op", Duration::from_micros(10));
        bench.record("op", Duration::from_micros(30));

        let stat = &bench.stats["op"];
        assert_eq!(stat.count, 2);
        assert_eq!(stat.min, Duration::from_micros(10));
        assert_eq!(stat.max, Duration::from_micros(30));
        assert_eq!(stat.avg(), Duration::from_micros(20));
    }
}
