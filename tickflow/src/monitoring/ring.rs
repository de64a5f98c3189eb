use parking_lot::Mutex;
use serde::Serialize;

/// Counters accumulated over one second, or summed over a window of seconds.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BucketTotals {
    pub ticks: u64,
    pub aggregates: u64,
    pub delay_count: u64,
    pub delay_sum_ms: u64,
    pub max_delay_ms: u64,
}

impl BucketTotals {
    pub fn avg_delay_ms(&self) -> f64 {
        if self.delay_count == 0 {
            0.0
        } else {
            self.delay_sum_ms as f64 / self.delay_count as f64
        }
    }

    fn merge(&mut self, other: &BucketTotals) {
        self.ticks += other.ticks;
        self.aggregates += other.aggregates;
        self.delay_count += other.delay_count;
        self.delay_sum_ms += other.delay_sum_ms;
        self.max_delay_ms = self.max_delay_ms.max(other.max_delay_ms);
    }
}

#[derive(Debug)]
struct Bucket {
    second: i64,
    totals: BucketTotals,
}

/// Ring of per-second buckets covering the trailing `len()` seconds.
///
/// A bucket is addressed by `epoch_second mod len` and lazily reset the first time it is
/// touched for a new second. Each bucket has its own lock, so writers to different seconds
/// never contend and a snapshot never holds more than one lock at a time.
#[derive(Debug)]
pub struct RollingWindow {
    buckets: Vec<Mutex<Bucket>>,
}

impl RollingWindow {
    pub fn new(seconds: usize) -> Self {
        Self {
            buckets: (0..seconds.max(1))
                .map(|_| {
                    Mutex::new(Bucket {
                        second: i64::MIN,
                        totals: BucketTotals::default(),
                    })
                })
                .collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }

    pub fn record_tick(&self, second: i64) {
        self.touch(second, |totals| totals.ticks += 1);
    }

    pub fn record_aggregate(&self, second: i64) {
        self.touch(second, |totals| totals.aggregates += 1);
    }

    pub fn record_delay(&self, second: i64, delay_ms: u64) {
        self.touch(second, |totals| {
            totals.delay_count += 1;
            totals.delay_sum_ms += delay_ms;
            totals.max_delay_ms = totals.max_delay_ms.max(delay_ms);
        });
    }

    /// Sum of every bucket aged `[0, len)` seconds relative to `now_second`.
    pub fn totals(&self, now_second: i64) -> BucketTotals {
        let len = self.buckets.len() as i64;

        self.buckets
            .iter()
            .fold(BucketTotals::default(), |mut sum, bucket| {
                let bucket = bucket.lock();
                let age = now_second.saturating_sub(bucket.second);
                if (0..len).contains(&age) {
                    sum.merge(&bucket.totals);
                }
                sum
            })
    }

    fn touch<F>(&self, second: i64, update: F)
    where
        F: FnOnce(&mut BucketTotals),
    {
        let index = second.rem_euclid(self.buckets.len() as i64) as usize;
        let mut bucket = self.buckets[index].lock();

        if bucket.second != second {
            bucket.second = second;
            bucket.totals = BucketTotals::default();
        }

        update(&mut bucket.totals);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bucket_reused_for_new_second() {
        let window = RollingWindow::new(10);

        window.record_tick(100);
        window.record_tick(100);
        window.record_tick(110);

        // Second 100 and 110 share an index, 110 resets the bucket
        assert_eq!(window.totals(110).ticks, 1);
        assert_eq!(window.totals(109).ticks, 0);
    }

    #[test]
    fn test_totals_over_window() {
        let window = RollingWindow::new(5);

        window.record_tick(100);
        window.record_tick(102);
        window.record_delay(102, 40);
        window.record_delay(103, 10);
        window.record_aggregate(104);

        let totals = window.totals(104);
        assert_eq!(totals.ticks, 2);
        assert_eq!(totals.aggregates, 1);
        assert_eq!(totals.delay_count, 2);
        assert_eq!(totals.max_delay_ms, 40);
        assert_eq!(totals.avg_delay_ms(), 25.0);

        // Second 100 has aged out
        assert_eq!(window.totals(105).ticks, 1);

        // Nothing is counted from the future
        assert_eq!(window.totals(101).ticks, 1);
    }
}
