//! Token bucket with period refill

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

/// GPU-time budget refilled once per period
///
/// The balance is never negative: deductions saturate at zero. A refill
/// only raises the balance, so a bucket that is already full keeps it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenBucket {
    period: Duration,
    capacity: Duration,
    balance: Duration,
    last_refill: Option<Instant>,
}

impl TokenBucket {
    /// Full bucket that has never been refilled
    pub fn new(period: Duration, capacity: Duration) -> Self {
        Self {
            period,
            capacity,
            balance: capacity,
            last_refill: None,
        }
    }

    /// Bucket from microsecond settings
    pub fn from_micros(period_us: u64, capacity_us: u64) -> Self {
        Self::new(Duration::from_micros(period_us), Duration::from_micros(capacity_us))
    }

    /// Refill period
    pub fn period(&self) -> Duration {
        self.period
    }

    /// Balance after a refill
    pub fn capacity(&self) -> Duration {
        self.capacity
    }

    /// Remaining budget
    pub fn balance(&self) -> Duration {
        self.balance
    }

    /// Change the refill period
    pub fn set_period(&mut self, period: Duration) {
        self.period = period;
    }

    /// Change the capacity, clamping the current balance to it
    pub fn set_capacity(&mut self, capacity: Duration) {
        self.capacity = capacity;
        self.balance = self.balance.min(capacity);
    }

    /// Refill if a full period has passed since the last refill
    ///
    /// Returns whether a refill happened. Calling it again within the same
    /// period changes nothing.
    pub fn refill(&mut self, now: Instant) -> bool {
        let due = self
            .last_refill
            .map_or(true, |last| now.saturating_duration_since(last) >= self.period);
        if due {
            self.balance = self.balance.max(self.capacity);
            self.last_refill = Some(now);
        }
        due
    }

    /// Budget left
    pub fn has_budget(&self) -> bool {
        !self.balance.is_zero()
    }

    /// Charge `amount`, saturating at zero
    pub fn deduct(&mut self, amount: Duration) {
        self.balance = self.balance.saturating_sub(amount);
    }

    /// Return budget, never above capacity
    pub fn credit(&mut self, amount: Duration) {
        self.balance = (self.balance + amount).min(self.capacity);
    }

    /// Time until the next period boundary
    pub fn until_refill(&self, now: Instant) -> Duration {
        match self.last_refill {
            Some(last) => (last + self.period).saturating_duration_since(now),
            None => Duration::ZERO,
        }
    }

    /// Serializable view
    pub fn report(&self) -> BucketReport {
        BucketReport {
            period_us: self.period.as_micros() as u64,
            capacity_us: self.capacity.as_micros() as u64,
            balance_us: self.balance.as_micros() as u64,
        }
    }
}

/// Bucket settings and balance in microseconds
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BucketReport {
    /// Refill period
    pub period_us: u64,
    /// Capacity per period
    pub capacity_us: u64,
    /// Remaining budget
    pub balance_us: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    const MS: Duration = Duration::from_millis(1);

    #[test]
    fn test_deduct_saturates() {
        let mut bucket = TokenBucket::new(50 * MS, 35 * MS);
        bucket.deduct(30 * MS);
        assert_eq!(bucket.balance(), 5 * MS);
        bucket.deduct(30 * MS);
        assert_eq!(bucket.balance(), Duration::ZERO);
        assert!(!bucket.has_budget());
    }

    #[test]
    fn test_refill_once_per_period() {
        let t0 = Instant::now();
        let mut bucket = TokenBucket::new(50 * MS, 35 * MS);
        assert!(bucket.refill(t0));
        bucket.deduct(35 * MS);
        assert!(!bucket.refill(t0 + 10 * MS));
        assert!(!bucket.refill(t0 + 49 * MS));
        assert_eq!(bucket.balance(), Duration::ZERO);
        assert_eq!(bucket.until_refill(t0 + 20 * MS), 30 * MS);
        assert!(bucket.refill(t0 + 50 * MS));
        assert_eq!(bucket.balance(), 35 * MS);
    }

    #[test]
    fn test_capacity_change_clamps_balance() {
        let mut bucket = TokenBucket::new(50 * MS, 35 * MS);
        bucket.set_capacity(10 * MS);
        assert_eq!(bucket.balance(), 10 * MS);
        assert_eq!(bucket.report().capacity_us, 10_000);
    }
}
