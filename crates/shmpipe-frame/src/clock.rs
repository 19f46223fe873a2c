//! Clock domain translation between the monotonic clock and a pipeline clock.
//!
//! A [`SlavedClock`] reports the monotonic clock as an affine function of
//! itself, fitted to samples of a master pipeline clock. The payloader maps
//! pipeline time back to monotonic time for the wire, the depayloader maps
//! the sender's monotonic time forward into its own pipeline.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, trace};

const CALIBRATION_DENOM: u64 = 1 << 20;

/// Current `CLOCK_MONOTONIC` time in nanoseconds.
pub fn monotonic_now() -> u64 {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    // SAFETY: `ts` is a valid, writable timespec.
    let rc = unsafe { libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts) };
    if rc != 0 {
        return 0;
    }
    (ts.tv_sec as u64)
        .saturating_mul(1_000_000_000)
        .saturating_add(ts.tv_nsec as u64)
}

/// A source of nanosecond timestamps.
pub trait PipelineClock: Send + Sync {
    fn now(&self) -> u64;
}

impl<T: PipelineClock + ?Sized> PipelineClock for Arc<T> {
    fn now(&self) -> u64 {
        (**self).now()
    }
}

/// The process's `CLOCK_MONOTONIC`.
#[derive(Debug, Clone, Copy, Default)]
pub struct MonotonicClock;

impl PipelineClock for MonotonicClock {
    fn now(&self) -> u64 {
        monotonic_now()
    }
}

/// A clock that only moves when told to.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicU64,
}

impl ManualClock {
    pub fn new(start: u64) -> Self {
        Self {
            now: AtomicU64::new(start),
        }
    }

    pub fn set(&self, now: u64) {
        self.now.store(now, Ordering::SeqCst);
    }

    pub fn advance(&self, by: Duration) {
        self.now.fetch_add(by.as_nanos() as u64, Ordering::SeqCst);
    }
}

impl PipelineClock for ManualClock {
    fn now(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }
}

/// `external = external_base + (internal - internal_base) * num / denom`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Calibration {
    pub internal: u64,
    pub external: u64,
    pub num: u64,
    pub denom: u64,
}

impl Calibration {
    pub const IDENTITY: Calibration = Calibration {
        internal: 0,
        external: 0,
        num: 1,
        denom: 1,
    };

    /// Map an internal time to the external domain, saturating at `0` and `u64::MAX`.
    pub fn adjust(&self, internal: u64) -> u64 {
        if internal >= self.internal {
            let delta = scale(internal - self.internal, self.num, self.denom);
            self.external.saturating_add(delta)
        } else {
            let delta = scale(self.internal - internal, self.num, self.denom);
            self.external.saturating_sub(delta)
        }
    }

    /// Map an external time back to the internal domain.
    pub fn unadjust(&self, external: u64) -> u64 {
        if external >= self.external {
            let delta = scale(external - self.external, self.denom, self.num);
            self.internal.saturating_add(delta)
        } else {
            let delta = scale(self.external - external, self.denom, self.num);
            self.internal.saturating_sub(delta)
        }
    }
}

impl Default for Calibration {
    fn default() -> Self {
        Self::IDENTITY
    }
}

fn scale(value: u64, num: u64, denom: u64) -> u64 {
    if denom == 0 {
        return u64::MAX;
    }
    let scaled = value as u128 * num as u128 / denom as u128;
    u64::try_from(scaled).unwrap_or(u64::MAX)
}

/// How often a slaved clock samples its master and how many samples it fits.
#[derive(Debug, Clone)]
pub struct ClockConfig {
    /// Minimum internal time between two samples. Default: 1 s.
    pub sample_interval: Duration,
    /// Number of samples kept for the fit. Default: 32.
    pub window: usize,
}

impl Default for ClockConfig {
    fn default() -> Self {
        Self {
            sample_interval: Duration::from_secs(1),
            window: 32,
        }
    }
}

/// A monotonic clock calibrated against a master pipeline clock.
pub struct SlavedClock {
    internal: Arc<dyn PipelineClock>,
    master: Option<Arc<dyn PipelineClock>>,
    calibration: Calibration,
    samples: VecDeque<(u64, u64)>,
    last_sample: Option<u64>,
    config: ClockConfig,
}

impl SlavedClock {
    /// A slaved clock over `CLOCK_MONOTONIC`.
    pub fn new(config: ClockConfig) -> Self {
        Self::with_internal(config, Arc::new(MonotonicClock))
    }

    /// A slaved clock over an arbitrary internal clock (used by tests).
    pub fn with_internal(config: ClockConfig, internal: Arc<dyn PipelineClock>) -> Self {
        Self {
            internal,
            master: None,
            calibration: Calibration::IDENTITY,
            samples: VecDeque::new(),
            last_sample: None,
            config,
        }
    }

    /// Attach (or detach with `None`) the master clock.
    ///
    /// Attaching calibrates immediately from one sample at rate 1:1, so
    /// timestamps are usable before the fit has converged.
    pub fn set_master(&mut self, master: Option<Arc<dyn PipelineClock>>) {
        self.samples.clear();
        self.last_sample = None;
        self.master = master;

        if let Some(master) = &self.master {
            let internal = self.internal.now();
            let external = master.now();
            self.calibration = Calibration {
                internal,
                external,
                num: 1,
                denom: 1,
            };
            self.samples.push_back((internal, external));
            self.last_sample = Some(internal);
            debug!(internal, external, "slaved clock calibrated 1:1");
        }
    }

    pub fn has_master(&self) -> bool {
        self.master.is_some()
    }

    pub fn calibration(&self) -> Calibration {
        self.calibration
    }

    pub fn set_calibration(&mut self, calibration: Calibration) {
        self.calibration = calibration;
    }

    /// Raw internal time.
    pub fn internal_now(&self) -> u64 {
        self.internal.now()
    }

    /// Internal time translated into the master's domain.
    pub fn now(&self) -> u64 {
        self.calibration.adjust(self.internal.now())
    }

    pub fn adjust(&self, internal: u64) -> u64 {
        self.calibration.adjust(internal)
    }

    pub fn unadjust(&self, external: u64) -> u64 {
        self.calibration.unadjust(external)
    }

    /// Take a master sample if one is due and refit the calibration.
    pub fn sync(&mut self) {
        let Some(master) = &self.master else {
            return;
        };
        let internal = self.internal.now();
        if let Some(last) = self.last_sample {
            if internal.saturating_sub(last) < self.config.sample_interval.as_nanos() as u64 {
                return;
            }
        }
        let external = master.now();
        self.samples.push_back((internal, external));
        while self.samples.len() > self.config.window.max(2) {
            self.samples.pop_front();
        }
        self.last_sample = Some(internal);

        if let Some(calibration) = fit(&self.samples) {
            trace!(?calibration, samples = self.samples.len(), "refit clock calibration");
            self.calibration = calibration;
        }
    }
}

impl std::fmt::Debug for SlavedClock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SlavedClock")
            .field("calibration", &self.calibration)
            .field("has_master", &self.master.is_some())
            .field("samples", &self.samples.len())
            .finish()
    }
}

/// Least-squares line through the samples, anchored at their mean.
fn fit(samples: &VecDeque<(u64, u64)>) -> Option<Calibration> {
    if samples.len() < 2 {
        return None;
    }
    let (x0, y0) = *samples.front()?;
    let n = samples.len() as f64;

    let (mut sx, mut sy) = (0f64, 0f64);
    for &(x, y) in samples {
        sx += x.wrapping_sub(x0) as i64 as f64;
        sy += y.wrapping_sub(y0) as i64 as f64;
    }
    let (mx, my) = (sx / n, sy / n);

    let (mut sxx, mut sxy) = (0f64, 0f64);
    for &(x, y) in samples {
        let dx = x.wrapping_sub(x0) as i64 as f64 - mx;
        let dy = y.wrapping_sub(y0) as i64 as f64 - my;
        sxx += dx * dx;
        sxy += dx * dy;
    }
    if sxx <= 0.0 {
        return None;
    }
    let slope = sxy / sxx;
    if !slope.is_finite() || slope <= 0.0 {
        return None;
    }

    let offset = |base: u64, mean: f64| {
        if mean >= 0.0 {
            base.saturating_add(mean.round() as u64)
        } else {
            base.saturating_sub((-mean).round() as u64)
        }
    };
    Some(Calibration {
        internal: offset(x0, mx),
        external: offset(y0, my),
        num: (slope * CALIBRATION_DENOM as f64).round() as u64,
        denom: CALIBRATION_DENOM,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn monotonic_clock_moves_forward() {
        let a = monotonic_now();
        let b = monotonic_now();
        assert!(a > 0);
        assert!(b >= a);
    }

    #[test]
    fn adjust_and_unadjust_are_inverse() {
        let cal = Calibration {
            internal: 1_000,
            external: 50_000,
            num: 2,
            denom: 1,
        };
        assert_eq!(cal.adjust(1_500), 51_000);
        assert_eq!(cal.unadjust(51_000), 1_500);
        assert_eq!(cal.adjust(900), 49_800);
        assert_eq!(cal.unadjust(49_800), 900);
    }

    #[test]
    fn adjust_saturates_at_zero() {
        let cal = Calibration {
            internal: 10_000,
            external: 100,
            num: 1,
            denom: 1,
        };
        assert_eq!(cal.adjust(0), 0);
        assert_eq!(cal.unadjust(0), 9_900);
    }

    #[test]
    fn attaching_master_calibrates_immediately() {
        let internal = Arc::new(ManualClock::new(5_000));
        let master = Arc::new(ManualClock::new(1_000_000));
        let mut clock = SlavedClock::with_internal(ClockConfig::default(), internal.clone());

        assert_eq!(clock.now(), 5_000);
        clock.set_master(Some(master));

        assert_eq!(clock.now(), 1_000_000);
        internal.advance(Duration::from_nanos(250));
        assert_eq!(clock.now(), 1_000_250);
        assert_eq!(clock.unadjust(1_000_000), 5_000);
    }

    #[test]
    fn sync_tracks_master_rate() {
        let internal = Arc::new(ManualClock::new(0));
        let master = Arc::new(ManualClock::new(1_000_000_000));
        let config = ClockConfig {
            sample_interval: Duration::from_millis(10),
            window: 8,
        };
        let mut clock = SlavedClock::with_internal(config, internal.clone());
        clock.set_master(Some(master.clone()));

        // Master runs twice as fast as the internal clock.
        for _ in 0..8 {
            internal.advance(Duration::from_millis(10));
            master.advance(Duration::from_millis(20));
            clock.sync();
        }

        let cal = clock.calibration();
        let rate = cal.num as f64 / cal.denom as f64;
        assert!((rate - 2.0).abs() < 1e-3, "rate {rate}");
        let predicted = clock.now();
        assert!(predicted.abs_diff(master.now()) < 1_000, "{predicted}");
    }

    #[test]
    fn sync_waits_for_sample_interval() {
        let internal = Arc::new(ManualClock::new(0));
        let master = Arc::new(ManualClock::new(0));
        let mut clock = SlavedClock::with_internal(ClockConfig::default(), internal.clone());
        clock.set_master(Some(master.clone()));

        internal.advance(Duration::from_millis(1));
        master.advance(Duration::from_millis(5));
        clock.sync();
        assert_eq!(clock.calibration().num, 1);
        assert_eq!(clock.calibration().denom, 1);
    }

    #[test]
    fn detaching_keeps_last_calibration() {
        let internal = Arc::new(ManualClock::new(10));
        let mut clock = SlavedClock::with_internal(ClockConfig::default(), internal);
        clock.set_master(Some(Arc::new(ManualClock::new(500))));
        let before = clock.calibration();
        clock.set_master(None);
        assert_eq!(clock.calibration(), before);
        assert!(!clock.has_master());
    }
}
