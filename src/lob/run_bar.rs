//! Volume-imbalance run-bar sampler.
//!
//! Closes a bar when directional volume accumulated since the last bar
//! crosses an adaptive threshold, with a minimum time gap between bars.
//! The threshold is recalibrated each morning: a binary search over
//! yesterday's tape finds the cut that would have produced the target bar
//! count, and the result is blended into an EMA so one unusual day cannot
//! whip the sampling rate.

/// Tuning for the sampler. Defaults reproduce the production constants.
#[derive(Debug, Clone)]
pub struct RunBarConfig {
    /// Target seconds per bar.
    pub target_bar_period_secs: u32,
    /// Trading hours per day (A-share continuous session = 4h).
    pub trade_hours_per_day: f32,
    /// Threshold before the first calibration.
    pub initial_threshold: f32,
    /// Minimum seconds between consecutive bars.
    pub min_gap_secs: u32,
    /// EMA period in days for threshold blending.
    pub ema_days: u32,
}

impl Default for RunBarConfig {
    fn default() -> Self {
        Self {
            target_bar_period_secs: 60,
            trade_hours_per_day: 4.0,
            initial_threshold: 1_000.0,
            min_gap_secs: 3,
            ema_days: 5,
        }
    }
}

/// One emitted bar.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RunBar {
    /// Packed tick of the closing trade.
    pub tick: u32,
    /// Side of the closing trade.
    pub closed_by_buy: bool,
    /// Buy volume accumulated in the bar.
    pub buy_volume: u32,
    /// Sell volume accumulated in the bar.
    pub sell_volume: u32,
}

/// Per-instrument sampler state. Survives `Book::clear` so the threshold
/// carries across trading days.
pub struct RunBarSampler {
    config: RunBarConfig,
    expected_bars_per_day: i32,
    bar_tolerance: i32,
    ema_alpha: f32,

    accum_buy: u32,
    accum_sell: u32,

    threshold_ema: f32,

    last_emit_tick: u32,
    last_hour: u8,

    /// Today's trades for tomorrow's calibration.
    daily_sides: Vec<bool>,
    daily_volumes: Vec<u32>,
    daily_bar_count: u32,
}

impl RunBarSampler {
    pub fn new(config: RunBarConfig) -> Self {
        let expected = ((3600.0 * config.trade_hours_per_day)
            / config.target_bar_period_secs as f32) as i32;
        let tolerance = ((expected as f32) * 0.05) as i32;
        let alpha = 2.0 / (config.ema_days as f32 + 1.0);
        let threshold = config.initial_threshold;

        Self {
            config,
            expected_bars_per_day: expected,
            bar_tolerance: tolerance,
            ema_alpha: alpha,
            accum_buy: 0,
            accum_sell: 0,
            threshold_ema: threshold,
            last_emit_tick: 0,
            last_hour: 255,
            daily_sides: Vec::with_capacity(expected.max(0) as usize),
            daily_volumes: Vec::with_capacity(expected.max(0) as usize),
            daily_bar_count: 0,
        }
    }

    /// Current adaptive threshold.
    pub fn threshold(&self) -> f32 {
        self.threshold_ema
    }

    /// Bars emitted today so far.
    pub fn bars_today(&self) -> u32 {
        self.daily_bar_count
    }

    /// Feed one trade. Returns the closed bar when the emit condition
    /// fires.
    #[inline]
    pub fn process(&mut self, tick: u32, is_buy: bool, volume: u32) -> Option<RunBar> {
        // Crossing into the 9 o'clock hour starts a new day.
        let hour = ((tick >> 24) & 0xff) as u8;
        if hour == 9 && self.last_hour != 9 {
            self.on_new_day();
        }
        self.last_hour = hour;

        if is_buy {
            self.accum_buy += volume;
        } else {
            self.accum_sell += volume;
        }
        self.daily_sides.push(is_buy);
        self.daily_volumes.push(volume);

        if !self.should_emit(tick) {
            return None;
        }

        let bar = RunBar {
            tick,
            closed_by_buy: is_buy,
            buy_volume: self.accum_buy,
            sell_volume: self.accum_sell,
        };
        self.accum_buy = 0;
        self.accum_sell = 0;
        self.last_emit_tick = tick;
        self.daily_bar_count += 1;
        Some(bar)
    }

    #[inline]
    fn should_emit(&self, tick: u32) -> bool {
        let max_side = self.accum_buy.max(self.accum_sell);
        if (max_side as f32) < self.threshold_ema.max(0.0) {
            return false;
        }

        // Time guard: no two bars closer than min_gap.
        if self.last_emit_tick != 0 {
            let gap = seconds_of_day(tick).saturating_sub(seconds_of_day(self.last_emit_tick));
            if gap < self.config.min_gap_secs {
                return false;
            }
        }
        true
    }

    fn on_new_day(&mut self) {
        self.daily_bar_count = 0;
        self.accum_buy = 0;
        self.accum_sell = 0;
        self.last_emit_tick = 0;

        if !self.daily_volumes.is_empty() {
            let optimal = self.compute_optimal_threshold();
            self.threshold_ema = if self.threshold_ema < 0.0 {
                optimal
            } else {
                self.ema_alpha * optimal + (1.0 - self.ema_alpha) * self.threshold_ema
            };
        }

        self.daily_sides.clear();
        self.daily_volumes.clear();
    }

    /// Binary search over yesterday's tape for the threshold that yields
    /// the target bar count within tolerance.
    fn compute_optimal_threshold(&self) -> f32 {
        let mut lo = *self.daily_volumes.iter().min().unwrap_or(&0) as f32;
        let mut hi: f32 = self.daily_volumes.iter().map(|&v| v as f32).sum();

        const MAX_ITERATIONS: usize = 20;
        for _ in 0..MAX_ITERATIONS {
            let mid = 0.5 * (lo + hi);
            let bars = self.simulate_bar_count(mid);

            if (bars - self.expected_bars_per_day).abs() <= self.bar_tolerance
                || (hi - lo) < 100.0
            {
                return mid;
            }
            if bars > self.expected_bars_per_day {
                lo = mid;
            } else {
                hi = mid;
            }
        }
        0.5 * (lo + hi)
    }

    fn simulate_bar_count(&self, threshold: f32) -> i32 {
        let mut buy = 0.0f32;
        let mut sell = 0.0f32;
        let mut bars = 0i32;

        for (i, &vol) in self.daily_volumes.iter().enumerate() {
            if self.daily_sides[i] {
                buy += vol as f32;
            } else {
                sell += vol as f32;
            }
            if buy >= threshold || sell >= threshold {
                bars += 1;
                buy = 0.0;
                sell = 0.0;
            }
        }
        bars
    }
}

#[inline(always)]
fn seconds_of_day(tick: u32) -> u32 {
    let h = (tick >> 24) & 0xff;
    let m = (tick >> 16) & 0xff;
    let s = (tick >> 8) & 0xff;
    h * 3600 + m * 60 + s
}
