//! Adaptive Streaming Estimator (C3).
//!
//! Maintains an exponential moving average of available bandwidth per session and maps it to a
//! recommended LOD: a struct holding one running average plus a sample counter, updated on each
//! observation, rather than a full control-theoretic filter.

use crate::config::StreamingConfig;
use crate::protocol::Lod;

pub struct BandwidthEstimator {
    config: StreamingConfig,
    ema_bps: Option<f64>,
    samples: u32,
    forced_tier: Option<Lod>,
    latest_client: Option<f64>,
    latest_server: Option<f64>,
}

impl BandwidthEstimator {
    pub fn new(config: StreamingConfig) -> Self {
        Self {
            config,
            ema_bps: None,
            samples: 0,
            forced_tier: None,
            latest_client: None,
            latest_server: None,
        }
    }

    /// Ingests a client-reported bandwidth sample (bytes/sec).
    pub fn observe_client(&mut self, bps: f64) {
        self.latest_client = Some(bps);
        self.fold_latest();
    }

    /// Ingests a server-measured sample, derived from bytes actually sent over elapsed time.
    pub fn observe_server(&mut self, bytes_sent: u64, elapsed_secs: f64) {
        if elapsed_secs <= 0.0 {
            return;
        }
        self.latest_server = Some(bytes_sent as f64 / elapsed_secs);
        self.fold_latest();
    }

    /// When both a client report and a server measurement are pending, blends them 50/50 before
    /// folding into the EMA; otherwise folds whichever one arrived.
    fn fold_latest(&mut self) {
        let sample = match (self.latest_client.take(), self.latest_server.take()) {
            (Some(c), Some(s)) => (c + s) / 2.0,
            (Some(c), None) => c,
            (None, Some(s)) => s,
            (None, None) => return,
        };

        let alpha = self.config.smoothing_factor;
        self.ema_bps = Some(match self.ema_bps {
            Some(prev) => alpha * sample + (1.0 - alpha) * prev,
            None => sample,
        });
        self.samples += 1;
    }

    /// Forces every subsequent recommendation to `lod` regardless of measured bandwidth, until
    /// cleared. Used for the `set-simulation-mode` override path.
    pub fn set_forced_tier(&mut self, lod: Option<Lod>) {
        self.forced_tier = lod;
    }

    /// Recommends HIGH or LOW — the MEDIUM tier is the foveated selector's territory, not this estimator's.
    /// Below `min_samples` observations this returns LOW (cold-start safety) unless a forced
    /// tier is set.
    pub fn recommend(&self) -> Lod {
        if let Some(forced) = self.forced_tier {
            return forced;
        }
        let Some(bps) = self.ema_bps else {
            return Lod::Low;
        };
        if self.samples < self.config.min_samples {
            return Lod::Low;
        }
        if bps >= self.config.high_threshold_bps {
            Lod::High
        } else {
            Lod::Low
        }
    }

    pub fn current_estimate(&self) -> Option<f64> {
        self.ema_bps
    }
}
