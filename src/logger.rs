//! Persisted telemetry streams
//!
//! When the configuration names a log directory, the filter keeps four plain
//! text streams there for offline analysis:
//!
//! - `conf.txt`: a one-shot snapshot of the configuration at init.
//! - `prop.txt`: time, mean state, and covariance diagonal, downsampled to
//!   every tenth propagation.
//! - `meas.txt`: kind name, time, measurement, prediction, (for depth kinds)
//!   the slot's depth variance, and the feature id; the first few records of
//!   each kind are skipped to let transients settle.
//! - `perf.txt`: exponentially-weighted moving averages of the propagate
//!   duration and the per-kind update durations, flushed on a coarse cadence.
//!
//! Writes happen on buffered files off the estimation math; an I/O error
//! while recording is swallowed so the filter itself never fails. Everything
//! here is row-oriented `writeln!` output, whitespace separated, one record
//! per line.

use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::Path;

use nalgebra::DVector;

use crate::config::FilterConfig;
use crate::measurement::MeasurementKind;
use crate::MAX_FEATURES;

/// EWMA smoothing factor for the timing telemetry.
const EWMA_ALPHA: f64 = 0.1;
/// Propagation records are downsampled by this factor.
const PROP_DECIMATION: usize = 10;
/// Performance rows are flushed after this many filter steps.
const PERF_INTERVAL: usize = 1000;
/// Per-kind measurement records skipped before logging starts.
const MEAS_WARMUP: usize = 10;

/// Open file streams plus the timing accumulators they report.
pub struct FilterLogger {
    prop: BufWriter<File>,
    meas: BufWriter<File>,
    perf: BufWriter<File>,
    prop_time: f64,
    update_times: [f64; MeasurementKind::COUNT],
    meas_counts: [usize; MeasurementKind::COUNT],
    step_count: usize,
    prop_count: usize,
}

impl std::fmt::Debug for FilterLogger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FilterLogger")
            .field("prop_time", &self.prop_time)
            .field("step_count", &self.step_count)
            .finish()
    }
}

impl FilterLogger {
    /// Create the directory if needed, open the streams, and write the
    /// configuration snapshot.
    pub fn create(directory: &Path, cfg: &FilterConfig) -> io::Result<Self> {
        fs::create_dir_all(directory)?;

        let mut conf = BufWriter::new(File::create(directory.join("conf.txt"))?);
        writeln!(conf, "Using Drag Term: {}", cfg.use_drag_term)?;
        writeln!(conf, "Max Features: {}", MAX_FEATURES)?;
        writeln!(conf, "Min Depth: {}", cfg.min_depth)?;
        write_row(&mut conf, "P0", cfg.p0.iter())?;
        write_row(&mut conf, "P0_feat", cfg.p0_feat.iter())?;
        write_row(&mut conf, "Qx", cfg.qx.iter())?;
        write_row(&mut conf, "Qx_feat", cfg.qx_feat.iter())?;
        write_row(&mut conf, "Qu", cfg.qu.iter())?;
        write_row(&mut conf, "gamma", cfg.gamma.iter())?;
        write_row(&mut conf, "gamma_feat", cfg.gamma_feat.iter())?;
        conf.flush()?;

        Ok(FilterLogger {
            prop: BufWriter::new(File::create(directory.join("prop.txt"))?),
            meas: BufWriter::new(File::create(directory.join("meas.txt"))?),
            perf: BufWriter::new(File::create(directory.join("perf.txt"))?),
            prop_time: 0.0,
            update_times: [0.0; MeasurementKind::COUNT],
            meas_counts: [0; MeasurementKind::COUNT],
            step_count: 0,
            prop_count: 0,
        })
    }

    /// Fold one propagation duration into the EWMA and flush the performance
    /// row on its cadence.
    pub fn note_propagation(&mut self, t: f64, elapsed_seconds: f64) {
        self.prop_time += EWMA_ALPHA * (elapsed_seconds - self.prop_time);
        self.step_count += 1;
        if self.step_count >= PERF_INTERVAL {
            self.step_count = 0;
            let _ = write!(self.perf, "{t}\t{:.9}", self.prop_time);
            for kind_time in &self.update_times {
                let _ = write!(self.perf, "\t{kind_time:.9}");
            }
            let _ = writeln!(self.perf);
        }
    }

    /// Fold one update duration into the per-kind EWMA.
    pub fn note_update(&mut self, kind: MeasurementKind, elapsed_seconds: f64) {
        let slot = &mut self.update_times[kind.index()];
        *slot += EWMA_ALPHA * (elapsed_seconds - *slot);
        self.step_count += 1;
    }

    /// Record the propagated state and covariance diagonal, downsampled.
    pub fn record_prop(&mut self, t: f64, x: &DVector<f64>, ambient: usize, p_diag: &DVector<f64>) {
        self.prop_count += 1;
        if self.prop_count < PROP_DECIMATION {
            return;
        }
        self.prop_count = 0;
        let _ = write!(self.prop, "{t}");
        for k in 0..ambient {
            let _ = write!(self.prop, " {}", x[k]);
        }
        for v in p_diag.iter() {
            let _ = write!(self.prop, " {v}");
        }
        let _ = writeln!(self.prop);
    }

    /// Record one measurement with its prediction. `variance` carries the
    /// depth variance for the depth kinds and is omitted otherwise.
    pub fn record_meas(
        &mut self,
        kind: MeasurementKind,
        t: f64,
        z: &DVector<f64>,
        zhat: &DVector<f64>,
        z_dim: usize,
        variance: Option<f64>,
        id: Option<u32>,
    ) {
        let count = &mut self.meas_counts[kind.index()];
        *count += 1;
        if *count <= MEAS_WARMUP {
            return;
        }
        let _ = write!(self.meas, "{}\t{t}\t", kind.name());
        for v in z.iter() {
            let _ = write!(self.meas, "{v} ");
        }
        let _ = write!(self.meas, "\t");
        for k in 0..z_dim {
            let _ = write!(self.meas, "{} ", zhat[k]);
        }
        if let Some(var) = variance {
            let _ = write!(self.meas, "\t{var}");
        }
        let _ = writeln!(self.meas, "\t{}", id.map(i64::from).unwrap_or(-1));
    }
}

impl Drop for FilterLogger {
    fn drop(&mut self) {
        let _ = self.prop.flush();
        let _ = self.meas.flush();
        let _ = self.perf.flush();
    }
}

fn write_row<'a, W: Write>(
    w: &mut W,
    label: &str,
    values: impl Iterator<Item = &'a f64>,
) -> io::Result<()> {
    write!(w, "{label}:")?;
    for v in values {
        write!(w, " {v}")?;
    }
    writeln!(w)
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::DVector;

    fn temp_log_dir(tag: &str) -> std::path::PathBuf {
        std::env::temp_dir().join(format!("vi_ekf_logger_{tag}_{}", std::process::id()))
    }

    #[test]
    fn create_writes_config_snapshot() {
        let dir = temp_log_dir("conf");
        {
            let cfg = FilterConfig::default();
            let _logger = FilterLogger::create(&dir, &cfg).expect("logger init");
        }
        let conf = std::fs::read_to_string(dir.join("conf.txt")).expect("conf.txt");
        assert!(conf.contains("Using Drag Term: true"));
        assert!(conf.contains("P0:"));
        assert!(conf.contains("gamma:"));
        assert!(dir.join("prop.txt").exists());
        assert!(dir.join("meas.txt").exists());
        assert!(dir.join("perf.txt").exists());
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn prop_records_are_decimated() {
        let dir = temp_log_dir("prop");
        {
            let cfg = FilterConfig::default();
            let mut logger = FilterLogger::create(&dir, &cfg).expect("logger init");
            let x = DVector::from_element(crate::STATE_CAP, 1.0);
            let p_diag = DVector::from_element(crate::tangent_dim(0), 0.5);
            for step in 0..25 {
                logger.record_prop(step as f64 * 0.01, &x, crate::ambient_dim(0), &p_diag);
            }
        }
        let prop = std::fs::read_to_string(dir.join("prop.txt")).expect("prop.txt");
        assert_eq!(prop.lines().count(), 2);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn meas_records_skip_warmup() {
        let dir = temp_log_dir("meas");
        {
            let cfg = FilterConfig::default();
            let mut logger = FilterLogger::create(&dir, &cfg).expect("logger init");
            let z = DVector::from_vec(vec![1.0, 2.0, 3.0]);
            let zhat = DVector::from_vec(vec![1.1, 2.1, 3.1, 0.0]);
            for _ in 0..12 {
                logger.record_meas(MeasurementKind::Pos, 0.5, &z, &zhat, 3, None, None);
            }
            logger.record_meas(MeasurementKind::Depth, 0.6, &z, &zhat, 1, Some(0.25), Some(4));
        }
        let meas = std::fs::read_to_string(dir.join("meas.txt")).expect("meas.txt");
        assert_eq!(meas.lines().filter(|l| l.starts_with("POS")).count(), 2);
        // Depth records are still inside their warmup window.
        assert_eq!(meas.lines().filter(|l| l.starts_with("DEPTH")).count(), 0);
        let _ = std::fs::remove_dir_all(&dir);
    }
}
