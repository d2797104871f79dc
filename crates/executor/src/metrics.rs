use prometheus::{
    CounterVec, Encoder, Gauge, Histogram, HistogramOpts, Opts, Registry, TextEncoder,
};

use crate::Result;

/// Namespace for every metric produced by this program.
pub const NAMESPACE: &str = "am_executor";

pub const ERR_READ: &str = "read";
pub const ERR_UNMARSHAL: &str = "unmarshal";
pub const ERR_START: &str = "start";

pub const SIG_OK: &str = "ok";
pub const SIG_FAIL: &str = "fail";

pub const SKIP_NOMATCH: &str = "nomatch";
pub const SKIP_NOMAX: &str = "nomax";
pub const SKIP_NOFINGER: &str = "nofinger";
pub const SKIP_FINGERUNDER: &str = "fingerunder";
pub const SKIP_FINGEROVER: &str = "fingerover";

const ERR_STAGES: [&str; 3] = [ERR_READ, ERR_UNMARSHAL, ERR_START];
const SIG_RESULTS: [&str; 2] = [SIG_OK, SIG_FAIL];
const SKIP_REASONS: [&str; 5] = [
    SKIP_NOMATCH,
    SKIP_NOMAX,
    SKIP_NOFINGER,
    SKIP_FINGERUNDER,
    SKIP_FINGEROVER,
];

/// The instruments backing `/metrics`.
///
/// Each server owns its own registry instead of the process-global default,
/// so server instances in tests don't collide when registering.
pub struct Metrics {
    registry: Registry,
    pub process_duration: Histogram,
    pub processes_current: Gauge,
    pub errors: CounterVec,
    pub signalled: CounterVec,
    pub skipped: CounterVec,
}

impl Metrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let process_duration = Histogram::with_opts(
            HistogramOpts::new("duration_seconds", "Time the processes handling alerts ran.")
                .namespace(NAMESPACE)
                .subsystem("process")
                .buckets(vec![1.0, 10.0, 60.0, 600.0, 900.0, 1800.0]),
        )?;
        let processes_current = Gauge::with_opts(
            Opts::new("current", "Current number of processes running.")
                .namespace(NAMESPACE)
                .subsystem("processes"),
        )?;
        let errors = CounterVec::new(
            Opts::new("total", "Total number of errors while processing alerts.")
                .namespace(NAMESPACE)
                .subsystem("errors"),
            &["stage"],
        )?;
        let signalled = CounterVec::new(
            Opts::new("total", "Total number of commands signalled on resolved alerts.")
                .namespace(NAMESPACE)
                .subsystem("signalled"),
            &["result"],
        )?;
        let skipped = CounterVec::new(
            Opts::new("total", "Total number of command launches skipped.")
                .namespace(NAMESPACE)
                .subsystem("skipped"),
            &["reason"],
        )?;

        registry.register(Box::new(process_duration.clone()))?;
        registry.register(Box::new(processes_current.clone()))?;
        registry.register(Box::new(errors.clone()))?;
        registry.register(Box::new(signalled.clone()))?;
        registry.register(Box::new(skipped.clone()))?;

        // Touch every fixed label so the first scrape reports zeros rather
        // than omitting the series.
        for stage in ERR_STAGES {
            errors.with_label_values(&[stage]);
        }
        for result in SIG_RESULTS {
            signalled.with_label_values(&[result]);
        }
        for reason in SKIP_REASONS {
            skipped.with_label_values(&[reason]);
        }

        Ok(Self {
            registry,
            process_duration,
            processes_current,
            errors,
            signalled,
            skipped,
        })
    }

    /// Renders the registry in the Prometheus text exposition format.
    pub fn gather(&self) -> Result<String> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        Ok(String::from_utf8_lossy(&buffer).into_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_labels_are_present_in_the_first_scrape() {
        let metrics = Metrics::new().unwrap();
        let body = metrics.gather().unwrap();

        for name in [
            "am_executor_process_duration_seconds",
            "am_executor_processes_current",
            "am_executor_errors_total",
            "am_executor_signalled_total",
            "am_executor_skipped_total",
        ] {
            assert!(body.contains(name), "missing {name} in:\n{body}");
        }
        for label in ERR_STAGES {
            assert!(body.contains(&format!("stage=\"{label}\"")));
        }
        for label in SIG_RESULTS {
            assert!(body.contains(&format!("result=\"{label}\"")));
        }
        for label in SKIP_REASONS {
            assert!(body.contains(&format!("reason=\"{label}\"")));
        }
    }

    #[test]
    fn instruments_record() {
        let metrics = Metrics::new().unwrap();
        metrics.process_duration.observe(0.25);
        metrics.processes_current.inc();
        metrics.errors.with_label_values(&[ERR_START]).inc();
        metrics.processes_current.dec();

        assert_eq!(metrics.process_duration.get_sample_count(), 1);
        assert_eq!(metrics.processes_current.get(), 0.0);
        assert_eq!(metrics.errors.with_label_values(&[ERR_START]).get(), 1.0);
    }

    #[test]
    fn registries_are_independent() {
        // Two instances must not clash the way the global registry would.
        let a = Metrics::new().unwrap();
        let b = Metrics::new().unwrap();
        a.errors.with_label_values(&[ERR_READ]).inc();
        assert_eq!(b.errors.with_label_values(&[ERR_READ]).get(), 0.0);
    }
}
