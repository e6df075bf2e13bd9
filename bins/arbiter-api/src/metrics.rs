// Prometheus counters for the submission API
use lazy_static::lazy_static;
use prometheus::{Encoder, IntCounter, IntCounterVec, Opts, Registry, TextEncoder};

lazy_static! {
    pub static ref REGISTRY: Registry = Registry::new();
    pub static ref SUBMISSIONS_TOTAL: IntCounter = register(
        IntCounter::new("arbiter_submissions_total", "Submissions accepted onto the queue")
    );
    pub static ref SUBMISSIONS_REJECTED_TOTAL: IntCounter = register(
        IntCounter::new("arbiter_submissions_rejected_total", "Submissions rejected before enqueue")
    );
    pub static ref STATUS_POLLS_TOTAL: IntCounterVec = register(IntCounterVec::new(
        Opts::new("arbiter_status_polls_total", "Status lookups by job state"),
        &["state"]
    ));
}

fn register<C>(collector: prometheus::Result<C>) -> C
where
    C: prometheus::core::Collector + Clone + 'static,
{
    let collector = collector.expect("static metric definition is valid");
    if let Err(e) = REGISTRY.register(Box::new(collector.clone())) {
        tracing::warn!(error = %e, "Metric registered twice");
    }
    collector
}

/// Render every registered metric in the Prometheus text format
pub fn render() -> String {
    lazy_static::initialize(&SUBMISSIONS_TOTAL);
    lazy_static::initialize(&SUBMISSIONS_REJECTED_TOTAL);
    lazy_static::initialize(&STATUS_POLLS_TOTAL);

    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&REGISTRY.gather(), &mut buffer) {
        tracing::error!(error = %e, "Failed to encode metrics");
    }
    String::from_utf8_lossy(&buffer).into_owned()
}
