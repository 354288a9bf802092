//! Per-pass timing for the aggregate collector (§4.8): how long each of
//! the eight ordered steps took, plus the pass total.

#[derive(Debug, Clone)]
pub struct CollectorMetrics {
    pub name: String,
    pub duration_ms: u128,
}

#[derive(Debug, Clone)]
pub struct GcPassMetrics {
    pub total_duration_ms: u128,
    pub collectors: Vec<CollectorMetrics>,
}

impl GcPassMetrics {
    /// Duration of the named collector's run this pass, if it ran.
    pub fn collector_duration_ms(&self, name: &str) -> Option<u128> {
        self.collectors.iter().find(|c| c.name == name).map(|c| c.duration_ms)
    }
}
