use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct GatewayMetrics {
    admitted_total: AtomicU64,
    rate_limited_total: AtomicU64,
    rejected_callers_total: AtomicU64,
    completed_total: AtomicU64,
    breaker_open_total: AtomicU64,
    no_backend_total: AtomicU64,
    backend_failure_total: AtomicU64,
    analytics_dropped_total: AtomicU64,
}

impl GatewayMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn admitted(&self) {
        self.admitted_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn rate_limited(&self) {
        self.rate_limited_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn rejected_caller(&self) {
        self.rejected_callers_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn completed(&self) {
        self.completed_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn breaker_open(&self) {
        self.breaker_open_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn no_backend(&self) {
        self.no_backend_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn backend_failure(&self) {
        self.backend_failure_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn analytics_dropped(&self) {
        self.analytics_dropped_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn render_prometheus(&self) -> String {
        format!(
            concat!(
                "# TYPE gateway_admitted_total counter\n",
                "gateway_admitted_total {}\n",
                "# TYPE gateway_rate_limited_total counter\n",
                "gateway_rate_limited_total {}\n",
                "# TYPE gateway_rejected_callers_total counter\n",
                "gateway_rejected_callers_total {}\n",
                "# TYPE gateway_completed_total counter\n",
                "gateway_completed_total {}\n",
                "# TYPE gateway_breaker_open_total counter\n",
                "gateway_breaker_open_total {}\n",
                "# TYPE gateway_no_backend_total counter\n",
                "gateway_no_backend_total {}\n",
                "# TYPE gateway_backend_failure_total counter\n",
                "gateway_backend_failure_total {}\n",
                "# TYPE gateway_analytics_dropped_total counter\n",
                "gateway_analytics_dropped_total {}\n"
            ),
            self.admitted_total.load(Ordering::Relaxed),
            self.rate_limited_total.load(Ordering::Relaxed),
            self.rejected_callers_total.load(Ordering::Relaxed),
            self.completed_total.load(Ordering::Relaxed),
            self.breaker_open_total.load(Ordering::Relaxed),
            self.no_backend_total.load(Ordering::Relaxed),
            self.backend_failure_total.load(Ordering::Relaxed),
            self.analytics_dropped_total.load(Ordering::Relaxed),
        )
    }
}
