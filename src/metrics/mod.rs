//! Metrics collection for observability

use prometheus::{
    Counter, CounterVec, Histogram, HistogramOpts, HistogramVec, Opts, Registry,
    register_counter_vec_with_registry, register_histogram_vec_with_registry,
    register_counter_with_registry, register_histogram_with_registry,
};
use std::sync::Arc;
use std::time::Duration;
use once_cell::sync::Lazy;

use crate::admission::ErrorClass;
use crate::context::Budget;
use crate::knowledge::{SearchMode, SelectionMetrics};

/// Global metrics registry
pub static METRICS: Lazy<Arc<Metrics>> = Lazy::new(|| {
    Arc::new(Metrics::new().expect("Failed to initialize metrics"))
});

/// Metrics collector
pub struct Metrics {
    registry: Registry,

    // Budget metrics
    pub budget_allocations: CounterVec,
    pub budget_knowledge_tokens: Histogram,
    pub budget_history_tokens: Histogram,
    pub budget_degraded: Counter,

    // Knowledge metrics
    pub knowledge_searches: CounterVec,
    pub knowledge_search_hits: Histogram,
    pub embedding_cache_lookups: CounterVec,
    pub selection_tokens_used: Histogram,
    pub selection_budget_usage: Histogram,

    // Admission metrics
    pub admission_delays: CounterVec,
    pub admission_delay_seconds: HistogramVec,
    pub admission_retries: CounterVec,
    pub admission_outcomes: CounterVec,

    // Generation metrics
    pub backend_requests: CounterVec,
    pub backend_request_duration: HistogramVec,
    pub generation_fallbacks: Counter,
    pub generation_unavailable: Counter,

    // Chat API metrics
    pub chat_requests: CounterVec,
    pub chat_request_duration: HistogramVec,
}

impl Metrics {
    /// Create a new metrics collector
    pub fn new() -> Result<Self, Box<dyn std::error::Error>> {
        let registry = Registry::new();

        // Budget metrics
        let budget_allocations = register_counter_vec_with_registry!(
            Opts::new("budget_allocations_total", "Total budget allocations"),
            &["complexity"],
            registry
        )?;

        let budget_knowledge_tokens = register_histogram_with_registry!(
            HistogramOpts::new("budget_knowledge_tokens", "Knowledge tokens allocated per request")
                .buckets(vec![0.0, 100.0, 250.0, 500.0, 1000.0, 2000.0, 4000.0]),
            registry
        )?;

        let budget_history_tokens = register_histogram_with_registry!(
            HistogramOpts::new("budget_history_tokens", "History tokens allocated per request")
                .buckets(vec![0.0, 100.0, 250.0, 500.0, 1000.0, 2000.0, 4000.0]),
            registry
        )?;

        let budget_degraded = register_counter_with_registry!(
            Opts::new("budget_degraded_total", "Allocations with no capacity left for context"),
            registry
        )?;

        // Knowledge metrics
        let knowledge_searches = register_counter_vec_with_registry!(
            Opts::new("knowledge_searches_total", "Total knowledge searches"),
            &["mode"],
            registry
        )?;

        let knowledge_search_hits = register_histogram_with_registry!(
            HistogramOpts::new("knowledge_search_hits", "Cards returned per search")
                .buckets(vec![0.0, 1.0, 2.0, 4.0, 8.0, 16.0, 32.0]),
            registry
        )?;

        let embedding_cache_lookups = register_counter_vec_with_registry!(
            Opts::new("embedding_cache_lookups_total", "Query embedding cache lookups"),
            &["result"],
            registry
        )?;

        let selection_tokens_used = register_histogram_with_registry!(
            HistogramOpts::new("selection_tokens_used", "Knowledge tokens selected per request")
                .buckets(vec![0.0, 100.0, 250.0, 500.0, 1000.0, 2000.0, 4000.0]),
            registry
        )?;

        let selection_budget_usage = register_histogram_with_registry!(
            HistogramOpts::new("selection_budget_usage_ratio", "Share of knowledge budget used")
                .buckets(vec![0.1, 0.25, 0.5, 0.75, 0.9, 1.0]),
            registry
        )?;

        // Admission metrics
        let admission_delays = register_counter_vec_with_registry!(
            Opts::new("admission_delays_total", "Requests delayed by admission control"),
            &["limit"],
            registry
        )?;

        let admission_delay_seconds = register_histogram_vec_with_registry!(
            "admission_delay_seconds",
            "Time spent waiting for admission in seconds",
            &["limit"],
            registry
        )?;

        let admission_retries = register_counter_vec_with_registry!(
            Opts::new("admission_retries_total", "Retries scheduled after a failed attempt"),
            &["class"],
            registry
        )?;

        let admission_outcomes = register_counter_vec_with_registry!(
            Opts::new("admission_outcomes_total", "Final outcome of admitted operations"),
            &["outcome"],
            registry
        )?;

        // Generation metrics
        let backend_requests = register_counter_vec_with_registry!(
            Opts::new("backend_requests_total", "Total generation backend requests"),
            &["backend", "status"],
            registry
        )?;

        let backend_request_duration = register_histogram_vec_with_registry!(
            "backend_request_duration_seconds",
            "Generation backend request duration in seconds",
            &["backend"],
            registry
        )?;

        let generation_fallbacks = register_counter_with_registry!(
            Opts::new("generation_fallbacks_total", "Requests answered by the secondary backend"),
            registry
        )?;

        let generation_unavailable = register_counter_with_registry!(
            Opts::new("generation_unavailable_total", "Requests where both backends failed"),
            registry
        )?;

        // Chat API metrics
        let chat_requests = register_counter_vec_with_registry!(
            Opts::new("chat_requests_total", "Total chat requests"),
            &["status"],
            registry
        )?;

        let chat_request_duration = register_histogram_vec_with_registry!(
            "chat_request_duration_seconds",
            "Chat request duration in seconds",
            &["endpoint"],
            registry
        )?;

        Ok(Self {
            registry,
            budget_allocations,
            budget_knowledge_tokens,
            budget_history_tokens,
            budget_degraded,
            knowledge_searches,
            knowledge_search_hits,
            embedding_cache_lookups,
            selection_tokens_used,
            selection_budget_usage,
            admission_delays,
            admission_delay_seconds,
            admission_retries,
            admission_outcomes,
            backend_requests,
            backend_request_duration,
            generation_fallbacks,
            generation_unavailable,
            chat_requests,
            chat_request_duration,
        })
    }

    /// Get the metrics registry for exporting
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Record a budget allocation
    pub fn record_budget(&self, budget: &Budget) {
        self.budget_allocations
            .with_label_values(&[budget.complexity.as_str()])
            .inc();
        self.budget_knowledge_tokens.observe(budget.knowledge as f64);
        self.budget_history_tokens.observe(budget.history as f64);
        if budget.degraded {
            self.budget_degraded.inc();
        }
    }

    /// Record a knowledge search
    pub fn record_search(&self, mode: SearchMode, hits: usize) {
        self.knowledge_searches.with_label_values(&[mode.as_str()]).inc();
        self.knowledge_search_hits.observe(hits as f64);
    }

    /// Record a query embedding cache lookup
    pub fn record_embedding_cache(&self, hit: bool) {
        let result = if hit { "hit" } else { "miss" };
        self.embedding_cache_lookups.with_label_values(&[result]).inc();
    }

    /// Record a knowledge selection
    pub fn record_selection(&self, metrics: &SelectionMetrics) {
        self.selection_tokens_used.observe(metrics.tokens_used as f64);
        if metrics.budget > 0 {
            self.selection_budget_usage
                .observe(metrics.tokens_used as f64 / metrics.budget as f64);
        }
    }

    /// Record time a request spent throttled by `limit` ("session", "high_cost", "global")
    pub fn record_admission_delay(&self, limit: &str, waited: Duration) {
        self.admission_delays.with_label_values(&[limit]).inc();
        self.admission_delay_seconds
            .with_label_values(&[limit])
            .observe(waited.as_secs_f64());
    }

    /// Record a scheduled retry
    pub fn record_retry(&self, class: ErrorClass) {
        self.admission_retries.with_label_values(&[class.as_str()]).inc();
    }

    /// Record the final outcome of an admitted operation
    pub fn record_admission_outcome(&self, success: bool) {
        let outcome = if success { "success" } else { "failure" };
        self.admission_outcomes.with_label_values(&[outcome]).inc();
    }

    /// Record a single backend call
    pub fn record_backend_request(&self, backend: &str, success: bool, elapsed: Duration) {
        let status = if success { "success" } else { "error" };
        self.backend_requests.with_label_values(&[backend, status]).inc();
        self.backend_request_duration
            .with_label_values(&[backend])
            .observe(elapsed.as_secs_f64());
    }

    /// Record a fallback to the secondary backend
    pub fn record_fallback(&self) {
        self.generation_fallbacks.inc();
    }

    /// Record that both backends failed
    pub fn record_unavailable(&self) {
        self.generation_unavailable.inc();
    }

    /// Record a chat request
    pub fn record_chat_request(&self, status: &str) {
        self.chat_requests.with_label_values(&[status]).inc();
    }

    /// Export metrics in Prometheus text format
    pub fn export_prometheus(&self) -> String {
        use prometheus::Encoder;

        let encoder = prometheus::TextEncoder::new();
        let metric_families = self.registry.gather();

        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer).unwrap_or_default();

        String::from_utf8(buffer).unwrap_or_default()
    }
}

/// Helper macro to time operations
#[macro_export]
macro_rules! time_operation {
    ($histogram:expr, $label:expr, $operation:expr) => {{
        let timer = $histogram.with_label_values(&[$label]).start_timer();
        let result = $operation;
        timer.observe_duration();
        result
    }};
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Complexity;

    #[test]
    fn test_metrics_initialization() {
        let metrics = Metrics::new();
        assert!(metrics.is_ok());
    }

    #[test]
    fn test_budget_recording() {
        let metrics = Metrics::new().unwrap();
        let budget = Budget {
            header: 150,
            knowledge: 0,
            history: 0,
            auxiliary: 0,
            user_message: 1900,
            reserve: 0,
            complexity: Complexity::Complex,
            degraded: true,
        };

        metrics.record_budget(&budget);
        metrics.record_budget(&budget);

        assert_eq!(metrics.budget_degraded.get(), 2.0);
        assert_eq!(
            metrics.budget_allocations.with_label_values(&["complex"]).get(),
            2.0
        );
    }

    #[test]
    fn test_export_contains_registered_metrics() {
        let metrics = Metrics::new().unwrap();
        metrics.record_fallback();
        metrics.record_search(SearchMode::Lexical, 3);
        metrics.record_retry(ErrorClass::FallbackEligible);

        let output = metrics.export_prometheus();
        assert!(output.contains("generation_fallbacks_total 1"));
        assert!(output.contains("knowledge_searches_total{mode=\"lexical\"} 1"));
        assert!(output.contains("admission_retries_total{class=\"fallback_eligible\"} 1"));
    }
}
