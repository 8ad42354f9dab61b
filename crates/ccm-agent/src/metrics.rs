use prometheus::{
    register_counter_vec_with_registry, register_histogram_vec_with_registry,
    register_histogram_with_registry, CounterVec, Histogram, HistogramVec, Registry,
};

/// Prometheus metrics for the agent. Names, types and labels are fixed for
/// dashboard compatibility; do not rename.
pub struct AgentMetrics {
    pub registry: Registry,
    pub apply_duration_seconds: HistogramVec,
    pub healthcheck_duration_seconds: HistogramVec,
    pub data_resolve_duration_seconds: Histogram,
    pub facts_resolve_duration_seconds: Histogram,
    pub facts_gather_duration_seconds: Histogram,
    pub healthcheck_remediations_count: CounterVec,
    pub data_resolve_error_count: CounterVec,
    pub facts_resolve_error_count: CounterVec,
    pub manifest_fetch_count: CounterVec,
    pub manifest_fetch_error_count: CounterVec,
}

impl AgentMetrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let apply_duration_seconds = register_histogram_vec_with_registry!(
            "choria_ccm_agent_apply_duration_seconds",
            "Duration of a manifest apply",
            &["manifest"],
            registry
        )
        .expect("metric registration");

        let healthcheck_duration_seconds = register_histogram_vec_with_registry!(
            "choria_ccm_agent_healthcheck_duration_seconds",
            "Duration of a health-check apply",
            &["manifests"],
            registry
        )
        .expect("metric registration");

        let data_resolve_duration_seconds = register_histogram_with_registry!(
            "choria_ccm_agent_data_resolve_duration_seconds",
            "Duration of an external-data resolve",
            registry
        )
        .expect("metric registration");

        let facts_resolve_duration_seconds = register_histogram_with_registry!(
            "choria_ccm_agent_facts_resolve_duration_seconds",
            "Duration of a facts refresh",
            registry
        )
        .expect("metric registration");

        let facts_gather_duration_seconds = register_histogram_with_registry!(
            "choria_ccm_facts_gather_duration_seconds",
            "Duration of a raw facts gather call",
            registry
        )
        .expect("metric registration");

        let healthcheck_remediations_count = register_counter_vec_with_registry!(
            "choria_ccm_agent_healthcheck_remediations_count",
            "Remediation applies triggered by a critical health check",
            &["manifest"],
            registry
        )
        .expect("metric registration");

        let data_resolve_error_count = register_counter_vec_with_registry!(
            "choria_ccm_agent_data_resolve_error_count",
            "Failed external-data resolve attempts",
            &["url"],
            registry
        )
        .expect("metric registration");

        let facts_resolve_error_count = register_counter_vec_with_registry!(
            "choria_ccm_agent_facts_resolve_error_count",
            "Failed facts refresh attempts",
            &["manifest"],
            registry
        )
        .expect("metric registration");

        let manifest_fetch_count = register_counter_vec_with_registry!(
            "choria_ccm_agent_manifest_fetch_count",
            "Successful manifest fetches",
            &["manifest"],
            registry
        )
        .expect("metric registration");

        let manifest_fetch_error_count = register_counter_vec_with_registry!(
            "choria_ccm_agent_manifest_fetch_error_count",
            "Failed manifest fetches",
            &["manifest"],
            registry
        )
        .expect("metric registration");

        AgentMetrics {
            registry,
            apply_duration_seconds,
            healthcheck_duration_seconds,
            data_resolve_duration_seconds,
            facts_resolve_duration_seconds,
            facts_gather_duration_seconds,
            healthcheck_remediations_count,
            data_resolve_error_count,
            facts_resolve_error_count,
            manifest_fetch_count,
            manifest_fetch_error_count,
        }
    }
}

impl Default for AgentMetrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metric_names_are_bit_exact() {
        use prometheus::core::Collector;

        let metrics = AgentMetrics::new();
        // Vec metrics have no observed label combinations yet, so assert via
        // each collector's descriptor rather than `registry.gather()`.
        let fq_name = |c: &dyn Collector| c.desc()[0].fq_name.clone();
        assert_eq!(
            fq_name(&metrics.apply_duration_seconds),
            "choria_ccm_agent_apply_duration_seconds"
        );
        assert_eq!(
            fq_name(&metrics.healthcheck_duration_seconds),
            "choria_ccm_agent_healthcheck_duration_seconds"
        );
        assert_eq!(
            fq_name(&metrics.data_resolve_duration_seconds),
            "choria_ccm_agent_data_resolve_duration_seconds"
        );
        assert_eq!(
            fq_name(&metrics.facts_resolve_duration_seconds),
            "choria_ccm_agent_facts_resolve_duration_seconds"
        );
        assert_eq!(
            fq_name(&metrics.facts_gather_duration_seconds),
            "choria_ccm_facts_gather_duration_seconds"
        );
        assert_eq!(
            fq_name(&metrics.healthcheck_remediations_count),
            "choria_ccm_agent_healthcheck_remediations_count"
        );
        assert_eq!(
            fq_name(&metrics.data_resolve_error_count),
            "choria_ccm_agent_data_resolve_error_count"
        );
        assert_eq!(
            fq_name(&metrics.facts_resolve_error_count),
            "choria_ccm_agent_facts_resolve_error_count"
        );
        assert_eq!(
            fq_name(&metrics.manifest_fetch_count),
            "choria_ccm_agent_manifest_fetch_count"
        );
        assert_eq!(
            fq_name(&metrics.manifest_fetch_error_count),
            "choria_ccm_agent_manifest_fetch_error_count"
        );
    }
}
