use prometheus_client::{
    encoding::EncodeLabelSet,
    metrics::{counter::Counter, family::Family, gauge::Gauge},
    registry::Registry,
};

#[derive(Clone, Debug, Default)]
pub struct AdmissionMetrics {
    decisions: Family<DecisionLabels, Counter>,
    partitions: Family<PolicyLabels, Gauge>,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct DecisionLabels {
    policy: String,
    decision: &'static str,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct PolicyLabels {
    policy: String,
}

impl AdmissionMetrics {
    pub fn register(prom: &mut Registry) -> Self {
        let decisions = Family::default();
        prom.register(
            "admission_decisions",
            "Count of admission decisions by policy",
            decisions.clone(),
        );

        let partitions = Family::default();
        prom.register(
            "admission_partitions",
            "The number of live rate-limit partitions by policy",
            partitions.clone(),
        );

        Self {
            decisions,
            partitions,
        }
    }

    pub(crate) fn decided(&self, policy: &str, admitted: bool) {
        self.decisions
            .get_or_create(&DecisionLabels {
                policy: policy.to_string(),
                decision: if admitted { "admit" } else { "reject" },
            })
            .inc();
    }

    pub(crate) fn set_partitions(&self, policy: &str, count: usize) {
        self.partitions
            .get_or_create(&PolicyLabels {
                policy: policy.to_string(),
            })
            .set(count as i64);
    }
}
