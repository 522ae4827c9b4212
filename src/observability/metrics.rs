use prometheus::{Encoder, HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry, TextEncoder};

#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    pub transitions_total: IntCounterVec,
    pub transition_rejections_total: IntCounterVec,
    pub assignments_total: IntCounterVec,
    pub otp_validations_total: IntCounterVec,
    pub courier_shipments_total: IntCounterVec,
    pub notifications_total: IntCounterVec,
    pub sweep_latency_seconds: HistogramVec,
}

impl Metrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let transitions_total = IntCounterVec::new(
            Opts::new("order_transitions_total", "Committed order status transitions"),
            &["to"],
        )
        .expect("valid order_transitions_total metric");

        let transition_rejections_total = IntCounterVec::new(
            Opts::new(
                "order_transition_rejections_total",
                "Rejected order status transitions by reason",
            ),
            &["reason"],
        )
        .expect("valid order_transition_rejections_total metric");

        let assignments_total = IntCounterVec::new(
            Opts::new("agent_assignments_total", "Agent assignment attempts by outcome"),
            &["outcome"],
        )
        .expect("valid agent_assignments_total metric");

        let otp_validations_total = IntCounterVec::new(
            Opts::new("otp_validations_total", "Delivery code validations by outcome"),
            &["outcome"],
        )
        .expect("valid otp_validations_total metric");

        let courier_shipments_total = IntCounterVec::new(
            Opts::new("courier_shipments_total", "Courier shipment requests by outcome"),
            &["outcome"],
        )
        .expect("valid courier_shipments_total metric");

        let notifications_total = IntCounterVec::new(
            Opts::new("notifications_total", "Notification dispatches by outcome"),
            &["outcome"],
        )
        .expect("valid notifications_total metric");

        let sweep_latency_seconds = HistogramVec::new(
            HistogramOpts::new(
                "auto_assign_sweep_latency_seconds",
                "Latency of auto-assign sweeps in seconds",
            ),
            &["outcome"],
        )
        .expect("valid auto_assign_sweep_latency_seconds metric");

        registry
            .register(Box::new(transitions_total.clone()))
            .expect("register order_transitions_total");
        registry
            .register(Box::new(transition_rejections_total.clone()))
            .expect("register order_transition_rejections_total");
        registry
            .register(Box::new(assignments_total.clone()))
            .expect("register agent_assignments_total");
        registry
            .register(Box::new(otp_validations_total.clone()))
            .expect("register otp_validations_total");
        registry
            .register(Box::new(courier_shipments_total.clone()))
            .expect("register courier_shipments_total");
        registry
            .register(Box::new(notifications_total.clone()))
            .expect("register notifications_total");
        registry
            .register(Box::new(sweep_latency_seconds.clone()))
            .expect("register auto_assign_sweep_latency_seconds");

        Self {
            registry,
            transitions_total,
            transition_rejections_total,
            assignments_total,
            otp_validations_total,
            courier_shipments_total,
            notifications_total,
            sweep_latency_seconds,
        }
    }

    pub fn encode(&self) -> Result<String, String> {
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();

        TextEncoder::new()
            .encode(&metric_families, &mut buffer)
            .map_err(|err| format!("failed to encode metrics: {err}"))?;

        String::from_utf8(buffer).map_err(|err| format!("metrics are not valid utf8: {err}"))
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}
