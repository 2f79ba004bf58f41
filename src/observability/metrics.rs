use prometheus::{
    Encoder, HistogramVec, IntCounter, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry,
    TextEncoder,
};

#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    pub offers_total: IntCounterVec,
    pub courier_signals_total: IntCounterVec,
    pub refusals_total: IntCounter,
    pub courier_repairs_total: IntCounter,
    pub stuck_couriers: IntGauge,
    pub board_partition_size: IntGaugeVec,
    pub dispatch_latency_seconds: HistogramVec,
}

impl Metrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let offers_total = IntCounterVec::new(
            Opts::new("offers_total", "Offer attempts by outcome"),
            &["outcome"],
        )
        .expect("valid offers_total metric");

        let courier_signals_total = IntCounterVec::new(
            Opts::new(
                "courier_signals_total",
                "Courier lifecycle signals by kind and outcome",
            ),
            &["signal", "outcome"],
        )
        .expect("valid courier_signals_total metric");

        let refusals_total =
            IntCounter::new("refusals_total", "Total refusals recorded in the ledger")
                .expect("valid refusals_total metric");

        let courier_repairs_total = IntCounter::new(
            "courier_repairs_total",
            "Stuck couriers repaired via force-available",
        )
        .expect("valid courier_repairs_total metric");

        let stuck_couriers = IntGauge::new(
            "stuck_couriers",
            "Couriers currently busy with no active order",
        )
        .expect("valid stuck_couriers metric");

        let board_partition_size = IntGaugeVec::new(
            Opts::new("board_partition_size", "Orders per dispatch board column"),
            &["partition"],
        )
        .expect("valid board_partition_size metric");

        let dispatch_latency_seconds = HistogramVec::new(
            prometheus::HistogramOpts::new(
                "dispatch_latency_seconds",
                "Latency of coordinator operations in seconds",
            ),
            &["operation"],
        )
        .expect("valid dispatch_latency_seconds metric");

        registry
            .register(Box::new(offers_total.clone()))
            .expect("register offers_total");
        registry
            .register(Box::new(courier_signals_total.clone()))
            .expect("register courier_signals_total");
        registry
            .register(Box::new(refusals_total.clone()))
            .expect("register refusals_total");
        registry
            .register(Box::new(courier_repairs_total.clone()))
            .expect("register courier_repairs_total");
        registry
            .register(Box::new(stuck_couriers.clone()))
            .expect("register stuck_couriers");
        registry
            .register(Box::new(board_partition_size.clone()))
            .expect("register board_partition_size");
        registry
            .register(Box::new(dispatch_latency_seconds.clone()))
            .expect("register dispatch_latency_seconds");

        Self {
            registry,
            offers_total,
            courier_signals_total,
            refusals_total,
            courier_repairs_total,
            stuck_couriers,
            board_partition_size,
            dispatch_latency_seconds,
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
