use once_cell::sync::Lazy;
use prometheus::{Encoder, IntCounter, IntGauge, Registry, TextEncoder};

pub static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

pub static STREAMS_RUNNING: Lazy<IntGauge> = Lazy::new(|| {
  let g = IntGauge::new("streams_running", "Number of live camera stream sessions")
    .unwrap_or_else(|e| panic!("gauge streams_running: {e}"));
  REGISTRY.register(Box::new(g.clone())).ok();
  g
});

pub static TRANSCODE_CRASHES_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
  let c = int_counter("transcode_crashes_total", "Total abnormal transcode subprocess exits");
  REGISTRY.register(Box::new(c.clone())).ok();
  c
});

pub static TRANSCODE_RESTARTS_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
  let c = int_counter("transcode_restarts_total", "Total automatic transcode restarts");
  REGISTRY.register(Box::new(c.clone())).ok();
  c
});

pub static BREAKER_OPENED_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
  let c = int_counter("breaker_opened_total", "Total circuit breaker open transitions");
  REGISTRY.register(Box::new(c.clone())).ok();
  c
});

pub static FRAMES_DROPPED_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
  let c = int_counter("frames_dropped_total", "Frames dropped on slow subscriber queues");
  REGISTRY.register(Box::new(c.clone())).ok();
  c
});

pub static ALERTS_PUBLISHED_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
  let c = int_counter("alerts_published_total", "Face detection alerts published to the bus");
  REGISTRY.register(Box::new(c.clone())).ok();
  c
});

fn int_counter(name: &str, help: &str) -> IntCounter {
  IntCounter::new(name, help).unwrap_or_else(|e| panic!("counter {name}: {e}"))
}

pub fn render() -> String {
  let mut buf = Vec::new();
  let encoder = TextEncoder::new();
  let mfs = REGISTRY.gather();
  encoder.encode(&mfs, &mut buf).ok();
  String::from_utf8(buf).unwrap_or_default()
}
