use super::{MetricCounter, MetricName, MetricValue};
use async_trait::async_trait;
use color_eyre::Result;
use opentelemetry::{
	global,
	metrics::{Counter, Meter},
	KeyValue,
};
use opentelemetry_otlp::{MetricExporter, Protocol, WithExportConfig};
use opentelemetry_sdk::{
	metrics::{PeriodicReader, SdkMeterProvider},
	runtime::Tokio,
	Resource,
};
use serde::{Deserialize, Serialize};
use std::{collections::HashMap, sync::Arc, time::Duration};
use tokio::sync::Mutex;

// NOTE: Buffers trade space for simplicity, values are aggregated only on flush.
pub struct Metrics {
	meter: Meter,
	counters: HashMap<&'static str, Counter<u64>>,
	attributes: Vec<KeyValue>,
	metric_buffer: Arc<Mutex<Vec<Record>>>,
	counter_buffer: Arc<Mutex<Vec<MetricCounter>>>,
}

impl Metrics {
	fn record_u64(&self, name: &'static str, value: u64) {
		let attributes = self.attributes.clone();
		self.meter
			.u64_observable_gauge(name)
			.with_callback(move |observer| observer.observe(value, &attributes))
			.build();
	}

	fn record_f64(&self, name: &'static str, value: f64) {
		let attributes = self.attributes.clone();
		self.meter
			.f64_observable_gauge(name)
			.with_callback(move |observer| observer.observe(value, &attributes))
			.build();
	}
}

#[derive(Debug)]
pub enum Record {
	MaxU64(&'static str, u64),
	AvgF64(&'static str, f64),
}

impl From<MetricValue> for Record {
	fn from(value: MetricValue) -> Self {
		use MetricValue::*;
		use Record::*;

		let name = value.name();

		match value {
			FragmentBufferSize(size) => MaxU64(name, size as u64),
			RequestBufferSize(size) => MaxU64(name, size as u64),
			ReverseLookupSize(size) => MaxU64(name, size as u64),
			DnsCacheSize(size) => MaxU64(name, size as u64),
			CmcGroups(count) => MaxU64(name, count as u64),
			CmcGroupSize(size) => AvgF64(name, size as f64),
		}
	}
}

/// Counts occurrences of counters in the provided buffer.
/// Returned value is a `HashMap` where the keys are the counter name,
/// and values are the counts of those counters.
fn flatten_counters(buffer: &[MetricCounter]) -> HashMap<&'static str, u64> {
	let mut result = HashMap::new();
	for counter in buffer {
		result
			.entry(counter.name())
			.and_modify(|count| {
				if !counter.as_last() {
					*count += 1
				}
			})
			.or_insert(1);
	}
	result
}

/// Aggregates buffered metrics into `u64` or `f64` values, depending on the metric.
/// Returned values are `HashMap`s where the keys are the metric name,
/// and values are the aggregations (avg, max) of those metrics.
fn flatten_metrics(buffer: &[Record]) -> (HashMap<&'static str, u64>, HashMap<&'static str, f64>) {
	let mut u64_maximums: HashMap<&'static str, Vec<u64>> = HashMap::new();
	let mut f64_averages: HashMap<&'static str, Vec<f64>> = HashMap::new();

	for value in buffer {
		match value {
			Record::MaxU64(name, number) => u64_maximums.entry(name).or_default().push(*number),
			Record::AvgF64(name, number) => f64_averages.entry(name).or_default().push(*number),
		}
	}

	let u64_metrics = u64_maximums
		.into_iter()
		.map(|(name, v)| (name, v.into_iter().max().unwrap_or(0)))
		.collect();

	let f64_metrics = f64_averages
		.into_iter()
		.map(|(name, v)| (name, v.iter().sum::<f64>() / v.len() as f64))
		.collect();

	(u64_metrics, f64_metrics)
}

#[async_trait]
impl super::Metrics for Metrics {
	/// Puts counter to the counter buffer.
	/// If counter is not buffered, counter is incremented.
	async fn count(&self, counter: MetricCounter) {
		if !counter.is_buffered() {
			if let Some(instrument) = self.counters.get(counter.name()) {
				instrument.add(1, &self.attributes);
			}
			return;
		}
		self.counter_buffer.lock().await.push(counter);
	}

	async fn record(&self, value: MetricValue) {
		self.metric_buffer.lock().await.push(value.into());
	}

	/// Calculates counters and aggregated metrics, and flushes buffers to the collector.
	async fn flush(&self) -> Result<()> {
		let mut counter_buffer = self.counter_buffer.lock().await;
		let counters = flatten_counters(&counter_buffer);
		counter_buffer.clear();
		drop(counter_buffer);

		let mut metric_buffer = self.metric_buffer.lock().await;
		let (metrics_u64, metrics_f64) = flatten_metrics(&metric_buffer);
		metric_buffer.clear();
		drop(metric_buffer);

		for (counter, value) in counters {
			if let Some(instrument) = self.counters.get(counter) {
				instrument.add(value, &self.attributes);
			}
		}

		for (metric, value) in metrics_u64 {
			self.record_u64(metric, value);
		}

		for (metric, value) in metrics_f64 {
			self.record_f64(metric, value);
		}

		Ok(())
	}
}

fn init_counters(meter: &Meter) -> HashMap<&'static str, Counter<u64>> {
	[
		MetricCounter::Starts,
		MetricCounter::Up,
		MetricCounter::AcceptedConnections,
		MetricCounter::BufferedRequests,
		MetricCounter::PublishedFragments,
		MetricCounter::ReassembledPackets,
		MetricCounter::DroppedPackets,
		MetricCounter::EndedSessions,
		MetricCounter::SurrogateRelays,
	]
	.iter()
	.map(|counter| (counter.name(), meter.u64_counter(counter.name()).build()))
	.collect()
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct OtelConfig {
	/// OpenTelemetry Collector endpoint (default: `http://127.0.0.1:4317`)
	pub ot_collector_endpoint: String,
	/// Interval between two exports, in seconds (default: 300)
	pub ot_export_period: u64,
	/// Time to wait for an export to complete, in seconds (default: 10)
	pub ot_export_timeout: u64,
	/// Interval between two flushes of buffered metrics, in seconds (default: 15)
	pub ot_flush_interval: u64,
}

impl Default for OtelConfig {
	fn default() -> Self {
		Self {
			ot_collector_endpoint: "http://127.0.0.1:4317".to_string(),
			ot_export_period: 300,
			ot_export_timeout: 10,
			ot_flush_interval: 15,
		}
	}
}

pub fn initialize(
	service_name: &str,
	ot_config: OtelConfig,
	attributes: Vec<(&str, String)>,
) -> Result<Metrics> {
	let exporter = MetricExporter::builder()
		.with_tonic()
		.with_endpoint(&ot_config.ot_collector_endpoint)
		.with_protocol(Protocol::Grpc)
		.with_timeout(Duration::from_secs(ot_config.ot_export_timeout))
		.build()?;

	let reader = PeriodicReader::builder(exporter, Tokio)
		.with_interval(Duration::from_secs(ot_config.ot_export_period))
		.with_timeout(Duration::from_secs(ot_config.ot_export_timeout))
		.build();

	let provider = SdkMeterProvider::builder()
		.with_reader(reader)
		.with_resource(Resource::new(vec![KeyValue::new(
			"service.name",
			service_name.to_string(),
		)]))
		.build();

	global::set_meter_provider(provider);
	let meter = global::meter("nap_gateway");

	let attributes = attributes
		.into_iter()
		.map(|(k, v)| KeyValue::new(k.to_string(), v))
		.collect();

	// counters persist, unlike gauges which are recreated on every flush
	let counters = init_counters(&meter);
	Ok(Metrics {
		meter,
		counters,
		attributes,
		metric_buffer: Arc::new(Mutex::new(vec![])),
		counter_buffer: Arc::new(Mutex::new(vec![])),
	})
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_flatten_counters() {
		use MetricCounter::*;
		assert!(flatten_counters(&[] as &[MetricCounter]).is_empty());

		let one = flatten_counters(&[Starts]);
		let mut expected = HashMap::new();
		expected.insert(Starts.name(), 1);
		assert_eq!(one, expected);

		let buffer = vec![
			Starts,
			Up,
			AcceptedConnections,
			PublishedFragments,
			PublishedFragments,
			Up,
			Starts,
			DroppedPackets,
			Up,
			EndedSessions,
			Starts,
		];
		let result = flatten_counters(&buffer);
		let mut expected = HashMap::new();
		expected.insert(Starts.name(), 3);
		expected.insert(Up.name(), 1);
		expected.insert(AcceptedConnections.name(), 1);
		expected.insert(PublishedFragments.name(), 2);
		expected.insert(DroppedPackets.name(), 1);
		expected.insert(EndedSessions.name(), 1);
		assert_eq!(result, expected);
	}

	fn flatten_metrics(
		values: Vec<MetricValue>,
	) -> (HashMap<&'static str, u64>, HashMap<&'static str, f64>) {
		super::flatten_metrics(&values.into_iter().map(Into::into).collect::<Vec<Record>>())
	}

	#[test]
	fn test_flatten_metrics() {
		let (m_u64, m_f64) = flatten_metrics(vec![]);
		assert!(m_u64.is_empty());
		assert!(m_f64.is_empty());

		let buffer = vec![
			MetricValue::FragmentBufferSize(3),
			MetricValue::CmcGroupSize(2),
			MetricValue::FragmentBufferSize(10),
			MetricValue::CmcGroupSize(3),
			MetricValue::DnsCacheSize(1),
			MetricValue::FragmentBufferSize(0),
		];
		let (m_u64, m_f64) = flatten_metrics(buffer);
		assert_eq!(m_u64.len(), 2);
		assert_eq!(m_u64.get("nap.buffer.fragments"), Some(&10));
		assert_eq!(m_u64.get("nap.buffer.dns"), Some(&1));
		assert_eq!(m_f64.len(), 1);
		assert_eq!(m_f64.get("nap.cmc.group_size"), Some(&2.5));
	}
}
