//! Age-bounded concurrent map shared by every keyed store of the gateway.
//!
//! Each value carries the instant it was stored (or last refreshed). A sweeper
//! task periodically evicts values older than the configured maximum age. The
//! sweep is done in two phases: expired keys are collected under the lock, then
//! removed one at a time, re-acquiring the lock for every removal so pending
//! inserts and lookups are never starved by a long eviction pass.

use crate::utils::lock;
use std::{
	collections::HashMap,
	fmt::Debug,
	hash::Hash,
	sync::{Arc, Mutex},
	time::Duration,
};
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, trace};

struct Timestamped<V> {
	value: V,
	touched: Instant,
}

impl<V> Timestamped<V> {
	fn new(value: V) -> Self {
		Timestamped {
			value,
			touched: Instant::now(),
		}
	}

	fn is_expired(&self, now: Instant, max_age: Duration) -> bool {
		now.saturating_duration_since(self.touched) > max_age
	}
}

pub struct ExpiringMap<K, V> {
	name: &'static str,
	entries: Mutex<HashMap<K, Timestamped<V>>>,
	refresh_on_get: bool,
}

impl<K, V> ExpiringMap<K, V>
where
	K: Eq + Hash + Clone + Debug,
{
	/// Creates a map whose lookups leave the age of entries untouched.
	pub fn new(name: &'static str) -> Self {
		ExpiringMap {
			name,
			entries: Mutex::new(HashMap::new()),
			refresh_on_get: false,
		}
	}

	/// Creates a map where every successful [`ExpiringMap::get`] resets the age of the entry.
	pub fn with_refresh_on_get(name: &'static str) -> Self {
		ExpiringMap {
			refresh_on_get: true,
			..Self::new(name)
		}
	}

	pub fn name(&self) -> &'static str {
		self.name
	}

	/// Inserts or replaces a value, resetting its age. Returns the replaced value.
	pub fn insert(&self, key: K, value: V) -> Option<V> {
		lock(&self.entries)
			.insert(key, Timestamped::new(value))
			.map(|previous| previous.value)
	}

	pub fn get(&self, key: &K) -> Option<V>
	where
		V: Clone,
	{
		let mut entries = lock(&self.entries);
		let entry = entries.get_mut(key)?;
		if self.refresh_on_get {
			entry.touched = Instant::now();
		}
		Some(entry.value.clone())
	}

	pub fn contains_key(&self, key: &K) -> bool {
		lock(&self.entries).contains_key(key)
	}

	/// Mutates an existing value in place without touching its age.
	pub fn update<R>(&self, key: &K, f: impl FnOnce(&mut V) -> R) -> Option<R> {
		lock(&self.entries)
			.get_mut(key)
			.map(|entry| f(&mut entry.value))
	}

	/// Mutates the value stored under `key`, inserting `default()` first if absent.
	///
	/// The whole read-modify-write happens under the store lock.
	pub fn upsert<R>(&self, key: K, default: impl FnOnce() -> V, f: impl FnOnce(&mut V) -> R) -> R {
		let mut entries = lock(&self.entries);
		let entry = entries
			.entry(key)
			.or_insert_with(|| Timestamped::new(default()));
		f(&mut entry.value)
	}

	/// Resets the age of an entry. Returns `false` if the key is unknown.
	pub fn refresh(&self, key: &K) -> bool {
		match lock(&self.entries).get_mut(key) {
			Some(entry) => {
				entry.touched = Instant::now();
				true
			},
			None => false,
		}
	}

	pub fn remove(&self, key: &K) -> Option<V> {
		lock(&self.entries).remove(key).map(|entry| entry.value)
	}

	/// Removes the entry only if `predicate` holds for its current value.
	pub fn remove_if(&self, key: &K, predicate: impl FnOnce(&V) -> bool) -> Option<V> {
		let mut entries = lock(&self.entries);
		if !predicate(&entries.get(key)?.value) {
			return None;
		}
		entries.remove(key).map(|entry| entry.value)
	}

	/// Removes and returns every entry matching `remove`.
	pub fn drain_where(&self, mut remove: impl FnMut(&K, &V) -> bool) -> Vec<(K, V)> {
		let mut entries = lock(&self.entries);
		let keys: Vec<K> = entries
			.iter()
			.filter(|(key, entry)| remove(key, &entry.value))
			.map(|(key, _)| key.clone())
			.collect();

		keys.into_iter()
			.filter_map(|key| entries.remove(&key).map(|entry| (key, entry.value)))
			.collect()
	}

	/// Collects a projection of every entry for which `f` returns a value.
	pub fn filter_map<R>(&self, mut f: impl FnMut(&K, &V) -> Option<R>) -> Vec<R> {
		lock(&self.entries)
			.iter()
			.filter_map(|(key, entry)| f(key, &entry.value))
			.collect()
	}

	pub fn len(&self) -> usize {
		lock(&self.entries).len()
	}

	pub fn is_empty(&self) -> bool {
		lock(&self.entries).is_empty()
	}

	/// Removes every entry older than `max_age` at `now`, returning the number of evicted entries.
	pub fn sweep(&self, now: Instant, max_age: Duration) -> usize {
		self.sweep_unless(now, max_age, |_, _| false)
	}

	/// Same as [`ExpiringMap::sweep`], except that expired entries matching `keep` stay in the map.
	pub fn sweep_unless(
		&self,
		now: Instant,
		max_age: Duration,
		keep: impl Fn(&K, &V) -> bool,
	) -> usize {
		let expired: Vec<K> = lock(&self.entries)
			.iter()
			.filter(|(key, entry)| entry.is_expired(now, max_age) && !keep(key, &entry.value))
			.map(|(key, _)| key.clone())
			.collect();

		let mut removed = 0;
		for key in expired {
			// entry may have been refreshed or removed since it was collected
			let evicted = self.remove_if_expired(&key, now, max_age);
			if let Some(value) = evicted {
				trace!(store = self.name, ?key, "Evicted expired entry");
				drop(value);
				removed += 1;
			}
		}
		removed
	}

	fn remove_if_expired(&self, key: &K, now: Instant, max_age: Duration) -> Option<V> {
		let mut entries = lock(&self.entries);
		if !entries.get(key)?.is_expired(now, max_age) {
			return None;
		}
		entries.remove(key).map(|entry| entry.value)
	}

	/// Sweeps the map every `interval`, evicting entries older than `max_age`.
	///
	/// After every pass `report` receives the number of evicted entries and the remaining size.
	pub async fn run_sweeper(
		self: Arc<Self>,
		interval: Duration,
		max_age: Duration,
		report: impl FnMut(usize, usize) + Send,
	) {
		self.run_sweeper_unless(interval, max_age, |_, _| false, report)
			.await
	}

	/// Sweeps the map every `interval`, keeping expired entries which match `keep`.
	pub async fn run_sweeper_unless(
		self: Arc<Self>,
		interval: Duration,
		max_age: Duration,
		keep: impl Fn(&K, &V) -> bool + Send,
		mut report: impl FnMut(usize, usize) + Send,
	) {
		let mut ticker = time::interval(interval);
		ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
		loop {
			ticker.tick().await;
			let removed = self.sweep_unless(Instant::now(), max_age, &keep);
			let remaining = self.len();
			if removed > 0 {
				debug!(
					store = self.name,
					removed, remaining, "Expired entries removed from buffer"
				);
			}
			report(removed, remaining);
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::thread;

	#[test]
	fn insert_get_remove() {
		let map = ExpiringMap::new("test");
		assert_eq!(map.insert("a", 1), None);
		assert_eq!(map.insert("a", 2), Some(1));
		assert_eq!(map.get(&"a"), Some(2));
		assert_eq!(map.len(), 1);
		assert_eq!(map.remove(&"a"), Some(2));
		assert_eq!(map.remove(&"a"), None);
		assert!(map.is_empty());
	}

	#[test]
	fn upsert_inserts_lazily() {
		let map: ExpiringMap<u8, Vec<u8>> = ExpiringMap::new("test");
		map.upsert(1, Vec::new, |value| value.push(1));
		map.upsert(1, Vec::new, |value| value.push(2));
		assert_eq!(map.get(&1), Some(vec![1, 2]));
		assert_eq!(map.update(&2, |value| value.len()), None);
	}

	#[test]
	fn sweep_removes_only_expired_entries() {
		let map = ExpiringMap::new("test");
		map.insert(1, "old");
		let later = Instant::now() + Duration::from_secs(10);
		map.insert(2, "new");

		assert_eq!(map.sweep(later, Duration::from_secs(60)), 0);
		assert_eq!(map.sweep(later, Duration::from_secs(5)), 2);
		assert!(map.is_empty());
	}

	#[test]
	fn kept_entries_survive_sweep() {
		let map = ExpiringMap::new("test");
		map.insert(1, "live");
		map.insert(2, "idle");
		let later = Instant::now() + Duration::from_secs(10);

		assert_eq!(map.sweep_unless(later, Duration::from_secs(5), |_, value| *value == "live"), 1);
		assert_eq!(map.get(&1), Some("live"));
		assert_eq!(map.get(&2), None);
	}

	#[test]
	fn lookups_do_not_reset_age_by_default() {
		let map = ExpiringMap::new("packets");
		map.insert(1, ());
		thread::sleep(Duration::from_millis(20));
		assert!(map.get(&1).is_some());
		assert_eq!(map.sweep(Instant::now(), Duration::from_millis(10)), 1);
	}

	#[test]
	fn lookups_reset_age_when_configured() {
		let map = ExpiringMap::with_refresh_on_get("dns");
		map.insert(1, ());
		thread::sleep(Duration::from_millis(20));
		assert!(map.get(&1).is_some());
		assert_eq!(map.sweep(Instant::now(), Duration::from_millis(10)), 0);
		assert!(map.contains_key(&1));
	}

	#[test]
	fn explicit_refresh_keeps_entry() {
		let map = ExpiringMap::new("test");
		map.insert(1, ());
		thread::sleep(Duration::from_millis(20));
		assert!(map.refresh(&1));
		assert!(!map.refresh(&2));
		assert_eq!(map.sweep(Instant::now(), Duration::from_millis(10)), 0);
	}

	#[test]
	fn drain_where_returns_removed_values() {
		let map = ExpiringMap::new("test");
		for key in 0..6u8 {
			map.insert(key, key * 10);
		}
		let mut drained = map.drain_where(|key, _| key % 2 == 0);
		drained.sort();
		assert_eq!(drained, vec![(0, 0), (2, 20), (4, 40)]);
		assert_eq!(map.len(), 3);
	}

	#[test]
	fn evicted_values_are_dropped_once() {
		let resource = Arc::new(());
		let map = ExpiringMap::new("test");
		for key in 0..10 {
			map.insert(key, resource.clone());
		}
		assert_eq!(Arc::strong_count(&resource), 11);

		let later = Instant::now() + Duration::from_secs(1);
		assert_eq!(map.sweep(later, Duration::ZERO), 10);
		assert_eq!(map.sweep(later, Duration::ZERO), 0);
		assert_eq!(Arc::strong_count(&resource), 1);
	}

	#[test]
	fn sweep_does_not_block_unrelated_inserts() {
		let map = Arc::new(ExpiringMap::new("test"));
		for key in 0..10_000u32 {
			map.insert(key, key);
		}
		thread::sleep(Duration::from_millis(5));
		let now = Instant::now();

		let sweeper = thread::spawn({
			let map = map.clone();
			move || map.sweep(now, Duration::ZERO)
		});
		let inserter = thread::spawn({
			let map = map.clone();
			move || {
				for key in 100_000..101_000u32 {
					map.insert(key, key);
				}
			}
		});

		inserter.join().unwrap();
		assert_eq!(sweeper.join().unwrap(), 10_000);
		assert_eq!(map.len(), 1_000);
	}

	#[tokio::test(start_paused = true)]
	async fn sweeper_reports_sizes() {
		let map = Arc::new(ExpiringMap::new("test"));
		map.insert(1, ());
		let (sender, mut receiver) = tokio::sync::mpsc::unbounded_channel();

		let task = tokio::spawn(map.clone().run_sweeper(
			Duration::from_secs(1),
			Duration::from_secs(2),
			move |removed, remaining| {
				_ = sender.send((removed, remaining));
			},
		));

		assert_eq!(receiver.recv().await, Some((0, 1)));
		assert_eq!(receiver.recv().await, Some((0, 1)));
		assert_eq!(receiver.recv().await, Some((0, 1)));
		assert_eq!(receiver.recv().await, Some((1, 0)));
		task.abort();
	}
}
