#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;

use parking_lot::RwLock;

/// Event handler. An `Err` aborts the dispatch call it was invoked from.
pub type Handler<E> = Arc<dyn Fn(&E) -> anyhow::Result<()> + Send + Sync>;

/// Key -> handler map, first registration wins.
///
/// Safe to share between loops; registration may happen while another
/// loop is dispatching.
pub struct CallbackRegistry<K, E> {
	handlers: RwLock<HashMap<K, Handler<E>>>,
}

impl<K, E> Default for CallbackRegistry<K, E> {
	fn default() -> Self {
		Self {
			handlers: RwLock::new(HashMap::new()),
		}
	}
}

impl<K, E> std::fmt::Debug for CallbackRegistry<K, E> {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("CallbackRegistry")
			.field("handlers", &self.handlers.read().len())
			.finish()
	}
}

impl<K, E> CallbackRegistry<K, E>
where
	K: Eq + Hash,
{
	pub fn new() -> Self {
		Self::default()
	}

	/// Store `handler` for `key` unless one is already there.
	///
	/// Returns `true` if this call stored the handler.
	pub fn register<F>(&self, key: impl Into<K>, handler: F) -> bool
	where
		F: Fn(&E) -> anyhow::Result<()> + Send + Sync + 'static,
	{
		self.register_arc(key.into(), Arc::new(handler))
	}

	pub fn register_arc(&self, key: K, handler: Handler<E>) -> bool {
		let mut guard = self.handlers.write();
		if guard.contains_key(&key) {
			return false;
		}
		guard.insert(key, handler);
		true
	}

	/// Run the handler for `key`, if any.
	///
	/// Returns `Ok(true)` if a handler ran. The lock is not held while it runs.
	pub fn dispatch(&self, key: &K, event: &E) -> anyhow::Result<bool> {
		let handler = self.handlers.read().get(key).cloned();
		match handler {
			Some(handler) => {
				handler(event)?;
				Ok(true)
			}
			None => Ok(false),
		}
	}

	pub fn contains(&self, key: &K) -> bool {
		self.handlers.read().contains_key(key)
	}

	pub fn len(&self) -> usize {
		self.handlers.read().len()
	}

	pub fn is_empty(&self) -> bool {
		self.handlers.read().is_empty()
	}
}
