//! Model lifecycle signals
//!
//! Django-style synchronous dispatch. Signals are process-wide and keyed by
//! name and payload type, so `pre_delete::<Instance>()` always returns the
//! same signal.

use once_cell::sync::Lazy;
use parking_lot::RwLock;
use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Signal identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SignalName(&'static str);

impl SignalName {
	pub const PRE_SAVE: SignalName = SignalName("pre_save");
	pub const POST_SAVE: SignalName = SignalName("post_save");
	pub const PRE_DELETE: SignalName = SignalName("pre_delete");
	pub const POST_DELETE: SignalName = SignalName("post_delete");

	pub fn as_str(&self) -> &'static str {
		self.0
	}
}

impl fmt::Display for SignalName {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.0)
	}
}

/// Receiver callback. The first argument is the sender's model label.
pub type ReceiverFn<T> = Arc<dyn Fn(&str, &T) + Send + Sync>;

struct Receiver<T> {
	dispatch_uid: Option<String>,
	sender: Option<String>,
	func: ReceiverFn<T>,
}

/// A synchronous signal carrying payloads of type `T`
pub struct Signal<T> {
	name: SignalName,
	receivers: Arc<RwLock<Vec<Receiver<T>>>>,
}

impl<T> Clone for Signal<T> {
	fn clone(&self) -> Self {
		Self {
			name: self.name,
			receivers: Arc::clone(&self.receivers),
		}
	}
}

impl<T> fmt::Debug for Signal<T> {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("Signal")
			.field("name", &self.name)
			.field("receivers", &self.receivers.read().len())
			.finish()
	}
}

impl<T: Send + Sync + 'static> Signal<T> {
	fn new(name: SignalName) -> Self {
		Self {
			name,
			receivers: Arc::new(RwLock::new(Vec::new())),
		}
	}

	pub fn name(&self) -> SignalName {
		self.name
	}

	/// Connect a receiver for every sender.
	///
	/// A receiver registered with an existing `dispatch_uid` replaces the
	/// previous one.
	pub fn connect<F>(&self, dispatch_uid: impl Into<String>, receiver: F)
	where
		F: Fn(&str, &T) + Send + Sync + 'static,
	{
		self.connect_receiver(Some(dispatch_uid.into()), None, Arc::new(receiver));
	}

	/// Connect a receiver that only fires for one sender model label.
	pub fn connect_for<F>(&self, dispatch_uid: impl Into<String>, sender: impl Into<String>, receiver: F)
	where
		F: Fn(&str, &T) + Send + Sync + 'static,
	{
		self.connect_receiver(Some(dispatch_uid.into()), Some(sender.into()), Arc::new(receiver));
	}

	fn connect_receiver(&self, dispatch_uid: Option<String>, sender: Option<String>, func: ReceiverFn<T>) {
		let mut receivers = self.receivers.write();
		if let Some(uid) = &dispatch_uid {
			receivers.retain(|r| r.dispatch_uid.as_ref() != Some(uid));
		}
		receivers.push(Receiver {
			dispatch_uid,
			sender,
			func,
		});
	}

	/// Disconnect by dispatch uid. Returns whether a receiver was removed.
	pub fn disconnect(&self, dispatch_uid: &str) -> bool {
		let mut receivers = self.receivers.write();
		let before = receivers.len();
		receivers.retain(|r| r.dispatch_uid.as_deref() != Some(dispatch_uid));
		receivers.len() < before
	}

	pub fn disconnect_all(&self) {
		self.receivers.write().clear();
	}

	pub fn receiver_count(&self) -> usize {
		self.receivers.read().len()
	}

	/// Whether any receiver would fire for `sender`.
	pub fn has_listeners(&self, sender: &str) -> bool {
		self.receivers
			.read()
			.iter()
			.any(|r| r.sender.as_deref().is_none_or(|s| s == sender))
	}

	/// Send to all matching receivers. Returns the number of receivers called.
	pub fn send(&self, sender: &str, payload: &T) -> usize {
		// Snapshot so receivers may connect/disconnect while being called.
		let matching: Vec<ReceiverFn<T>> = self
			.receivers
			.read()
			.iter()
			.filter(|r| r.sender.as_deref().is_none_or(|s| s == sender))
			.map(|r| Arc::clone(&r.func))
			.collect();
		for func in &matching {
			func(sender, payload);
		}
		matching.len()
	}
}

type SignalKey = (SignalName, TypeId);

static SIGNAL_REGISTRY: Lazy<RwLock<HashMap<SignalKey, Box<dyn Any + Send + Sync>>>> =
	Lazy::new(|| RwLock::new(HashMap::new()));

/// Get (or lazily create) the process-wide signal for `name` and payload `T`.
pub fn get_signal<T: Send + Sync + 'static>(name: SignalName) -> Signal<T> {
	let key = (name, TypeId::of::<T>());
	if let Some(signal) = SIGNAL_REGISTRY
		.read()
		.get(&key)
		.and_then(|s| s.downcast_ref::<Signal<T>>())
	{
		return signal.clone();
	}
	let mut registry = SIGNAL_REGISTRY.write();
	let entry = registry
		.entry(key)
		.or_insert_with(|| Box::new(Signal::<T>::new(name)));
	match entry.downcast_ref::<Signal<T>>() {
		Some(signal) => signal.clone(),
		// The key includes the TypeId, so the stored value always has type Signal<T>.
		None => Signal::new(name),
	}
}

/// Pre-save signal - sent before a model instance is saved
pub fn pre_save<T: Send + Sync + 'static>() -> Signal<T> {
	get_signal::<T>(SignalName::PRE_SAVE)
}

/// Post-save signal - sent after a model instance is saved
pub fn post_save<T: Send + Sync + 'static>() -> Signal<T> {
	get_signal::<T>(SignalName::POST_SAVE)
}

/// Pre-delete signal - sent before a model instance is deleted
pub fn pre_delete<T: Send + Sync + 'static>() -> Signal<T> {
	get_signal::<T>(SignalName::PRE_DELETE)
}

/// Post-delete signal - sent after a model instance is deleted
pub fn post_delete<T: Send + Sync + 'static>() -> Signal<T> {
	get_signal::<T>(SignalName::POST_DELETE)
}
