//! Finality window applied to extracted events.

use ledger_types::Event;
use std::collections::VecDeque;

/// Holds events until the head is `delay` blocks past their block.
///
/// Events are released in arrival order, which the listener guarantees to be
/// block order.
#[derive(Debug)]
pub(crate) struct FinalityGate {
	delay: u64,
	held: VecDeque<Event>,
}

impl FinalityGate {
	pub fn new(delay: u64) -> Self {
		Self {
			delay,
			held: VecDeque::new(),
		}
	}

	pub fn hold(&mut self, events: impl IntoIterator<Item = Event>) {
		self.held.extend(events);
	}

	/// Releases the held events that are final at `head`.
	pub fn release(&mut self, head: u64) -> Vec<Event> {
		let mut released = Vec::new();
		while let Some(event) = self.held.front() {
			if head < event.block_number.saturating_add(self.delay) {
				break;
			}
			if let Some(event) = self.held.pop_front() {
				released.push(event);
			}
		}
		released
	}

	#[cfg(test)]
	pub fn len(&self) -> usize {
		self.held.len()
	}
}
