//! Concurrent ordered list with a shared traversal cursor.
//!
//! Each non-terminal order state owns one `StateList`. Any task may append or
//! remove items at any time; the processor owning the list walks it with
//! `reset_pointer` and `get_next` while those changes happen.
//!
//! Nodes live in an arena of slots linked by index, with an id index for O(1)
//! removal. Cursor rules:
//! - removing the node under the cursor moves the cursor to its successor;
//! - appending while the cursor is exhausted makes the new node the next one
//!   returned.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

/// Items stored in a [`StateList`] are keyed by id.
pub trait Identified {
	fn id(&self) -> &str;
}

struct Slot<T> {
	item: Option<T>,
	prev: Option<usize>,
	next: Option<usize>,
}

struct Inner<T> {
	slots: Vec<Slot<T>>,
	free: Vec<usize>,
	index: HashMap<String, usize>,
	head: Option<usize>,
	tail: Option<usize>,
	/// Next node `get_next` returns. None once the traversal is exhausted.
	cursor: Option<usize>,
}

impl<T> Inner<T> {
	fn new() -> Self {
		Self {
			slots: Vec::new(),
			free: Vec::new(),
			index: HashMap::new(),
			head: None,
			tail: None,
			cursor: None,
		}
	}

	fn allocate(&mut self, item: T) -> usize {
		let slot = Slot {
			item: Some(item),
			prev: self.tail,
			next: None,
		};
		match self.free.pop() {
			Some(pos) => {
				self.slots[pos] = slot;
				pos
			},
			None => {
				self.slots.push(slot);
				self.slots.len() - 1
			},
		}
	}
}

/// Ordered set of items with O(1) append and removal by id.
pub struct StateList<T> {
	inner: Mutex<Inner<T>>,
}

impl<T> Default for StateList<T> {
	fn default() -> Self {
		Self {
			inner: Mutex::new(Inner::new()),
		}
	}
}

impl<T: Identified + Clone> StateList<T> {
	pub fn new() -> Self {
		Self::default()
	}

	fn lock(&self) -> MutexGuard<'_, Inner<T>> {
		// A panic while holding the lock cannot leave the links half-updated:
		// every mutation below completes without calling out.
		self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
	}

	/// Appends an item at the tail. An item whose id is already present is
	/// left where it is.
	pub fn add_item(&self, item: T) {
		let mut inner = self.lock();
		if inner.index.contains_key(item.id()) {
			return;
		}
		let id = item.id().to_string();
		let pos = inner.allocate(item);
		match inner.tail {
			Some(tail) => inner.slots[tail].next = Some(pos),
			None => inner.head = Some(pos),
		}
		inner.tail = Some(pos);
		inner.index.insert(id, pos);
		if inner.cursor.is_none() {
			inner.cursor = Some(pos);
		}
	}

	/// Unlinks the item with `id`. Returns false when it was not in the list.
	pub fn remove_item(&self, id: &str) -> bool {
		let mut inner = self.lock();
		let Some(pos) = inner.index.remove(id) else {
			return false;
		};
		let (prev, next) = (inner.slots[pos].prev, inner.slots[pos].next);
		match prev {
			Some(p) => inner.slots[p].next = next,
			None => inner.head = next,
		}
		match next {
			Some(n) => inner.slots[n].prev = prev,
			None => inner.tail = prev,
		}
		if inner.cursor == Some(pos) {
			inner.cursor = next;
		}
		inner.slots[pos] = Slot {
			item: None,
			prev: None,
			next: None,
		};
		inner.free.push(pos);
		true
	}

	/// Returns the item under the cursor and advances it.
	pub fn get_next(&self) -> Option<T> {
		let mut inner = self.lock();
		let pos = inner.cursor?;
		inner.cursor = inner.slots[pos].next;
		inner.slots[pos].item.clone()
	}

	/// Rewinds the cursor to the head.
	pub fn reset_pointer(&self) {
		let mut inner = self.lock();
		inner.cursor = inner.head;
	}

	pub fn contains(&self, id: &str) -> bool {
		self.lock().index.contains_key(id)
	}

	pub fn len(&self) -> usize {
		self.lock().index.len()
	}

	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}

	/// Copy of the items in list order. Does not move the cursor.
	pub fn snapshot(&self) -> Vec<T> {
		let inner = self.lock();
		let mut items = Vec::with_capacity(inner.index.len());
		let mut pos = inner.head;
		while let Some(p) = pos {
			if let Some(item) = &inner.slots[p].item {
				items.push(item.clone());
			}
			pos = inner.slots[p].next;
		}
		items
	}
}
