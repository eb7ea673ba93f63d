//! Handle registry for live tasks.
//!
//! Handles are `(index, generation)` pairs into a slot arena. Freeing a task
//! bumps its slot's generation, so a stale handle can never resolve to the
//! task that later reuses the slot. The registry holds one `Arc` per task;
//! workers hold their own, so removing a task while it renders only drops
//! the registry's reference.

use crate::error::{Result, Text2ImageError};
use crate::task::Task;
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};

const HALF_BITS: u32 = usize::BITS / 2;
const INDEX_MASK: usize = (1usize << HALF_BITS) - 1;
/// Largest generation that fits the packed representation.
const MAX_GENERATION: u32 = INDEX_MASK as u32;
/// Number of addressable slots.
const MAX_SLOTS: usize = INDEX_MASK + 1;

/// Opaque, caller-visible reference to a task.
///
/// Packs into a pointer-sized integer (index in the low half, generation in
/// the high half). Generations start at 1, so the packed value is never 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskHandle {
    index: u32,
    generation: u32,
}

impl TaskHandle {
    pub fn index(self) -> u32 {
        self.index
    }

    pub fn generation(self) -> u32 {
        self.generation
    }

    /// Pack into a non-zero integer.
    pub fn into_raw(self) -> usize {
        ((self.generation as usize) << HALF_BITS) | self.index as usize
    }

    /// Unpack a value produced by [`into_raw`](Self::into_raw).
    /// Returns `None` for values no handle can have (including 0).
    pub fn from_raw(raw: usize) -> Option<Self> {
        let index = (raw & INDEX_MASK) as u32;
        let generation = (raw >> HALF_BITS) as u32;
        if generation == 0 {
            return None;
        }
        Some(Self { index, generation })
    }
}

impl fmt::Display for TaskHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}v{}", self.index, self.generation)
    }
}

struct Slot {
    generation: u32,
    task: Option<Arc<Task>>,
}

#[derive(Default)]
struct Slots {
    slots: Vec<Slot>,
    free: Vec<u32>,
    live: usize,
}

impl Slots {
    fn vacate(&mut self, index: u32) -> Option<Arc<Task>> {
        let slot = &mut self.slots[index as usize];
        let task = slot.task.take()?;
        self.live -= 1;
        if slot.generation == MAX_GENERATION {
            warn!("Retiring task slot {} after generation wrap", index);
        } else {
            slot.generation += 1;
            self.free.push(index);
        }
        Some(task)
    }
}

/// Maps handles to owned tasks.
pub struct TaskRegistry {
    inner: Mutex<Slots>,
}

impl fmt::Debug for TaskRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("TaskRegistry")
            .field("live", &inner.live)
            .field("slots", &inner.slots.len())
            .field("free", &inner.free.len())
            .finish()
    }
}

impl Default for TaskRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Slots::default()),
        }
    }

    /// Allocate a handle, build the task for it and register it.
    pub fn insert_with<F>(&self, make: F) -> Result<Arc<Task>>
    where
        F: FnOnce(TaskHandle) -> Task,
    {
        let mut inner = self.inner.lock();
        let index = match inner.free.pop() {
            Some(index) => index,
            None => {
                if inner.slots.len() >= MAX_SLOTS {
                    return Err(Text2ImageError::AllocationFailure {
                        size: std::mem::size_of::<Task>(),
                    });
                }
                inner.slots.push(Slot {
                    generation: 1,
                    task: None,
                });
                (inner.slots.len() - 1) as u32
            }
        };

        let slot = &mut inner.slots[index as usize];
        let handle = TaskHandle {
            index,
            generation: slot.generation,
        };
        let task = Arc::new(make(handle));
        slot.task = Some(Arc::clone(&task));
        inner.live += 1;

        debug!("Registered task {}", handle);
        Ok(task)
    }

    /// Resolve a handle to a shared reference.
    pub fn get(&self, handle: TaskHandle) -> Option<Arc<Task>> {
        let inner = self.inner.lock();
        let slot = inner.slots.get(handle.index as usize)?;
        if slot.generation != handle.generation {
            return None;
        }
        slot.task.clone()
    }

    /// Drop the registry's reference. Unknown or stale handles are ignored.
    pub fn remove(&self, handle: TaskHandle) -> Option<Arc<Task>> {
        let removed = {
            let mut inner = self.inner.lock();
            let current = inner
                .slots
                .get(handle.index as usize)
                .is_some_and(|slot| slot.generation == handle.generation);
            if current {
                inner.vacate(handle.index)
            } else {
                None
            }
        };
        if removed.is_some() {
            debug!("Freed task {}", handle);
        }
        removed
    }

    /// Remove every task, returning how many were registered.
    pub fn clear(&self) -> usize {
        let removed: Vec<Arc<Task>> = {
            let mut inner = self.inner.lock();
            let occupied: Vec<u32> = inner
                .slots
                .iter()
                .enumerate()
                .filter(|(_, slot)| slot.task.is_some())
                .map(|(index, _)| index as u32)
                .collect();
            occupied
                .into_iter()
                .filter_map(|index| inner.vacate(index))
                .collect()
        };
        removed.len()
    }

    /// Number of registered tasks.
    pub fn len(&self) -> usize {
        self.inner.lock().live
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
