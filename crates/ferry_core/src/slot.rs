use std::fmt;

/// A stable reference to a value stored in a [`SlotTable`].
///
/// Handles carry the generation of the slot they were issued for. Once the
/// value is removed the slot's generation moves on, so an old handle can
/// never resolve to whatever is stored there next.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct SlotHandle {
    index: u32,
    generation: u32,
}

impl SlotHandle {
    /// A handle that never resolves.
    pub const NONE: SlotHandle = SlotHandle {
        index: u32::MAX,
        generation: 0,
    };

    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn generation(&self) -> u32 {
        self.generation
    }
}

impl Default for SlotHandle {
    fn default() -> Self {
        Self::NONE
    }
}

impl fmt::Debug for SlotHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if *self == Self::NONE {
            write!(f, "SlotHandle(none)")
        } else {
            write!(f, "SlotHandle({}v{})", self.index, self.generation)
        }
    }
}

struct Slot<T> {
    // odd generations are occupied, even ones are free
    generation: u32,
    value: Option<T>,
}

/// Generational arena handing out [`SlotHandle`]s.
///
/// Every lookup through a handle is fallible; removed or foreign handles
/// simply miss.
pub struct SlotTable<T> {
    slots: Vec<Slot<T>>,
    free: Vec<u32>,
    len: usize,
}

impl<T> Default for SlotTable<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> SlotTable<T> {
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            len: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn add(&mut self, value: T) -> SlotHandle {
        self.len += 1;
        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            slot.generation = slot.generation.wrapping_add(1);
            slot.value = Some(value);
            return SlotHandle {
                index,
                generation: slot.generation,
            };
        }

        let index = self.slots.len() as u32;
        self.slots.push(Slot {
            generation: 1,
            value: Some(value),
        });
        SlotHandle {
            index,
            generation: 1,
        }
    }

    /// Removes the value, returning `false` for stale or unknown handles.
    pub fn remove(&mut self, handle: SlotHandle) -> bool {
        self.take(handle).is_some()
    }

    pub fn take(&mut self, handle: SlotHandle) -> Option<T> {
        let slot = self.slots.get_mut(handle.index as usize)?;
        if slot.generation != handle.generation {
            return None;
        }
        let value = slot.value.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(handle.index);
        self.len -= 1;
        Some(value)
    }

    pub fn contains(&self, handle: SlotHandle) -> bool {
        self.try_get(handle).is_some()
    }

    pub fn try_get(&self, handle: SlotHandle) -> Option<&T> {
        let slot = self.slots.get(handle.index as usize)?;
        if slot.generation != handle.generation {
            return None;
        }
        slot.value.as_ref()
    }

    pub fn try_get_mut(&mut self, handle: SlotHandle) -> Option<&mut T> {
        let slot = self.slots.get_mut(handle.index as usize)?;
        if slot.generation != handle.generation {
            return None;
        }
        slot.value.as_mut()
    }

    /// Replaces the value behind a live handle, handing back the old one.
    pub fn replace(&mut self, handle: SlotHandle, value: T) -> Option<T> {
        self.try_get_mut(handle)
            .map(|current| std::mem::replace(current, value))
    }

    /// Removes and returns the occupied slot with the lowest index.
    pub fn take_first(&mut self) -> Option<(SlotHandle, T)> {
        let handle = self.cursor().next(self)?;
        self.take(handle).map(|value| (handle, value))
    }

    pub fn clear(&mut self) {
        while self.take_first().is_some() {}
    }

    pub fn iter(&self) -> impl Iterator<Item = (SlotHandle, &T)> {
        self.slots.iter().enumerate().filter_map(|(index, slot)| {
            slot.value.as_ref().map(|value| {
                (
                    SlotHandle {
                        index: index as u32,
                        generation: slot.generation,
                    },
                    value,
                )
            })
        })
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (SlotHandle, &mut T)> {
        self.slots.iter_mut().enumerate().filter_map(|(index, slot)| {
            let generation = slot.generation;
            slot.value.as_mut().map(|value| {
                (
                    SlotHandle {
                        index: index as u32,
                        generation,
                    },
                    value,
                )
            })
        })
    }

    pub fn handles(&self) -> Vec<SlotHandle> {
        self.iter().map(|(handle, _)| handle).collect()
    }

    /// A cursor that does not borrow the table, so the element it just
    /// yielded may be removed before advancing.
    pub fn cursor(&self) -> StableCursor {
        StableCursor { next: 0 }
    }
}

impl<T> std::ops::Index<SlotHandle> for SlotTable<T> {
    type Output = T;

    /// Panics on a stale handle, like indexing a `Vec` out of bounds.
    fn index(&self, handle: SlotHandle) -> &T {
        match self.try_get(handle) {
            Some(value) => value,
            None => panic!("stale slot handle {handle:?}"),
        }
    }
}

impl<T> std::ops::IndexMut<SlotHandle> for SlotTable<T> {
    fn index_mut(&mut self, handle: SlotHandle) -> &mut T {
        match self.try_get_mut(handle) {
            Some(value) => value,
            None => panic!("stale slot handle {handle:?}"),
        }
    }
}

/// Position-only iterator over a [`SlotTable`].
///
/// Slots never move, so removing the current element neither skips nor
/// revisits any other element.
#[derive(Debug, Clone, Copy)]
pub struct StableCursor {
    next: usize,
}

impl StableCursor {
    pub fn next<T>(&mut self, table: &SlotTable<T>) -> Option<SlotHandle> {
        while self.next < table.slots.len() {
            let index = self.next;
            self.next += 1;
            let slot = &table.slots[index];
            if slot.value.is_some() {
                return Some(SlotHandle {
                    index: index as u32,
                    generation: slot.generation,
                });
            }
        }
        None
    }
}
