//! Fixed-capacity slot arena with generation-checked handles

/// Names one occupied slot. A handle outlives its value only as a stale
/// handle: once the slot is freed the generation moves on and lookups fail.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Handle {
    index: usize,
    generation: u32,
}

impl Handle {
    pub fn index(&self) -> usize {
        self.index
    }
}

struct Slot<T> {
    generation: u32,
    value: Option<T>,
}

pub struct Arena<T, const N: usize> {
    slots: [Slot<T>; N],
}

impl<T, const N: usize> Arena<T, N> {
    pub fn new() -> Self {
        Self {
            slots: core::array::from_fn(|_| Slot {
                generation: 0,
                value: None,
            }),
        }
    }

    /// Stores `value` in the lowest free slot.
    pub fn insert(&mut self, value: T) -> Option<Handle> {
        let index = self.slots.iter().position(|s| s.value.is_none())?;
        let slot = &mut self.slots[index];
        slot.value = Some(value);
        Some(Handle {
            index,
            generation: slot.generation,
        })
    }

    pub fn get(&self, h: Handle) -> Option<&T> {
        let slot = self.slots.get(h.index)?;
        if slot.generation != h.generation {
            return None;
        }
        slot.value.as_ref()
    }

    pub fn get_mut(&mut self, h: Handle) -> Option<&mut T> {
        let slot = self.slots.get_mut(h.index)?;
        if slot.generation != h.generation {
            return None;
        }
        slot.value.as_mut()
    }

    pub fn remove(&mut self, h: Handle) -> Option<T> {
        let slot = self.slots.get_mut(h.index)?;
        if slot.generation != h.generation {
            return None;
        }
        let value = slot.value.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        Some(value)
    }

    /// Handle of the value currently at `index`.
    pub fn handle_at(&self, index: usize) -> Option<Handle> {
        let slot = self.slots.get(index)?;
        slot.value.as_ref().map(|_| Handle {
            index,
            generation: slot.generation,
        })
    }

    pub fn len(&self) -> usize {
        self.slots.iter().filter(|s| s.value.is_some()).count()
    }

    pub fn is_full(&self) -> bool {
        self.len() == N
    }
}

impl<T, const N: usize> Default for Arena<T, N> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lowest_free_slot_is_reused() {
        let mut arena: Arena<u32, 3> = Arena::new();
        let a = arena.insert(10).unwrap();
        let b = arena.insert(11).unwrap();
        assert_eq!((a.index(), b.index()), (0, 1));
        assert_eq!(arena.remove(a), Some(10));
        let c = arena.insert(12).unwrap();
        assert_eq!(c.index(), 0);
        assert_eq!(arena.len(), 2);
    }

    #[test]
    fn stale_handles_miss() {
        let mut arena: Arena<u32, 2> = Arena::new();
        let a = arena.insert(1).unwrap();
        arena.remove(a);
        let b = arena.insert(2).unwrap();
        assert_eq!(a.index(), b.index());
        assert_eq!(arena.get(a), None);
        assert_eq!(arena.remove(a), None);
        assert_eq!(arena.get(b), Some(&2));
    }

    #[test]
    fn full_arena_refuses() {
        let mut arena: Arena<(), 1> = Arena::new();
        assert!(arena.insert(()).is_some());
        assert!(arena.is_full());
        assert!(arena.insert(()).is_none());
    }
}
