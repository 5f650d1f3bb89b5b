use std::fmt::{Debug, Display};
use std::hash::{Hash, Hasher};
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering::Relaxed};

/// Monotonic identifier for objects of type `T`.
pub struct Id<T> {
   _marker: PhantomData<fn() -> T>,
   pub value: u64
}

impl<T> Copy for Id<T> {}

impl<T> Clone for Id<T> {
   fn clone(&self) -> Self {
      *self
   }
}

impl<T> Eq for Id<T> {}

impl<T> PartialEq<Id<T>> for Id<T> {
   fn eq(&self, other: &Id<T>) -> bool {
      self.value.eq(&other.value)
   }
}

impl<T> Hash for Id<T> {
   fn hash<H: Hasher>(&self, state: &mut H) {
      self.value.hash(state)
   }
}

impl<T> Display for Id<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>)
        -> Result<(), std::fmt::Error>
    {
        write!(f, "{}", self.value)
    }
}

impl<T> Debug for Id<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>)
        -> Result<(), std::fmt::Error>
    {
        write!(f, "{}", self.value)
    }
}

impl<T> From<u64> for Id<T> {
   fn from(i: u64) -> Self {
      Id::<T> {
         _marker: PhantomData,
         value: i
      }
   }
}

impl<T> From<Id<T>> for u64 {
   fn from(id: Id<T>) -> Self {
      id.value
   }
}

/// Source of fresh ids, shared between threads.
pub struct IdSource<T> {
   _marker: PhantomData<fn() -> T>,
   next: AtomicU64,
}

impl<T> IdSource<T> {
   pub const fn new() -> Self {
      IdSource {
         _marker: PhantomData,
         next: AtomicU64::new(1),
      }
   }

   pub fn next(&self) -> Id<T> {
      Id::from(self.next.fetch_add(1, Relaxed))
   }
}

impl<T> Default for IdSource<T> {
   fn default() -> Self {
      Self::new()
   }
}

/// Index of a slot in an arena, tagged with the generation of the slot's
/// occupant so that a handle to a freed object is never mistaken for a
/// handle to whatever reuses the slot.
pub struct Handle<T> {
   _marker: PhantomData<fn() -> T>,
   pub index: u32,
   pub generation: u32,
}

impl<T> Handle<T> {
   pub const fn new(index: u32, generation: u32) -> Self {
      Handle {
         _marker: PhantomData,
         index,
         generation,
      }
   }
}

impl<T> Copy for Handle<T> {}

impl<T> Clone for Handle<T> {
   fn clone(&self) -> Self {
      *self
   }
}

impl<T> Eq for Handle<T> {}

impl<T> PartialEq for Handle<T> {
   fn eq(&self, other: &Self) -> bool {
      self.index == other.index && self.generation == other.generation
   }
}

impl<T> Hash for Handle<T> {
   fn hash<H: Hasher>(&self, state: &mut H) {
      self.index.hash(state);
      self.generation.hash(state);
   }
}

impl<T> Debug for Handle<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>)
        -> Result<(), std::fmt::Error>
    {
        write!(f, "{}v{}", self.index, self.generation)
    }
}

#[cfg(test)]
mod tests {
   use super::*;

   struct Thing;

   #[test]
   fn test_id_source() {
      let source = IdSource::<Thing>::new();
      let a = source.next();
      let b = source.next();
      assert!(a != b);
      assert_eq!(u64::from(b), u64::from(a) + 1);
      assert_eq!(format!("{a}"), "1");
   }

   #[test]
   fn test_handle_generations() {
      let old = Handle::<Thing>::new(4, 0);
      let new = Handle::<Thing>::new(4, 1);
      assert!(old != new);
      assert_eq!(old, Handle::new(4, 0));
      assert_eq!(format!("{new:?}"), "4v1");
   }
}
