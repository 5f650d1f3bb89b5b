use std::sync::Arc;
use arc_swap::ArcSwapAny;

/// Read-copy-update for values with one writer at a time.
///
/// Readers take lock-free snapshots with `load_full`. Writers must be
/// serialized by the caller; two concurrent updates would lose one of them.
pub trait SingleWriterRcu<T: Clone> {
    /// Copy the value, apply a function to it, and publish the copy.
    fn update<R, F: FnOnce(&mut T) -> R>(&self, f: F) -> R;

    /// Copy the value and apply a function to it. The copy is published
    /// only if the function returns `Some`.
    fn maybe_update<R, F: FnOnce(&mut T) -> Option<R>>(&self, f: F)
        -> Option<R>;
}

impl<T> SingleWriterRcu<T> for ArcSwapAny<Arc<T>>
where T: Clone
{
    fn update<R, F: FnOnce(&mut T) -> R>(&self, f: F) -> R {
        let mut copy = self.load().as_ref().clone();
        let result = f(&mut copy);
        self.store(Arc::new(copy));
        result
    }

    fn maybe_update<R, F: FnOnce(&mut T) -> Option<R>>(&self, f: F)
        -> Option<R>
    {
        let mut copy = self.load().as_ref().clone();
        let result = f(&mut copy)?;
        self.store(Arc::new(copy));
        Some(result)
    }
}
