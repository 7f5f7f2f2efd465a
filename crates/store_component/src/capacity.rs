//! Capacity planning for array-backed storage.
//!
//! Dense stores and the entity slot table grow through one shared policy so
//! growth behavior can be tested independently of any store.

/// Plan a new capacity for array-backed storage.
///
/// Returns `current` unchanged when it already covers `requested`. Otherwise
/// grows by at least 1.5x, with a floor of one extra slot so tiny tables do
/// not crawl one element at a time, then rounds up to `requested` if the
/// multiplicative step still falls short (e.g. a bulk reservation).
#[must_use]
pub fn plan_capacity(current: usize, requested: usize) -> usize {
    if requested <= current {
        return current;
    }
    let step = current + (current / 2).max(1);
    step.max(requested)
}
