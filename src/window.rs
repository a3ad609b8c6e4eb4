//! Head-centred window cache
//!
//! Only a bounded slice of each series is kept in memory. The slice is centred
//! on the head so single steps in either direction stay resident for as long
//! as possible, and it is clamped so it never reaches outside the series.

use crate::context::ReplayContext;
use crate::store::StoreError;

/// Computes `(start, len)` of the window for `head` in a series of `total` bars.
///
/// `start = clamp(head - size/2, 0, total - size)` and
/// `len = min(size, total - start)`; both are zero for an empty series.
pub fn window_bounds(head: usize, total: usize, window_size: usize) -> (usize, usize) {
    if total == 0 || window_size == 0 {
        return (0, 0);
    }

    let max_start = total.saturating_sub(window_size);
    let start = head.saturating_sub(window_size / 2).min(max_start);
    let len = window_size.min(total - start);
    (start, len)
}

/// Whether a context must be reloaded before its head bar can be read.
pub fn needs_reload(context: &ReplayContext) -> bool {
    context.total_bar_count() > 0 && !context.head_in_window()
}

/// Fetches the window around the context's head from its backing store.
///
/// # Returns
/// A replacement context carrying the new window. The input is not modified.
///
/// # Errors
/// Returns the store error if the fetch fails.
pub fn load_window(context: &ReplayContext, window_size: usize) -> Result<ReplayContext, StoreError> {
    let (start, len) = window_bounds(
        context.head_index(),
        context.total_bar_count(),
        window_size,
    );

    if len == 0 {
        return Ok(context.with_window(0, Vec::new()));
    }

    let bars = context.store().fetch_range(start, len)?;
    if bars.len() != len {
        log::warn!(
            "Short read for {}: asked for {} bars at {}, got {}",
            context.symbol(),
            len,
            start,
            bars.len()
        );
    }

    log::debug!(
        "Loaded window [{}, {}) for {} (head {})",
        start,
        start + bars.len(),
        context.symbol(),
        context.head_index()
    );

    Ok(context.with_window(start, bars))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bar::{Bar, DataSource};
    use crate::store::{BarStore, InMemoryBarStore};
    use chrono::{Duration, TimeZone, Utc};
    use std::sync::Arc;

    fn context(total: usize, head: usize) -> ReplayContext {
        let base = Utc.with_ymd_and_hms(2024, 1, 15, 0, 0, 0).unwrap();
        let bars = (0..total)
            .map(|i| Bar::flat(base + Duration::minutes(i as i64), i as f64))
            .collect();
        let store: Arc<dyn BarStore> = Arc::new(InMemoryBarStore::new(bars));
        ReplayContext::new(DataSource::in_memory("EURUSD", "1m"), store, total, head)
    }

    #[test]
    fn test_bounds_centre_on_head() {
        assert_eq!(window_bounds(50, 100, 10), (45, 10));
        assert_eq!(window_bounds(55, 100, 10), (50, 10));
    }

    #[test]
    fn test_bounds_clamp_at_edges() {
        assert_eq!(window_bounds(2, 100, 10), (0, 10));
        assert_eq!(window_bounds(98, 100, 10), (90, 10));
        assert_eq!(window_bounds(99, 100, 10), (90, 10));
    }

    #[test]
    fn test_bounds_series_shorter_than_window() {
        assert_eq!(window_bounds(3, 7, 10), (0, 7));
        assert_eq!(window_bounds(0, 0, 10), (0, 0));
    }

    #[test]
    fn test_bounds_always_contain_head_and_stay_inside_series() {
        for total in 1..40 {
            for size in 1..12 {
                for head in 0..total {
                    let (start, len) = window_bounds(head, total, size);
                    assert!(start <= head && head < start + len);
                    assert!(start + len <= total);
                    assert!(len <= size);
                }
            }
        }
    }

    #[test]
    fn test_load_window_fetches_centred_slice() {
        let loaded = load_window(&context(100, 50), 10).unwrap();

        assert_eq!(loaded.window_start(), 45);
        assert_eq!(loaded.window().len(), 10);
        assert_eq!(loaded.current_bar().unwrap().close, 50.0);
        assert!(!needs_reload(&loaded));
    }

    #[test]
    fn test_load_window_empty_series_is_noop() {
        let loaded = load_window(&context(0, 0), 10).unwrap();
        assert!(loaded.window().is_empty());
        assert!(!needs_reload(&loaded));
    }

    #[test]
    fn test_fresh_context_needs_reload() {
        assert!(needs_reload(&context(100, 0)));
    }

    #[test]
    fn test_load_window_propagates_store_errors() {
        let ctx = context(100, 50);
        ctx.store().close();
        assert_eq!(load_window(&ctx, 10).unwrap_err(), StoreError::Closed);
    }
}
