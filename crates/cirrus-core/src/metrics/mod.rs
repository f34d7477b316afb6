//! Metrics emission.
//!
//! Events are recorded through the `metrics` facade. Installing a recorder or
//! exporter is left to the embedding process; without one every event is a
//! no-op apart from its trace line.

pub mod events;

/// Macro for emitting metric events.
///
/// Calls `InternalEvent::emit()` on the given event, which records the
/// corresponding counter or histogram.
///
/// # Example
///
/// ```ignore
/// use cirrus_core::metrics::events::CommitCompleted;
///
/// emit!(CommitCompleted { bytes: 1024 });
/// ```
#[macro_export]
macro_rules! emit {
    ($event:expr) => {
        $crate::metrics::events::InternalEvent::emit($event)
    };
}

pub use emit;
