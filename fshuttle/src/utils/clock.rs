use std::sync::atomic::{AtomicI64, Ordering};

/// Versions reserved for one entity set in one flush.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteVersions {
    /// Superseded rows are stamped with the negation of this value.
    pub tombstone: i64,
    pub write: i64,
}

/// Logical clock handing out version bases.
///
/// Bases track wall-clock milliseconds but always exceed the previous write version,
/// so a tombstone can never collide with an earlier write.
#[derive(Debug, Default)]
pub struct VersionClock {
    last: AtomicI64,
}

impl VersionClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ensures future bases are greater than an already persisted version.
    pub fn observe(&self, version: i64) {
        self.last.fetch_max(version.abs(), Ordering::SeqCst);
    }

    pub fn next(&self) -> WriteVersions {
        let now = chrono::Utc::now().timestamp_millis();
        let mut previous = self.last.load(Ordering::SeqCst);
        loop {
            let base = now.max(previous + 1);
            match self
                .last
                .compare_exchange(previous, base + 1, Ordering::SeqCst, Ordering::SeqCst)
            {
                Ok(_) => {
                    return WriteVersions {
                        tombstone: base,
                        write: base + 1,
                    };
                }
                Err(actual) => previous = actual,
            }
        }
    }
}
