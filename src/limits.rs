//! Hard resource limits. These are deliberately generous — they exist to
//! bound memory and WAL growth, not to express business rules.

/// Maximum number of slots the engine will hold.
pub const MAX_SLOTS: usize = 1_000_000;

/// Maximum seats on a single slot.
pub const MAX_SLOT_CAPACITY: u32 = 1_000;

/// Maximum booking records (any status) retained on one slot.
pub const MAX_BOOKINGS_PER_SLOT: usize = 10_000;

/// Maximum registered students.
pub const MAX_STUDENTS: usize = 1_000_000;

/// Maximum length of a free-text reason (cancellation, block, grant, bypass).
pub const MAX_REASON_LEN: usize = 512;

/// Widest date range an availability query may cover, in days.
pub const MAX_QUERY_WINDOW_DAYS: i64 = 366;
