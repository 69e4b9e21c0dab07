/// Max candidates accepted by one availability publication.
pub const MAX_PUBLISH_BATCH: usize = 500;

/// Max slots a single provider may hold in the ledger.
pub const MAX_SLOTS_PER_PROVIDER: usize = 50_000;

/// Max bytes of free-text notes on a booking.
pub const MAX_NOTES_LEN: usize = 2_000;

/// Largest page size for paginated listings.
pub const MAX_PAGE_LIMIT: usize = 100;

/// Business hours, seconds from midnight. Slots must fit inside `[OPEN, CLOSE)`.
pub const BUSINESS_OPEN_SECS: u32 = 9 * 3600;
pub const BUSINESS_CLOSE_SECS: u32 = 18 * 3600;

/// How far ahead of "now" reminder notifications look.
pub const REMINDER_WINDOW_HOURS: i64 = 24;
