/// Max bytes in a reservation note.
pub const MAX_NOTE_LEN: usize = 500;

/// Max bytes in an administrative cancellation note.
pub const MAX_ADMIN_NOTE_LEN: usize = 500;

/// Max bytes in a penalty reason.
pub const MAX_REASON_LEN: usize = 1_000;

/// Max seats on a weekly template.
pub const MAX_SESSION_CAPACITY: u32 = 500;

/// Max sessions materialized per template in one expansion.
pub const MAX_HORIZON: usize = 52;

/// Page size for reservation listings.
pub const RESERVATION_PAGE_SIZE: usize = 20;

/// Page size for registration listings.
pub const REGISTRATION_PAGE_SIZE: usize = 10;
