/// Longest accepted patient or doctor name, in bytes.
pub const MAX_NAME_LEN: usize = 256;
pub const MAX_EMAIL_LEN: usize = 320;
pub const MAX_DEPARTMENT_LEN: usize = 256;
pub const MAX_NOTES_LEN: usize = 4096;

/// Upper bound on appointments held in one doctor's calendar.
pub const MAX_APPOINTMENTS_PER_DOCTOR: usize = 100_000;
pub const MAX_SLOTS_PER_DOCTOR: usize = 10_000;

/// Longest request line the wire protocol will buffer.
pub const MAX_LINE_LEN: usize = 64 * 1024;
