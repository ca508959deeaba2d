// Hard caps on caller-controlled input. Anything past these is rejected
// with `LimitExceeded` rather than grown without bound.

pub const MAX_VEHICLE_ID_LEN: usize = 64;
pub const MAX_REQUESTS_PER_TENANT: usize = 1_000_000;
pub const MAX_ROLLBACK_BATCH: usize = 100_000;

pub const MAX_ZONES: usize = 10_000;
pub const MAX_SLOTS: usize = 1_000_000;

pub const MAX_TENANTS: usize = 1024;
pub const MAX_TENANT_NAME_LEN: usize = 256;
