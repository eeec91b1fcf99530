//! Crate-wide constants.

use uuid::Uuid;

pub const APP_NAME: &str = "deriva";

/// Version of the build system itself.
///
/// Stored in every action so that a change to the way actions are resolved or
/// executed invalidates every cached output.
pub const BUILD_SYSTEM_VERSION: Uuid = Uuid::from_u128(0x6a3b_9e2c_41d7_4f08_b5e1_2c97_d04f_a311);

/// Maximum length of a cache bucket name.
pub const MAX_BUCKET_LEN: usize = 63;

/// Diagnostic category used for errors raised by the job itself.
pub const BUILD_LOG_CATEGORY: &str = "Build";

/// Marker version written alongside filesystem cache records.
pub const CACHE_RECORD_FORMAT_VERSION: u32 = 1;
