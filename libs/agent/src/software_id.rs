//! Compile-time fingerprint of the target firmware.

pub const SOFTWARE_ID_LENGTH: usize = 16;

/// Placeholder fingerprint. Release pipelines overwrite this array in the
/// final binary with a hash of the build artifacts, so this exact value only
/// shows up in untagged development builds.
pub const SOFTWARE_ID: [u8; SOFTWARE_ID_LENGTH] =
    [0, 1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15];
