//! Exit statuses, chosen to conform or give way to existing conventions.

/// An instance with the requested name is already registered.
pub const NAME_IN_USE: i32 = 123;
/// Any internal setup failure.
pub const CANNOT: i32 = 124;
/// Inapplicable convention (git-bisect).
pub const UNTESTABLE: i32 = 125;
/// The command exists but could not be executed.
pub const CMD_NOT_EXEC: i32 = 126;
/// The command was not found.
pub const CMD_NOT_FOUND: i32 = 127;

/// Exit status of a child killed by signal `sig`, shell convention.
pub fn killed_by(sig: i32) -> i32 {
    128 + sig
}
