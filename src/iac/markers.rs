//! Completion markers printed by the IaC CLI.
//!
//! Only consulted in `status = "markers"` mode, for wrappers that swallow the
//! real exit status. The exit code is still checked first.

/// Printed by a successful `init`.
pub const INIT_MARKER: &str = "initialized successfully";
/// Printed by a successful `apply`.
pub const APPLY_MARKER: &str = "apply complete";
/// Printed by a successful `import`.
pub const IMPORT_MARKER: &str = "import successful";

/// Case-insensitive search for `marker` in the tool output.
pub fn contains_marker(output: &str, marker: &str) -> bool {
    output.to_lowercase().contains(marker)
}
