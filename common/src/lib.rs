//! Shared helpers for the Overseer workspace.

pub mod fsutil;
pub mod names;

pub use fsutil::append_jsonl_line;
pub use fsutil::ensure_accessible_dir;
pub use fsutil::write_json_atomic;
pub use names::sanitize_name;
