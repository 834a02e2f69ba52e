mod driver;
mod reader;
mod time_range;
mod types;
mod write;

pub use driver::{MZAligner, MZAlignerError, DEFAULT_CONFIG_FILE, ENV_PREFIX};
pub use reader::{collect_run, read_run, LoadedRun};
pub use time_range::{TimeRange, TimeRangeParseError};
pub use write::{write_output, write_table, OutputFormat};
