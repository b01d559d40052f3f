pub mod counting_reader;
pub mod hashing_reader;
pub mod tee_reader;

pub use counting_reader::CountingReader;
pub use hashing_reader::HashingReader;
pub use tee_reader::{tee_reader, ChannelReader};

use std::sync::Arc;

/// The time source used by the processor and the janitor; injectable so tests
/// can control the clock. Returns Unix seconds.
pub type Clock = Arc<dyn Fn() -> i64 + Send + Sync>;

pub fn wall_clock() -> Clock {
    Arc::new(|| chrono::Utc::now().timestamp())
}
