//! Small helpers shared by the callback flows.

pub mod decode;
pub mod time;

pub use decode::url_decode;
pub use time::unix_timestamp;
