mod key;
mod record;
mod writer;

pub use key::{is_local_key, validate_key_braces};
pub use record::{FileType, Record, RecordTypeTag, RecordValue, Status};
pub use writer::WriterId;
