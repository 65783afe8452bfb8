pub mod error;
pub mod part;
pub mod partition;
pub mod path;
pub mod schema;
pub mod sink;
pub mod value;

pub use error::{DataError, ErrorKind};
pub use part::{Part, RowStream};
pub use partition::{Partition, PartitionEntry};
pub use schema::{Column, DataType, Schema};
pub use sink::{SinkConnection, SinkTarget};
pub use value::{Row, Value};
