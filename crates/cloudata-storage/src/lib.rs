pub mod codec;
pub mod engine;
pub mod external;
pub mod fjall;
pub mod keys;
pub mod latch;
pub mod log;
pub mod mem;
pub mod operation;
pub mod registry;
pub mod traits;
pub mod types;


pub use engine::Engine;
pub use external::{DataStore, ObjectStore, ObjectStoreLocation, RecordMapping, TableCatalog};
pub use self::fjall::FjallBackend;
pub use log::{LogAction, LogEntry, LogRecord};
pub use mem::MemBackend;
pub use operation::{parse_decimal, Operation};
pub use registry::{user_keyspace_name, KeyspaceRegistry, SYSTEM_KEYSPACE_NAME};
pub use traits::{Backend, OperationStore};
pub use types::{Partition, WriteBatch};
