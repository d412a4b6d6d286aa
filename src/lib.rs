pub mod core;
pub mod storage;
pub mod mmap;
pub mod cache;
pub mod channel;
pub mod system;
pub mod index;
pub mod query;
pub mod gigamap;

pub use crate::core::config::Config;
pub use crate::core::database::{Database, Databases};
pub use crate::core::error::{Error, ErrorKind, Result};
pub use crate::core::types::{Entity, ObjectId, TypeId};
pub use crate::gigamap::map::{GigaMap, GigaQuery};
pub use crate::system::manager::{StorageBuilder, StorageManager};

/*
┌──────────────────────────────────── GIGASTORE ARCHITECTURE ───────────────────────────────────┐

┌───────────────────────────────────── SYSTEM LAYER ───────────────────────────────────────────┐
│  struct StorageManager (Clone, Arc<StorageSystem>)                                            │
│  • object_ids: ObjectIdProvider       • timestamps: TimestampProvider                         │
│  • broker: TaskBroker                 • controller: Arc<OperationController>                  │
│  • lock_file: LockFileManager         • backup: Option<BackupHandler>                         │
│  • store_lock: Mutex<()>              // one store in flight                                  │
│                                                                                               │
│  struct Database ──Weak──▶ StorageSystem   (at most one running storage per path)            │
└───────────────────────────────────────────────────────────────────────────────────────────────┘
                       │ submit(TaskKind) broadcasts one ChannelTask to every channel
                       ▼
┌───────────────────────────────────── CHANNEL LAYER ──────────────────────────────────────────┐
│  StorageChannel[0]       StorageChannel[1]      ...      StorageChannel[n-1]                  │
│  thread "gigastore-channel-i", crossbeam receiver, housekeeping when idle                      │
│  • cache: EntityCache          oid & (n - 1) selects the channel                             │
│  • files: FileManager          GC: MarkMonitor (queues + pending counter + cycle barrier)    │
│  failures ──▶ StorageExceptionHandler ──▶ OperationController (disrupted, fail fast)          │
└───────────────────────────────────────────────────────────────────────────────────────────────┘
                       │
                       ▼
┌───────────────────────────────────── STORAGE LAYER ──────────────────────────────────────────┐
│  channel_i/                                                                                   │
│   ├── channel_i_<n>.dat          [len][tid][oid][payload] records, append only                │
│   └── transactions_i.sft         STORE / FILE_CREATION / TRANSFER / TRUNCATION / DELETION     │
│  used.lock                       lastWrite;expiration;identifier                              │
└───────────────────────────────────────────────────────────────────────────────────────────────┘

┌───────────────────────────────────── GIGAMAP LAYER ──────────────────────────────────────────┐
│  GigaMap<E> (Arc<RwLock<MapState<E>>>)                                                        │
│  • entities: Vec<Option<E>>   positions never reused                                          │
│  • indices: BTreeMap<String, BitmapIndex<E>>   key ─▶ RoaringTreemap, nulls bitmap            │
│  query(): Condition ─▶ QueryOptimizer ─▶ ConditionEvaluator ─▶ QueryResults (lazy)            │
│  store(): root + segments of 1024 positions + one entity per index, reachable from ROOTS      │
└───────────────────────────────────────────────────────────────────────────────────────────────┘
*/
