//! On-disk formats owned by the durability layer

pub mod wal_record;

pub use wal_record::{
    read_header, sync_dir, WalFile, WalFileHeader, WalRecord, WalRecordError,
    RECORD_HEADER_SIZE, WAL_FILE_HEADER_SIZE, WAL_FORMAT_VERSION, WAL_MAGIC,
};
