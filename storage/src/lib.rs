pub mod file_storage;
pub mod storage;
