use std::error::Error;

use tokio::io;

pub type Result<T> = std::result::Result<T, Box<dyn Error + Send + Sync>>;

/// Local file store of one node. Incoming bytes land in a staging area and
/// only become visible to `available_files` once committed.
pub trait Storage {
    async fn write(
        &self,
        file_name: String,
        file_stream: &mut (impl io::AsyncRead + Unpin),
    ) -> Result<u64>;
    async fn commit(&self, file_name: String) -> Result<bool>;
    async fn read(&self, file_name: String) -> Result<Box<dyn io::AsyncRead + Unpin + Send>>;
    async fn delete(&self, file_name: String) -> Result<bool>;
    async fn exists(&self, file_name: &str) -> Result<bool>;
    async fn available_files(&self) -> Result<Vec<String>>;
    async fn get_file_size(&self, file_name: &str) -> Result<u64>;
}
