use std::time::Duration;

use storage::{file_storage::FileStorage, storage::Storage};
use tokio::{io::AsyncReadExt, task::JoinHandle, time::timeout};
use utilities::{
    data_packet::DataPacket,
    event_queue::EventQueue,
    logger::{Instrument, Span, error, info, instrument, trace, tracing},
    result::Result,
    tcp_pool::TcpPool,
};

/// A peer asked this node to pull `file_name` from `source`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DownloadRequest {
    pub source: String,
    pub file_name: String,
}

/// Pulls files from peers into local storage. Bytes are staged and only
/// committed once the whole body arrived.
#[derive(Clone, Debug)]
pub struct TransferService {
    store: FileStorage,
    pool: TcpPool,
    transfer_timeout: Duration,
}

impl TransferService {
    pub fn new(store: FileStorage, pool: TcpPool, transfer_timeout: Duration) -> Self {
        Self {
            store,
            pool,
            transfer_timeout,
        }
    }

    /// Fetches the file unless a copy is already committed locally. Returns
    /// the number of bytes received, `None` when nothing had to be fetched.
    #[instrument(name = "transfer_download", skip(self), fields(source = %request.source, file_name = %request.file_name))]
    pub async fn download(&self, request: &DownloadRequest) -> Result<Option<u64>> {
        if self.store.exists(&request.file_name).await? {
            trace!("file already present, skipping download");
            return Ok(None);
        }
        let fetch = DataPacket::request("fetch_file").with("file_name", request.file_name.as_str());
        let (headers, stream) = self.pool.open(&request.source, &fetch).await?;
        let file_size: u64 = headers.get("file_size")?.parse()?;
        trace!(%file_size, "Bytes to be read for the file");
        let mut body = stream.take(file_size);
        let written = match timeout(
            self.transfer_timeout,
            self.store.write(request.file_name.clone(), &mut body),
        )
        .await
        {
            Ok(written) => written?,
            Err(_) => {
                return Err(format!(
                    "transfer of {} from {} did not finish within {:?}",
                    request.file_name, request.source, self.transfer_timeout
                )
                .into());
            }
        };
        if written != file_size {
            return Err(format!(
                "peer closed the stream after {written} of {file_size} bytes"
            )
            .into());
        }
        self.store.commit(request.file_name.clone()).await?;
        info!(bytes = written, "File downloaded");
        Ok(Some(written))
    }

    /// Consumes `queue`, running every download on its own task so a slow
    /// peer does not hold up the others.
    pub fn spawn_listener(&self, queue: &EventQueue<DownloadRequest>) -> JoinHandle<()> {
        let service = self.clone();
        queue.spawn_listener(move |queue| {
            let service = service.clone();
            async move {
                for request in queue.drain().await {
                    let service = service.clone();
                    let span = Span::current();
                    tokio::spawn(
                        async move {
                            if let Err(e) = service.download(&request).await {
                                error!(source = %request.source, file_name = %request.file_name, error = %e, "Download failed");
                            }
                        }
                        .instrument(span),
                    );
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::{io::AsyncWriteExt, net::TcpListener};

    /// Serves one fetch request, announcing `announced` bytes and sending
    /// `body`.
    async fn serve_file(announced: usize, body: &'static [u8]) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let request = DataPacket::decode(&mut stream).await.unwrap();
            assert_eq!(request.op().unwrap(), "fetch_file");
            DataPacket::ok()
                .with("file_size", announced.to_string())
                .write_to(&mut stream)
                .await
                .unwrap();
            stream.write_all(body).await.unwrap();
            stream.flush().await.unwrap();
        });
        address
    }

    fn service_in(dir: &tempfile::TempDir) -> TransferService {
        TransferService::new(
            FileStorage::new(dir.path()).unwrap(),
            TcpPool::default(),
            Duration::from_secs(5),
        )
    }

    #[tokio::test]
    async fn download_stages_then_commits() {
        let dir = tempfile::tempdir().unwrap();
        let service = service_in(&dir);
        let source = serve_file(5, b"hello").await;
        let request = DownloadRequest {
            source,
            file_name: "a.txt".to_owned(),
        };
        assert_eq!(service.download(&request).await.unwrap(), Some(5));
        assert_eq!(std::fs::read(dir.path().join("a.txt")).unwrap(), b"hello");
        // second request is a no-op
        assert_eq!(service.download(&request).await.unwrap(), None);
    }

    #[tokio::test]
    async fn short_body_is_not_committed() {
        let dir = tempfile::tempdir().unwrap();
        let service = service_in(&dir);
        let source = serve_file(10, b"hello").await;
        let request = DownloadRequest {
            source,
            file_name: "a.txt".to_owned(),
        };
        assert!(service.download(&request).await.is_err());
        assert!(!dir.path().join("a.txt").exists());
    }

    #[tokio::test]
    async fn listener_runs_queued_downloads() {
        let dir = tempfile::tempdir().unwrap();
        let service = service_in(&dir);
        let queue = EventQueue::new();
        let handle = service.spawn_listener(&queue);
        queue
            .add(DownloadRequest {
                source: serve_file(3, b"abc").await,
                file_name: "b.txt".to_owned(),
            })
            .await;
        let path = dir.path().join("b.txt");
        for _ in 0..100 {
            if path.exists() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(std::fs::read(&path).unwrap(), b"abc");
        queue.close();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
