//! Origin that serves media files from a local directory

use std::io::{ErrorKind, SeekFrom};
use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tracing::debug;
use vidcache::{ByteRange, NetworkError, Origin};

/// Resolves resource ids as relative paths under a root directory
pub struct FileOrigin {
    root: PathBuf,
}

impl FileOrigin {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn resolve(&self, resource: &str) -> Result<PathBuf, NetworkError> {
        let relative = Path::new(resource);
        let escapes = relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
        if resource.is_empty() || escapes {
            return Err(NetworkError::permanent(format!(
                "resource {:?} is outside the origin root",
                resource
            )));
        }
        Ok(self.root.join(relative))
    }
}

fn io_error(resource: &str, err: std::io::Error) -> NetworkError {
    let message = format!("{}: {}", resource, err);
    match err.kind() {
        ErrorKind::NotFound => NetworkError::permanent(message),
        _ => NetworkError::transient(message),
    }
}

#[async_trait]
impl Origin for FileOrigin {
    async fn fetch_range(&self, resource: &str, range: ByteRange) -> Result<Bytes, NetworkError> {
        let path = self.resolve(resource)?;
        let mut file = File::open(&path).await.map_err(|e| io_error(resource, e))?;

        let file_len = file
            .metadata()
            .await
            .map_err(|e| io_error(resource, e))?
            .len();
        if range.start() >= file_len {
            return Err(NetworkError::permanent(format!(
                "{}: range {} starts past end of file ({} bytes)",
                resource, range, file_len
            )));
        }

        let len = range.end().min(file_len) - range.start();
        file.seek(SeekFrom::Start(range.start()))
            .await
            .map_err(|e| io_error(resource, e))?;

        let mut data = vec![0u8; len as usize];
        file.read_exact(&mut data)
            .await
            .map_err(|e| io_error(resource, e))?;

        debug!(resource, %range, len, "served range from origin directory");
        Ok(Bytes::from(data))
    }
}
