// OpenDAL-based object store gateway.
//
// File bytes live under a prefix-per-batch layout so teardown can remove
// every byte a batch ever wrote with a single prefix delete:
//
//   {batch_id}/{item_id}/{filename}
//
// Bytes are written once at batch creation and deleted once at teardown;
// in-place mutation is forbidden.

use opendal::Operator;

use crate::state::StoreError;

#[derive(Clone)]
pub struct ObjectStore {
    operator: Operator,
}

impl ObjectStore {
    /// Storage on the local filesystem
    pub fn new_fs(root: &str) -> Result<Self, StoreError> {
        let builder = opendal::services::Fs::default().root(root);
        let operator = Operator::new(builder)
            .map_err(|e| StoreError::Backend(e.to_string()))?
            .finish();
        Ok(Self { operator })
    }

    /// Storage on S3 (or any S3-compatible endpoint)
    pub fn new_s3(bucket: &str, region: &str, endpoint: Option<&str>) -> Result<Self, StoreError> {
        let mut builder = opendal::services::S3::default().bucket(bucket).region(region);
        if let Some(ep) = endpoint {
            builder = builder.endpoint(ep);
        }
        let operator = Operator::new(builder)
            .map_err(|e| StoreError::Backend(e.to_string()))?
            .finish();
        Ok(Self { operator })
    }

    /// Ephemeral in-process storage (tests, local development)
    pub fn new_memory() -> Result<Self, StoreError> {
        let builder = opendal::services::Memory::default();
        let operator = Operator::new(builder)
            .map_err(|e| StoreError::Backend(e.to_string()))?
            .finish();
        Ok(Self { operator })
    }

    /// Store file bytes and return the opaque reference the analyzer accepts.
    ///
    /// The derived path is unique per `(batch_id, item_id)`; an existing
    /// object at the path is an error, never an overwrite.
    pub async fn put(
        &self,
        batch_id: &str,
        item_id: &str,
        filename: &str,
        bytes: Vec<u8>,
    ) -> Result<String, StoreError> {
        let path = object_path(batch_id, item_id, filename);
        match self.operator.stat(&path).await {
            Ok(_) => return Err(StoreError::AlreadyExists(path)),
            Err(e) if e.kind() == opendal::ErrorKind::NotFound => {}
            Err(e) => return Err(StoreError::Backend(e.to_string())),
        }
        self.operator
            .write(&path, bytes)
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        Ok(path)
    }

    /// Read back stored bytes by reference.
    pub async fn read(&self, file_ref: &str) -> Result<Vec<u8>, StoreError> {
        let data = self
            .operator
            .read(file_ref)
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        Ok(data.to_vec())
    }

    /// Remove every object under the batch prefix. Idempotent; a missing
    /// prefix is fine.
    pub async fn delete_all(&self, batch_id: &str) -> Result<(), StoreError> {
        let prefix = format!("{}/", batch_id);
        match self.operator.remove_all(&prefix).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == opendal::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StoreError::Backend(e.to_string())),
        }
    }

    /// Readiness probe: verify the backend answers at all.
    pub async fn check(&self) -> Result<(), StoreError> {
        match self.operator.stat("/").await {
            Ok(_) => Ok(()),
            Err(e) if e.kind() == opendal::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StoreError::Backend(e.to_string())),
        }
    }
}

/// Path under the batch prefix. Filenames are flattened so caller-supplied
/// names cannot escape the prefix, and an empty name still yields a path.
fn object_path(batch_id: &str, item_id: &str, filename: &str) -> String {
    let safe: String = filename
        .chars()
        .map(|c| if c == '/' || c == '\\' { '_' } else { c })
        .collect();
    let name = if safe.is_empty() {
        "document".to_string()
    } else {
        safe
    };
    format!("{}/{}/{}", batch_id, item_id, name)
}
