use std::path::Path;

use crate::PartitionImage;

/// A trait to signify firmware images. Flashers take any image source that implements this
/// trait, so packages can be downloaded or extracted lazily.
pub trait Resolvable {
    type ResolvedType;

    /// Load the image. Network calls can be done here, with background work pushed to
    /// `join_set`.
    fn resolve(
        &self,
        join_set: &mut tokio::task::JoinSet<std::io::Result<()>>,
    ) -> impl Future<Output = std::io::Result<Self::ResolvedType>>;
}

/// Firmware image present in the local filesystem.
#[derive(Debug, Clone)]
pub struct LocalFile(Box<Path>);

impl LocalFile {
    /// Construct a new local image from path.
    pub const fn new(path: Box<Path>) -> Self {
        Self(path)
    }

    pub fn path(&self) -> &Path {
        &self.0
    }

    fn name(&self) -> String {
        self.0
            .file_name()
            .map(|x| x.to_string_lossy().to_string())
            .unwrap_or_else(|| self.0.display().to_string())
    }
}

impl Resolvable for LocalFile {
    type ResolvedType = PartitionImage;

    async fn resolve(
        &self,
        _: &mut tokio::task::JoinSet<std::io::Result<()>>,
    ) -> std::io::Result<Self::ResolvedType> {
        let data = tokio::fs::read(&self.0).await?;
        Ok(PartitionImage::new(self.name(), data))
    }
}
