use std::sync::Arc;

use async_trait::async_trait;

use crate::error::StoreError;
use crate::voxel::{Block, Slice, Voxel};

use super::traits::SliceReader;

/// Slice reader over a volume already held in memory.
#[derive(Debug, Clone)]
pub struct VolumeReader<T> {
    volume: Arc<Block<T>>,
}

impl<T: Voxel> VolumeReader<T> {
    pub fn new(volume: Block<T>) -> Self {
        Self {
            volume: Arc::new(volume),
        }
    }

    pub fn volume(&self) -> &Block<T> {
        &self.volume
    }
}

#[async_trait]
impl<T: Voxel> SliceReader<T> for VolumeReader<T> {
    fn slice_shape(&self) -> [usize; 2] {
        let [x, y, _] = self.volume.shape();
        [x, y]
    }

    fn depth(&self) -> usize {
        self.volume.shape()[2]
    }

    async fn read_slice(&self, z: usize) -> Result<Slice<T>, StoreError> {
        if z >= self.depth() {
            return Err(StoreError::NotFound(format!(
                "slice {} of {}",
                z,
                self.depth()
            )));
        }
        Ok(self.volume.plane(z))
    }
}
