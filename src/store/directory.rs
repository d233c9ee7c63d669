//! Filesystem chunk store.
//!
//! # Layout
//!
//! ```text
//! <root>/
//!   store.json                 element type and shard shape
//!   multiscales.json           multiscale manifest
//!   0/
//!     level.json               level shape and chunk edge
//!     0.0.0/                   shard directory (only when sharded)
//!       0.0.0                  chunk file
//!       1.0.0
//!       .complete              written once every member chunk exists
//!   1/
//!     ...
//! ```
//!
//! Unsharded stores put chunk files directly in the level directory.
//!
//! Chunk files are written to a `.partial` sibling and renamed into place, so a
//! chunk is either absent or complete. That is what makes `chunk_exists` a safe
//! resume check.

use std::collections::HashMap;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::RwLock;
use tracing::debug;

use crate::error::StoreError;
use crate::geometry::{shard_of, validate_shard_shape, ChunkGrid, ChunkIndex, Shape3, ShardId};
use crate::io::{ChunkReader, ChunkWriter};
use crate::voxel::{Block, Voxel};

use super::metadata::{GroupMetadata, LevelMetadata, Multiscale, StoreMetadata};

const STORE_METADATA_FILE: &str = "store.json";
const LEVEL_METADATA_FILE: &str = "level.json";
const MULTISCALES_FILE: &str = "multiscales.json";
const SHARD_COMPLETE_MARKER: &str = ".complete";
const PARTIAL_SUFFIX: &str = ".partial";

/// Chunk store backed by a directory tree.
#[derive(Debug)]
pub struct DirectoryStore<T> {
    root: PathBuf,
    shard_shape: Option<Shape3>,
    levels: RwLock<HashMap<usize, LevelMetadata>>,
    _voxel: PhantomData<fn() -> T>,
}

impl<T: Voxel> DirectoryStore<T> {
    /// Create a new store at `root`.
    ///
    /// Fails if `root` already exists and is not empty, so an existing dataset
    /// is never clobbered. Use [`DirectoryStore::open`] to resume one.
    pub async fn create(
        root: impl AsRef<Path>,
        shard_shape: Option<Shape3>,
    ) -> Result<Self, StoreError> {
        let root = root.as_ref().to_path_buf();
        if let Some(shape) = shard_shape {
            validate_shard_shape(shape).map_err(|e| StoreError::Metadata(e.to_string()))?;
        }

        if tokio::fs::try_exists(&root).await? {
            let mut entries = tokio::fs::read_dir(&root).await?;
            if entries.next_entry().await?.is_some() {
                return Err(StoreError::Metadata(format!(
                    "{} already exists",
                    root.display()
                )));
            }
        }
        tokio::fs::create_dir_all(&root).await?;

        let metadata = StoreMetadata {
            dtype: T::DATA_TYPE,
            shard_shape,
        };
        write_json(&root.join(STORE_METADATA_FILE), &metadata).await?;
        debug!(root = %root.display(), dtype = %T::DATA_TYPE, "Created chunk store");

        Ok(Self {
            root,
            shard_shape,
            levels: RwLock::new(HashMap::new()),
            _voxel: PhantomData,
        })
    }

    /// Open an existing store, loading the metadata of every level present.
    pub async fn open(root: impl AsRef<Path>) -> Result<Self, StoreError> {
        let root = root.as_ref().to_path_buf();
        let metadata: StoreMetadata = read_json(&root.join(STORE_METADATA_FILE)).await?;
        if metadata.dtype != T::DATA_TYPE {
            return Err(StoreError::Metadata(format!(
                "store holds {} data, opened as {}",
                metadata.dtype,
                T::DATA_TYPE
            )));
        }

        let mut levels = HashMap::new();
        let mut entries = tokio::fs::read_dir(&root).await?;
        while let Some(entry) = entries.next_entry().await? {
            // Level directories are named by their number; skip root files.
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            if entry.file_name().to_str().and_then(|n| n.parse::<usize>().ok()).is_none() {
                continue;
            }
            let level_file = entry.path().join(LEVEL_METADATA_FILE);
            if tokio::fs::try_exists(&level_file).await? {
                let level: LevelMetadata = read_json(&level_file).await?;
                levels.insert(level.level, level);
            }
        }
        debug!(root = %root.display(), levels = levels.len(), "Opened chunk store");

        Ok(Self {
            root,
            shard_shape: metadata.shard_shape,
            levels: RwLock::new(levels),
            _voxel: PhantomData,
        })
    }

    /// Open the store at `root` if one exists, otherwise create it.
    ///
    /// An existing store must have the same shard shape.
    pub async fn open_or_create(
        root: impl AsRef<Path>,
        shard_shape: Option<Shape3>,
    ) -> Result<Self, StoreError> {
        let root = root.as_ref();
        if tokio::fs::try_exists(root.join(STORE_METADATA_FILE)).await? {
            let store = Self::open(root).await?;
            if store.shard_shape != shard_shape {
                return Err(StoreError::Metadata(format!(
                    "store uses shard shape {:?}, requested {:?}",
                    store.shard_shape, shard_shape
                )));
            }
            Ok(store)
        } else {
            Self::create(root, shard_shape).await
        }
    }

    /// Root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Shard shape in chunks, if the store is sharded.
    pub fn shard_shape(&self) -> Option<Shape3> {
        self.shard_shape
    }

    /// Metadata of a level, if it has been created.
    pub async fn level(&self, level: usize) -> Option<LevelMetadata> {
        self.levels.read().await.get(&level).cloned()
    }

    /// Levels present in the store, ascending.
    pub async fn levels(&self) -> Vec<usize> {
        let mut levels: Vec<usize> = self.levels.read().await.keys().copied().collect();
        levels.sort_unstable();
        levels
    }

    /// Write the multiscale manifest.
    pub async fn write_multiscales(&self, multiscale: Multiscale) -> Result<(), StoreError> {
        let document = GroupMetadata {
            multiscales: vec![multiscale],
        };
        write_json(&self.root.join(MULTISCALES_FILE), &document).await
    }

    /// Read the multiscale manifest.
    pub async fn read_multiscales(&self) -> Result<GroupMetadata, StoreError> {
        read_json(&self.root.join(MULTISCALES_FILE)).await
    }

    /// Whether a shard has been committed.
    pub async fn is_shard_committed(&self, level: usize, shard: ShardId) -> Result<bool, StoreError> {
        Ok(tokio::fs::try_exists(self.shard_dir(level, shard).join(SHARD_COMPLETE_MARKER)).await?)
    }

    fn level_dir(&self, level: usize) -> PathBuf {
        self.root.join(level.to_string())
    }

    fn shard_dir(&self, level: usize, shard: ShardId) -> PathBuf {
        self.level_dir(level).join(shard.to_string())
    }

    fn chunk_path(&self, level: usize, index: ChunkIndex) -> PathBuf {
        let name = format!("{}.{}.{}", index.x, index.y, index.z);
        match self.shard_shape {
            Some(shape) => self.shard_dir(level, shard_of(index, shape)).join(name),
            None => self.level_dir(level).join(name),
        }
    }

    /// True extent of a chunk according to the level metadata.
    async fn expected_extent(&self, level: usize, index: ChunkIndex) -> Result<Shape3, StoreError> {
        let meta = self
            .levels
            .read()
            .await
            .get(&level)
            .cloned()
            .ok_or(StoreError::UnknownLevel(level))?;
        let grid = ChunkGrid::new(meta.shape, meta.chunk_edge)
            .map_err(|e| StoreError::Metadata(e.to_string()))?;
        grid.chunk_extent(index).ok_or_else(|| {
            StoreError::NotFound(format!("chunk {} outside level {} grid", index, level))
        })
    }
}

#[async_trait]
impl<T: Voxel> ChunkWriter<T> for DirectoryStore<T> {
    async fn create_level(
        &self,
        level: usize,
        shape: Shape3,
        chunk_edge: usize,
    ) -> Result<(), StoreError> {
        let meta = LevelMetadata {
            level,
            shape,
            chunk_edge,
            dtype: T::DATA_TYPE,
            shard_shape: self.shard_shape,
        };

        let mut levels = self.levels.write().await;
        if let Some(existing) = levels.get(&level) {
            if *existing == meta {
                return Ok(());
            }
            return Err(StoreError::Metadata(format!(
                "level {} exists with shape {:?} and chunk edge {}, requested {:?} and {}",
                level, existing.shape, existing.chunk_edge, shape, chunk_edge
            )));
        }

        let dir = self.level_dir(level);
        tokio::fs::create_dir_all(&dir).await?;
        write_json(&dir.join(LEVEL_METADATA_FILE), &meta).await?;
        levels.insert(level, meta);
        Ok(())
    }

    async fn write_chunk(
        &self,
        level: usize,
        index: ChunkIndex,
        data: Block<T>,
    ) -> Result<(), StoreError> {
        let expected = self.expected_extent(level, index).await?;
        if data.shape() != expected {
            return Err(StoreError::ShapeMismatch {
                expected,
                actual: data.shape(),
            });
        }

        let path = self.chunk_path(level, index);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let encoded = data.to_bytes();
        drop(data);

        let mut partial = path.clone().into_os_string();
        partial.push(PARTIAL_SUFFIX);
        let partial = PathBuf::from(partial);
        tokio::fs::write(&partial, &encoded).await?;
        tokio::fs::rename(&partial, &path).await?;
        Ok(())
    }

    async fn chunk_exists(&self, level: usize, index: ChunkIndex) -> Result<bool, StoreError> {
        Ok(tokio::fs::try_exists(self.chunk_path(level, index)).await?)
    }

    async fn commit_shard(&self, level: usize, shard: ShardId) -> Result<(), StoreError> {
        if self.shard_shape.is_none() {
            return Ok(());
        }
        let dir = self.shard_dir(level, shard);
        tokio::fs::create_dir_all(&dir).await?;
        tokio::fs::write(dir.join(SHARD_COMPLETE_MARKER), b"").await?;
        debug!(level, shard = %shard, "Committed shard");
        Ok(())
    }
}

#[async_trait]
impl<T: Voxel> ChunkReader<T> for DirectoryStore<T> {
    async fn read_chunk(&self, level: usize, index: ChunkIndex) -> Result<Block<T>, StoreError> {
        let expected = self.expected_extent(level, index).await?;
        let bytes = tokio::fs::read(self.chunk_path(level, index)).await?;
        let block = Block::from_bytes(Bytes::from(bytes))?;
        if block.shape() != expected {
            return Err(StoreError::ShapeMismatch {
                expected,
                actual: block.shape(),
            });
        }
        Ok(block)
    }
}

async fn write_json<V: serde::Serialize>(path: &Path, value: &V) -> Result<(), StoreError> {
    let text = serde_json::to_string_pretty(value)?;
    tokio::fs::write(path, text).await?;
    Ok(())
}

async fn read_json<V: serde::de::DeserializeOwned>(path: &Path) -> Result<V, StoreError> {
    let text = tokio::fs::read_to_string(path).await?;
    Ok(serde_json::from_str(&text)?)
}

// =============================================================================
// Tests
// =============================================================================
