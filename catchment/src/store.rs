//! On-disk dataset format.
//!
//! ```text
//! <cache_dir>/<dataset>/
//!   metadata.json          : DatasetMetadata (JSON: graph schema + tasks)
//!   nodes/<type>.bin       : f32 features [num_nodes, feature_dim], then i64 node times if temporal
//!   edges/<index>.bin      : CSR of one edge type: u32 row_ptr, u32 col_idx, i64 edge_time
//!   tasks/<task>/<split>.bin : (u32 src, u32 dst, i64 time) records
//! ```
//!
//! All arrays are little-endian and read back through a memory map.

use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use memmap2::Mmap;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::common::{EdgeType, NodeType, Split, TemporalCsr};
use crate::graph::{GraphError, GraphSchema, HeteroGraph, NodeStore};
use crate::task::{LinkExample, LinkTask, TaskError, TaskMetadata};

const TASK_RECORD_BYTES: usize = 16;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskEntry {
    #[serde(flatten)]
    pub meta: TaskMetadata,
    pub num_train: u64,
    pub num_val: u64,
    pub num_test: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetMetadata {
    pub name: String,
    pub schema: GraphSchema,
    pub tasks: Vec<TaskEntry>,
}

/// Example tables of one task.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskTables {
    pub meta: TaskMetadata,
    pub train: Vec<LinkExample>,
    pub val: Vec<LinkExample>,
    pub test: Vec<LinkExample>,
}

impl TaskTables {
    pub fn split(&self, split: Split) -> &[LinkExample] {
        match split {
            Split::Train => &self.train,
            Split::Val => &self.val,
            Split::Test => &self.test,
        }
    }
}

/// A graph plus its tasks, as loaded from or written to a dataset directory.
#[derive(Debug, Clone)]
pub struct Dataset {
    pub name: String,
    pub graph: Arc<HeteroGraph>,
    pub tasks: Vec<TaskTables>,
}

impl Dataset {
    pub fn task_names(&self) -> impl Iterator<Item = &str> {
        self.tasks.iter().map(|t| t.meta.name.as_str())
    }

    /// Bind the named task to the graph as a [`LinkTask`].
    pub fn link_task(&self, name: &str) -> Result<LinkTask, StoreError> {
        let tables = self
            .tasks
            .iter()
            .find(|t| t.meta.name == name)
            .ok_or_else(|| StoreError::UnknownTask {
                dataset: self.name.clone(),
                task: name.to_string(),
            })?;
        Ok(LinkTask::new(
            tables.meta.clone(),
            tables.train.clone(),
            tables.val.clone(),
            tables.test.clone(),
            &self.graph,
        )?)
    }

    fn metadata(&self) -> DatasetMetadata {
        DatasetMetadata {
            name: self.name.clone(),
            schema: self.graph.schema().clone(),
            tasks: self
                .tasks
                .iter()
                .map(|t| TaskEntry {
                    meta: t.meta.clone(),
                    num_train: t.train.len() as u64,
                    num_val: t.val.len() as u64,
                    num_test: t.test.len() as u64,
                })
                .collect(),
        }
    }
}

/// `<cache_dir>/<dataset>`.
pub fn dataset_dir(cache_dir: &Path, dataset: &str) -> PathBuf {
    cache_dir.join(dataset)
}

// ============================================================================
// Writing
// ============================================================================

pub fn write_dataset(dir: &Path, dataset: &Dataset) -> Result<(), StoreError> {
    let graph = &dataset.graph;
    let schema = graph.schema();
    fs::create_dir_all(dir.join("nodes"))?;
    fs::create_dir_all(dir.join("edges"))?;

    for (t, meta) in schema.node_types.iter().enumerate() {
        let store = graph.node_store(NodeType(t as u32));
        let mut w = BufWriter::new(File::create(dir.join("nodes").join(format!("{}.bin", meta.name)))?);
        write_le(&mut w, &store.features, f32::to_le_bytes)?;
        if let Some(times) = &store.times {
            write_le(&mut w, times, i64::to_le_bytes)?;
        }
        w.flush()?;
    }

    for e in 0..schema.num_edge_types() {
        let csr = graph.adjacency(EdgeType(e as u32));
        let mut w = BufWriter::new(File::create(dir.join("edges").join(format!("{e}.bin")))?);
        write_le(&mut w, &csr.row_ptr, u32::to_le_bytes)?;
        write_le(&mut w, &csr.col_idx, u32::to_le_bytes)?;
        write_le(&mut w, &csr.edge_time, i64::to_le_bytes)?;
        w.flush()?;
    }

    for task in &dataset.tasks {
        let task_dir = dir.join("tasks").join(&task.meta.name);
        fs::create_dir_all(&task_dir)?;
        for split in Split::ALL {
            let mut w = BufWriter::new(File::create(task_dir.join(format!("{split}.bin")))?);
            for ex in task.split(split) {
                w.write_all(&ex.src.to_le_bytes())?;
                w.write_all(&ex.dst.to_le_bytes())?;
                w.write_all(&ex.time.to_le_bytes())?;
            }
            w.flush()?;
        }
    }

    let metadata = serde_json::to_vec_pretty(&dataset.metadata())?;
    fs::write(dir.join("metadata.json"), metadata)?;
    info!(
        "Wrote dataset '{}' ({} node types, {} edge types, {} tasks) to {}",
        dataset.name,
        schema.num_node_types(),
        schema.num_edge_types(),
        dataset.tasks.len(),
        dir.display()
    );
    Ok(())
}

fn write_le<T: Copy, const N: usize>(
    w: &mut impl Write,
    values: &[T],
    to_bytes: fn(T) -> [u8; N],
) -> std::io::Result<()> {
    for &v in values {
        w.write_all(&to_bytes(v))?;
    }
    Ok(())
}

// ============================================================================
// Loading
// ============================================================================

/// A memory-mapped file consumed front to back.
struct MappedFile {
    path: PathBuf,
    mmap: Option<Mmap>,
    offset: usize,
}

impl MappedFile {
    fn open(path: PathBuf) -> Result<Self, StoreError> {
        let file = File::open(&path)?;
        let mmap = if file.metadata()?.len() == 0 {
            None
        } else {
            // SAFETY: dataset files are written once and not modified while mapped.
            Some(unsafe { Mmap::map(&file)? })
        };
        Ok(Self {
            path,
            mmap,
            offset: 0,
        })
    }

    fn bytes(&self) -> &[u8] {
        self.mmap.as_deref().unwrap_or(&[])
    }

    fn take<T, const N: usize>(&mut self, count: usize, from_bytes: fn([u8; N]) -> T) -> Result<Vec<T>, StoreError> {
        let end = self.offset + count * N;
        if end > self.bytes().len() {
            return Err(StoreError::Malformed {
                path: self.path.clone(),
                reason: format!("needs {end} bytes, file has {}", self.bytes().len()),
            });
        }
        let out = self.bytes()[self.offset..end]
            .chunks_exact(N)
            .map(|c| {
                let mut buf = [0u8; N];
                buf.copy_from_slice(c);
                from_bytes(buf)
            })
            .collect();
        self.offset = end;
        Ok(out)
    }

    fn finish(self) -> Result<(), StoreError> {
        if self.offset != self.bytes().len() {
            return Err(StoreError::Malformed {
                reason: format!("{} trailing bytes", self.bytes().len() - self.offset),
                path: self.path,
            });
        }
        Ok(())
    }
}

pub fn load_dataset(dir: &Path) -> Result<Dataset, StoreError> {
    let metadata_path = dir.join("metadata.json");
    let metadata_bytes = fs::read(&metadata_path)?;
    let metadata: DatasetMetadata = serde_json::from_slice(&metadata_bytes)?;
    let schema = &metadata.schema;

    let mut nodes = Vec::with_capacity(schema.num_node_types());
    for meta in &schema.node_types {
        let mut file = MappedFile::open(dir.join("nodes").join(format!("{}.bin", meta.name)))?;
        let n = meta.num_nodes as usize;
        let features = file.take(n * meta.feature_dim as usize, f32::from_le_bytes)?;
        let times = if meta.temporal {
            Some(file.take(n, i64::from_le_bytes)?)
        } else {
            None
        };
        file.finish()?;
        nodes.push(NodeStore { features, times });
    }

    let mut adjacency = Vec::with_capacity(schema.num_edge_types());
    for (e, meta) in schema.edge_types.iter().enumerate() {
        let mut file = MappedFile::open(dir.join("edges").join(format!("{e}.bin")))?;
        let rows = schema.node_meta(meta.dst).num_nodes as usize;
        let num_edges = meta.num_edges as usize;
        let csr = TemporalCsr {
            row_ptr: file.take(rows + 1, u32::from_le_bytes)?,
            col_idx: file.take(num_edges, u32::from_le_bytes)?,
            edge_time: file.take(num_edges, i64::from_le_bytes)?,
        };
        file.finish()?;
        adjacency.push(csr);
    }

    let graph = Arc::new(HeteroGraph::new(metadata.schema.clone(), nodes, adjacency)?);

    let mut tasks = Vec::with_capacity(metadata.tasks.len());
    for entry in &metadata.tasks {
        let task_dir = dir.join("tasks").join(&entry.meta.name);
        let read_split = |split: Split, count: u64| -> Result<Vec<LinkExample>, StoreError> {
            let mut file = MappedFile::open(task_dir.join(format!("{split}.bin")))?;
            let raw = file.take(count as usize, |b: [u8; TASK_RECORD_BYTES]| b)?;
            file.finish()?;
            Ok(raw.into_iter().map(decode_example).collect())
        };
        tasks.push(TaskTables {
            meta: entry.meta.clone(),
            train: read_split(Split::Train, entry.num_train)?,
            val: read_split(Split::Val, entry.num_val)?,
            test: read_split(Split::Test, entry.num_test)?,
        });
    }

    info!(
        "Loaded dataset '{}' from {}: {} node types, {} edge types, tasks [{}]",
        metadata.name,
        dir.display(),
        schema.num_node_types(),
        schema.num_edge_types(),
        metadata
            .tasks
            .iter()
            .map(|t| t.meta.name.as_str())
            .collect::<Vec<_>>()
            .join(", ")
    );

    Ok(Dataset {
        name: metadata.name,
        graph,
        tasks,
    })
}

fn decode_example(b: [u8; TASK_RECORD_BYTES]) -> LinkExample {
    let [s0, s1, s2, s3, d0, d1, d2, d3, t0, t1, t2, t3, t4, t5, t6, t7] = b;
    LinkExample {
        src: u32::from_le_bytes([s0, s1, s2, s3]),
        dst: u32::from_le_bytes([d0, d1, d2, d3]),
        time: i64::from_le_bytes([t0, t1, t2, t3, t4, t5, t6, t7]),
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed metadata: {0}")]
    Json(#[from] serde_json::Error),

    #[error("malformed file {path}: {reason}")]
    Malformed { path: PathBuf, reason: String },

    #[error(transparent)]
    Graph(#[from] GraphError),

    #[error(transparent)]
    Task(#[from] TaskError),

    #[error("dataset '{dataset}' has no task '{task}'")]
    UnknownTask { dataset: String, task: String },
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::TIMELESS;
    use crate::graph::GraphBuilder;
    use crate::task::TaskType;

    fn dataset() -> Dataset {
        let mut b = GraphBuilder::new();
        let users = b.add_node_type("users", 2, vec![0.5; 6], None).unwrap();
        let items = b
            .add_node_type("items", 1, vec![1.0, 2.0], Some(vec![3, 4]))
            .unwrap();
        b.add_relation(users, "bought", items, &[(0, 1, 10), (2, 0, TIMELESS)])
            .unwrap();
        let meta = TaskMetadata {
            name: "user-item".into(),
            task_type: TaskType::LinkPrediction,
            src_entity: users,
            dst_entity: items,
            eval_k: 1,
            val_seed_time: 20,
            test_seed_time: 30,
        };
        Dataset {
            name: "tiny".into(),
            graph: Arc::new(b.build().unwrap()),
            tasks: vec![TaskTables {
                meta,
                train: vec![LinkExample { src: 0, dst: 1, time: 10 }],
                val: vec![LinkExample { src: 1, dst: 0, time: -5 }],
                test: vec![],
            }],
        }
    }

    #[test]
    fn test_write_then_load() {
        let tmp = tempfile::tempdir().unwrap();
        let original = dataset();
        write_dataset(tmp.path(), &original).unwrap();
        let loaded = load_dataset(tmp.path()).unwrap();

        assert_eq!(loaded.name, "tiny");
        assert_eq!(loaded.graph.schema(), original.graph.schema());
        assert_eq!(loaded.graph.node_store(NodeType(1)), original.graph.node_store(NodeType(1)));
        assert_eq!(loaded.tasks, original.tasks);

        let task = loaded.link_task("user-item").unwrap();
        assert_eq!(task.num_dst_nodes(), 2);
        assert!(matches!(
            loaded.link_task("missing"),
            Err(StoreError::UnknownTask { .. })
        ));
    }

    #[test]
    fn test_truncated_file_is_malformed() {
        let tmp = tempfile::tempdir().unwrap();
        write_dataset(tmp.path(), &dataset()).unwrap();
        fs::write(tmp.path().join("edges").join("0.bin"), [0u8; 3]).unwrap();
        assert!(matches!(
            load_dataset(tmp.path()),
            Err(StoreError::Malformed { .. })
        ));
    }

    #[test]
    fn test_missing_metadata_is_io_error() {
        let tmp = tempfile::tempdir().unwrap();
        assert!(matches!(load_dataset(tmp.path()), Err(StoreError::Io(_))));
    }
}
