//! Link-prediction task tables and their scoring.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::common::{NodeType, Split, Timestamp};
use crate::graph::HeteroGraph;

pub const LINK_PREDICTION_PRECISION: &str = "link_prediction_precision";
pub const LINK_PREDICTION_RECALL: &str = "link_prediction_recall";
pub const LINK_PREDICTION_MAP: &str = "link_prediction_map";

/// Metric name → value, ordered by name so printed reports are stable.
pub type Metrics = BTreeMap<String, f64>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    LinkPrediction,
    BinaryClassification,
    MulticlassClassification,
    Regression,
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskType::LinkPrediction => "link_prediction",
            TaskType::BinaryClassification => "binary_classification",
            TaskType::MulticlassClassification => "multiclass_classification",
            TaskType::Regression => "regression",
        };
        f.write_str(s)
    }
}

/// Metadata for a single prediction task.
///
/// A link task asks, for a source entity at a point in time, which
/// destination entities it will link to next. Validation and test are
/// evaluated at one fixed seed time each.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskMetadata {
    /// Human-readable task name (e.g. "user-attendance").
    pub name: String,
    pub task_type: TaskType,
    pub src_entity: NodeType,
    pub dst_entity: NodeType,
    /// Number of destinations retrieved per source at evaluation.
    pub eval_k: usize,
    pub val_seed_time: Timestamp,
    pub test_seed_time: Timestamp,
}

/// One labeled `(source, destination, time)` example.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LinkExample {
    pub src: u32,
    pub dst: u32,
    pub time: Timestamp,
}

/// Ground truth of an evaluation split: the distinct sources in ascending id
/// order, each with its set of true destinations.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EvalTable {
    pub src: Vec<u32>,
    pub dst: Vec<Vec<u32>>,
}

impl EvalTable {
    pub fn from_examples(examples: &[LinkExample]) -> Self {
        let mut grouped: BTreeMap<u32, BTreeSet<u32>> = BTreeMap::new();
        for ex in examples {
            grouped.entry(ex.src).or_default().insert(ex.dst);
        }
        let (src, dst) = grouped
            .into_iter()
            .map(|(s, d)| (s, d.into_iter().collect()))
            .unzip();
        Self { src, dst }
    }

    pub fn len(&self) -> usize {
        self.src.len()
    }

    pub fn is_empty(&self) -> bool {
        self.src.is_empty()
    }
}

#[derive(Debug)]
pub struct LinkTask {
    meta: TaskMetadata,
    num_dst_nodes: usize,
    train: Vec<LinkExample>,
    val: Vec<LinkExample>,
    test: Vec<LinkExample>,
    val_table: EvalTable,
    test_table: EvalTable,
}

impl LinkTask {
    /// Bind task tables to a graph. Fails for any task type other than link
    /// prediction, or if an example references a node outside the graph.
    pub fn new(
        meta: TaskMetadata,
        train: Vec<LinkExample>,
        val: Vec<LinkExample>,
        test: Vec<LinkExample>,
        graph: &HeteroGraph,
    ) -> Result<Self, TaskError> {
        if meta.task_type != TaskType::LinkPrediction {
            return Err(TaskError::Unsupported(meta.task_type));
        }
        let num_types = graph.schema().num_node_types();
        for t in [meta.src_entity, meta.dst_entity] {
            if t.index() >= num_types {
                return Err(TaskError::Invalid(format!("unknown node type index {}", t.0)));
            }
        }
        if meta.eval_k == 0 {
            return Err(TaskError::Invalid("eval_k must be positive".into()));
        }
        let num_src_nodes = graph.num_nodes(meta.src_entity);
        let num_dst_nodes = graph.num_nodes(meta.dst_entity);
        for (split, examples) in [(Split::Train, &train), (Split::Val, &val), (Split::Test, &test)] {
            if let Some(ex) = examples
                .iter()
                .find(|ex| ex.src as usize >= num_src_nodes || ex.dst as usize >= num_dst_nodes)
            {
                return Err(TaskError::Invalid(format!(
                    "{split} example ({}, {}) out of range for {num_src_nodes} sources / {num_dst_nodes} destinations",
                    ex.src, ex.dst
                )));
            }
        }

        let val_table = EvalTable::from_examples(&val);
        let test_table = EvalTable::from_examples(&test);
        Ok(Self {
            meta,
            num_dst_nodes,
            train,
            val,
            test,
            val_table,
            test_table,
        })
    }

    pub fn meta(&self) -> &TaskMetadata {
        &self.meta
    }

    pub fn name(&self) -> &str {
        &self.meta.name
    }

    pub fn src_entity(&self) -> NodeType {
        self.meta.src_entity
    }

    pub fn dst_entity(&self) -> NodeType {
        self.meta.dst_entity
    }

    pub fn num_dst_nodes(&self) -> usize {
        self.num_dst_nodes
    }

    pub fn eval_k(&self) -> usize {
        self.meta.eval_k
    }

    pub fn examples(&self, split: Split) -> &[LinkExample] {
        match split {
            Split::Train => &self.train,
            Split::Val => &self.val,
            Split::Test => &self.test,
        }
    }

    /// Fixed seed time of an evaluation split. Training has none.
    pub fn seed_time(&self, split: Split) -> Option<Timestamp> {
        match split {
            Split::Train => None,
            Split::Val => Some(self.meta.val_seed_time),
            Split::Test => Some(self.meta.test_seed_time),
        }
    }

    /// Ground truth of an evaluation split (empty for train).
    pub fn eval_table(&self, split: Split) -> &EvalTable {
        static EMPTY: EvalTable = EvalTable {
            src: Vec::new(),
            dst: Vec::new(),
        };
        match split {
            Split::Train => &EMPTY,
            Split::Val => &self.val_table,
            Split::Test => &self.test_table,
        }
    }

    /// Score a row-major `[num_sources, k]` matrix of predicted destination
    /// indices against the split's ground truth. Rows must follow
    /// [`EvalTable::src`] order.
    pub fn evaluate(&self, predictions: &[u32], k: usize, split: Split) -> Result<Metrics, TaskError> {
        let table = self.eval_table(split);
        if k == 0 || predictions.len() != table.len() * k {
            return Err(TaskError::Invalid(format!(
                "prediction matrix of {} entries does not fit {} rows x {k}",
                predictions.len(),
                table.len()
            )));
        }
        if let Some(&bad) = predictions.iter().find(|&&p| p as usize >= self.num_dst_nodes) {
            return Err(TaskError::Invalid(format!(
                "predicted destination {bad} out of range for {} destinations",
                self.num_dst_nodes
            )));
        }
        Ok(link_prediction_metrics(predictions, k, &table.dst))
    }
}

/// Precision@k, recall@k and MAP@k averaged over rows.
pub fn link_prediction_metrics(predictions: &[u32], k: usize, truth: &[Vec<u32>]) -> Metrics {
    let mut precision = 0.0;
    let mut recall = 0.0;
    let mut map = 0.0;
    for (row, true_dst) in predictions.chunks_exact(k).zip(truth) {
        let mut hits = 0usize;
        let mut ap = 0.0;
        for (i, p) in row.iter().enumerate() {
            if true_dst.binary_search(p).is_ok() {
                hits += 1;
                ap += hits as f64 / (i + 1) as f64;
            }
        }
        precision += hits as f64 / k as f64;
        recall += hits as f64 / true_dst.len().max(1) as f64;
        map += ap / true_dst.len().clamp(1, k) as f64;
    }
    let n = truth.len().max(1) as f64;
    Metrics::from([
        (LINK_PREDICTION_PRECISION.to_string(), precision / n),
        (LINK_PREDICTION_RECALL.to_string(), recall / n),
        (LINK_PREDICTION_MAP.to_string(), map / n),
    ])
}

#[derive(Debug, thiserror::Error)]
pub enum TaskError {
    #[error("task type {0} is not supported, expected link_prediction")]
    Unsupported(TaskType),

    #[error("invalid task: {0}")]
    Invalid(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::GraphBuilder;

    fn ex(src: u32, dst: u32, time: Timestamp) -> LinkExample {
        LinkExample { src, dst, time }
    }

    fn meta(task_type: TaskType) -> TaskMetadata {
        TaskMetadata {
            name: "user-item".into(),
            task_type,
            src_entity: NodeType(0),
            dst_entity: NodeType(1),
            eval_k: 2,
            val_seed_time: 100,
            test_seed_time: 200,
        }
    }

    fn graph() -> HeteroGraph {
        let mut b = GraphBuilder::new();
        b.add_node_type("users", 1, vec![0.0; 3], None).unwrap();
        b.add_node_type("items", 1, vec![0.0; 4], None).unwrap();
        b.build().unwrap()
    }

    #[test]
    fn test_eval_table_groups_by_source() {
        let table = EvalTable::from_examples(&[ex(2, 1, 0), ex(0, 3, 0), ex(2, 0, 0), ex(2, 1, 5)]);
        assert_eq!(table.src, vec![0, 2]);
        assert_eq!(table.dst, vec![vec![3], vec![0, 1]]);
    }

    #[test]
    fn test_rejects_non_link_task() {
        let err = LinkTask::new(meta(TaskType::Regression), vec![], vec![], vec![], &graph()).unwrap_err();
        assert!(matches!(err, TaskError::Unsupported(TaskType::Regression)));
    }

    #[test]
    fn test_rejects_out_of_range_examples() {
        let err = LinkTask::new(meta(TaskType::LinkPrediction), vec![ex(0, 4, 0)], vec![], vec![], &graph())
            .unwrap_err();
        assert!(matches!(err, TaskError::Invalid(_)));
    }

    #[test]
    fn test_metrics_by_hand() {
        // Row 0: truth {1}, predicted [1, 2] -> P=1/2, R=1, AP=1.
        // Row 1: truth {0, 3}, predicted [2, 3] -> P=1/2, R=1/2, AP=(1/2)/2=1/4.
        let metrics = link_prediction_metrics(&[1, 2, 2, 3], 2, &[vec![1], vec![0, 3]]);
        assert!((metrics[LINK_PREDICTION_PRECISION] - 0.5).abs() < 1e-12);
        assert!((metrics[LINK_PREDICTION_RECALL] - 0.75).abs() < 1e-12);
        assert!((metrics[LINK_PREDICTION_MAP] - 0.625).abs() < 1e-12);
    }

    #[test]
    fn test_evaluate_checks_shape_and_range() {
        let task = LinkTask::new(
            meta(TaskType::LinkPrediction),
            vec![ex(0, 0, 1)],
            vec![ex(0, 1, 50), ex(1, 2, 60)],
            vec![],
            &graph(),
        )
        .unwrap();
        assert_eq!(task.seed_time(Split::Val), Some(100));
        assert_eq!(task.seed_time(Split::Train), None);
        assert!(task.evaluate(&[1, 0], 2, Split::Val).is_err());
        assert!(task.evaluate(&[1, 0, 2, 9], 2, Split::Val).is_err());
        let metrics = task.evaluate(&[1, 0, 2, 3], 2, Split::Val).unwrap();
        assert!((metrics[LINK_PREDICTION_RECALL] - 1.0).abs() < 1e-12);
    }
}
