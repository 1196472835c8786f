//! Containers and dataset handles.
//!
//! A [Container] is an opened HDF5 file. Datasets are read through a [DatasetHandle], an owned
//! trait object opened per request and dropped at the end of it. Handles are never cached.

use crate::array::{Block, Selection};
use crate::error::H5LensError;
use crate::models::{
    Attribute, ChildInfo, DType, DataKind, DatasetInfo, DatasetLayout, FilterInfo, NodeType,
    RawTypeInfo,
};
use crate::sanitize::Sanitize;

use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// An opened dataset.
pub trait DatasetHandle: Send {
    /// Normalized path of the dataset
    fn path(&self) -> &str;

    /// Extent of each axis
    fn shape(&self) -> &[usize];

    /// Element type
    fn dtype(&self) -> &DType;

    /// Read the elements covered by `selection`.
    ///
    /// Pinned axes are removed from the returned block.
    fn read(&self, selection: &Selection) -> Result<Block, H5LensError>;

    fn ndim(&self) -> usize {
        self.shape().len()
    }

    fn kind(&self) -> DataKind {
        self.dtype().kind()
    }

    fn info(&self) -> DatasetInfo {
        DatasetInfo::new(self.path(), self.shape(), self.dtype())
    }
}

/// An opened container of groups and datasets.
pub trait Container: Send {
    /// List the direct children of a group.
    fn children(&self, path: &str) -> Result<Vec<ChildInfo>, H5LensError>;

    /// Describe a group or dataset.
    fn metadata(&self, path: &str) -> Result<NodeMetadata, H5LensError>;

    /// Open a dataset for reading.
    fn dataset(&self, path: &str) -> Result<Box<dyn DatasetHandle>, H5LensError>;
}

/// A JSON-safe attribute.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct AttributeInfo {
    pub name: String,
    pub dtype: String,
    pub value: serde_json::Value,
}

impl From<&Attribute> for AttributeInfo {
    fn from(attribute: &Attribute) -> Self {
        AttributeInfo {
            name: attribute.name.clone(),
            dtype: attribute.dtype.to_string(),
            value: attribute.value.sanitize(),
        }
    }
}

/// Dataset specific metadata.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct DatasetDetails {
    pub shape: Vec<usize>,
    pub ndim: usize,
    /// Number of elements
    pub size: u64,
    pub dtype: String,
    pub type_info: DType,
    pub raw_type_info: RawTypeInfo,
    pub chunks: Option<Vec<usize>>,
    pub compression: Option<String>,
    pub filters: Vec<FilterInfo>,
}

impl DatasetDetails {
    pub fn new(shape: &[usize], dtype: &DType, layout: &DatasetLayout) -> Self {
        DatasetDetails {
            shape: shape.to_vec(),
            ndim: shape.len(),
            size: crate::limits::product(shape),
            dtype: dtype.to_string(),
            type_info: dtype.clone(),
            raw_type_info: RawTypeInfo::from(dtype),
            chunks: layout.chunks.clone(),
            compression: layout.compression(),
            filters: layout.filters.clone(),
        }
    }
}

/// Metadata of a group or dataset.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct NodeMetadata {
    pub name: String,
    pub path: String,
    #[serde(rename = "type")]
    pub node_type: NodeType,
    pub attributes: Vec<AttributeInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub num_children: Option<usize>,
    #[serde(flatten)]
    pub dataset: Option<DatasetDetails>,
}

/// Normalize an internal path: a single leading slash, no empty segments and no trailing slash.
pub fn normalize_path(path: &str) -> String {
    let segments: Vec<&str> = path
        .split('/')
        .map(str::trim)
        .filter(|segment| !segment.is_empty() && *segment != ".")
        .collect();
    format!("/{}", segments.join("/"))
}

/// Parent of a normalized path. The root is its own parent.
pub fn parent_path(path: &str) -> &str {
    match path.rfind('/') {
        Some(0) | None => "/",
        Some(index) => &path[..index],
    }
}

/// Last segment of a normalized path.
pub fn base_name(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

/// A dataset held in memory.
#[derive(Clone, Debug)]
struct MemoryDataset {
    dtype: DType,
    data: Arc<Block>,
    layout: DatasetLayout,
}

#[derive(Clone, Debug)]
enum MemoryNodeKind {
    Group,
    Dataset(MemoryDataset),
}

#[derive(Clone, Debug)]
struct MemoryNode {
    kind: MemoryNodeKind,
    attributes: Vec<Attribute>,
}

/// A [Container] held in memory, used for tests and benchmarks.
#[derive(Clone, Debug)]
pub struct MemoryContainer {
    nodes: BTreeMap<String, MemoryNode>,
    elements_read: Arc<AtomicU64>,
}

impl Default for MemoryContainer {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryContainer {
    /// Create a container with an empty root group.
    pub fn new() -> Self {
        let mut nodes = BTreeMap::new();
        nodes.insert(
            "/".to_string(),
            MemoryNode {
                kind: MemoryNodeKind::Group,
                attributes: vec![],
            },
        );
        MemoryContainer {
            nodes,
            elements_read: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Add a group and any missing ancestors.
    pub fn with_group(mut self, path: &str) -> Self {
        self.insert_groups(&normalize_path(path));
        self
    }

    /// Add a contiguous dataset, creating any missing parent groups.
    pub fn with_dataset(self, path: &str, dtype: DType, data: Block) -> Self {
        self.with_layout(path, dtype, data, DatasetLayout::default())
    }

    /// Add a dataset with the given storage layout.
    pub fn with_layout(mut self, path: &str, dtype: DType, data: Block, layout: DatasetLayout) -> Self {
        let path = normalize_path(path);
        self.insert_groups(parent_path(&path));
        self.nodes.insert(
            path,
            MemoryNode {
                kind: MemoryNodeKind::Dataset(MemoryDataset {
                    dtype,
                    data: Arc::new(data),
                    layout,
                }),
                attributes: vec![],
            },
        );
        self
    }

    /// Attach an attribute to an existing node. Unknown paths are ignored.
    pub fn with_attribute(mut self, path: &str, attribute: Attribute) -> Self {
        if let Some(node) = self.nodes.get_mut(&normalize_path(path)) {
            node.attributes.push(attribute);
        }
        self
    }

    /// Total number of elements returned by dataset reads so far.
    pub fn elements_read(&self) -> u64 {
        self.elements_read.load(Ordering::Relaxed)
    }

    fn insert_groups(&mut self, path: &str) {
        let mut current = String::new();
        for segment in path.split('/').filter(|segment| !segment.is_empty()) {
            current.push('/');
            current.push_str(segment);
            self.nodes.entry(current.clone()).or_insert(MemoryNode {
                kind: MemoryNodeKind::Group,
                attributes: vec![],
            });
        }
    }

    fn node(&self, path: &str) -> Result<(String, &MemoryNode), H5LensError> {
        let path = normalize_path(path);
        match self.nodes.get(&path) {
            Some(node) => Ok((path, node)),
            None => Err(H5LensError::not_found(path)),
        }
    }

    fn child_paths<'a>(&'a self, path: &'a str) -> impl Iterator<Item = &'a String> + 'a {
        self.nodes
            .keys()
            .filter(move |child| child.as_str() != "/" && parent_path(child) == path)
    }
}

impl Container for MemoryContainer {
    fn children(&self, path: &str) -> Result<Vec<ChildInfo>, H5LensError> {
        let (path, node) = self.node(path)?;
        if !matches!(node.kind, MemoryNodeKind::Group) {
            return Err(H5LensError::invalid(
                "path",
                format!("{} is a dataset, not a group", path),
            ));
        }
        let children = self
            .child_paths(&path)
            .map(|child| {
                let node = &self.nodes[child];
                let mut info = ChildInfo {
                    name: base_name(child).to_string(),
                    path: child.clone(),
                    node_type: NodeType::Group,
                    num_children: None,
                    shape: None,
                    dtype: None,
                    chunks: None,
                    compression: None,
                };
                match &node.kind {
                    MemoryNodeKind::Group => {
                        info.num_children = Some(self.child_paths(child).count());
                    }
                    MemoryNodeKind::Dataset(dataset) => {
                        info.node_type = NodeType::Dataset;
                        info.shape = Some(dataset.data.shape().to_vec());
                        info.dtype = Some(dataset.dtype.to_string());
                        info.chunks = dataset.layout.chunks.clone();
                        info.compression = dataset.layout.compression();
                    }
                }
                info
            })
            .collect();
        Ok(children)
    }

    fn metadata(&self, path: &str) -> Result<NodeMetadata, H5LensError> {
        let (path, node) = self.node(path)?;
        let attributes = node.attributes.iter().map(AttributeInfo::from).collect();
        let (node_type, num_children, dataset) = match &node.kind {
            MemoryNodeKind::Group => (NodeType::Group, Some(self.child_paths(&path).count()), None),
            MemoryNodeKind::Dataset(dataset) => (
                NodeType::Dataset,
                None,
                Some(DatasetDetails::new(
                    dataset.data.shape(),
                    &dataset.dtype,
                    &dataset.layout,
                )),
            ),
        };
        Ok(NodeMetadata {
            name: base_name(&path).to_string(),
            path,
            node_type,
            attributes,
            num_children,
            dataset,
        })
    }

    fn dataset(&self, path: &str) -> Result<Box<dyn DatasetHandle>, H5LensError> {
        let (path, node) = self.node(path)?;
        match &node.kind {
            MemoryNodeKind::Dataset(dataset) => Ok(Box::new(MemoryDatasetHandle {
                path,
                dtype: dataset.dtype.clone(),
                data: dataset.data.clone(),
                elements_read: self.elements_read.clone(),
            })),
            MemoryNodeKind::Group => Err(H5LensError::invalid(
                "path",
                format!("{} is a group, not a dataset", path),
            )),
        }
    }
}

/// Handle onto a [MemoryContainer] dataset.
struct MemoryDatasetHandle {
    path: String,
    dtype: DType,
    data: Arc<Block>,
    elements_read: Arc<AtomicU64>,
}

impl DatasetHandle for MemoryDatasetHandle {
    fn path(&self) -> &str {
        &self.path
    }

    fn shape(&self) -> &[usize] {
        self.data.shape()
    }

    fn dtype(&self) -> &DType {
        &self.dtype
    }

    fn read(&self, selection: &Selection) -> Result<Block, H5LensError> {
        let block = self.data.select(selection)?;
        self.elements_read
            .fetch_add(block.len() as u64, Ordering::Relaxed);
        Ok(block)
    }
}
