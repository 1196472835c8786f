//! Opened HDF5 files: resolving paths, listing groups and opening datasets.

use super::btree::symbol_table_links;
use super::btree2::BTree2;
use super::data::{decode_elements, H5Dataset};
use super::datatype::Datatype;
use super::decoder::{malformed, Decoder};
use super::filters::FilterPipeline;
use super::fractal_heap::FractalHeap;
use super::global_heap::GlobalHeapReader;
use super::layout::Layout;
use super::messages::{
    decode_dense_storage, decode_fill_value, Dataspace, Link, LinkTarget, RawAttribute,
};
use super::object_header::{
    ObjectHeader, ATTRIBUTE, ATTRIBUTE_INFO, DATASPACE, DATATYPE, FILL_VALUE, FILL_VALUE_OLD,
    FILTER_PIPELINE, LAYOUT, LINK, LINK_INFO, SYMBOL_TABLE,
};
use super::raw::RawFile;
use crate::dataset::{
    base_name, normalize_path, AttributeInfo, Container, DatasetDetails, DatasetHandle,
    NodeMetadata,
};
use crate::error::H5LensError;
use crate::models::{Attribute, ChildInfo, NodeType};
use crate::range_reader::BlockReader;

use bytes::Bytes;
use std::sync::Arc;

/// Soft links followed while resolving one path.
const MAX_SOFT_LINKS: usize = 16;

/// Record type of version 2 B-trees indexing densely stored links by name.
const LINK_NAME_RECORDS: u8 = 5;
/// Record type of version 2 B-trees indexing densely stored attributes by name.
const ATTRIBUTE_NAME_RECORDS: u8 = 8;

fn join(parent: &str, name: &str) -> String {
    if parent == "/" {
        format!("/{name}")
    } else {
        format!("{parent}/{name}")
    }
}

/// What an object header describes.
enum Node {
    Group(ObjectHeader),
    Dataset(ObjectHeader),
    /// A committed datatype, which is neither listed nor readable
    Datatype,
}

impl Node {
    fn classify(header: ObjectHeader) -> Self {
        if header.has(LAYOUT) {
            Node::Dataset(header)
        } else if header.has(DATATYPE) {
            Node::Datatype
        } else {
            Node::Group(header)
        }
    }
}

/// An HDF5 file read through ranged requests.
///
/// Clones share the underlying reader and its block cache.
#[derive(Clone)]
pub struct H5File {
    raw: Arc<RawFile>,
}

impl H5File {
    pub fn open(reader: BlockReader) -> Result<Self, H5LensError> {
        Ok(H5File {
            raw: Arc::new(RawFile::open(reader)?),
        })
    }

    /// Total bytes fetched from storage so far.
    pub fn fetched(&self) -> u64 {
        self.raw.fetched()
    }

    /// Object header address of a path.
    fn locate(&self, path: &str, depth: usize) -> Result<u64, H5LensError> {
        if depth > MAX_SOFT_LINKS {
            return Err(H5LensError::invalid(
                "path",
                format!("too many soft links resolving {path}"),
            ));
        }
        let mut address = self.raw.root;
        let mut group = "/".to_string();
        for segment in path.split('/').filter(|segment| !segment.is_empty()) {
            let header = ObjectHeader::read(&self.raw, address)?;
            let link = self
                .links(&header)?
                .into_iter()
                .find(|link| link.name == segment)
                .ok_or_else(|| H5LensError::not_found(path))?;
            address = self
                .follow(&group, &link, depth)?
                .ok_or_else(|| H5LensError::not_found(path))?;
            group = join(&group, segment);
        }
        Ok(address)
    }

    /// Object header address a link points at, `None` for links into other files.
    fn follow(&self, group: &str, link: &Link, depth: usize) -> Result<Option<u64>, H5LensError> {
        match &link.target {
            LinkTarget::Hard(address) => Ok(Some(*address)),
            LinkTarget::Soft(target) => {
                let target = if target.starts_with('/') {
                    normalize_path(target)
                } else {
                    normalize_path(&join(group, target))
                };
                self.locate(&target, depth + 1).map(Some)
            }
            LinkTarget::External => {
                tracing::debug!("Skipping external link {}", link.name);
                Ok(None)
            }
        }
    }

    fn node(&self, path: &str) -> Result<(String, Node), H5LensError> {
        let path = normalize_path(path);
        let address = self.locate(&path, 0)?;
        let header = ObjectHeader::read(&self.raw, address)?;
        Ok((path, Node::classify(header)))
    }

    /// Links of a group, sorted by name.
    fn links(&self, header: &ObjectHeader) -> Result<Vec<Link>, H5LensError> {
        let file = &self.raw;
        let sizes = file.sizes;
        let mut links = vec![];
        if let Some(data) = header.message(SYMBOL_TABLE) {
            let mut d = Decoder::new(data.clone());
            let btree = d.address(sizes)?;
            let heap = d.address(sizes)?;
            if let (Some(btree), Some(heap)) = (btree, heap) {
                links.extend(symbol_table_links(file, btree, heap)?);
            }
        }
        for data in header.messages(LINK) {
            links.push(Link::decode(data.clone(), sizes)?);
        }
        if let Some(data) = header.message(LINK_INFO) {
            if let Some(dense) = decode_dense_storage(data, sizes, false)? {
                for raw in self.dense_messages(dense.heap, dense.name_index, LINK_NAME_RECORDS)? {
                    links.push(Link::decode(raw, sizes)?);
                }
            }
        }
        links.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(links)
    }

    /// Messages held in a fractal heap and indexed by a name B-tree.
    fn dense_messages(
        &self,
        heap: u64,
        name_index: u64,
        record_type: u8,
    ) -> Result<Vec<Bytes>, H5LensError> {
        let file = &self.raw;
        let heap = FractalHeap::open(file, heap)?;
        let tree = BTree2::open(file, name_index)?;
        if tree.record_type != record_type {
            return Err(malformed(format!(
                "name index record type {}, expected {record_type}",
                tree.record_type
            )));
        }
        let mut messages = vec![];
        for record in tree.records(file, |_, _| true)? {
            let id = match record_type {
                // Name hash, then the heap id.
                LINK_NAME_RECORDS => record.slice(4.min(record.len())..),
                // Heap id, then flags, creation order and name hash.
                _ => {
                    if record.len() < 8 {
                        return Err(malformed("attribute name record is too short"));
                    }
                    if record[8..].first().is_some_and(|flags| flags & 0x01 != 0) {
                        tracing::debug!("Skipping attribute held in the shared message heap");
                        continue;
                    }
                    record.slice(..8)
                }
            };
            messages.push(heap.object(file, &id)?);
        }
        Ok(messages)
    }

    fn raw_attributes(&self, header: &ObjectHeader) -> Result<Vec<Bytes>, H5LensError> {
        let mut messages: Vec<Bytes> = header.messages(ATTRIBUTE).cloned().collect();
        if let Some(data) = header.message(ATTRIBUTE_INFO) {
            if let Some(dense) = decode_dense_storage(data, self.raw.sizes, true)? {
                messages.extend(self.dense_messages(
                    dense.heap,
                    dense.name_index,
                    ATTRIBUTE_NAME_RECORDS,
                )?);
            }
        }
        Ok(messages)
    }

    /// Decode the attributes of an object, sorted by name. Attributes which cannot be decoded
    /// are skipped.
    fn attributes(&self, header: &ObjectHeader) -> Result<Vec<AttributeInfo>, H5LensError> {
        let file = &self.raw;
        let mut heap = GlobalHeapReader::new(file);
        let mut attributes = vec![];
        for data in self.raw_attributes(header)? {
            let raw = match RawAttribute::decode(file, data) {
                Ok(raw) => raw,
                Err(err) => {
                    tracing::debug!("Skipping attribute: {}", err);
                    continue;
                }
            };
            let value = raw.dataspace.shape().and_then(|shape| {
                decode_elements(
                    &raw.datatype,
                    &raw.data,
                    &shape,
                    raw.datatype.stored_size(file.sizes.offset),
                    &mut heap,
                )
            });
            match value {
                Ok(value) => attributes.push(AttributeInfo::from(&Attribute {
                    dtype: raw.datatype.to_dtype(),
                    name: raw.name,
                    value,
                })),
                Err(err) => tracing::debug!("Skipping attribute {}: {}", raw.name, err),
            }
        }
        attributes.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(attributes)
    }

    fn open_dataset(&self, path: String, header: &ObjectHeader) -> Result<H5Dataset, H5LensError> {
        let sizes = self.raw.sizes;
        let required = |kind: u16, what: &str| {
            header
                .message(kind)
                .cloned()
                .ok_or_else(|| malformed(format!("{path} has no {what} message")))
        };
        let dataspace = Dataspace::decode(&mut Decoder::new(required(DATASPACE, "dataspace")?), sizes)?;
        let datatype = Datatype::decode(
            &mut Decoder::new(required(DATATYPE, "datatype")?),
            sizes.offset,
        )?;
        let layout = Layout::decode(&required(LAYOUT, "layout")?, sizes)?;
        let filters = match header.message(FILTER_PIPELINE) {
            Some(data) => FilterPipeline::decode(data)?,
            None => FilterPipeline::default(),
        };
        let fill = match (header.message(FILL_VALUE), header.message(FILL_VALUE_OLD)) {
            (Some(data), _) => decode_fill_value(FILL_VALUE, data)?,
            (None, Some(data)) => decode_fill_value(FILL_VALUE_OLD, data)?,
            (None, None) => None,
        };
        H5Dataset::new(
            self.raw.clone(),
            path,
            dataspace,
            datatype,
            layout,
            filters,
            fill,
        )
    }
}

impl Container for H5File {
    fn children(&self, path: &str) -> Result<Vec<ChildInfo>, H5LensError> {
        let (path, node) = self.node(path)?;
        let header = match node {
            Node::Group(header) => header,
            Node::Dataset(_) | Node::Datatype => {
                return Err(H5LensError::invalid(
                    "path",
                    format!("{} is a dataset, not a group", path),
                ))
            }
        };
        let mut children = vec![];
        for link in self.links(&header)? {
            let address = match self.follow(&path, &link, 0) {
                Ok(Some(address)) => address,
                Ok(None) => continue,
                Err(err) => {
                    tracing::debug!("Skipping link {}: {}", link.name, err);
                    continue;
                }
            };
            let child = join(&path, &link.name);
            let mut info = ChildInfo {
                name: link.name,
                path: child.clone(),
                node_type: NodeType::Group,
                num_children: None,
                shape: None,
                dtype: None,
                chunks: None,
                compression: None,
            };
            match Node::classify(ObjectHeader::read(&self.raw, address)?) {
                Node::Group(header) => info.num_children = Some(self.links(&header)?.len()),
                Node::Dataset(header) => {
                    let dataset = self.open_dataset(child, &header)?;
                    let layout = dataset.storage();
                    info.node_type = NodeType::Dataset;
                    info.shape = Some(dataset.shape().to_vec());
                    info.dtype = Some(dataset.dtype().to_string());
                    info.compression = layout.compression();
                    info.chunks = layout.chunks;
                }
                Node::Datatype => continue,
            }
            children.push(info);
        }
        Ok(children)
    }

    fn metadata(&self, path: &str) -> Result<NodeMetadata, H5LensError> {
        let (path, node) = self.node(path)?;
        let (node_type, attributes, num_children, dataset) = match node {
            Node::Group(header) => (
                NodeType::Group,
                self.attributes(&header)?,
                Some(self.links(&header)?.len()),
                None,
            ),
            Node::Dataset(header) => {
                let dataset = self.open_dataset(path.clone(), &header)?;
                let details =
                    DatasetDetails::new(dataset.shape(), dataset.dtype(), &dataset.storage());
                (NodeType::Dataset, self.attributes(&header)?, None, Some(details))
            }
            Node::Datatype => {
                return Err(H5LensError::invalid(
                    "path",
                    format!("{} is a committed datatype", path),
                ))
            }
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
        match self.node(path)? {
            (path, Node::Dataset(header)) => Ok(Box::new(self.open_dataset(path, &header)?)),
            (path, Node::Group(_)) => Err(H5LensError::invalid(
                "path",
                format!("{} is a group, not a dataset", path),
            )),
            (path, Node::Datatype) => Err(H5LensError::invalid(
                "path",
                format!("{} is a committed datatype", path),
            )),
        }
    }
}
