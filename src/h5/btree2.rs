//! Version 2 B-trees.
//!
//! Used to index densely stored links and attributes by name hash, and the chunks of datasets
//! with more than one unlimited axis.

use super::decoder::{encoded_width, malformed, Decoder};
use super::raw::RawFile;
use crate::error::H5LensError;

use bytes::Bytes;

/// Size of the signature, version, type and checksum of a node.
const NODE_OVERHEAD: usize = 10;

/// Record layout of the nodes at one depth.
#[derive(Clone, Copy, Debug)]
struct NodeInfo {
    max_records: usize,
    /// Width of the total record count stored with pointers to nodes of this depth
    cumulative_width: usize,
}

/// An opened version 2 B-tree.
#[derive(Debug)]
pub struct BTree2 {
    pub record_type: u8,
    pub record_size: usize,
    node_size: u64,
    depth: u16,
    root: Option<u64>,
    root_records: usize,
    count_width: usize,
    nodes: Vec<NodeInfo>,
}

impl BTree2 {
    pub fn open(file: &RawFile, address: u64) -> Result<Self, H5LensError> {
        let sizes = file.sizes;
        let mut d = file.decoder(address, 22 + 2 * u64::from(sizes.length))?;
        d.signature(b"BTHD")?;
        let version = d.u8()?;
        if version != 0 {
            return Err(malformed(format!("B-tree version {version}")));
        }
        let record_type = d.u8()?;
        let node_size = d.u32()?;
        let record_size = usize::from(d.u16()?);
        let depth = d.u16()?;
        // Split and merge percentages
        d.skip(2)?;
        let root = d.address(sizes)?;
        let root_records = usize::from(d.u16()?);
        if record_size == 0 || (node_size as usize) <= NODE_OVERHEAD + record_size {
            return Err(malformed(format!(
                "B-tree with {node_size} byte nodes and {record_size} byte records"
            )));
        }

        let leaf_records = (node_size as usize - NODE_OVERHEAD) / record_size;
        let count_width = encoded_width(leaf_records as u64);
        let mut nodes = vec![NodeInfo {
            max_records: leaf_records,
            cumulative_width: 0,
        }];
        let mut cumulative = leaf_records as u64;
        for level in 1..=usize::from(depth) {
            let pointer = usize::from(sizes.offset)
                + count_width
                + if level > 1 {
                    nodes[level - 1].cumulative_width
                } else {
                    0
                };
            let space = (node_size as usize).saturating_sub(NODE_OVERHEAD + pointer);
            let max_records = space / (record_size + pointer);
            cumulative = (max_records as u64 + 1)
                .saturating_mul(cumulative)
                .saturating_add(max_records as u64);
            nodes.push(NodeInfo {
                max_records,
                cumulative_width: encoded_width(cumulative),
            });
        }
        Ok(BTree2 {
            record_type,
            record_size,
            node_size: u64::from(node_size),
            depth,
            root,
            root_records,
            count_width,
            nodes,
        })
    }

    /// Collect records in key order.
    ///
    /// `keep(low, high)` decides whether to descend into a subtree whose records lie strictly
    /// between the records `low` and `high`; `None` means unbounded. Every record of a visited
    /// node is returned.
    pub fn records<F>(&self, file: &RawFile, keep: F) -> Result<Vec<Bytes>, H5LensError>
    where
        F: Fn(Option<&Bytes>, Option<&Bytes>) -> bool,
    {
        let mut records = vec![];
        if let Some(root) = self.root {
            self.visit(file, root, self.root_records, self.depth, &keep, &mut records)?;
        }
        Ok(records)
    }

    fn visit<F>(
        &self,
        file: &RawFile,
        address: u64,
        count: usize,
        depth: u16,
        keep: &F,
        records: &mut Vec<Bytes>,
    ) -> Result<(), H5LensError>
    where
        F: Fn(Option<&Bytes>, Option<&Bytes>) -> bool,
    {
        let info = self.nodes[usize::from(depth)];
        if count > info.max_records {
            return Err(malformed(format!(
                "B-tree node at {address} holds {count} records"
            )));
        }
        let mut d = file.decoder(address, self.node_size)?;
        if depth == 0 {
            d.signature(b"BTLF")?;
            d.skip(2)?;
            for _ in 0..count {
                records.push(d.take(self.record_size)?);
            }
            return Ok(());
        }
        d.signature(b"BTIN")?;
        d.skip(2)?;
        let mut own = Vec::with_capacity(count);
        for _ in 0..count {
            own.push(d.take(self.record_size)?);
        }
        let mut children = Vec::with_capacity(count + 1);
        for _ in 0..=count {
            let child = d
                .address(file.sizes)?
                .ok_or_else(|| malformed("B-tree child without an address"))?;
            let child_count = usize::try_from(d.uint(self.count_width)?)?;
            if depth > 1 {
                d.skip(self.nodes[usize::from(depth) - 1].cumulative_width)?;
            }
            children.push((child, child_count));
        }
        for (n, (child, child_count)) in children.into_iter().enumerate() {
            let low = n.checked_sub(1).map(|i| &own[i]);
            let high = own.get(n);
            if keep(low, high) {
                self.visit(file, child, child_count, depth - 1, keep, records)?;
            }
            if let Some(record) = high {
                records.push(record.clone());
            }
        }
        Ok(())
    }
}
