//! R-tree node representation and split helpers.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

use crate::geometry::Box3D;
use crate::sort_tile::centroid_cmp_from;
use crate::values::SpatialValue;

/// Maximum children of an internal node / values of a leaf.
pub(crate) const MAX_FANOUT: usize = 16;

/// A node of the tree: either a leaf holding values or an internal node
/// holding child references. The MBR of a node lives in its parent's
/// [`ChildNode`], so it is available without descending.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) enum Node<V> {
    Leaf { values: Vec<V> },
    Internal { children: Vec<ChildNode<V>> },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct ChildNode<V> {
    pub mbr: Box3D,
    pub node: Box<Node<V>>,
}

pub(crate) fn mbr_of_values<V: SpatialValue>(values: &[V]) -> Box3D {
    let mut mbr = Box3D::empty();
    for v in values {
        mbr.expand(&v.bounding_box());
    }
    mbr
}

pub(crate) fn mbr_of_children<V>(children: &[ChildNode<V>]) -> Box3D {
    let mut mbr = Box3D::empty();
    for c in children {
        mbr.expand(&c.mbr);
    }
    mbr
}

/// Index of the child whose MBR needs the least enlargement to cover
/// `bbox`; ties go to the smaller volume.
pub(crate) fn choose_subtree<V>(children: &[ChildNode<V>], bbox: &Box3D) -> usize {
    let mut best = 0;
    let mut best_enlargement = children[0].mbr.enlargement(bbox);
    let mut best_volume = children[0].mbr.volume();
    for (i, child) in children.iter().enumerate().skip(1) {
        let enlargement = child.mbr.enlargement(bbox);
        let volume = child.mbr.volume();
        if enlargement < best_enlargement
            || (enlargement == best_enlargement && volume < best_volume)
        {
            best = i;
            best_enlargement = enlargement;
            best_volume = volume;
        }
    }
    best
}

/// The axis with the largest extent, used to pick the split dimension.
pub(crate) fn longest_axis(mbr: &Box3D) -> usize {
    let extents = [
        mbr.max.x - mbr.min.x,
        mbr.max.y - mbr.min.y,
        mbr.max.z - mbr.min.z,
    ];
    let mut axis = 0;
    for (d, extent) in extents.iter().enumerate().skip(1) {
        if *extent > extents[axis] {
            axis = d;
        }
    }
    axis
}

/// Splits an overfull leaf along the longest axis; returns the new left MBR
/// and the right sibling.
pub(crate) fn split_leaf<V: SpatialValue>(
    values: &mut Vec<V>,
    node_mbr: &Box3D,
) -> (Box3D, ChildNode<V>) {
    let axis = longest_axis(node_mbr);
    values.sort_by(|a, b| centroid_cmp_from(a, b, axis));
    let right = values.split_off(values.len() / 2);
    let sibling = ChildNode {
        mbr: mbr_of_values(&right),
        node: Box::new(Node::Leaf { values: right }),
    };
    (mbr_of_values(values), sibling)
}

/// Splits an overfull internal node along the longest axis.
pub(crate) fn split_internal<V>(
    children: &mut Vec<ChildNode<V>>,
    node_mbr: &Box3D,
) -> (Box3D, ChildNode<V>) {
    let axis = longest_axis(node_mbr);
    children.sort_by(|a, b| {
        let ca = a.mbr.center().coord(axis);
        let cb = b.mbr.center().coord(axis);
        ca.partial_cmp(&cb).unwrap_or(Ordering::Equal)
    });
    let right = children.split_off(children.len() / 2);
    let sibling = ChildNode {
        mbr: mbr_of_children(&right),
        node: Box::new(Node::Internal { children: right }),
    };
    (mbr_of_children(children), sibling)
}
