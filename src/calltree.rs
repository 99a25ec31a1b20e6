//! CallTree — rose tree built from repeated stack samples (spec §3/§4.3/
//! §4.5), shared by RING's profile export and CPU's call-tree aggregator.

use crate::stack::{StackSample, SymbolCache};
use serde::Serialize;

#[derive(Debug, Clone, Serialize)]
pub struct CallTreeNode {
    pub address: u64,
    pub repeat_count: u32,
    pub cpu_weighted: f64,
    pub symbol_name: Option<String>,
    pub children: Vec<CallTreeNode>,
}

impl CallTreeNode {
    fn new(address: u64) -> Self {
        CallTreeNode {
            address,
            repeat_count: 0,
            cpu_weighted: 0.0,
            symbol_name: None,
            children: Vec::new(),
        }
    }

    fn find_or_insert_child(&mut self, address: u64) -> &mut CallTreeNode {
        if let Some(pos) = self.children.iter().position(|c| c.address == address) {
            &mut self.children[pos]
        } else {
            self.children.push(CallTreeNode::new(address));
            self.children.last_mut().unwrap()
        }
    }

    /// Sorts this node's children (and their descendants) by descending
    /// repeat count (spec §4.5 "sorted by descending count").
    fn sort_descending(&mut self) {
        self.children.sort_by(|a, b| b.repeat_count.cmp(&a.repeat_count));
        for child in &mut self.children {
            child.sort_descending();
        }
    }

    fn symbolize(&mut self, cache: &mut SymbolCache) {
        if let Some(info) = cache.symbolize(crate::stack::return_address_to_call_site(
            self.address,
            crate::stack::AddressTagBits::Two,
        )) {
            self.symbol_name = info.symbol_name;
        }
        for child in &mut self.children {
            child.symbolize(cache);
        }
    }
}

/// A rose tree rooted at a synthetic, address-less root node (spec §3:
/// "Built by walking each StackSample top-to-bottom, inserting or
/// incrementing nodes at each depth whose address matches an existing
/// sibling").
#[derive(Debug, Clone, Serialize)]
pub struct CallTree {
    pub roots: Vec<CallTreeNode>,
}

impl CallTree {
    /// Builds a tree from a batch of samples, top-of-stack first in each
    /// sample's address list (matching `StackSample`'s callee-to-root
    /// ordering).
    pub fn build(samples: &[StackSample]) -> Self {
        let mut roots: Vec<CallTreeNode> = Vec::new();
        for sample in samples {
            let mut addresses = sample.addresses().iter().rev().copied();
            let Some(first) = addresses.next() else {
                continue;
            };
            let root = match roots.iter().position(|r| r.address == first) {
                Some(pos) => &mut roots[pos],
                None => {
                    roots.push(CallTreeNode::new(first));
                    roots.last_mut().unwrap()
                }
            };
            root.repeat_count += 1;
            root.cpu_weighted += sample.cpu_pct;
            let mut current = root;
            for addr in addresses {
                current = current.find_or_insert_child(addr);
                current.repeat_count += 1;
                current.cpu_weighted += sample.cpu_pct;
            }
        }
        let mut tree = CallTree { roots };
        tree.sort_descending();
        tree
    }

    fn sort_descending(&mut self) {
        self.roots.sort_by(|a, b| b.repeat_count.cmp(&a.repeat_count));
        for root in &mut self.roots {
            root.sort_descending();
        }
    }

    pub fn symbolize(&mut self, cache: &mut SymbolCache) {
        for root in &mut self.roots {
            root.symbolize(cache);
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(addrs: &[u64], cpu: f64) -> StackSample {
        // StackSample stores callee-first (top-of-stack first); build()
        // reverses to walk root-to-leaf, so pass callee-first here too.
        StackSample::new(addrs.iter().rev().copied(), cpu, false)
    }

    #[test]
    fn merges_shared_prefixes() {
        let samples = vec![sample(&[1, 2, 3], 10.0), sample(&[1, 2, 4], 20.0)];
        let tree = CallTree::build(&samples);
        assert_eq!(tree.roots.len(), 1);
        let root = &tree.roots[0];
        assert_eq!(root.address, 1);
        assert_eq!(root.repeat_count, 2);
        assert_eq!(root.children.len(), 1);
        let mid = &root.children[0];
        assert_eq!(mid.address, 2);
        assert_eq!(mid.repeat_count, 2);
        assert_eq!(mid.children.len(), 2);
    }

    #[test]
    fn children_sorted_descending_by_repeat_count() {
        let samples = vec![
            sample(&[1, 10], 0.0),
            sample(&[1, 20], 0.0),
            sample(&[1, 20], 0.0),
        ];
        let tree = CallTree::build(&samples);
        let root = &tree.roots[0];
        assert_eq!(root.children[0].address, 20);
        assert_eq!(root.children[0].repeat_count, 2);
        assert_eq!(root.children[1].address, 10);
    }
}
