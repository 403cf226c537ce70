/// Merkle Search Tree
///
/// An ordered key -> CID mapping with deterministic structure: the layer a
/// key lives at is the number of leading two-bit zero chunks in
/// `sha256(key)`, so the tree shape is a pure function of the key set.
/// Node blocks are DAG-CBOR maps
/// `{l: Option<link>, e: [{p: int, k: bytes, v: link, t: Option<link>}]}`
/// with entry keys prefix-compressed against the previous key in the node.
///
/// The tree here is held as a flat ordered leaf map; `build` materializes
/// the node blocks for the current leaf set and `load` walks an existing
/// root back into the flat form, collecting every reachable CID so commits
/// can be diffed by set difference.
use libipld::{Cid, Ipld};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashSet};

use crate::error::{PdsError, PdsResult};
use crate::repo::{dag, must_get, BlockMap, CidSet, ReadableBlockstore};

/// Maximum length of a tree key (`<collection>/<rkey>`)
const MAX_KEY_LEN: usize = 1024;

/// Layer of a key: leading 2-bit zero chunks of its SHA-256 hash
pub fn key_layer(key: &str) -> u32 {
    let hash = Sha256::digest(key.as_bytes());
    let mut zeros = 0u32;
    for byte in hash.iter() {
        if *byte < 0x40 {
            zeros += 1;
        }
        if *byte < 0x10 {
            zeros += 1;
        }
        if *byte < 0x04 {
            zeros += 1;
        }
        if *byte == 0 {
            zeros += 1;
        } else {
            break;
        }
    }
    zeros
}

/// Validate a tree key: printable subset, two non-empty segments
pub fn ensure_valid_key(key: &str) -> PdsResult<()> {
    let valid_char = |c: char| c.is_ascii_alphanumeric() || matches!(c, '_' | '~' | '.' | ':' | '-');
    let mut parts = key.splitn(2, '/');
    let collection = parts.next().unwrap_or("");
    let rkey = parts.next().unwrap_or("");
    if key.len() > MAX_KEY_LEN
        || collection.is_empty()
        || rkey.is_empty()
        || rkey.contains('/')
        || !collection.chars().all(|c| valid_char(c) || c == '.')
        || !rkey.chars().all(valid_char)
    {
        return Err(PdsError::invalid_request(format!(
            "invalid MST key: {:?}",
            key
        )));
    }
    Ok(())
}

/// One entry in a serialized node
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeEntry {
    /// Bytes shared with the previous key in this node
    pub prefix_len: usize,
    /// Remainder of the key after the shared prefix
    pub key_suffix: Vec<u8>,
    /// Record CID
    pub value: Cid,
    /// Subtree to the right of this entry
    pub tree: Option<Cid>,
}

/// Decoded node block
#[derive(Debug, Clone, Default)]
pub struct NodeData {
    /// Subtree to the left of the first entry
    pub left: Option<Cid>,
    pub entries: Vec<TreeEntry>,
}

impl NodeData {
    pub fn to_ipld(&self) -> Ipld {
        let entries: Vec<Ipld> = self
            .entries
            .iter()
            .map(|e| {
                let mut map = BTreeMap::new();
                map.insert("p".to_string(), Ipld::Integer(e.prefix_len as i128));
                map.insert("k".to_string(), Ipld::Bytes(e.key_suffix.clone()));
                map.insert("v".to_string(), Ipld::Link(e.value));
                map.insert(
                    "t".to_string(),
                    match e.tree {
                        Some(cid) => Ipld::Link(cid),
                        None => Ipld::Null,
                    },
                );
                Ipld::Map(map)
            })
            .collect();
        let mut map = BTreeMap::new();
        map.insert(
            "l".to_string(),
            match self.left {
                Some(cid) => Ipld::Link(cid),
                None => Ipld::Null,
            },
        );
        map.insert("e".to_string(), Ipld::List(entries));
        Ipld::Map(map)
    }

    pub fn from_ipld(value: &Ipld) -> PdsResult<Self> {
        let map = match value {
            Ipld::Map(map) => map,
            _ => return Err(PdsError::internal("MST node is not a map")),
        };
        let left = match map.get("l") {
            Some(Ipld::Link(cid)) => Some(*cid),
            Some(Ipld::Null) | None => None,
            _ => return Err(PdsError::internal("MST node has invalid left link")),
        };
        let mut entries = Vec::new();
        if let Some(Ipld::List(items)) = map.get("e") {
            for item in items {
                let entry = match item {
                    Ipld::Map(m) => m,
                    _ => return Err(PdsError::internal("MST entry is not a map")),
                };
                let prefix_len = match entry.get("p") {
                    Some(Ipld::Integer(n)) if *n >= 0 => *n as usize,
                    _ => return Err(PdsError::internal("MST entry missing prefix length")),
                };
                let key_suffix = match entry.get("k") {
                    Some(Ipld::Bytes(b)) => b.clone(),
                    _ => return Err(PdsError::internal("MST entry missing key suffix")),
                };
                let value = match entry.get("v") {
                    Some(Ipld::Link(cid)) => *cid,
                    _ => return Err(PdsError::internal("MST entry missing value link")),
                };
                let tree = match entry.get("t") {
                    Some(Ipld::Link(cid)) => Some(*cid),
                    Some(Ipld::Null) | None => None,
                    _ => return Err(PdsError::internal("MST entry has invalid subtree link")),
                };
                entries.push(TreeEntry {
                    prefix_len,
                    key_suffix,
                    value,
                    tree,
                });
            }
        }
        Ok(NodeData { left, entries })
    }
}

/// Flat view of a tree plus the CIDs reachable from its root
#[derive(Debug, Clone, Default)]
pub struct LoadedTree {
    pub leaves: BTreeMap<String, Cid>,
    /// Every node CID reachable from the root
    pub node_cids: CidSet,
}

impl LoadedTree {
    /// All reachable CIDs: nodes plus leaf values
    pub fn reachable(&self) -> CidSet {
        let mut set = self.node_cids.clone();
        set.extend(self.leaves.values().copied());
        set
    }
}

/// Walk an existing tree from its root node, collecting leaves and node CIDs
pub async fn load(store: &dyn ReadableBlockstore, root: Cid) -> PdsResult<LoadedTree> {
    let mut tree = LoadedTree::default();
    let mut stack = vec![root];
    while let Some(cid) = stack.pop() {
        if !tree.node_cids.insert(cid) {
            continue;
        }
        let bytes = must_get(store, &cid).await?;
        let node = NodeData::from_ipld(&dag::decode(&bytes)?)?;
        if let Some(left) = node.left {
            stack.push(left);
        }
        let mut prev_key: Vec<u8> = Vec::new();
        for entry in &node.entries {
            if entry.prefix_len > prev_key.len() {
                return Err(PdsError::internal("MST entry prefix overruns previous key"));
            }
            let mut key_bytes = prev_key[..entry.prefix_len].to_vec();
            key_bytes.extend_from_slice(&entry.key_suffix);
            let key = String::from_utf8(key_bytes.clone())
                .map_err(|_| PdsError::internal("MST key is not utf-8"))?;
            tree.leaves.insert(key, entry.value);
            prev_key = key_bytes;
            if let Some(sub) = entry.tree {
                stack.push(sub);
            }
        }
    }
    Ok(tree)
}

/// Deterministically build node blocks for a leaf set
///
/// Returns the root CID and every node block. The empty tree is a single
/// node with no entries.
pub fn build(leaves: &BTreeMap<String, Cid>) -> PdsResult<(Cid, BlockMap)> {
    let mut blocks = BlockMap::new();
    if leaves.is_empty() {
        let root = blocks.add(&NodeData::default().to_ipld())?;
        return Ok((root, blocks));
    }
    let items: Vec<(&str, Cid, u32)> = leaves
        .iter()
        .map(|(k, v)| (k.as_str(), *v, key_layer(k)))
        .collect();
    let top = items.iter().map(|(_, _, l)| *l).max().unwrap_or(0);
    let root = build_node(&items, top, &mut blocks)?
        .ok_or_else(|| PdsError::internal("MST build produced no root"))?;
    Ok((root, blocks))
}

/// Recursively build the node at `layer` covering `items` (sorted by key)
fn build_node(
    items: &[(&str, Cid, u32)],
    layer: u32,
    blocks: &mut BlockMap,
) -> PdsResult<Option<Cid>> {
    if items.is_empty() {
        return Ok(None);
    }
    let entry_positions: Vec<usize> = items
        .iter()
        .enumerate()
        .filter(|(_, item)| item.2 >= layer)
        .map(|(i, _)| i)
        .collect();

    // No entries here: an intermediate node with only a left child
    if entry_positions.is_empty() {
        let left = build_node(items, layer.saturating_sub(1), blocks)?;
        let node = NodeData {
            left,
            entries: Vec::new(),
        };
        return Ok(Some(blocks.add(&node.to_ipld())?));
    }

    let mut node = NodeData {
        left: build_node(&items[..entry_positions[0]], layer.saturating_sub(1), blocks)?,
        entries: Vec::with_capacity(entry_positions.len()),
    };
    let mut prev_key = "";
    for (n, &pos) in entry_positions.iter().enumerate() {
        let (key, value, _) = items[pos];
        let segment_end = entry_positions
            .get(n + 1)
            .copied()
            .unwrap_or(items.len());
        let tree = build_node(&items[pos + 1..segment_end], layer.saturating_sub(1), blocks)?;
        let prefix_len = shared_prefix_len(prev_key.as_bytes(), key.as_bytes());
        node.entries.push(TreeEntry {
            prefix_len,
            key_suffix: key.as_bytes()[prefix_len..].to_vec(),
            value,
            tree,
        });
        prev_key = key;
    }
    Ok(Some(blocks.add(&node.to_ipld())?))
}

fn shared_prefix_len(a: &[u8], b: &[u8]) -> usize {
    a.iter().zip(b.iter()).take_while(|(x, y)| x == y).count()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// BlockMap-backed store for walking freshly built trees
    struct MapStore(Mutex<BlockMap>);

    #[async_trait::async_trait]
    impl ReadableBlockstore for MapStore {
        async fn get_bytes(&self, cid: &Cid) -> PdsResult<Option<Vec<u8>>> {
            Ok(self.0.lock().unwrap().get(cid).cloned())
        }
    }

    fn leaf_cid(n: u32) -> Cid {
        let (cid, _) = dag::cid_for_ipld(&Ipld::Integer(n as i128)).unwrap();
        cid
    }

    #[test]
    fn test_empty_tree_has_a_root() {
        let (root, blocks) = build(&BTreeMap::new()).unwrap();
        assert_eq!(blocks.len(), 1);
        assert!(blocks.has(&root));
    }

    #[test]
    fn test_build_is_order_independent() {
        let mut a = BTreeMap::new();
        let mut b = BTreeMap::new();
        for i in 0..50u32 {
            let key = format!("app.test.kind/rec-{:04}", i);
            a.insert(key.clone(), leaf_cid(i));
        }
        // Insert in reverse; BTreeMap normalizes but the CIDs must agree too
        for i in (0..50u32).rev() {
            let key = format!("app.test.kind/rec-{:04}", i);
            b.insert(key, leaf_cid(i));
        }
        let (root_a, _) = build(&a).unwrap();
        let (root_b, _) = build(&b).unwrap();
        assert_eq!(root_a, root_b);
    }

    #[test]
    fn test_different_content_different_root() {
        let mut a = BTreeMap::new();
        a.insert("c/1".to_string(), leaf_cid(1));
        let mut b = BTreeMap::new();
        b.insert("c/1".to_string(), leaf_cid(2));
        let (root_a, _) = build(&a).unwrap();
        let (root_b, _) = build(&b).unwrap();
        assert_ne!(root_a, root_b);
    }

    #[tokio::test]
    async fn test_load_round_trips_leaves() {
        let mut leaves = BTreeMap::new();
        for i in 0..200u32 {
            leaves.insert(format!("com.example.thing/k{:05}", i), leaf_cid(i));
        }
        let (root, blocks) = build(&leaves).unwrap();
        let store = MapStore(Mutex::new(blocks));
        let loaded = load(&store, root).await.unwrap();
        assert_eq!(loaded.leaves, leaves);
        // Rebuilding the loaded leaves reproduces the same root
        let (root2, _) = build(&loaded.leaves).unwrap();
        assert_eq!(root, root2);
    }

    #[tokio::test]
    async fn test_removal_changes_reachable_set() {
        let mut leaves = BTreeMap::new();
        for i in 0..20u32 {
            leaves.insert(format!("a.b.c/key{}", i), leaf_cid(i));
        }
        let (root, blocks) = build(&leaves).unwrap();
        let store = MapStore(Mutex::new(blocks));
        let before = load(&store, root).await.unwrap().reachable();

        leaves.remove("a.b.c/key7");
        let (root2, blocks2) = build(&leaves).unwrap();
        let store2 = MapStore(Mutex::new(blocks2));
        let after = load(&store2, root2).await.unwrap().reachable();

        assert!(before.contains(&leaf_cid(7)));
        assert!(!after.contains(&leaf_cid(7)));
        assert_ne!(root, root2);
    }

    #[test]
    fn test_key_validation() {
        assert!(ensure_valid_key("app.bsky.feed.post/3jzfcijpj2z2a").is_ok());
        assert!(ensure_valid_key("no-slash").is_err());
        assert!(ensure_valid_key("/missing-collection").is_err());
        assert!(ensure_valid_key("coll/").is_err());
        assert!(ensure_valid_key("coll/bad key").is_err());
    }

    #[test]
    fn test_layer_distribution_is_shallow() {
        // Most keys live at layer zero with 4-way fanout
        let at_zero = (0..1000)
            .filter(|i| key_layer(&format!("col/key{}", i)) == 0)
            .count();
        assert!(at_zero > 600);
    }
}
