use anyhow::bail;
use bytes::Bytes;
use rustc_hash::FxHashMap;
use tracing::{debug, trace};

use crate::wire::SplitMeta;

/// Send side: hands out split ids and slices oversized payloads into fragments.
pub struct Splitter {
    next_split_id: u16,
}

impl Splitter {
    pub fn new() -> Splitter {
        Splitter { next_split_id: 0 }
    }

    /// Slices a payload into fragments of at most `fragment_capacity` bytes, each
    ///  tagged with a fresh split id. The slices share the payload's underlying
    ///  buffer, no bytes are copied.
    pub fn split(&mut self, payload: Bytes, fragment_capacity: usize) -> Vec<(SplitMeta, Bytes)> {
        let split_id = self.next_split_id;
        self.next_split_id = self.next_split_id.wrapping_add(1);

        let fragment_count = payload.len().div_ceil(fragment_capacity);
        trace!("splitting {} byte payload into {} fragments (split id {})",
            payload.len(), fragment_count, split_id);

        (0..fragment_count)
            .map(|fragment_index| {
                let start = fragment_index * fragment_capacity;
                let end = (start + fragment_capacity).min(payload.len());
                let meta = SplitMeta {
                    fragment_count: fragment_count as u16,
                    split_id,
                    fragment_index: fragment_index as u16,
                };
                (meta, payload.slice(start..end))
            })
            .collect()
    }
}

struct SplitAssembly {
    fragments: Vec<Option<Bytes>>,
    num_received: usize,
}

/// Receive side: collects fragments per split id and reassembles once complete.
///
/// Both the number of concurrently reassembling splits and the declared fragment
///  count per split are bounded; a peer exceeding either is a protocol violation and
///  the error surfaces as a bad-packet disconnect in the caller.
pub struct Reassembler {
    assemblies: FxHashMap<u16, SplitAssembly>,
    max_outstanding_splits: usize,
    max_fragment_count: usize,
}

impl Reassembler {
    pub fn new(max_outstanding_splits: usize, max_fragment_count: usize) -> Reassembler {
        Reassembler {
            assemblies: FxHashMap::default(),
            max_outstanding_splits,
            max_fragment_count,
        }
    }

    /// Stores a fragment, returning the reassembled payload once the last fragment
    ///  of its split has arrived. A duplicate fragment index overwrites in place.
    pub fn on_fragment(&mut self, meta: &SplitMeta, payload: Bytes) -> anyhow::Result<Option<Bytes>> {
        if meta.fragment_count == 0 {
            bail!("split {} declares zero fragments", meta.split_id);
        }
        if meta.fragment_count as usize > self.max_fragment_count {
            bail!("split {} declares {} fragments, limit is {}",
                meta.split_id, meta.fragment_count, self.max_fragment_count);
        }
        if meta.fragment_index >= meta.fragment_count {
            bail!("fragment index {} out of range for split {} with {} fragments",
                meta.fragment_index, meta.split_id, meta.fragment_count);
        }

        if !self.assemblies.contains_key(&meta.split_id)
            && self.assemblies.len() >= self.max_outstanding_splits
        {
            bail!("more than {} concurrently incomplete splits", self.max_outstanding_splits);
        }

        let assembly = self.assemblies.entry(meta.split_id)
            .or_insert_with(|| SplitAssembly {
                fragments: vec![None; meta.fragment_count as usize],
                num_received: 0,
            });

        if assembly.fragments.len() != meta.fragment_count as usize {
            bail!("split {} changed its declared fragment count from {} to {}",
                meta.split_id, assembly.fragments.len(), meta.fragment_count);
        }

        let slot = &mut assembly.fragments[meta.fragment_index as usize];
        if slot.replace(payload).is_none() {
            assembly.num_received += 1;
        } else {
            debug!("duplicate fragment {} of split {}", meta.fragment_index, meta.split_id);
        }

        if assembly.num_received < assembly.fragments.len() {
            return Ok(None);
        }

        let assembly = self.assemblies.remove(&meta.split_id)
            .expect("assembly was present a moment ago");
        let total_len = assembly.fragments.iter()
            .map(|f| f.as_ref().map(|b| b.len()).unwrap_or(0))
            .sum();
        let mut reassembled = Vec::with_capacity(total_len);
        for fragment in assembly.fragments {
            // every slot is filled, num_received == len
            if let Some(bytes) = fragment {
                reassembled.extend_from_slice(&bytes);
            }
        }
        Ok(Some(Bytes::from(reassembled)))
    }

    pub fn num_outstanding(&self) -> usize {
        self.assemblies.len()
    }
}
