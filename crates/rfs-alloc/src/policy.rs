//! Placement policy: where a request should start looking for free blocks.
//!
//! The policy is a fixed, ordered list of stages. Each stage inspects the
//! request and may move `search_start` or narrow the `[beg, end]` window;
//! some stages end the evaluation. The result depends only on the hint, the
//! geometry, the options and the inode's preallocation cursor, so the same
//! request always lands in the same place.

use crate::geometry::Geometry;
use crate::hash::{bmap_hash_id, hash_id};
use crate::options::AllocOptions;
use rfs_types::{BlockNumber, InodeNumber, ObjectKey};
use serde::Serialize;
use tracing::trace;

// ── Request description ─────────────────────────────────────────────────────

/// What the allocator needs to know about the inode owning the blocks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InodeRef {
    pub number: InodeNumber,
    /// The inode's own key: packing locality and object id.
    pub key: ObjectKey,
    pub is_regular: bool,
    /// Internal files (xattrs, ACLs) never get preallocation.
    pub private: bool,
    pub size_bytes: u64,
}

impl InodeRef {
    #[must_use]
    pub fn regular(number: InodeNumber, key: ObjectKey, size_bytes: u64) -> Self {
        Self {
            number,
            key,
            is_regular: true,
            private: false,
            size_bytes,
        }
    }

    #[must_use]
    pub fn directory(number: InodeNumber, key: ObjectKey) -> Self {
        Self {
            number,
            key,
            is_regular: false,
            private: false,
            size_bytes: 0,
        }
    }
}

/// Block pointers of the indirect item the new block extends.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndirectItem {
    /// Zero entries are holes.
    pub pointers: Vec<u32>,
    pub pos_in_item: usize,
}

/// Tree position of the insertion point.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeftNeighbor {
    /// Block of the leaf holding the insertion point.
    pub node_block: BlockNumber,
    pub indirect: Option<IndirectItem>,
}

/// Per-request placement input. Built by the caller, never persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllocationHint {
    pub key: ObjectKey,
    /// Tree node (true) or file data (false).
    pub formatted_node: bool,
    pub inode: Option<InodeRef>,
    /// Logical block of the file being allocated.
    pub file_block: u64,
    pub left_neighbor: Option<LeftNeighbor>,
    pub search_start: BlockNumber,
    pub preallocate: bool,
    /// First allocation of a new packing locality; displace it.
    pub displace_new_blocks: bool,
    /// Smallest fragment accepted once a contiguous run has failed.
    pub min_window: u32,
}

impl Default for AllocationHint {
    fn default() -> Self {
        Self {
            key: ObjectKey::default(),
            formatted_node: false,
            inode: None,
            file_block: 0,
            left_neighbor: None,
            search_start: BlockNumber(0),
            preallocate: false,
            displace_new_blocks: false,
            min_window: 1,
        }
    }
}

impl AllocationHint {
    /// Hint for a tree node keyed by `key`.
    #[must_use]
    pub fn formatted(key: ObjectKey) -> Self {
        Self {
            key,
            formatted_node: true,
            ..Self::default()
        }
    }

    /// Hint for data block `file_block` of `inode`.
    #[must_use]
    pub fn unformatted(inode: InodeRef, file_block: u64) -> Self {
        Self {
            key: inode.key,
            inode: Some(inode),
            file_block,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_search_start(mut self, block: BlockNumber) -> Self {
        self.search_start = block;
        self
    }

    #[must_use]
    pub fn with_left_neighbor(mut self, neighbor: LeftNeighbor) -> Self {
        self.left_neighbor = Some(neighbor);
        self
    }

    #[must_use]
    pub fn with_preallocation(mut self) -> Self {
        self.preallocate = true;
        self
    }

    #[must_use]
    pub fn with_min_window(mut self, blocks: u32) -> Self {
        self.min_window = blocks.max(1);
        self
    }

    #[must_use]
    pub fn displacing_new_blocks(mut self) -> Self {
        self.displace_new_blocks = true;
        self
    }

    /// Data blocks owned by an inode are subject to quota.
    #[must_use]
    pub fn charged_inode(&self) -> Option<InodeNumber> {
        if self.formatted_node {
            return None;
        }
        self.inode.as_ref().map(|inode| inode.number)
    }
}

// ── Output ──────────────────────────────────────────────────────────────────

/// Where to search: the preferred region `[beg, end]` and the start point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SearchWindow {
    pub beg: BlockNumber,
    pub end: BlockNumber,
    pub search_start: BlockNumber,
}

// ── Stages ──────────────────────────────────────────────────────────────────

struct PolicyInput<'a> {
    hint: &'a AllocationHint,
    geometry: &'a Geometry,
    options: &'a AllocOptions,
    prealloc_cursor: Option<BlockNumber>,
}

impl PolicyInput<'_> {
    fn unformatted(&self) -> bool {
        !self.hint.formatted_node
    }

    /// Key of the owning inode, falling back to the hint key.
    fn owner_key(&self) -> ObjectKey {
        self.hint
            .inode
            .as_ref()
            .map_or(self.hint.key, |inode| inode.key)
    }

    /// Id to spread an inode's data by: its dir id or its object id.
    fn displacement_id(&self, key: ObjectKey) -> u32 {
        if self.options.displace_based_on_dirid {
            key.dir_id
        } else {
            key.object_id
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct PolicyState {
    beg: u64,
    end: u64,
    search_start: u64,
    /// The left neighbor supplied a concrete data block to follow.
    unfm_hint: bool,
}

impl PolicyState {
    /// `beg + value % (end - beg)`, or `beg` for an empty span.
    fn spread(&self, value: u32) -> u64 {
        let span = self.end.saturating_sub(self.beg);
        if span == 0 {
            self.beg
        } else {
            self.beg + u64::from(value) % span
        }
    }

    fn move_forward(&mut self, to: u64) {
        if to > self.search_start {
            self.search_start = to;
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    Done,
}

trait Stage: Sync {
    fn name(&self) -> &'static str;
    fn apply(&self, input: &PolicyInput<'_>, state: &mut PolicyState) -> Flow;
}

/// Keep formatted nodes below `block_count / border_fraction` and data above.
struct BorderClamp;

impl Stage for BorderClamp {
    fn name(&self) -> &'static str {
        "border"
    }

    fn apply(&self, input: &PolicyInput<'_>, state: &mut PolicyState) -> Flow {
        if input.options.concentrating_formatted_nodes {
            let border = input.geometry.block_count() / input.options.border_fraction.max(1);
            if input.hint.formatted_node {
                state.end = border.saturating_sub(1);
            } else {
                state.beg = border;
            }
        }
        Flow::Continue
    }
}

struct NewPackingLocality;

impl Stage for NewPackingLocality {
    fn name(&self) -> &'static str {
        "displace_new_packing_locality"
    }

    fn apply(&self, input: &PolicyInput<'_>, state: &mut PolicyState) -> Flow {
        if !(input.options.displacing_new_packing_localities && input.hint.displace_new_blocks) {
            return Flow::Continue;
        }
        state.search_start = state.spread(hash_id(input.hint.key.object_id));
        Flow::Done
    }
}

struct LargeFileDisplacement;

impl Stage for LargeFileDisplacement {
    fn name(&self) -> &'static str {
        "displace_large_file"
    }

    fn apply(&self, input: &PolicyInput<'_>, state: &mut PolicyState) -> Flow {
        if !(input.options.displacing_large_files
            && input.unformatted()
            && input.hint.file_block == input.options.large_file_block_threshold)
        {
            return Flow::Continue;
        }
        let id = input.displacement_id(input.owner_key());
        state.search_start = state.spread(hash_id(id));
        Flow::Done
    }
}

struct HashedFormattedNodes;

impl Stage for HashedFormattedNodes {
    fn name(&self) -> &'static str {
        "hash_formatted_node"
    }

    fn apply(&self, input: &PolicyInput<'_>, state: &mut PolicyState) -> Flow {
        if !(input.hint.formatted_node && input.options.hashed_formatted_nodes) {
            return Flow::Continue;
        }
        let id = match &input.hint.inode {
            None => input.hint.key.dir_id,
            Some(inode) => input.displacement_id(inode.key),
        };
        state.search_start = state.spread(hash_id(id));
        Flow::Done
    }
}

/// Start next to the tree position, or right after the last data block of
/// the indirect item being extended.
struct LeftNeighborLookup;

impl Stage for LeftNeighborLookup {
    fn name(&self) -> &'static str {
        "left_neighbor"
    }

    fn apply(&self, input: &PolicyInput<'_>, state: &mut PolicyState) -> Flow {
        let Some(neighbor) = &input.hint.left_neighbor else {
            return Flow::Continue;
        };
        state.search_start = neighbor.node_block.0;
        if input.hint.formatted_node {
            return Flow::Continue;
        }
        let Some(item) = &neighbor.indirect else {
            return Flow::Continue;
        };
        if item.pointers.is_empty() {
            return Flow::Continue;
        }
        let pos = item.pos_in_item.min(item.pointers.len() - 1);
        if let Some(&last) = item.pointers[..=pos].iter().rev().find(|&&ptr| ptr != 0) {
            state.search_start = u64::from(last) + 1;
            state.unfm_hint = true;
        }
        Flow::Continue
    }
}

/// Forward-only relocation by the hashed dir id of the owning inode.
fn old_hashed_relocation(input: &PolicyInput<'_>, state: &mut PolicyState) {
    let Some(inode) = &input.hint.inode else {
        return;
    };
    if input.hint.formatted_node {
        return;
    }
    let span = state.end.saturating_sub(state.beg).saturating_sub(1);
    let border = if span == 0 {
        state.beg
    } else {
        state.beg + u64::from(hash_id(inode.key.dir_id)) % span
    };
    state.move_forward(border);
}

/// Legacy placement; decides alone when enabled.
struct OldWay;

impl Stage for OldWay {
    fn name(&self) -> &'static str {
        "old_way"
    }

    fn apply(&self, input: &PolicyInput<'_>, state: &mut PolicyState) -> Flow {
        let options = input.options;
        if !options.old_way {
            return Flow::Continue;
        }
        if input.hint.formatted_node {
            return Flow::Done;
        }
        if !options.hashed_relocation {
            if let Some(inode) = &input.hint.inode {
                let border = state.spread(inode.key.dir_id);
                state.move_forward(border);
            }
        } else if !options.no_unhashed_relocation {
            old_hashed_relocation(input, state);
        }
        if input.hint.inode.is_some() {
            if let Some(cursor) = input.prealloc_cursor {
                state.move_forward(cursor.0);
            }
        }
        Flow::Done
    }
}

/// Give each directory its own hundredth of the device.
struct HundredthSlices;

impl Stage for HundredthSlices {
    fn name(&self) -> &'static str {
        "hundredth_slices"
    }

    fn apply(&self, input: &PolicyInput<'_>, state: &mut PolicyState) -> Flow {
        let options = input.options;
        if !options.hundredth_slices || (options.displacing_large_files && input.unformatted()) {
            return Flow::Continue;
        }
        let slice = state.end / 100;
        let slice_start = u64::from(hash_id(input.hint.key.dir_id) % 100) * slice;
        if slice_start > state.search_start || slice_start + slice <= state.search_start {
            state.search_start = slice_start;
        }
        Flow::Done
    }
}

struct OldHashedRelocation;

impl Stage for OldHashedRelocation {
    fn name(&self) -> &'static str {
        "old_hashed_relocation"
    }

    fn apply(&self, input: &PolicyInput<'_>, state: &mut PolicyState) -> Flow {
        if input.options.old_hashed_relocation && !state.unfm_hint && input.unformatted() {
            old_hashed_relocation(input, state);
        }
        Flow::Continue
    }
}

struct NewHashedRelocation;

impl Stage for NewHashedRelocation {
    fn name(&self) -> &'static str {
        "new_hashed_relocation"
    }

    fn apply(&self, input: &PolicyInput<'_>, state: &mut PolicyState) -> Flow {
        if !input.options.new_hashed_relocation
            || (state.unfm_hint && !input.hint.formatted_node)
        {
            return Flow::Continue;
        }
        let id = match &input.hint.inode {
            Some(inode) if !input.hint.formatted_node => input.displacement_id(inode.key),
            _ => input.hint.key.dir_id,
        };
        state.search_start = state.spread(hash_id(id));
        Flow::Continue
    }
}

/// Start in the bitmap group of the packing locality.
struct DiridGroups;

impl Stage for DiridGroups {
    fn name(&self) -> &'static str {
        "dirid_groups"
    }

    fn apply(&self, input: &PolicyInput<'_>, state: &mut PolicyState) -> Flow {
        if !input.options.dirid_groups || (state.unfm_hint && !input.hint.formatted_node) {
            return Flow::Continue;
        }
        let dirid = match &input.hint.inode {
            Some(inode) => inode.key.dir_id,
            None if input.hint.formatted_node => input.hint.key.dir_id,
            None => 0,
        };
        if dirid != 0 {
            let geometry = input.geometry;
            let bm = bmap_hash_id(dirid, geometry.bitmap_count());
            let mut start = u64::from(bm) * u64::from(geometry.bits_per_bitmap());
            if input.hint.inode.is_some() {
                // Leave the head of the group to tree nodes.
                start += u64::from(geometry.block_size().get() / 2);
            }
            state.search_start = start;
        }
        Flow::Continue
    }
}

/// Start in the bitmap group of the object itself.
struct OidGroups;

impl Stage for OidGroups {
    fn name(&self) -> &'static str {
        "oid_groups"
    }

    fn apply(&self, input: &PolicyInput<'_>, state: &mut PolicyState) -> Flow {
        if !input.options.oid_groups || state.unfm_hint || input.hint.formatted_node {
            return Flow::Continue;
        }
        let Some(inode) = &input.hint.inode else {
            return Flow::Continue;
        };
        let geometry = input.geometry;
        let bits = u64::from(geometry.bits_per_bitmap());
        state.search_start = if inode.key.dir_id <= 2 {
            bits
        } else {
            u64::from(bmap_hash_id(inode.key.object_id, geometry.bitmap_count())) * bits
        };
        Flow::Continue
    }
}

const STAGES: &[&dyn Stage] = &[
    &BorderClamp,
    &NewPackingLocality,
    &LargeFileDisplacement,
    &HashedFormattedNodes,
    &LeftNeighborLookup,
    &OldWay,
    &HundredthSlices,
    &OldHashedRelocation,
    &NewHashedRelocation,
    &DiridGroups,
    &OidGroups,
];

/// Run the stage list for `hint`.
///
/// `prealloc_cursor` is the next block of the inode's preallocation, used by
/// the legacy strategy to keep writes moving forward. The returned
/// `search_start` is not clamped to the device.
#[must_use]
pub fn determine_search_start(
    hint: &AllocationHint,
    geometry: &Geometry,
    options: &AllocOptions,
    prealloc_cursor: Option<BlockNumber>,
) -> SearchWindow {
    let input = PolicyInput {
        hint,
        geometry,
        options,
        prealloc_cursor,
    };
    let mut state = PolicyState {
        beg: 0,
        end: geometry.block_count() - 1,
        search_start: hint.search_start.0,
        unfm_hint: false,
    };
    for stage in STAGES {
        let flow = stage.apply(&input, &mut state);
        trace!(
            target: "rfs::alloc",
            event = "policy_stage",
            stage = stage.name(),
            beg = state.beg,
            end = state.end,
            search_start = state.search_start
        );
        if flow == Flow::Done {
            break;
        }
    }
    SearchWindow {
        beg: BlockNumber(state.beg),
        end: BlockNumber(state.end),
        search_start: BlockNumber(state.search_start),
    }
}

/// Packing locality for a new directory created in `dir`.
///
/// With `packing_groups`, a directory whose parent's bitmap group still has
/// more than 60% free space shares the parent's locality; otherwise (or under
/// dir id 1, which fsck treats specially) it starts its own.
#[must_use]
pub fn choose_packing(
    dir: ObjectKey,
    options: &AllocOptions,
    geometry: &Geometry,
    bitmap_free: impl Fn(u32) -> u32,
) -> u32 {
    if !options.packing_groups {
        return dir.object_id;
    }
    let parent = dir.dir_id;
    let bm = bmap_hash_id(parent, geometry.bitmap_count());
    let roomy = u64::from(bitmap_free(bm)) * 100 > u64::from(geometry.bits_per_bitmap()) * 60;
    if parent == 1 || !roomy {
        dir.object_id
    } else {
        dir.dir_id
    }
}
