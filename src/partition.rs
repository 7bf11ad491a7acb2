//! Partition table: which storage nodes own which slice of the OID space.

use crate::error::{Error, Result};
use crate::types::{CellState, NodeId, Oid, Ptid, Tid};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// One `(node, state)` assignment for one partition.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Cell {
    pub node: NodeId,
    pub state: CellState,
}

/// Full-table row as carried by `AnswerPartitionTable` / `SendPartitionTable`.
pub type PartitionRow = (u32, Vec<Cell>);

/// Incremental change as carried by `NotifyPartitionChanges`.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct CellChange {
    pub partition: u32,
    pub node: NodeId,
    pub state: CellState,
}

/// Replicated map from partition to its cells, versioned by a strictly
/// increasing `ptid`. Every node holds a copy; only the primary mutates it
/// directly, everyone else applies its broadcasts.
#[derive(Clone, Debug)]
pub struct PartitionTable {
    ptid: Ptid,
    rows: Vec<Vec<Cell>>,
}

impl PartitionTable {
    pub fn new(partitions: u32) -> PartitionTable {
        PartitionTable {
            ptid: Ptid::ZERO,
            rows: vec![Vec::new(); partitions as usize],
        }
    }

    pub fn ptid(&self) -> Ptid {
        self.ptid
    }

    pub fn partitions(&self) -> u32 {
        self.rows.len() as u32
    }

    pub fn partition_of(&self, oid: Oid) -> u32 {
        (oid.raw() % self.rows.len() as u64) as u32
    }

    pub fn partition_of_tid(&self, tid: Tid) -> u32 {
        (tid.raw() % self.rows.len() as u64) as u32
    }

    pub fn cells(&self, partition: u32) -> &[Cell] {
        &self.rows[partition as usize]
    }

    /// Cells whose state permits reading this partition.
    pub fn readable_cells(&self, partition: u32) -> Vec<Cell> {
        self.rows[partition as usize]
            .iter()
            .copied()
            .filter(|c| c.state.is_readable())
            .collect()
    }

    /// Cells whose state permits writing this partition.
    pub fn writable_cells(&self, partition: u32) -> Vec<Cell> {
        self.rows[partition as usize]
            .iter()
            .copied()
            .filter(|c| c.state.is_writable())
            .collect()
    }

    pub fn readable_cells_for_oid(&self, oid: Oid) -> Vec<Cell> {
        self.readable_cells(self.partition_of(oid))
    }

    pub fn writable_cells_for_oid(&self, oid: Oid) -> Vec<Cell> {
        self.writable_cells(self.partition_of(oid))
    }

    /// True iff every partition has at least one readable cell.
    pub fn operational(&self) -> bool {
        !self.rows.is_empty() && self.rows.iter().all(|row| {
            row.iter().any(|c| c.state.is_readable())
        })
    }

    /// Rebuild from a persisted cell list, bypassing the monotonicity check.
    /// Used when a node restarts from its own stored table.
    pub fn restore(&mut self, ptid: Ptid, changes: &[CellChange]) {
        for row in self.rows.iter_mut() {
            row.clear();
        }
        for change in changes {
            if change.state != CellState::Discarded {
                self.set_cell(change.partition, change.node, change.state);
            }
        }
        self.ptid = ptid;
    }

    /// Full replace, used at bootstrap.
    pub fn load(&mut self, ptid: Ptid, rows: &[PartitionRow]) {
        for row in self.rows.iter_mut() {
            row.clear();
        }
        for (partition, cells) in rows {
            self.rows[*partition as usize] = cells.clone();
        }
        self.ptid = ptid;
    }

    /// Incremental update. `ptid` must exceed the current revision, otherwise
    /// the diff is stale and rejected.
    pub fn update(&mut self, ptid: Ptid, changes: &[CellChange]) -> Result<()> {
        if ptid <= self.ptid {
            debug!(%ptid, current = %self.ptid, "ignoring stale partition changes");
            return Err(Error::Protocol(format!(
                "stale partition table update {ptid} <= {}",
                self.ptid
            )));
        }
        for change in changes {
            match change.state {
                CellState::Discarded => self.remove_cell(change.partition, change.node),
                state => self.set_cell(change.partition, change.node, state),
            }
        }
        self.ptid = ptid;
        Ok(())
    }

    /// Local mutation used by the primary while constructing a new revision.
    pub fn set_cell(&mut self, partition: u32, node: NodeId, state: CellState) {
        let row = &mut self.rows[partition as usize];
        match row.iter_mut().find(|c| c.node == node) {
            Some(cell) => cell.state = state,
            None => row.push(Cell { node, state }),
        }
    }

    pub fn remove_cell(&mut self, partition: u32, node: NodeId) {
        self.rows[partition as usize].retain(|c| c.node != node);
    }

    /// Bump the revision after local mutations; primary only.
    pub fn bump(&mut self) -> Ptid {
        self.ptid = Ptid::new(self.ptid.raw() + 1);
        self.ptid
    }

    pub fn rows(&self) -> Vec<PartitionRow> {
        self.rows
            .iter()
            .enumerate()
            .map(|(i, row)| (i as u32, row.clone()))
            .collect()
    }

    /// Partitions assigned to `node` in the given state.
    pub fn partitions_in_state(&self, node: NodeId, state: CellState) -> Vec<u32> {
        self.rows
            .iter()
            .enumerate()
            .filter(|(_, row)| row.iter().any(|c| c.node == node && c.state == state))
            .map(|(i, _)| i as u32)
            .collect()
    }

    /// Build the initial table over the given storages, round-robin, every
    /// cell up-to-date. Primary only, before the first `ptid` broadcast.
    pub fn make(&mut self, nodes: &[NodeId], replicas: u32) {
        let copies = (replicas as usize + 1).min(nodes.len().max(1));
        for (partition, row) in self.rows.iter_mut().enumerate() {
            row.clear();
            for replica in 0..copies {
                if nodes.is_empty() {
                    break;
                }
                let node = nodes[(partition + replica) % nodes.len()];
                row.push(Cell {
                    node,
                    state: CellState::UpToDate,
                });
            }
        }
    }

    /// Mark every cell of a lost storage out-of-date, keeping the last
    /// readable cell of each partition intact so the cluster can restart.
    /// Returns the diff to broadcast, empty if the node held nothing.
    pub fn outdate(&mut self, node: NodeId) -> Vec<CellChange> {
        let mut changes = Vec::new();
        for (partition, row) in self.rows.iter_mut().enumerate() {
            let readable_elsewhere = row
                .iter()
                .any(|c| c.node != node && c.state.is_readable());
            for cell in row.iter_mut() {
                if cell.node == node && cell.state == CellState::UpToDate && readable_elsewhere {
                    cell.state = CellState::OutOfDate;
                    changes.push(CellChange {
                        partition: partition as u32,
                        node,
                        state: CellState::OutOfDate,
                    });
                }
            }
        }
        changes
    }

    /// Assign out-of-date cells to a joining storage up to the replication
    /// factor. Returns the diff to broadcast.
    pub fn assign(&mut self, node: NodeId, replicas: u32) -> Vec<CellChange> {
        let target = replicas as usize + 1;
        let mut changes = Vec::new();
        for (partition, row) in self.rows.iter_mut().enumerate() {
            if row.iter().any(|c| c.node == node) {
                continue;
            }
            let live = row
                .iter()
                .filter(|c| c.state != CellState::Discarded)
                .count();
            if live < target {
                row.push(Cell {
                    node,
                    state: CellState::OutOfDate,
                });
                changes.push(CellChange {
                    partition: partition as u32,
                    node,
                    state: CellState::OutOfDate,
                });
            }
        }
        changes
    }

    /// Promote a replicated cell and drop any feeding cell for the same
    /// partition. Returns the diff to broadcast.
    pub fn promote(&mut self, partition: u32, node: NodeId) -> Vec<CellChange> {
        let mut changes = Vec::new();
        self.set_cell(partition, node, CellState::UpToDate);
        changes.push(CellChange {
            partition,
            node,
            state: CellState::UpToDate,
        });
        let feeding: Vec<NodeId> = self.rows[partition as usize]
            .iter()
            .filter(|c| c.state == CellState::Feeding)
            .map(|c| c.node)
            .collect();
        for fed in feeding {
            self.remove_cell(partition, fed);
            changes.push(CellChange {
                partition,
                node: fed,
                state: CellState::Discarded,
            });
        }
        changes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(n: u64) -> NodeId {
        NodeId::new(n)
    }

    #[test]
    fn oid_maps_to_partition_by_modulo() {
        let pt = PartitionTable::new(4);
        assert_eq!(pt.partition_of(Oid::new(0)), 0);
        assert_eq!(pt.partition_of(Oid::new(5)), 1);
        assert_eq!(pt.partition_of(Oid::new(7)), 3);
    }

    #[test]
    fn stale_update_is_rejected() {
        let mut pt = PartitionTable::new(1);
        pt.load(
            Ptid::new(7),
            &[(0, vec![Cell { node: node(1), state: CellState::UpToDate }])],
        );
        let change = [CellChange {
            partition: 0,
            node: node(2),
            state: CellState::OutOfDate,
        }];
        assert!(pt.update(Ptid::new(5), &change).is_err());
        assert!(pt.update(Ptid::new(7), &change).is_err());
        assert_eq!(pt.ptid(), Ptid::new(7));
        assert_eq!(pt.cells(0).len(), 1);
        assert!(pt.update(Ptid::new(8), &change).is_ok());
        assert_eq!(pt.cells(0).len(), 2);
    }

    #[test]
    fn selectors_follow_cell_states() {
        let mut pt = PartitionTable::new(1);
        pt.set_cell(0, node(1), CellState::UpToDate);
        pt.set_cell(0, node(2), CellState::OutOfDate);
        pt.set_cell(0, node(3), CellState::Feeding);
        let readable: Vec<NodeId> = pt.readable_cells(0).iter().map(|c| c.node).collect();
        assert_eq!(readable, vec![node(1), node(3)]);
        let writable: Vec<NodeId> = pt.writable_cells(0).iter().map(|c| c.node).collect();
        assert_eq!(writable, vec![node(1), node(2), node(3)]);
    }

    #[test]
    fn operational_requires_a_readable_cell_everywhere() {
        let mut pt = PartitionTable::new(2);
        pt.set_cell(0, node(1), CellState::UpToDate);
        assert!(!pt.operational());
        pt.set_cell(1, node(1), CellState::OutOfDate);
        assert!(!pt.operational());
        pt.set_cell(1, node(1), CellState::UpToDate);
        assert!(pt.operational());
    }

    #[test]
    fn outdate_preserves_last_readable_cell() {
        let mut pt = PartitionTable::new(1);
        pt.set_cell(0, node(1), CellState::UpToDate);
        let changes = pt.outdate(node(1));
        assert!(changes.is_empty());
        assert!(pt.operational());

        pt.set_cell(0, node(2), CellState::UpToDate);
        let changes = pt.outdate(node(1));
        assert_eq!(changes.len(), 1);
        assert_eq!(pt.cells(0)[0].state, CellState::OutOfDate);
        assert!(pt.operational());
    }

    #[test]
    fn promote_drops_feeding_cells() {
        let mut pt = PartitionTable::new(1);
        pt.set_cell(0, node(1), CellState::Feeding);
        pt.set_cell(0, node(2), CellState::OutOfDate);
        let changes = pt.promote(0, node(2));
        assert_eq!(changes.len(), 2);
        assert_eq!(pt.cells(0).len(), 1);
        assert_eq!(pt.cells(0)[0].node, node(2));
        assert_eq!(pt.cells(0)[0].state, CellState::UpToDate);
    }

    #[test]
    fn assign_fills_up_to_replica_target() {
        let mut pt = PartitionTable::new(2);
        pt.make(&[node(1)], 1);
        let changes = pt.assign(node(2), 1);
        assert_eq!(changes.len(), 2);
        for p in 0..2 {
            assert_eq!(pt.cells(p).len(), 2);
        }
        // A third storage finds every partition already at target.
        assert!(pt.assign(node(3), 1).is_empty());
    }
}
