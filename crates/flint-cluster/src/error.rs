//! Error types for cluster operations.

use crate::NodeId;

/// Errors that can occur during cluster operations.
///
/// Operator-command failures carry the human-readable message that is sent
/// back to the client verbatim; none of them mutate cluster state.
#[derive(Debug, thiserror::Error)]
pub enum ClusterError {
    /// A slot number outside `[0, 16383]`.
    #[error("Invalid or out of range slot")]
    InvalidSlot,

    /// The slot already has an owner.
    #[error("Slot {0} is already busy")]
    SlotBusy(u16),

    /// The slot has no owner.
    #[error("Slot {0} is already unassigned")]
    SlotUnassigned(u16),

    /// The same slot appeared twice in one command.
    #[error("Slot {0} specified multiple times")]
    SlotRepeated(u16),

    /// The slot is owned by a different node.
    #[error("I'm not the owner of hash slot {0}")]
    NotSlotOwner(u16),

    /// The slot is already owned by this node.
    #[error("I'm already the owner of hash slot {0}")]
    AlreadySlotOwner(u16),

    /// Keys are still present in a slot that is being given away.
    #[error("Can't assign hashslot {0} to a different node while I still hold keys for this hash slot")]
    SlotNotEmpty(u16),

    /// Node id not present in the node table.
    #[error("Unknown node {0}")]
    UnknownNode(NodeId),

    /// A node id that does not parse as 40 lowercase hex characters.
    #[error("Invalid node id")]
    InvalidNodeId,

    /// CLUSTER FORGET addressed at the local node.
    #[error("I tried hard but I can't forget myself...")]
    ForgetMyself,

    /// CLUSTER FORGET addressed at this replica's master.
    #[error("Can't forget my master!")]
    ForgetMaster,

    /// CLUSTER REPLICATE pointed at the local node.
    #[error("Can't replicate myself")]
    ReplicateMyself,

    /// CLUSTER REPLICATE pointed at a replica.
    #[error("I can only replicate a master, not a replica.")]
    ReplicateReplica,

    /// CLUSTER REPLICATE on a master still holding slots or keys.
    #[error("To set a master the node must be empty and without assigned slots.")]
    ReplicateNotEmpty,

    /// CLUSTER FAILOVER sent to a master.
    #[error("You should send CLUSTER FAILOVER to a replica")]
    FailoverNotReplica,

    /// CLUSTER FAILOVER on a replica with no known master.
    #[error("I'm a replica but my master is unknown to me")]
    FailoverNoMaster,

    /// CLUSTER FAILOVER without FORCE while the master is unreachable.
    #[error("Master is down or failed, please use CLUSTER FAILOVER FORCE")]
    FailoverMasterDown,

    /// SET-CONFIG-EPOCH while other nodes are known.
    #[error("The user can assign a config epoch only when the node does not know any other node.")]
    EpochNotAlone,

    /// SET-CONFIG-EPOCH with a non-zero local epoch.
    #[error("Node config epoch is already non-zero")]
    EpochAlreadySet,

    /// CLUSTER RESET or FLUSHSLOTS on a master holding keys.
    #[error("{0}")]
    NotEmpty(&'static str),

    /// An address that does not parse or a port that would overflow the bus
    /// port range.
    #[error("Invalid node address specified: {0}")]
    InvalidAddress(String),

    /// Failure persisting the node-view snapshot.
    #[error("error saving the cluster node config: {0}")]
    Persist(#[from] std::io::Error),

    /// The node-view snapshot on disk is corrupted.
    #[error("corrupted cluster config file: {0}")]
    CorruptConfig(String),

    /// The node-view file is locked by another process.
    #[error("cluster config file {0} is in use by another process")]
    ConfigLocked(String),
}
