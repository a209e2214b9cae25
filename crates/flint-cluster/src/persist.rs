//! The persisted node view ("nodes file").
//!
//! A line-oriented text snapshot, one line per known node (handshake
//! entries excluded) plus a trailing `vars` line with `currentEpoch` and
//! `lastVoteEpoch`. The same rendering backs the NODES operator command.
//!
//! Writes go in place over the existing descriptor: the new payload is
//! padded with newlines up to the old length (blank lines are ignored on
//! parse), written with a single write, then the file is truncated to the
//! payload length. A crash mid-write therefore leaves either the old or
//! the new content parseable. An exclusive advisory lock taken at open is
//! held by the struct for the process lifetime, guaranteeing one writer
//! per nodes file.

use std::fs::{File, OpenOptions, TryLockError};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::PathBuf;

use tracing::warn;

use crate::data::DataPlane;
use crate::engine::Cluster;
use crate::node::{LinkState, Node, NodeFlags};
use crate::{ClusterError, NodeId};

/// The locked nodes file. Dropping it releases the lock, so the engine
/// keeps it alive for as long as the process runs.
pub struct NodesConfig {
    path: PathBuf,
    file: File,
}

impl NodesConfig {
    /// Opens (creating if needed) and exclusively locks the nodes file.
    ///
    /// Returns the lock holder and the current content, or `None` when the
    /// file is empty — a zero-byte file is the legal "lock sentinel" state
    /// meaning no prior configuration exists.
    pub fn open(path: PathBuf) -> Result<(Self, Option<String>), ClusterError> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;
        match file.try_lock() {
            Ok(()) => {}
            Err(TryLockError::WouldBlock) => {
                return Err(ClusterError::ConfigLocked(path.display().to_string()));
            }
            Err(TryLockError::Error(err)) => return Err(ClusterError::Persist(err)),
        }
        let mut content = String::new();
        file.read_to_string(&mut content)?;
        let content = if content.is_empty() { None } else { Some(content) };
        Ok((Self { path, file }, content))
    }

    /// Rewrites the file in place with the padded-write-then-truncate
    /// protocol described in the module docs.
    pub fn save(&mut self, payload: &str, fsync: bool) -> Result<(), std::io::Error> {
        let old_len = self.file.metadata()?.len() as usize;
        let mut buf = payload.as_bytes().to_vec();
        if old_len > buf.len() {
            buf.resize(old_len, b'\n');
        }
        self.file.seek(SeekFrom::Start(0))?;
        self.file.write_all(&buf)?;
        if fsync {
            self.file.sync_data()?;
        }
        if buf.len() != payload.len() {
            self.file.set_len(payload.len() as u64)?;
        }
        Ok(())
    }

    pub fn path(&self) -> &std::path::Path {
        &self.path
    }
}

/// Renders one node line:
/// `<id> <host>:<bus-port> <flags> <master|-> <ping-sent> <pong-received>
/// <configEpoch> <link-state> <slots...>`, with `[slot->-target]` /
/// `[slot-<-source]` reshard markers appended for the local node only.
pub(crate) fn format_node_line<D: DataPlane>(cluster: &Cluster<D>, node: &Node) -> String {
    let mut line = format!(
        "{} {}:{} {} {} {} {} {} {}",
        node.id,
        node.host,
        node.bus_port(cluster.config().bus_port_offset),
        node.flags,
        node.replicates
            .map(|m| m.to_string())
            .unwrap_or_else(|| "-".to_string()),
        node.ping_sent,
        node.pong_received,
        node.config_epoch,
        if node.link.is_connected() || node.flags.contains(NodeFlags::MYSELF) {
            "connected"
        } else {
            "disconnected"
        },
    );
    for range in node.slots.ranges() {
        line.push(' ');
        line.push_str(&range.to_string());
    }
    if node.flags.contains(NodeFlags::MYSELF) {
        for slot in 0..crate::slots::SLOT_COUNT {
            if let Some(target) = cluster.migrating_to(slot) {
                line.push_str(&format!(" [{slot}->-{target}]"));
            } else if let Some(source) = cluster.importing_from(slot) {
                line.push_str(&format!(" [{slot}-<-{source}]"));
            }
        }
    }
    line
}

/// Renders the full snapshot: every non-handshake node plus the vars line.
pub(crate) fn format_nodes<D: DataPlane>(cluster: &Cluster<D>) -> String {
    let mut out = String::new();
    let mut nodes: Vec<&Node> = cluster
        .nodes_iter()
        .filter(|n| !n.in_handshake())
        .collect();
    nodes.sort_by_key(|n| n.id);
    for node in nodes {
        out.push_str(&format_node_line(cluster, node));
        out.push('\n');
    }
    out.push_str(&format!(
        "vars currentEpoch {} lastVoteEpoch {}\n",
        cluster.current_epoch(),
        cluster.last_vote_epoch
    ));
    out
}

/// Rebuilds cluster state from a snapshot into a freshly created engine.
///
/// Malformed content is configuration corruption: the error is returned
/// and the caller is expected to abort rather than run with a guessed
/// view.
pub(crate) fn load_into<D: DataPlane>(
    cluster: &mut Cluster<D>,
    content: &str,
    now: u64,
) -> Result<(), ClusterError> {
    let corrupt = |msg: &str| ClusterError::CorruptConfig(msg.to_string());
    let mut myself: Option<NodeId> = None;

    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let fields: Vec<&str> = line.split_whitespace().collect();

        if fields[0] == "vars" {
            let mut i = 1;
            while i + 1 < fields.len() {
                match fields[i] {
                    "currentEpoch" => {
                        cluster.current_epoch = fields[i + 1]
                            .parse()
                            .map_err(|_| corrupt("bad currentEpoch"))?;
                    }
                    "lastVoteEpoch" => {
                        cluster.last_vote_epoch = fields[i + 1]
                            .parse()
                            .map_err(|_| corrupt("bad lastVoteEpoch"))?;
                    }
                    other => warn!(var = other, "skipping unknown nodes-file variable"),
                }
                i += 2;
            }
            continue;
        }

        if fields.len() < 8 {
            return Err(corrupt("node line has too few fields"));
        }

        let id = NodeId::parse(fields[0]).map_err(|_| corrupt("bad node id"))?;
        if !cluster.nodes.contains(&id) {
            cluster.nodes.insert(Node::new(id, NodeFlags::default(), now));
        }

        // address: host:bus-port; the client port is offset below it
        let (host, bus_port) = fields[1]
            .rsplit_once(':')
            .ok_or_else(|| corrupt("bad address field"))?;
        let bus_port: u16 = bus_port.parse().map_err(|_| corrupt("bad bus port"))?;
        let port = bus_port.saturating_sub(cluster.config.bus_port_offset);

        let flags = NodeFlags::parse(fields[2]).map_err(|_| corrupt("bad flags"))?;
        if flags.contains(NodeFlags::MYSELF) {
            if myself.is_some() {
                return Err(corrupt("more than one myself node"));
            }
            myself = Some(id);
        }

        let master = match fields[3] {
            "-" => None,
            m => Some(NodeId::parse(m).map_err(|_| corrupt("bad master id"))?),
        };

        let ping_sent: u64 = fields[4].parse().map_err(|_| corrupt("bad ping-sent"))?;
        let pong_received: u64 = fields[5]
            .parse()
            .map_err(|_| corrupt("bad pong-received"))?;
        let config_epoch: u64 = fields[6]
            .parse()
            .map_err(|_| corrupt("bad configEpoch"))?;

        {
            let node = cluster.nodes.get_mut(&id).expect("inserted above");
            node.host = host.to_string();
            node.port = port;
            node.flags = flags;
            node.config_epoch = config_epoch;
            // wall-clock timestamps do not survive restarts; nonzero values
            // just mean "recently active"
            node.ping_sent = if ping_sent != 0 { now } else { 0 };
            node.pong_received = if pong_received != 0 { now } else { 0 };
            if flags.contains(NodeFlags::FAIL) {
                node.fail_time = now;
            }
        }

        if let Some(master_id) = master {
            if !cluster.nodes.contains(&master_id) {
                cluster
                    .nodes
                    .insert(Node::new(master_id, NodeFlags::default(), now));
            }
            cluster.nodes.get_mut(&id).expect("inserted above").replicates = Some(master_id);
            let m = cluster.nodes.get_mut(&master_id).expect("inserted above");
            if !m.replicas.contains(&id) {
                m.replicas.push(id);
            }
        }

        for field in &fields[8..] {
            if let Some(rest) = field.strip_prefix('[') {
                let rest = rest.strip_suffix(']').ok_or_else(|| corrupt("bad reshard marker"))?;
                let (slot_str, dir_and_id) = rest
                    .split_once('-')
                    .ok_or_else(|| corrupt("bad reshard marker"))?;
                let slot: u16 = slot_str.parse().map_err(|_| corrupt("bad reshard slot"))?;
                if slot >= crate::slots::SLOT_COUNT {
                    return Err(corrupt("reshard slot out of range"));
                }
                let (dir, peer) = dir_and_id
                    .split_at_checked(2)
                    .ok_or_else(|| corrupt("bad reshard marker"))?;
                let peer = NodeId::parse(peer).map_err(|_| corrupt("bad reshard node id"))?;
                if !cluster.nodes.contains(&peer) {
                    cluster
                        .nodes
                        .insert(Node::new(peer, NodeFlags::default(), now));
                }
                match dir {
                    ">-" => cluster.slot_map.set_migrating_to(slot, Some(peer)),
                    "<-" => cluster.slot_map.set_importing_from(slot, Some(peer)),
                    _ => return Err(corrupt("bad reshard direction")),
                }
                continue;
            }
            let (start, end) = match field.split_once('-') {
                Some((a, b)) => (
                    a.parse().map_err(|_| corrupt("bad slot range"))?,
                    b.parse().map_err(|_| corrupt("bad slot range"))?,
                ),
                None => {
                    let s: u16 = field.parse().map_err(|_| corrupt("bad slot"))?;
                    (s, s)
                }
            };
            if start > end || end >= crate::slots::SLOT_COUNT {
                return Err(corrupt("slot range out of bounds"));
            }
            for slot in start..=end {
                cluster
                    .add_slot(id, slot)
                    .map_err(|_| corrupt("slot assigned twice"))?;
            }
        }
    }

    let myself = myself.ok_or_else(|| corrupt("no myself node in config"))?;
    cluster.myself = myself;
    // links always start down after a restart
    for node in cluster.nodes.iter_mut() {
        node.link = LinkState::Disconnected;
    }
    // guard against hand-edited files: the logical clock never trails the
    // largest known configEpoch
    let max_epoch = cluster.max_epoch();
    if max_epoch > cluster.current_epoch {
        cluster.current_epoch = max_epoch;
    }
    Ok(())
}
