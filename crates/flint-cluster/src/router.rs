//! Client request routing.
//!
//! Given a command and its arguments, decide whether this node serves the
//! request or what redirection the client gets instead. All keys of one
//! request must hash to a single slot; resharding states add the ASK /
//! TRYAGAIN cases, and replicas may serve reads for their master's slots
//! when the client opted in with READONLY.

use crate::data::DataPlane;
use crate::engine::Cluster;
use crate::slots::key_slot;
use crate::NodeId;

/// Per-connection routing flags, set by the ASKING / READONLY commands.
#[derive(Debug, Default, Clone, Copy)]
pub struct ClientState {
    /// One-shot permission to hit an importing slot (cleared by the caller
    /// after the next command).
    pub asking: bool,
    /// Connection is in read-only mode and may read from replicas.
    pub readonly: bool,
}

/// Routing verdict for one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteDecision {
    /// Serve locally.
    Serve,
    /// The slot lives elsewhere.
    Moved { slot: u16, node: NodeId },
    /// The slot is leaving this node and the key is already gone.
    Ask { slot: u16, node: NodeId },
    /// Keys span more than one slot.
    CrossSlot,
    /// Multi-key request on an importing slot with some keys missing.
    TryAgain,
    /// The slot is unbound or the cluster is down.
    ClusterDown { unbound: bool },
}

impl RouteDecision {
    /// The redirection string sent to the client verbatim, or `None` when
    /// the request is served locally. Addresses are rendered from the
    /// target's client-facing host and port.
    pub fn redirect<D: DataPlane>(&self, cluster: &Cluster<D>) -> Option<String> {
        match self {
            RouteDecision::Serve => None,
            RouteDecision::Moved { slot, node } => {
                let n = cluster.node(node)?;
                Some(format!("MOVED {slot} {}:{}", n.host, n.port))
            }
            RouteDecision::Ask { slot, node } => {
                let n = cluster.node(node)?;
                Some(format!("ASK {slot} {}:{}", n.host, n.port))
            }
            RouteDecision::CrossSlot => {
                Some("CROSSSLOT Keys in request don't hash to the same slot".to_string())
            }
            RouteDecision::TryAgain => {
                Some("TRYAGAIN Multiple keys request during rehashing of slot".to_string())
            }
            RouteDecision::ClusterDown { unbound: true } => {
                Some("CLUSTERDOWN Hash slot not served".to_string())
            }
            RouteDecision::ClusterDown { unbound: false } => {
                Some("CLUSTERDOWN The cluster is down".to_string())
            }
        }
    }
}

/// Key-index descriptor for a command: which argv positions carry keys.
#[derive(Debug, Clone, Copy)]
pub struct CommandSpec {
    pub name: &'static str,
    /// 1-based index of the first key; 0 means the command carries none.
    pub first_key: usize,
    /// Last key index; negative counts from the end of argv.
    pub last_key: i32,
    /// Distance between consecutive keys (2 for MSET-style pairs).
    pub key_step: usize,
    /// May be served by a read-only replica.
    pub readonly: bool,
    /// May hit an importing slot without a preceding ASKING.
    pub asking_safe: bool,
}

const fn write_cmd(name: &'static str, first: usize, last: i32, step: usize) -> CommandSpec {
    CommandSpec {
        name,
        first_key: first,
        last_key: last,
        key_step: step,
        readonly: false,
        asking_safe: false,
    }
}

const fn read_cmd(name: &'static str, first: usize, last: i32, step: usize) -> CommandSpec {
    CommandSpec {
        name,
        first_key: first,
        last_key: last,
        key_step: step,
        readonly: true,
        asking_safe: false,
    }
}

/// The routed command surface. Commands missing here are treated as
/// keyless and served locally; the command layer rejects what it does not
/// know.
static COMMANDS: &[CommandSpec] = &[
    read_cmd("get", 1, 1, 1),
    write_cmd("set", 1, 1, 1),
    write_cmd("setnx", 1, 1, 1),
    write_cmd("setex", 1, 1, 1),
    write_cmd("append", 1, 1, 1),
    read_cmd("strlen", 1, 1, 1),
    write_cmd("del", 1, -1, 1),
    read_cmd("exists", 1, -1, 1),
    write_cmd("incr", 1, 1, 1),
    write_cmd("decr", 1, 1, 1),
    write_cmd("incrby", 1, 1, 1),
    write_cmd("decrby", 1, 1, 1),
    write_cmd("getset", 1, 1, 1),
    read_cmd("type", 1, 1, 1),
    read_cmd("ttl", 1, 1, 1),
    write_cmd("expire", 1, 1, 1),
    write_cmd("persist", 1, 1, 1),
    read_cmd("mget", 1, -1, 1),
    write_cmd("mset", 1, -1, 2),
    write_cmd("msetnx", 1, -1, 2),
    write_cmd("rename", 1, 2, 1),
    write_cmd("lpush", 1, 1, 1),
    write_cmd("rpush", 1, 1, 1),
    write_cmd("lpop", 1, 1, 1),
    write_cmd("rpop", 1, 1, 1),
    read_cmd("llen", 1, 1, 1),
    read_cmd("lrange", 1, 1, 1),
    write_cmd("rpoplpush", 1, 2, 1),
    write_cmd("sadd", 1, 1, 1),
    write_cmd("srem", 1, 1, 1),
    read_cmd("smembers", 1, 1, 1),
    read_cmd("scard", 1, 1, 1),
    write_cmd("hset", 1, 1, 1),
    read_cmd("hget", 1, 1, 1),
    write_cmd("hdel", 1, 1, 1),
    read_cmd("hgetall", 1, 1, 1),
    write_cmd("zadd", 1, 1, 1),
    read_cmd("zscore", 1, 1, 1),
    read_cmd("zrange", 1, 1, 1),
];

/// Looks up a command's key descriptor, case-insensitively.
pub fn command_spec(name: &str) -> Option<&'static CommandSpec> {
    COMMANDS
        .iter()
        .find(|c| c.name.eq_ignore_ascii_case(name))
}

/// Extracts the key positions of `argv` (which includes the command name
/// at index 0) according to `spec`. Out-of-range descriptors yield what
/// fits; argument arity errors are the command layer's problem.
pub fn extract_keys<'a>(spec: &CommandSpec, argv: &'a [&'a [u8]]) -> Vec<&'a [u8]> {
    if spec.first_key == 0 {
        return Vec::new();
    }
    let last = if spec.last_key < 0 {
        (argv.len() as i32 + spec.last_key) as usize
    } else {
        spec.last_key as usize
    };
    let mut keys = Vec::new();
    let mut i = spec.first_key;
    while i <= last && i < argv.len() {
        keys.push(argv[i]);
        i += spec.key_step;
    }
    keys
}

impl<D: DataPlane> Cluster<D> {
    /// Routes one client request. `argv` includes the command name.
    pub fn route(&self, argv: &[&[u8]], client: &ClientState) -> RouteDecision {
        let Some(name) = argv.first() else {
            return RouteDecision::Serve;
        };
        let name = String::from_utf8_lossy(name);
        let Some(spec) = command_spec(&name) else {
            return RouteDecision::Serve;
        };
        let keys = extract_keys(spec, argv);
        if keys.is_empty() {
            return RouteDecision::Serve;
        }

        // all keys must agree on one slot
        let slot = key_slot(keys[0]);
        let mut multiple_distinct = false;
        for key in &keys[1..] {
            if key_slot(key) != slot {
                return RouteDecision::CrossSlot;
            }
            if *key != keys[0] {
                multiple_distinct = true;
            }
        }

        // an unbound slot cannot be served by anyone; a bound slot is
        // served (or redirected) even while the aggregate state is FAIL,
        // so a partially configured cluster still answers for what it has
        let Some(owner) = self.slot_owner(slot) else {
            return RouteDecision::ClusterDown { unbound: true };
        };

        let migrating = owner == self.myself && self.migrating_to(slot).is_some();
        let importing = self.importing_from(slot).is_some();
        let missing_keys = if migrating || importing {
            keys.iter().filter(|k| !self.data().contains_key(k)).count()
        } else {
            0
        };

        // slot leaving us: keys already moved earn an ASK at the target
        if migrating && missing_keys > 0 {
            let target = self.migrating_to(slot).expect("migrating implies target");
            return RouteDecision::Ask { slot, node: target };
        }

        // slot arriving here: ASKING (or an asking-safe command) lets the
        // client in, unless a multi-key request is split across nodes
        if importing && (client.asking || spec.asking_safe) {
            if multiple_distinct && missing_keys > 0 {
                return RouteDecision::TryAgain;
            }
            return RouteDecision::Serve;
        }

        // replica serving reads for its own master's slots
        if client.readonly
            && spec.readonly
            && !self.myself_is_master()
            && self.myself_master() == Some(owner)
        {
            return RouteDecision::Serve;
        }

        if owner == self.myself {
            RouteDecision::Serve
        } else {
            RouteDecision::Moved { slot, node: owner }
        }
    }
}
