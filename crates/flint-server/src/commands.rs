//! Command dispatch: CLUSTER subcommands, connection routing flags, and
//! the small string keyspace served by the demo data plane.
//!
//! Every handler takes the engine lock held by the caller, applies the
//! change, and returns a reply frame. Data commands are routed first; a
//! redirection becomes the error frame sent to the client verbatim.

use bytes::Bytes;
use flint_cluster::{
    check_slot_arg, key_slot, ClientState, Cluster, ClusterError, DataPlane, MemoryDataPlane,
    NodeId,
};

use crate::resp::Reply;

type Engine = Cluster<MemoryDataPlane>;

fn err(e: ClusterError) -> Reply {
    Reply::Error(format!("ERR {e}"))
}

fn wrong_args(cmd: &str) -> Reply {
    Reply::Error(format!("ERR wrong number of arguments for '{cmd}' command"))
}

/// Dispatches one client command.
pub fn dispatch(
    cluster: &mut Engine,
    argv: &[Bytes],
    client: &mut ClientState,
    now: u64,
) -> Reply {
    let Some(name) = argv.first() else {
        return Reply::Error("ERR empty command".to_string());
    };
    let name = String::from_utf8_lossy(name).to_ascii_uppercase();

    match name.as_str() {
        "PING" => Reply::Simple("PONG".to_string()),
        "ASKING" => {
            client.asking = true;
            Reply::ok()
        }
        "READONLY" => {
            client.readonly = true;
            Reply::ok()
        }
        "READWRITE" => {
            client.readonly = false;
            Reply::ok()
        }
        "CLUSTER" => cluster_command(cluster, &argv[1..], now),
        "GET" | "SET" | "DEL" | "EXISTS" | "MGET" | "MSET" => {
            data_command(cluster, &name, argv, client)
        }
        other => Reply::Error(format!("ERR unknown command '{other}'")),
    }
}

/// Routes then executes one keyspace command against the demo data plane.
fn data_command(
    cluster: &mut Engine,
    name: &str,
    argv: &[Bytes],
    client: &mut ClientState,
) -> Reply {
    let argv_refs: Vec<&[u8]> = argv.iter().map(|b| b.as_ref()).collect();
    let decision = cluster.route(&argv_refs, client);
    // ASKING covers exactly one command
    client.asking = false;
    if let Some(redirect) = decision.redirect(cluster) {
        return Reply::Error(redirect);
    }

    match name {
        "GET" => {
            let [_, key] = argv else { return wrong_args("get") };
            match cluster.data().get(key) {
                Some(value) => Reply::Bulk(value),
                None => Reply::Nil,
            }
        }
        "SET" => {
            let [_, key, value] = argv else { return wrong_args("set") };
            cluster.data_mut().set(key.clone(), value.clone());
            Reply::ok()
        }
        "DEL" => {
            if argv.len() < 2 {
                return wrong_args("del");
            }
            let removed = argv[1..]
                .iter()
                .filter(|key| cluster.data_mut().remove_key(key))
                .count();
            Reply::Int(removed as i64)
        }
        "EXISTS" => {
            if argv.len() < 2 {
                return wrong_args("exists");
            }
            let found = argv[1..]
                .iter()
                .filter(|key| cluster.data().get(key).is_some())
                .count();
            Reply::Int(found as i64)
        }
        "MGET" => {
            if argv.len() < 2 {
                return wrong_args("mget");
            }
            Reply::Array(
                argv[1..]
                    .iter()
                    .map(|key| match cluster.data().get(key) {
                        Some(value) => Reply::Bulk(value),
                        None => Reply::Nil,
                    })
                    .collect(),
            )
        }
        "MSET" => {
            if argv.len() < 3 || argv.len() % 2 == 0 {
                return wrong_args("mset");
            }
            for pair in argv[1..].chunks(2) {
                cluster.data_mut().set(pair[0].clone(), pair[1].clone());
            }
            Reply::ok()
        }
        _ => unreachable!("routed commands are handled above"),
    }
}

fn parse_node_id(arg: &Bytes) -> Result<NodeId, ClusterError> {
    std::str::from_utf8(arg)
        .map_err(|_| ClusterError::InvalidNodeId)
        .and_then(NodeId::parse)
}

fn parse_slot(arg: &Bytes) -> Result<u16, ClusterError> {
    std::str::from_utf8(arg)
        .ok()
        .and_then(|s| s.parse::<u64>().ok())
        .ok_or(ClusterError::InvalidSlot)
        .and_then(check_slot_arg)
}

fn parse_slots(args: &[Bytes]) -> Result<Vec<u16>, ClusterError> {
    args.iter().map(parse_slot).collect()
}

/// CLUSTER subcommand dispatch; `argv` excludes the leading "CLUSTER".
fn cluster_command(cluster: &mut Engine, argv: &[Bytes], now: u64) -> Reply {
    let Some(sub) = argv.first() else {
        return Reply::Error(
            "ERR Wrong CLUSTER subcommand or number of arguments".to_string(),
        );
    };
    let sub = String::from_utf8_lossy(sub).to_ascii_uppercase();
    let args = &argv[1..];

    let result = match (sub.as_str(), args.len()) {
        ("MEET", 2) => {
            let host = String::from_utf8_lossy(&args[0]).to_string();
            let Ok(port) = String::from_utf8_lossy(&args[1]).parse::<u16>() else {
                return Reply::Error(format!(
                    "ERR Invalid TCP port specified: {}",
                    String::from_utf8_lossy(&args[1])
                ));
            };
            cluster.cluster_meet(&host, port, now).map(|_| Reply::ok())
        }
        ("NODES", 0) => Ok(Reply::bulk(cluster.cluster_nodes())),
        ("MYID", 0) => Ok(Reply::bulk(cluster.myself_id().to_string())),
        ("INFO", 0) => Ok(Reply::bulk(cluster.cluster_info())),
        ("SLOTS", 0) => Ok(cluster_slots_reply(cluster)),
        ("SAVECONFIG", 0) => cluster.cluster_saveconfig().map(|_| Reply::ok()),
        ("KEYSLOT", 1) => Ok(Reply::Int(key_slot(&args[0]) as i64)),
        ("COUNTKEYSINSLOT", 1) => parse_slot(&args[0])
            .map(|slot| Reply::Int(cluster.data().count_keys_in_slot(slot) as i64)),
        ("GETKEYSINSLOT", 2) => {
            let slot = parse_slot(&args[0]);
            let count = String::from_utf8_lossy(&args[1]).parse::<usize>().ok();
            match (slot, count) {
                (Ok(slot), Some(count)) => Ok(Reply::Array(
                    cluster
                        .data()
                        .keys_in_slot(slot, count)
                        .into_iter()
                        .map(Reply::Bulk)
                        .collect(),
                )),
                _ => Err(ClusterError::InvalidSlot),
            }
        }
        ("FLUSHSLOTS", 0) => cluster.cluster_flushslots().map(|_| Reply::ok()),
        ("ADDSLOTS", n) if n >= 1 => parse_slots(args)
            .and_then(|slots| cluster.cluster_addslots(&slots))
            .map(|_| Reply::ok()),
        ("DELSLOTS", n) if n >= 1 => parse_slots(args)
            .and_then(|slots| cluster.cluster_delslots(&slots))
            .map(|_| Reply::ok()),
        ("SETSLOT", n) if n == 2 || n == 3 => setslot_command(cluster, args, now),
        ("FORGET", 1) => parse_node_id(&args[0])
            .and_then(|id| cluster.cluster_forget(id, now))
            .map(|_| Reply::ok()),
        ("REPLICATE", 1) => parse_node_id(&args[0])
            .and_then(|id| cluster.cluster_replicate(id, now))
            .map(|_| Reply::ok()),
        ("SLAVES", 1) => parse_node_id(&args[0])
            .and_then(|id| cluster.cluster_slaves(id))
            .map(|lines| Reply::Array(lines.into_iter().map(Reply::bulk).collect())),
        ("COUNT-FAILURE-REPORTS", 1) => parse_node_id(&args[0])
            .and_then(|id| cluster.count_failure_reports_of(id, now))
            .map(|n| Reply::Int(n as i64)),
        ("FAILOVER", n) if n <= 1 => {
            let (force, takeover) = match args.first() {
                None => (false, false),
                Some(opt) => match String::from_utf8_lossy(opt).to_ascii_uppercase().as_str() {
                    "FORCE" => (true, false),
                    "TAKEOVER" => (true, true),
                    _ => return Reply::Error("ERR syntax error".to_string()),
                },
            };
            cluster
                .cluster_failover(force, takeover, now)
                .map(|_| Reply::ok())
        }
        ("SET-CONFIG-EPOCH", 1) => {
            let Ok(epoch) = String::from_utf8_lossy(&args[0]).parse::<u64>() else {
                return Reply::Error(format!(
                    "ERR Invalid config epoch specified: {}",
                    String::from_utf8_lossy(&args[0])
                ));
            };
            cluster
                .cluster_set_config_epoch(epoch, now)
                .map(|_| Reply::ok())
        }
        ("RESET", n) if n <= 1 => {
            let hard = match args.first() {
                None => false,
                Some(opt) => match String::from_utf8_lossy(opt).to_ascii_uppercase().as_str() {
                    "HARD" => true,
                    "SOFT" => false,
                    _ => return Reply::Error("ERR syntax error".to_string()),
                },
            };
            cluster.cluster_reset(hard, now).map(|_| Reply::ok())
        }
        _ => {
            return Reply::Error(
                "ERR Wrong CLUSTER subcommand or number of arguments".to_string(),
            )
        }
    };

    result.unwrap_or_else(err)
}

fn setslot_command(cluster: &mut Engine, args: &[Bytes], now: u64) -> Result<Reply, ClusterError> {
    let slot = parse_slot(&args[0])?;
    let action = String::from_utf8_lossy(&args[1]).to_ascii_uppercase();
    match (action.as_str(), args.len()) {
        ("MIGRATING", 3) => {
            let target = parse_node_id(&args[2])?;
            cluster.cluster_setslot_migrating(slot, target)?;
        }
        ("IMPORTING", 3) => {
            let source = parse_node_id(&args[2])?;
            cluster.cluster_setslot_importing(slot, source)?;
        }
        ("STABLE", 2) => cluster.cluster_setslot_stable(slot)?,
        ("NODE", 3) => {
            let owner = parse_node_id(&args[2])?;
            cluster.cluster_setslot_node(slot, owner, now)?;
        }
        _ => {
            return Ok(Reply::Error(
                "ERR Invalid CLUSTER SETSLOT action or number of arguments".to_string(),
            ))
        }
    }
    Ok(Reply::ok())
}

fn cluster_slots_reply(cluster: &Engine) -> Reply {
    Reply::Array(
        cluster
            .cluster_slots_entries()
            .into_iter()
            .map(|entry| {
                let mut item = vec![
                    Reply::Int(entry.start as i64),
                    Reply::Int(entry.end as i64),
                    Reply::Array(vec![
                        Reply::bulk(entry.master.0),
                        Reply::Int(entry.master.1 as i64),
                        Reply::bulk(entry.master.2.to_string()),
                    ]),
                ];
                for (host, port, id) in entry.replicas {
                    item.push(Reply::Array(vec![
                        Reply::bulk(host),
                        Reply::Int(port as i64),
                        Reply::bulk(id.to_string()),
                    ]));
                }
                Reply::Array(item)
            })
            .collect(),
    )
}
