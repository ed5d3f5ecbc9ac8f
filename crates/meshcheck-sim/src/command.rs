//! Admin command language and remote evaluation.
//!
//! Commands are single lines: a dotted path followed by whitespace-separated
//! arguments, e.g. `space.test.insert 4 2` or `info.vclock[3]`.

use std::str::FromStr;
use std::sync::atomic::Ordering;

use meshcheck_protocol::{InstanceId, Record};

use crate::api::AppState;
use crate::{Result, SimError};

/// Placeholder replaced by eval arguments.
const ARGS_PLACEHOLDER: &str = "...";

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Ping,
    InfoId,
    InfoLsn,
    InfoVclock,
    InfoVclockEntry(InstanceId),
    CfgListen,
    CfgReplication,
    SpaceCreate(String),
    SpaceInsert { space: String, record: Record },
    SpaceLen(String),
    SpaceSelect(String),
    DebugFreeze,
    DebugThaw,
}

fn bad(command: &str, why: &str) -> SimError {
    SimError::Command(format!("malformed command '{command}': {why}"))
}

fn parse_number<T: FromStr>(command: &str, token: Option<&str>, what: &str) -> Result<T> {
    token
        .ok_or_else(|| bad(command, &format!("missing {what}")))?
        .parse()
        .map_err(|_| bad(command, &format!("{what} is not a number")))
}

impl FromStr for Command {
    type Err = SimError;

    fn from_str(s: &str) -> Result<Self> {
        let line = s.trim();
        let mut tokens = line.split_whitespace();
        let head = tokens.next().ok_or_else(|| bad(line, "empty"))?;

        let cmd = match head {
            "ping" => Command::Ping,
            "info.id" => Command::InfoId,
            "info.lsn" => Command::InfoLsn,
            "info.vclock" => Command::InfoVclock,
            "cfg.listen" => Command::CfgListen,
            "cfg.replication" => Command::CfgReplication,
            "debug.freeze" => Command::DebugFreeze,
            "debug.thaw" => Command::DebugThaw,
            "space.create" => {
                let name = tokens.next().ok_or_else(|| bad(line, "missing space name"))?;
                Command::SpaceCreate(name.to_string())
            }
            _ => {
                if let Some(inner) = head
                    .strip_prefix("info.vclock[")
                    .and_then(|rest| rest.strip_suffix(']'))
                {
                    let id = inner
                        .trim()
                        .parse()
                        .map_err(|_| bad(line, "vclock index is not a number"))?;
                    Command::InfoVclockEntry(id)
                } else if let Some(rest) = head.strip_prefix("space.") {
                    let (space, action) = rest
                        .rsplit_once('.')
                        .ok_or_else(|| bad(line, "expected space.<name>.<action>"))?;
                    if space.is_empty() {
                        return Err(bad(line, "empty space name"));
                    }
                    match action {
                        "len" => Command::SpaceLen(space.to_string()),
                        "select" => Command::SpaceSelect(space.to_string()),
                        "insert" => {
                            let row = parse_number(line, tokens.next(), "row")?;
                            let origin = parse_number(line, tokens.next(), "origin")?;
                            Command::SpaceInsert {
                                space: space.to_string(),
                                record: Record { row, origin },
                            }
                        }
                        other => return Err(bad(line, &format!("unknown action '{other}'"))),
                    }
                } else {
                    return Err(SimError::Command(format!("unknown command '{head}'")));
                }
            }
        };

        if tokens.next().is_some() {
            return Err(bad(line, "unexpected trailing arguments"));
        }
        Ok(cmd)
    }
}

/// Run a parsed command against the node.
pub async fn execute(state: &AppState, cmd: Command) -> Result<serde_json::Value> {
    let value = match cmd {
        Command::Ping => serde_json::json!("pong"),
        Command::InfoId => serde_json::json!(state.store.instance_id()?),
        Command::InfoLsn => {
            let id = state.store.instance_id()?.ok_or(SimError::NotBootstrapped)?;
            serde_json::json!(state.store.vclock()?.lsn(id))
        }
        Command::InfoVclock => serde_json::to_value(state.store.vclock()?)?,
        Command::InfoVclockEntry(id) => serde_json::json!(state.store.vclock()?.get(id)),
        Command::CfgListen => serde_json::json!(state.listen),
        Command::CfgReplication => serde_json::json!(*state.sources.read().await),
        Command::SpaceCreate(space) => {
            let entry = state.store.create_space(&space)?;
            serde_json::json!({ "space": space, "lsn": entry.lsn })
        }
        Command::SpaceInsert { space, record } => {
            state.store.insert(&space, record)?;
            serde_json::json!([record.row, record.origin])
        }
        Command::SpaceLen(space) => serde_json::json!(state.store.space_len(&space)?),
        Command::SpaceSelect(space) => {
            let rows: Vec<[u64; 2]> = state
                .store
                .select(&space)?
                .into_iter()
                .map(|r| [r.row, r.origin as u64])
                .collect();
            serde_json::json!(rows)
        }
        Command::DebugFreeze => {
            state.frozen.store(true, Ordering::Relaxed);
            tracing::info!(node = state.name.as_str(), "frozen");
            serde_json::json!(true)
        }
        Command::DebugThaw => {
            state.frozen.store(false, Ordering::Relaxed);
            tracing::info!(node = state.name.as_str(), "thawed");
            serde_json::json!(false)
        }
    };
    Ok(value)
}

/// Evaluate an expression with positional arguments.
///
/// `cfg.replication = ...` replaces the node's replication sources with the
/// string list in `args[0]`. Any other expression has `...` substituted by
/// the space-separated arguments and is run as a command.
pub async fn eval(
    state: &AppState,
    expr: &str,
    args: &[serde_json::Value],
) -> Result<serde_json::Value> {
    let expr = expr.trim();
    if let Some((lhs, rhs)) = expr.split_once('=') {
        if lhs.trim() != "cfg.replication" {
            return Err(SimError::Command(format!(
                "cannot assign to '{}'",
                lhs.trim()
            )));
        }
        let sources = if rhs.trim() == ARGS_PLACEHOLDER {
            args.first()
                .cloned()
                .ok_or_else(|| SimError::Command("cfg.replication = ... needs an argument".into()))?
        } else {
            serde_json::from_str(rhs.trim())?
        };
        let sources: Vec<String> = serde_json::from_value(sources).map_err(|_| {
            SimError::Command("cfg.replication expects a list of addresses".into())
        })?;
        set_replication(state, sources.clone()).await;
        return Ok(serde_json::json!(sources));
    }

    let rendered = if expr.contains(ARGS_PLACEHOLDER) {
        let joined = args.iter().map(render_arg).collect::<Vec<_>>().join(" ");
        expr.replace(ARGS_PLACEHOLDER, &joined)
    } else {
        expr.to_string()
    };
    execute(state, rendered.parse()?).await
}

async fn set_replication(state: &AppState, sources: Vec<String>) {
    let peers = sources.iter().filter(|s| **s != state.listen).count();
    tracing::info!(
        node = state.name.as_str(),
        sources = sources.len(),
        peers,
        "replication sources updated"
    );
    *state.sources.write().await = sources;
}

fn render_arg(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
