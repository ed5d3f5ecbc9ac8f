//! Command templates for the system under test.
//!
//! The harness never hard-codes command text: every admin/eval call is
//! rendered from a template. Placeholders: `{space}`, `{id}`, `{row}`,
//! `{origin}`. The defaults speak the `meshcheck-sim` command language.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Dialect {
    /// Dataset the workload writes into.
    #[serde(default = "default_space")]
    pub space: String,
    /// Readiness probe; any successful reply counts.
    #[serde(default = "default_ping")]
    pub ping: String,
    /// Returns the instance id (integer).
    #[serde(default = "default_node_id")]
    pub node_id: String,
    /// Returns the replication listen address (string).
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Returns the node's own write position (integer).
    #[serde(default = "default_own_lsn")]
    pub own_lsn: String,
    /// Returns the clock entry for `{id}`, `null` when undefined.
    #[serde(default = "default_clock_entry")]
    pub clock_entry: String,
    #[serde(default = "default_dataset_size")]
    pub dataset_size: String,
    /// Returns every record as `[row, origin]` pairs.
    #[serde(default = "default_dataset_dump")]
    pub dataset_dump: String,
    #[serde(default = "default_insert")]
    pub insert: String,
    /// Eval expression; the source list is passed as the first argument.
    #[serde(default = "default_set_sources")]
    pub set_sources: String,
    /// Admin commands run on the master right after it is deployed.
    #[serde(default)]
    pub master_setup: Vec<String>,
    /// Admin commands run on the master before the workload.
    #[serde(default = "default_schema_setup")]
    pub schema_setup: Vec<String>,
}

fn default_space() -> String {
    "test".into()
}
fn default_ping() -> String {
    "ping".into()
}
fn default_node_id() -> String {
    "info.id".into()
}
fn default_listen() -> String {
    "cfg.listen".into()
}
fn default_own_lsn() -> String {
    "info.lsn".into()
}
fn default_clock_entry() -> String {
    "info.vclock[{id}]".into()
}
fn default_dataset_size() -> String {
    "space.{space}.len".into()
}
fn default_dataset_dump() -> String {
    "space.{space}.select".into()
}
fn default_insert() -> String {
    "space.{space}.insert {row} {origin}".into()
}
fn default_set_sources() -> String {
    "cfg.replication = ...".into()
}
fn default_schema_setup() -> Vec<String> {
    vec!["space.create {space}".into()]
}

impl Default for Dialect {
    fn default() -> Self {
        Self {
            space: default_space(),
            ping: default_ping(),
            node_id: default_node_id(),
            listen: default_listen(),
            own_lsn: default_own_lsn(),
            clock_entry: default_clock_entry(),
            dataset_size: default_dataset_size(),
            dataset_dump: default_dataset_dump(),
            insert: default_insert(),
            set_sources: default_set_sources(),
            master_setup: Vec::new(),
            schema_setup: default_schema_setup(),
        }
    }
}

impl Dialect {
    /// Substitute `{space}` and the given placeholders into `template`.
    pub fn render(&self, template: &str, vars: &[(&str, String)]) -> String {
        let mut out = template.replace("{space}", &self.space);
        for (key, value) in vars {
            out = out.replace(&format!("{{{key}}}"), value);
        }
        out
    }
}
