//! Rank and world size from the SLURM job environment.

use tracing::debug;

use crate::error::{Result, TrainError};

/// Expand a compressed SLURM hostlist such as `gpu[01-03,07],cpu5`.
///
/// Zero padding of range bounds is preserved.
pub fn expand_hostlist(list: &str) -> Result<Vec<String>> {
    let mut hosts = Vec::new();
    for item in split_top_level(list) {
        let item = item.trim();
        if item.is_empty() {
            continue;
        }
        match (item.find('['), item.rfind(']')) {
            (Some(open), Some(close)) if open < close => {
                let prefix = &item[..open];
                let suffix = &item[close + 1..];
                for part in item[open + 1..close].split(',') {
                    for n in expand_range(part)? {
                        hosts.push(format!("{prefix}{n}{suffix}"));
                    }
                }
            }
            (None, None) => hosts.push(item.to_string()),
            _ => return Err(TrainError::Env(format!("malformed hostlist entry '{item}'"))),
        }
    }
    Ok(hosts)
}

/// Split on commas that are not inside brackets.
fn split_top_level(list: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut depth = 0usize;
    let mut start = 0;
    for (i, c) in list.char_indices() {
        match c {
            '[' => depth += 1,
            ']' => depth = depth.saturating_sub(1),
            ',' if depth == 0 => {
                parts.push(&list[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    parts.push(&list[start..]);
    parts
}

fn expand_range(part: &str) -> Result<Vec<String>> {
    let bad = || TrainError::Env(format!("malformed hostlist range '{part}'"));
    let (lo, hi) = part.split_once('-').unwrap_or((part, part));
    let width = lo.len();
    let lo: u64 = lo.parse().map_err(|_| bad())?;
    let hi: u64 = hi.parse().map_err(|_| bad())?;
    if hi < lo {
        return Err(bad());
    }
    Ok((lo..=hi).map(|n| format!("{n:0width$}")).collect())
}

/// Placement of this process in a SLURM job, one process per GPU.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlurmEnv {
    /// Expanded and sorted node names.
    pub nodes: Vec<String>,
    pub nnodes: usize,
    pub node_id: usize,
    pub local_id: usize,
    pub gpus_per_node: usize,
}

impl SlurmEnv {
    /// Read the job layout from the process environment. Returns `Ok(None)`
    /// outside a SLURM allocation.
    pub fn from_env(gpus_per_node: Option<usize>) -> Result<Option<Self>> {
        Self::from_lookup(|k| std::env::var(k).ok(), gpus_per_node)
    }

    /// `SLURM_GPUS_ON_NODE` wins over `gpus_per_node`, which is the fallback
    /// for allocations that do not export it.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>, gpus_per_node: Option<usize>) -> Result<Option<Self>> {
        let Some(nodelist) = lookup("SLURM_JOB_NODELIST") else {
            return Ok(None);
        };
        let int = |key: &str| -> Result<Option<usize>> {
            lookup(key)
                .map(|v| {
                    v.trim()
                        .parse::<usize>()
                        .map_err(|_| TrainError::Env(format!("{key}='{v}' is not a number")))
                })
                .transpose()
        };

        let mut nodes = expand_hostlist(&nodelist)?;
        nodes.sort();
        if nodes.is_empty() {
            return Err(TrainError::Env("SLURM_JOB_NODELIST is empty".into()));
        }
        let nnodes = int("SLURM_NNODES")?.unwrap_or(nodes.len());
        let node_id = int("SLURM_NODEID")?.unwrap_or(0);
        let local_id = int("SLURM_LOCALID")?.unwrap_or(0);
        let gpus_per_node = int("SLURM_GPUS_ON_NODE")?.or(gpus_per_node).unwrap_or(1).max(1);

        if node_id >= nnodes {
            return Err(TrainError::Env(format!("SLURM_NODEID {node_id} >= SLURM_NNODES {nnodes}")));
        }
        if local_id >= gpus_per_node {
            return Err(TrainError::Env(format!(
                "SLURM_LOCALID {local_id} >= {gpus_per_node} GPUs per node"
            )));
        }

        let env = Self { nodes, nnodes, node_id, local_id, gpus_per_node };
        debug!(?env, "SLURM environment");
        Ok(Some(env))
    }

    /// Host of rank 0: the first node of the sorted node list.
    pub fn coordinator(&self) -> &str {
        &self.nodes[0]
    }

    pub fn rank(&self) -> usize {
        self.node_id * self.gpus_per_node + self.local_id
    }

    pub fn world_size(&self) -> usize {
        self.nnodes * self.gpus_per_node
    }

    pub fn init_url(&self, port: u16) -> String {
        format!("tcp://{}:{port}", self.coordinator())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::collections::HashMap;

    #[test]
    fn test_expand_hostlist() {
        assert_eq!(
            expand_hostlist("gpu[01-03,07],cpu5").unwrap(),
            vec!["gpu01", "gpu02", "gpu03", "gpu07", "cpu5"]
        );
        assert_eq!(expand_hostlist("node-a").unwrap(), vec!["node-a"]);
        assert_eq!(expand_hostlist("n[8-10]x").unwrap(), vec!["n8x", "n9x", "n10x"]);
        assert!(expand_hostlist("gpu[3-1]").is_err());
        assert!(expand_hostlist("gpu[01").is_err());
    }

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        move |k| map.get(k).cloned()
    }

    #[test]
    fn test_rank_and_world_size() {
        let env = SlurmEnv::from_lookup(
            lookup(&[
                ("SLURM_JOB_NODELIST", "gpu[02,01]"),
                ("SLURM_NNODES", "2"),
                ("SLURM_NODEID", "1"),
                ("SLURM_LOCALID", "2"),
            ]),
            Some(4),
        )
        .unwrap()
        .unwrap();

        assert_eq!(env.rank(), 6);
        assert_eq!(env.world_size(), 8);
        assert_eq!(env.coordinator(), "gpu01");
        assert_eq!(env.init_url(29500), "tcp://gpu01:29500");
    }

    #[test]
    fn test_gpus_on_node_overrides_fallback() {
        let env = SlurmEnv::from_lookup(
            lookup(&[("SLURM_JOB_NODELIST", "a"), ("SLURM_GPUS_ON_NODE", "2")]),
            Some(8),
        )
        .unwrap()
        .unwrap();
        assert_eq!(env.world_size(), 2);
    }

    #[test]
    fn test_outside_slurm() {
        assert!(SlurmEnv::from_lookup(lookup(&[]), None).unwrap().is_none());
    }

    #[test]
    fn test_inconsistent_ids_are_rejected() {
        let res = SlurmEnv::from_lookup(
            lookup(&[("SLURM_JOB_NODELIST", "a"), ("SLURM_NNODES", "1"), ("SLURM_NODEID", "1")]),
            Some(1),
        );
        assert!(res.is_err());
    }
}
