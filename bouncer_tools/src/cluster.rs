//! Minimal extraction of the stolon clusterdata document. Whenever stolon is
//! upgraded this definition should be checked for compatibility; parsing
//! tolerates any fields we do not model.

use std::collections::HashMap;
use std::fmt;

use anyhow::{bail, Context};
use serde::Deserialize;

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct Clusterdata {
    pub cluster: Cluster,
    pub proxy: Proxy,
    pub dbs: HashMap<String, Db>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct Cluster {
    pub spec: ClusterSpec,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct ClusterSpec {
    #[serde(rename = "synchronousReplication")]
    pub synchronous_replication: bool,
    #[serde(rename = "minSynchronousStandbys")]
    pub min_synchronous_standbys: u32,
    #[serde(rename = "sleepInterval")]
    pub sleep_interval: String,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct Proxy {
    pub spec: ProxySpec,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct ProxySpec {
    #[serde(rename = "masterDbUid")]
    pub master_db_uid: String,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct Db {
    pub spec: DbSpec,
    pub status: DbStatus,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct DbSpec {
    #[serde(rename = "keeperUID")]
    pub keeper_uid: String,
    #[serde(rename = "externalSynchronousStandbys")]
    pub external_synchronous_standbys: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct DbStatus {
    pub healthy: bool,
    #[serde(rename = "listenAddress")]
    pub listen_address: String,
    pub port: String,
    #[serde(rename = "synchronousStandbys")]
    pub synchronous_standbys: Vec<String>,
}

impl fmt::Display for Db {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.spec.keeper_uid, self.status.listen_address)
    }
}

#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum ClusterHealthError {
    #[error("no master")]
    NoMaster,
    #[error("master unhealthy")]
    MasterUnhealthy,
    #[error("insufficient standbys")]
    InsufficientSyncStandbys,
    #[error("insufficient standbys for failure")]
    InsufficientStandbysForFailure,
}

impl Clusterdata {
    pub fn parse(bytes: &[u8]) -> serde_json::Result<Clusterdata> {
        serde_json::from_slice(bytes)
    }

    /// The db the proxy routes writes to, if the proxy points anywhere.
    pub fn master(&self) -> Option<&Db> {
        if self.proxy.spec.master_db_uid.is_empty() {
            return None;
        }
        self.dbs.get(&self.proxy.spec.master_db_uid)
    }

    /// DBs configured as sync replicas of the current primary, ordered by the
    /// master's standby list followed by its external standby list. UIDs that
    /// point at no known db are dropped.
    pub fn synchronous_standbys(&self) -> Vec<&Db> {
        let Some(master) = self.master() else {
            return Vec::new();
        };

        let mut dbs: Vec<&Db> = master
            .status
            .synchronous_standbys
            .iter()
            .filter_map(|uid| self.dbs.get(uid))
            .collect();

        for keeper_uid in &master.spec.external_synchronous_standbys {
            dbs.extend(
                self.dbs
                    .values()
                    .find(|db| &db.spec.keeper_uid == keeper_uid),
            );
        }

        dbs
    }

    /// Every db that is neither the master nor one of its sync standbys.
    pub fn asynchronous_standbys(&self) -> Vec<&Db> {
        let master_keeper = self.master().map(|db| db.spec.keeper_uid.as_str());
        let sync_keepers: Vec<&str> = self
            .synchronous_standbys()
            .iter()
            .map(|db| db.spec.keeper_uid.as_str())
            .collect();

        self.dbs
            .values()
            .filter(|db| {
                Some(db.spec.keeper_uid.as_str()) != master_keeper
                    && !sync_keepers.contains(&db.spec.keeper_uid.as_str())
            })
            .collect()
    }

    pub fn databases(&self) -> Vec<&Db> {
        self.dbs.values().collect()
    }

    pub fn listen_addresses(&self) -> Vec<&str> {
        self.dbs
            .values()
            .map(|db| db.status.listen_address.as_str())
            .collect()
    }

    /// Decides whether the cluster could lose `tolerate_failures` keepers and
    /// still accept writes. Sync standbys count first against the configured
    /// minimum; healthy asyncs then pad the failure budget.
    pub fn check_healthy(&self, tolerate_failures: u32) -> Result<(), ClusterHealthError> {
        let master = self.master().ok_or(ClusterHealthError::NoMaster)?;
        if !master.status.healthy {
            return Err(ClusterHealthError::MasterUnhealthy);
        }

        let min = i64::from(self.cluster.spec.min_synchronous_standbys);
        let mut healthy = self
            .synchronous_standbys()
            .iter()
            .filter(|db| db.status.healthy)
            .count() as i64;

        if healthy < min {
            return Err(ClusterHealthError::InsufficientSyncStandbys);
        }

        healthy += self
            .asynchronous_standbys()
            .iter()
            .filter(|db| db.status.healthy)
            .count() as i64;

        if healthy - min < i64::from(tolerate_failures) {
            return Err(ClusterHealthError::InsufficientStandbysForFailure);
        }

        Ok(())
    }
}

/// Replaces the JSON string value at `path` (a chain of object keys) with
/// `new_value`, splicing bytes in place so every other byte of the document
/// survives verbatim. Returns the patched document and the previous raw value
/// exactly as it appeared between its quotes, suitable for the inverse patch.
///
/// The document's schema may gain fields we know nothing about, so this never
/// decodes and re-encodes; it only scans far enough to locate the target.
pub fn patch_string_field(
    doc: &[u8],
    path: &[&str],
    new_value: &str,
) -> anyhow::Result<(Vec<u8>, String)> {
    let mut scanner = Scanner { doc, pos: 0 };
    let (start, end) = scanner
        .find_string_value(path)
        .with_context(|| format!("failed to locate {} in document", path.join(".")))?;

    let previous = std::str::from_utf8(&doc[start + 1..end - 1])
        .context("field value is not valid utf-8")?
        .to_string();

    let mut patched = Vec::with_capacity(doc.len() + new_value.len());
    patched.extend_from_slice(&doc[..start + 1]);
    patched.extend_from_slice(new_value.as_bytes());
    patched.extend_from_slice(&doc[end - 1..]);

    Ok((patched, previous))
}

/// Just enough of a JSON scanner to find the byte range of one string value.
struct Scanner<'a> {
    doc: &'a [u8],
    pos: usize,
}

impl<'a> Scanner<'a> {
    fn peek(&self) -> anyhow::Result<u8> {
        self.doc
            .get(self.pos)
            .copied()
            .context("unexpected end of document")
    }

    fn skip_whitespace(&mut self) {
        while matches!(self.doc.get(self.pos), Some(b' ' | b'\t' | b'\n' | b'\r')) {
            self.pos += 1;
        }
    }

    fn expect(&mut self, byte: u8) -> anyhow::Result<()> {
        let got = self.peek()?;
        if got != byte {
            bail!(
                "expected {:?} at offset {}, found {:?}",
                byte as char,
                self.pos,
                got as char
            );
        }
        self.pos += 1;
        Ok(())
    }

    /// Consumes a string token, returning the byte range including quotes.
    fn parse_string(&mut self) -> anyhow::Result<(usize, usize)> {
        let start = self.pos;
        self.expect(b'"')?;
        loop {
            match self.peek()? {
                b'\\' => self.pos += 2,
                b'"' => {
                    self.pos += 1;
                    return Ok((start, self.pos));
                }
                _ => self.pos += 1,
            }
        }
    }

    fn skip_value(&mut self) -> anyhow::Result<()> {
        self.skip_whitespace();
        match self.peek()? {
            b'"' => {
                self.parse_string()?;
            }
            b'{' => {
                self.pos += 1;
                self.skip_whitespace();
                if self.peek()? == b'}' {
                    self.pos += 1;
                    return Ok(());
                }
                loop {
                    self.skip_whitespace();
                    self.parse_string()?;
                    self.skip_whitespace();
                    self.expect(b':')?;
                    self.skip_value()?;
                    self.skip_whitespace();
                    match self.peek()? {
                        b',' => self.pos += 1,
                        b'}' => {
                            self.pos += 1;
                            return Ok(());
                        }
                        other => bail!("malformed object: unexpected {:?}", other as char),
                    }
                }
            }
            b'[' => {
                self.pos += 1;
                self.skip_whitespace();
                if self.peek()? == b']' {
                    self.pos += 1;
                    return Ok(());
                }
                loop {
                    self.skip_value()?;
                    self.skip_whitespace();
                    match self.peek()? {
                        b',' => self.pos += 1,
                        b']' => {
                            self.pos += 1;
                            return Ok(());
                        }
                        other => bail!("malformed array: unexpected {:?}", other as char),
                    }
                }
            }
            // Numbers, booleans and null all end at a structural character.
            _ => {
                while !matches!(
                    self.doc.get(self.pos),
                    None | Some(b',' | b'}' | b']' | b' ' | b'\t' | b'\n' | b'\r')
                ) {
                    self.pos += 1;
                }
            }
        }
        Ok(())
    }

    /// Positioned at an object, descends `path` and returns the byte range of
    /// the string value at its end.
    fn find_string_value(&mut self, path: &[&str]) -> anyhow::Result<(usize, usize)> {
        let (target, rest) = path.split_first().context("empty path")?;

        self.skip_whitespace();
        self.expect(b'{')?;
        loop {
            self.skip_whitespace();
            if self.peek()? == b'}' {
                bail!("key {target:?} not present");
            }

            let (key_start, key_end) = self.parse_string()?;
            let key = &self.doc[key_start + 1..key_end - 1];
            self.skip_whitespace();
            self.expect(b':')?;

            if key == target.as_bytes() {
                return if rest.is_empty() {
                    self.skip_whitespace();
                    if self.peek()? != b'"' {
                        bail!("value of {target:?} is not a string");
                    }
                    self.parse_string()
                } else {
                    self.find_string_value(rest)
                };
            }

            self.skip_value()?;
            self.skip_whitespace();
            match self.peek()? {
                b',' => self.pos += 1,
                b'}' => bail!("key {target:?} not present"),
                other => bail!("malformed object: unexpected {:?}", other as char),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keeper(uid: &str, healthy: bool, synchronous_standbys: &[&str]) -> Db {
        Db {
            spec: DbSpec {
                keeper_uid: uid.to_string(),
                external_synchronous_standbys: Vec::new(),
            },
            status: DbStatus {
                healthy,
                listen_address: format!("10.0.0.{}", uid.len()),
                port: "5432".to_string(),
                synchronous_standbys: synchronous_standbys
                    .iter()
                    .map(|s| s.to_string())
                    .collect(),
            },
        }
    }

    fn three_keeper_cluster(
        keeper0: Db,
        keeper1: Db,
        keeper2: Db,
        min_synchronous_standbys: u32,
    ) -> Clusterdata {
        Clusterdata {
            cluster: Cluster {
                spec: ClusterSpec {
                    synchronous_replication: true,
                    min_synchronous_standbys,
                    sleep_interval: "5s".to_string(),
                },
            },
            proxy: Proxy {
                spec: ProxySpec {
                    master_db_uid: "keeper0".to_string(),
                },
            },
            dbs: HashMap::from([
                ("keeper0".to_string(), keeper0),
                ("keeper1".to_string(), keeper1),
                ("keeper2".to_string(), keeper2),
            ]),
        }
    }

    #[test]
    fn parse_tolerates_unknown_fields() {
        let doc = br#"{
            "formatVersion": 1,
            "changeTime": "2019-03-20T14:02:53.506335546Z",
            "cluster": {
                "spec": {
                    "synchronousReplication": true,
                    "minSynchronousStandbys": 1,
                    "maxSynchronousStandbys": 1,
                    "sleepInterval": "5s",
                    "failInterval": "20s"
                },
                "status": {"phase": "normal"}
            },
            "proxy": {"spec": {"masterDbUid": "abc123"}},
            "dbs": {
                "abc123": {
                    "spec": {"keeperUID": "keeper0", "initMode": "none"},
                    "status": {
                        "healthy": true,
                        "listenAddress": "10.0.0.1",
                        "port": "5432",
                        "synchronousStandbys": ["def456"],
                        "currentGeneration": 3
                    }
                },
                "def456": {
                    "spec": {"keeperUID": "keeper1"},
                    "status": {"healthy": true, "listenAddress": "10.0.0.2", "port": "5432"}
                }
            }
        }"#;

        let clusterdata = Clusterdata::parse(doc).unwrap();
        let master = clusterdata.master().unwrap();
        assert_eq!(master.spec.keeper_uid, "keeper0");
        assert_eq!(master.status.listen_address, "10.0.0.1");

        let standbys = clusterdata.synchronous_standbys();
        assert_eq!(standbys.len(), 1);
        assert_eq!(standbys[0].spec.keeper_uid, "keeper1");
    }

    #[test]
    fn master_absent_when_proxy_unset() {
        let clusterdata = Clusterdata::parse(br#"{"dbs": {}}"#).unwrap();
        assert!(clusterdata.master().is_none());
        assert_eq!(
            clusterdata.check_healthy(1),
            Err(ClusterHealthError::NoMaster)
        );
    }

    #[test]
    fn synchronous_standbys_ordered_and_external_appended() {
        let mut keeper0 = keeper("keeper0", true, &["k2", "k1"]);
        keeper0.spec.external_synchronous_standbys = vec!["keeper3".to_string()];
        let clusterdata = Clusterdata {
            proxy: Proxy {
                spec: ProxySpec {
                    master_db_uid: "k0".to_string(),
                },
            },
            dbs: HashMap::from([
                ("k0".to_string(), keeper0),
                ("k1".to_string(), keeper("keeper1", true, &[])),
                ("k2".to_string(), keeper("keeper2", true, &[])),
                ("k3".to_string(), keeper("keeper3", true, &[])),
            ]),
            ..Default::default()
        };

        let uids: Vec<&str> = clusterdata
            .synchronous_standbys()
            .iter()
            .map(|db| db.spec.keeper_uid.as_str())
            .collect();
        assert_eq!(uids, vec!["keeper2", "keeper1", "keeper3"]);
        assert!(clusterdata.asynchronous_standbys().is_empty());
    }

    #[test]
    fn check_healthy_default_cluster() {
        let clusterdata = three_keeper_cluster(
            keeper("keeper0", true, &["keeper1"]),
            keeper("keeper1", true, &[]),
            keeper("keeper2", true, &[]),
            1,
        );
        assert_eq!(clusterdata.check_healthy(1), Ok(()));
    }

    #[test]
    fn check_healthy_unhealthy_master() {
        let clusterdata = three_keeper_cluster(
            keeper("keeper0", false, &["keeper1"]),
            keeper("keeper1", true, &[]),
            keeper("keeper2", true, &[]),
            1,
        );
        assert_eq!(
            clusterdata.check_healthy(1),
            Err(ClusterHealthError::MasterUnhealthy)
        );
    }

    #[test]
    fn check_healthy_unhealthy_sync() {
        let clusterdata = three_keeper_cluster(
            keeper("keeper0", true, &["keeper1"]),
            keeper("keeper1", false, &[]),
            keeper("keeper2", true, &[]),
            1,
        );
        assert_eq!(
            clusterdata.check_healthy(1),
            Err(ClusterHealthError::InsufficientSyncStandbys)
        );
    }

    #[test]
    fn check_healthy_unhealthy_async() {
        let clusterdata = three_keeper_cluster(
            keeper("keeper0", true, &["keeper1"]),
            keeper("keeper1", true, &[]),
            keeper("keeper2", false, &[]),
            1,
        );
        assert_eq!(
            clusterdata.check_healthy(1),
            Err(ClusterHealthError::InsufficientStandbysForFailure)
        );

        // A failed async with a working master and sync is still healthy when
        // we are not required to survive any further failures.
        assert_eq!(clusterdata.check_healthy(0), Ok(()));
    }

    #[test]
    fn check_healthy_min_two_sync_standbys() {
        let clusterdata = three_keeper_cluster(
            keeper("keeper0", true, &["keeper1", "keeper2"]),
            keeper("keeper1", true, &[]),
            keeper("keeper2", true, &[]),
            2,
        );
        assert_eq!(
            clusterdata.check_healthy(1),
            Err(ClusterHealthError::InsufficientStandbysForFailure)
        );
    }

    #[test]
    fn check_healthy_higher_failure_budget() {
        let clusterdata = three_keeper_cluster(
            keeper("keeper0", true, &["keeper1"]),
            keeper("keeper1", true, &[]),
            keeper("keeper2", true, &[]),
            1,
        );
        assert_eq!(
            clusterdata.check_healthy(2),
            Err(ClusterHealthError::InsufficientStandbysForFailure)
        );
    }

    const PATCH_DOC: &[u8] = br#"{
        "unknownTopLevel": {"sleepInterval": "99s"},
        "cluster": {
            "uid": "8f7d3a",
            "spec": {"failInterval": "20s", "sleepInterval": "5s", "extra": [1, 2, {"a": "b"}]},
            "status": {"phase": "normal"}
        },
        "dbs": {}
    }"#;

    #[test]
    fn patch_string_field_targets_nested_path() {
        let (patched, previous) =
            patch_string_field(PATCH_DOC, &["cluster", "spec", "sleepInterval"], "1s").unwrap();

        assert_eq!(previous, "5s");
        // The decoy under unknownTopLevel must survive untouched.
        let text = String::from_utf8(patched).unwrap();
        assert!(text.contains(r#""sleepInterval": "1s""#));
        assert!(text.contains(r#"{"sleepInterval": "99s"}"#));
    }

    #[test]
    fn patch_string_field_round_trips_bytes() {
        let (patched, previous) =
            patch_string_field(PATCH_DOC, &["cluster", "spec", "sleepInterval"], "1s").unwrap();
        let (restored, interim) =
            patch_string_field(&patched, &["cluster", "spec", "sleepInterval"], &previous)
                .unwrap();

        assert_eq!(interim, "1s");
        assert_eq!(restored, PATCH_DOC);
    }

    #[test]
    fn patch_string_field_missing_key() {
        assert!(patch_string_field(PATCH_DOC, &["cluster", "spec", "nope"], "1s").is_err());
        assert!(patch_string_field(PATCH_DOC, &["missing", "spec"], "1s").is_err());
    }
}
