/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Configuration as specified by the operator, loaded from a JSON file.
//! The field names mirror the operator-facing JSON schema; accessors split
//! the flat structure into the subsystem-specific values the components
//! consume.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::quorum::{QuorumConfigError, QuorumParams};
use crate::state::PersistLevel;
use crate::types::ReplicaId;

pub const CONSENSUS_HOTSTUFF: u64 = 2;

#[derive(Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Configuration {
    pub max_batch_size: usize,
    #[serde(default)]
    pub batch_size: usize,
    pub max_tx_size: usize,
    /// Idle sleep (ms) for the monitor loops.
    pub sleep_timer: u64,
    /// Client retransmission timer (ms).
    pub client_timer: u64,
    /// Per-unicast deadline (ms); doubles when a peer fails.
    pub broadcast_timer: u64,
    #[serde(default)]
    pub verbose: bool,
    pub consensus: u64,
    #[serde(rename = "PersistLevel")]
    pub persist_level: u8,
    pub num_of_mal: usize,
    pub num_of_sleepy: usize,
    #[serde(rename = "GAT")]
    pub gat: bool,
    pub view_change: bool,
    /// Seconds until the rotating leader timer fires.
    pub rotating_time: u64,
    pub replicas: Vec<ReplicaInfo>,
    #[serde(default)]
    pub test: TestConfig,
}

#[derive(Clone, Serialize, Deserialize)]
pub struct ReplicaInfo {
    pub id: String,
    pub host: String,
    pub port: String,
}

#[derive(Clone, Default, Serialize, Deserialize)]
pub struct TestConfig {
    #[serde(rename = "testId", default)]
    pub test_id: TestType,
    #[serde(default)]
    pub param: TestParam,
}

#[derive(Clone, Default, Serialize, Deserialize)]
pub struct TestParam {
    #[serde(default)]
    pub replicas: Vec<SleepyReplica>,
    #[serde(rename = "NumOfActualSleep", default)]
    pub num_of_actual_sleep: usize,
    #[serde(rename = "sleepTime", default)]
    pub sleep_time: u64,
    #[serde(rename = "sleepSeq", default)]
    pub sleep_seq: u64,
}

/// Per-replica sleep/recovery schedule for the test harness.
#[derive(Clone, Serialize, Deserialize)]
pub struct SleepyReplica {
    pub id: String,
    #[serde(rename = "sleepTime")]
    pub sleep_time: u64,
    #[serde(rename = "sleepSeq")]
    pub sleep_seq: u64,
    #[serde(rename = "recMode")]
    pub rec_mode: RecMode,
}

/// Selects the sleep/recovery scenario under test.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum TestType {
    #[default]
    Off,
    SleepyHotStuffPartChurn,
    HotStuffNoPersistDoubleSpend,
    HotStuffPersistDoubleSpend,
    Koala2DoubleSpend,
}

impl TryFrom<u8> for TestType {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(TestType::Off),
            1 => Ok(TestType::SleepyHotStuffPartChurn),
            2 => Ok(TestType::HotStuffNoPersistDoubleSpend),
            3 => Ok(TestType::HotStuffPersistDoubleSpend),
            4 => Ok(TestType::Koala2DoubleSpend),
            other => Err(format!("unknown testId: {}", other)),
        }
    }
}

impl From<TestType> for u8 {
    fn from(value: TestType) -> u8 {
        value as u8
    }
}

/// How a woken replica rejoins the protocol.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum RecMode {
    /// Assume nothing durable; go straight back to READY.
    NoRec,
    /// Re-read the critical keys and re-enter via a view change.
    RecFromDisk,
    /// Disk-free recovery through the REC1/ECHO1/REC2/ECHO2 rounds.
    RecKoala2,
}

impl TryFrom<u8> for RecMode {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(RecMode::NoRec),
            1 => Ok(RecMode::RecFromDisk),
            2 => Ok(RecMode::RecKoala2),
            other => Err(format!("unknown recMode: {}", other)),
        }
    }
}

impl From<RecMode> for u8 {
    fn from(value: RecMode) -> u8 {
        value as u8
    }
}

#[derive(Debug)]
pub enum ConfigError {
    Io(std::io::Error),
    Parse(serde_json::Error),
    UnsupportedConsensus(u64),
    UnknownPersistLevel(u8),
    Quorum(QuorumConfigError),
}

impl Configuration {
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Configuration, ConfigError> {
        let bytes = fs::read(path).map_err(ConfigError::Io)?;
        let config: Configuration =
            serde_json::from_slice(&bytes).map_err(ConfigError::Parse)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.consensus != CONSENSUS_HOTSTUFF {
            return Err(ConfigError::UnsupportedConsensus(self.consensus));
        }
        let _ = self.persist_level()?;
        let _ = self.quorum_params()?;
        Ok(())
    }

    pub fn n(&self) -> usize {
        self.replicas.len()
    }

    pub fn persist_level(&self) -> Result<PersistLevel, ConfigError> {
        PersistLevel::from_config(self.persist_level)
            .ok_or(ConfigError::UnknownPersistLevel(self.persist_level))
    }

    /// Quorum sizes for the configured fault model. The sleepy modes apply
    /// only to the sleepy test scenarios; everything else runs the HotStuff
    /// baseline.
    pub fn quorum_params(&self) -> Result<QuorumParams, ConfigError> {
        match self.test.test_id {
            TestType::SleepyHotStuffPartChurn | TestType::Koala2DoubleSpend => {
                QuorumParams::sleepy(
                    self.n(),
                    self.num_of_mal,
                    self.num_of_sleepy,
                    self.gat,
                    self.persist_level()?,
                )
                .map_err(ConfigError::Quorum)
            }
            TestType::Off
            | TestType::HotStuffNoPersistDoubleSpend
            | TestType::HotStuffPersistDoubleSpend => {
                Ok(QuorumParams::hotstuff_baseline(self.n()))
            }
        }
    }

    /// The sleep schedule for `replica`, if this test run puts it to sleep.
    pub fn sleepy_param(&self, replica: ReplicaId) -> Option<SleepyReplica> {
        match self.test.test_id {
            TestType::Off => None,
            TestType::SleepyHotStuffPartChurn => {
                // The last `num_of_actual_sleep` replicas sleep.
                let n = self.n();
                let cutoff = n.saturating_sub(self.test.param.num_of_actual_sleep);
                if replica.as_usize() >= cutoff {
                    Some(SleepyReplica {
                        id: replica.to_string(),
                        sleep_time: self.test.param.sleep_time,
                        sleep_seq: self.test.param.sleep_seq,
                        rec_mode: RecMode::RecKoala2,
                    })
                } else {
                    None
                }
            }
            TestType::HotStuffNoPersistDoubleSpend
            | TestType::HotStuffPersistDoubleSpend
            | TestType::Koala2DoubleSpend => self
                .test
                .param
                .replicas
                .iter()
                .find(|r| r.id == replica.to_string())
                .cloned(),
        }
    }

    /// The double-spend scenarios dump the committed chain as JSON on every
    /// commit.
    pub fn is_double_spend_test(&self) -> bool {
        matches!(
            self.test.test_id,
            TestType::HotStuffNoPersistDoubleSpend
                | TestType::HotStuffPersistDoubleSpend
                | TestType::Koala2DoubleSpend
        )
    }
}

#[cfg(test)]
pub(crate) mod test_config {
    use super::*;

    /// A baseline configuration for `n` replicas, used across the test
    /// suite.
    pub(crate) fn hotstuff(n: usize, persist_level: u8) -> Configuration {
        Configuration {
            max_batch_size: 16,
            batch_size: 1,
            max_tx_size: 1 << 16,
            sleep_timer: 5,
            client_timer: 100,
            broadcast_timer: 100,
            verbose: false,
            consensus: CONSENSUS_HOTSTUFF,
            persist_level,
            num_of_mal: (n - 1) / 3,
            num_of_sleepy: 0,
            gat: true,
            view_change: false,
            rotating_time: 1,
            replicas: (0..n)
                .map(|i| ReplicaInfo {
                    id: i.to_string(),
                    host: "127.0.0.1".to_string(),
                    port: (7000 + i).to_string(),
                })
                .collect(),
            test: TestConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_the_operator_json_schema() {
        let raw = r#"{
            "maxBatchSize": 100,
            "batchSize": 10,
            "maxTxSize": 65536,
            "sleepTimer": 5,
            "clientTimer": 100,
            "broadcastTimer": 300,
            "consensus": 2,
            "PersistLevel": 2,
            "numOfMal": 1,
            "numOfSleepy": 1,
            "GAT": true,
            "viewChange": true,
            "rotatingTime": 10,
            "replicas": [
                {"id": "0", "host": "127.0.0.1", "port": "7000"},
                {"id": "1", "host": "127.0.0.1", "port": "7001"},
                {"id": "2", "host": "127.0.0.1", "port": "7002"},
                {"id": "3", "host": "127.0.0.1", "port": "7003"}
            ],
            "test": {
                "testId": 4,
                "param": {
                    "replicas": [
                        {"id": "3", "sleepTime": 2000, "sleepSeq": 10, "recMode": 2}
                    ]
                }
            }
        }"#;

        let config: Configuration = serde_json::from_str(raw).unwrap();
        config.validate().unwrap();
        assert_eq!(config.n(), 4);
        assert_eq!(config.test.test_id, TestType::Koala2DoubleSpend);
        assert!(config.is_double_spend_test());

        let sleepy = config.sleepy_param(ReplicaId::new(3)).unwrap();
        assert_eq!(sleepy.rec_mode, RecMode::RecKoala2);
        assert_eq!(sleepy.sleep_seq, 10);
        assert!(config.sleepy_param(ReplicaId::new(0)).is_none());
    }

    #[test]
    fn part_churn_selects_the_last_replicas() {
        let mut config = test_config::hotstuff(7, 3);
        config.num_of_mal = 1;
        config.num_of_sleepy = 3;
        config.test.test_id = TestType::SleepyHotStuffPartChurn;
        config.test.param.num_of_actual_sleep = 2;
        config.test.param.sleep_seq = 10;
        config.test.param.sleep_time = 500;

        assert!(config.sleepy_param(ReplicaId::new(4)).is_none());
        let sleepy = config.sleepy_param(ReplicaId::new(5)).unwrap();
        assert_eq!(sleepy.rec_mode, RecMode::RecKoala2);
        assert!(config.sleepy_param(ReplicaId::new(6)).is_some());
    }

    #[test]
    fn rejects_non_hotstuff_consensus() {
        let mut config = test_config::hotstuff(4, 3);
        config.consensus = 1;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::UnsupportedConsensus(1))
        ));
    }
}
