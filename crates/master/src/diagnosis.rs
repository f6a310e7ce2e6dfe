//! Diagnosis pipeline: reported data, inferred solutions, actions
//!
//! Upstream inference produces a list of solutions; the coordinator
//! turns the first event-shaped solution into a typed action that
//! rides the next heartbeat reply of the target node. Both report data
//! and actions travel as closed tagged enums, so an unknown tag fails
//! the request instead of loading arbitrary types.

use node_core::constants::ACTION_EXPIRED_TIME_PERIOD_DEFAULT;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::warn;

/// Required config keys of an event solution
pub const EVENT_TYPE: &str = "event_type";
pub const EVENT_INSTANCE: &str = "event_instance";
pub const EVENT_ACTION: &str = "event_action";
pub const EVENT_MSG: &str = "event_msg";
pub const EVENT_LABELS: &str = "event_labels";

/// Optional config keys
pub const EXPIRED_TIME_PERIOD: &str = "expired_time_period";
pub const EXECUTABLE_TIME_PERIOD: &str = "executable_time_period";

/// A typed event instruction for one node
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct EventAction {
    pub event_type: String,
    pub event_instance: String,
    pub event_action: String,
    pub event_msg: String,
    pub event_labels: HashMap<String, String>,

    /// Seconds until the action expires
    pub expired_time_period: u64,

    /// Seconds the receiver should wait before executing
    pub executable_time_period: u64,

    /// Unix seconds the action was created
    pub timestamp: u64,
}

/// Instruction returned to a node in a heartbeat reply
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum DiagnosisAction {
    NoAction,
    EventAction(EventAction),
}

impl DiagnosisAction {
    pub fn is_no_action(&self) -> bool {
        matches!(self, DiagnosisAction::NoAction)
    }

    /// True once the action has outlived its expiry period
    pub fn is_expired(&self, now: u64) -> bool {
        match self {
            DiagnosisAction::NoAction => false,
            DiagnosisAction::EventAction(action) => {
                now > action.timestamp.saturating_add(action.expired_time_period)
            }
        }
    }
}

impl Default for DiagnosisAction {
    fn default() -> Self {
        DiagnosisAction::NoAction
    }
}

/// Diagnosis records reported by worker agents
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "data_cls", content = "content")]
pub enum DiagnosisData {
    WorkerTrainingMetric {
        node_rank: i64,
        timestamp: u64,
        step: u64,
        elapsed_time_per_step: f64,
    },
    TrainingLog {
        node_rank: i64,
        timestamp: u64,
        logs: Vec<String>,
    },
}

/// What an inference concluded
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum InferenceName {
    Action,
    Check,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum InferenceAttribute {
    Is,
    Not,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum InferenceDescription {
    Event,
    Failure,
}

/// One solution produced by an inference component
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Inference {
    pub name: InferenceName,
    pub attribution: InferenceAttribute,
    pub description: InferenceDescription,

    #[serde(default)]
    pub configs: HashMap<String, String>,
}

/// Convert inferred solutions into the action to ship.
///
/// The first solution matching (ACTION, IS, EVENT) wins. A solution
/// with a missing or malformed required key is dropped with a log and
/// scanning continues.
pub fn coordinate_solutions(solutions: &[Inference]) -> DiagnosisAction {
    for solution in solutions {
        if solution.name != InferenceName::Action
            || solution.attribution != InferenceAttribute::Is
            || solution.description != InferenceDescription::Event
        {
            continue;
        }
        match event_action_from_configs(&solution.configs) {
            Ok(action) => return DiagnosisAction::EventAction(action),
            Err(missing) => {
                warn!(key = missing, "Dropping event solution with bad config");
            }
        }
    }
    DiagnosisAction::NoAction
}

fn event_action_from_configs(
    configs: &HashMap<String, String>,
) -> Result<EventAction, &'static str> {
    let required = |key: &'static str| configs.get(key).cloned().ok_or(key);

    let labels_raw = required(EVENT_LABELS)?;
    let event_labels: HashMap<String, String> =
        serde_json::from_str(&labels_raw).map_err(|_| EVENT_LABELS)?;

    let expired_time_period = match configs.get(EXPIRED_TIME_PERIOD) {
        Some(raw) => raw.parse().map_err(|_| EXPIRED_TIME_PERIOD)?,
        None => ACTION_EXPIRED_TIME_PERIOD_DEFAULT,
    };
    let executable_time_period = match configs.get(EXECUTABLE_TIME_PERIOD) {
        Some(raw) => raw.parse().map_err(|_| EXECUTABLE_TIME_PERIOD)?,
        None => 0,
    };

    Ok(EventAction {
        event_type: required(EVENT_TYPE)?,
        event_instance: required(EVENT_INSTANCE)?,
        event_action: required(EVENT_ACTION)?,
        event_msg: required(EVENT_MSG)?,
        event_labels,
        expired_time_period,
        executable_time_period,
        timestamp: unix_now(),
    })
}

/// Bounded store of reported diagnosis data
#[derive(Debug)]
pub struct DiagnosisManager {
    data: Mutex<VecDeque<DiagnosisData>>,
    capacity: usize,
}

impl DiagnosisManager {
    pub fn new() -> Self {
        Self {
            data: Mutex::new(VecDeque::new()),
            capacity: 1024,
        }
    }

    /// Store one report, evicting the oldest past capacity
    pub fn collect_diagnosis_data(&self, data: DiagnosisData) {
        let mut store = self.data.lock();
        store.push_back(data);
        if store.len() > self.capacity {
            store.pop_front();
        }
    }

    /// Most recent reports, newest last
    pub fn recent_data(&self, count: usize) -> Vec<DiagnosisData> {
        let store = self.data.lock();
        store.iter().rev().take(count).rev().cloned().collect()
    }
}

impl Default for DiagnosisManager {
    fn default() -> Self {
        Self::new()
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event_solution(configs: HashMap<String, String>) -> Inference {
        Inference {
            name: InferenceName::Action,
            attribution: InferenceAttribute::Is,
            description: InferenceDescription::Event,
            configs,
        }
    }

    fn full_configs() -> HashMap<String, String> {
        HashMap::from([
            (EVENT_TYPE.to_string(), "X".to_string()),
            (EVENT_INSTANCE.to_string(), "n0".to_string()),
            (EVENT_ACTION.to_string(), "kill".to_string()),
            (EVENT_MSG.to_string(), "m".to_string()),
            (EVENT_LABELS.to_string(), "{}".to_string()),
        ])
    }

    #[test]
    fn test_empty_solutions_yield_no_action() {
        assert_eq!(coordinate_solutions(&[]), DiagnosisAction::NoAction);
    }

    #[test]
    fn test_event_solution_becomes_action() {
        let action = coordinate_solutions(&[event_solution(full_configs())]);
        let DiagnosisAction::EventAction(action) = action else {
            panic!("expected an event action");
        };
        assert_eq!(action.event_type, "X");
        assert_eq!(action.event_instance, "n0");
        assert_eq!(action.event_action, "kill");
        assert_eq!(action.event_msg, "m");
        assert!(action.event_labels.is_empty());
        assert_eq!(
            action.expired_time_period,
            ACTION_EXPIRED_TIME_PERIOD_DEFAULT
        );
        assert_eq!(action.executable_time_period, 0);
    }

    #[test]
    fn test_missing_key_drops_solution() {
        let mut configs = full_configs();
        configs.remove(EVENT_MSG);

        // The broken solution is skipped, the next one wins
        let action =
            coordinate_solutions(&[event_solution(configs), event_solution(full_configs())]);
        assert!(matches!(action, DiagnosisAction::EventAction(_)));
    }

    #[test]
    fn test_non_event_solutions_are_ignored() {
        let other = Inference {
            name: InferenceName::Check,
            attribution: InferenceAttribute::Is,
            description: InferenceDescription::Failure,
            configs: HashMap::new(),
        };
        assert_eq!(coordinate_solutions(&[other]), DiagnosisAction::NoAction);
    }

    #[test]
    fn test_explicit_periods_are_used() {
        let mut configs = full_configs();
        configs.insert(EXPIRED_TIME_PERIOD.to_string(), "120".to_string());
        configs.insert(EXECUTABLE_TIME_PERIOD.to_string(), "30".to_string());

        let DiagnosisAction::EventAction(action) =
            coordinate_solutions(&[event_solution(configs)])
        else {
            panic!("expected an event action");
        };
        assert_eq!(action.expired_time_period, 120);
        assert_eq!(action.executable_time_period, 30);
    }

    #[test]
    fn test_action_expiry() {
        let mut action = EventAction::default();
        action.expired_time_period = 10;
        action.timestamp = 1000;
        let action = DiagnosisAction::EventAction(action);

        assert!(!action.is_expired(1005));
        assert!(action.is_expired(1011));
        assert!(!DiagnosisAction::NoAction.is_expired(u64::MAX));
    }

    #[test]
    fn test_diagnosis_data_tagging() {
        let data = DiagnosisData::TrainingLog {
            node_rank: 0,
            timestamp: 1,
            logs: vec!["line".to_string()],
        };
        let json = serde_json::to_string(&data).unwrap();
        assert!(json.contains("\"data_cls\":\"TrainingLog\""));

        // Unknown tags must fail instead of loading something else
        let bad = "{\"data_cls\":\"Exploit\",\"content\":{}}";
        assert!(serde_json::from_str::<DiagnosisData>(bad).is_err());
    }

    #[test]
    fn test_manager_capacity() {
        let manager = DiagnosisManager::new();
        for i in 0..2000 {
            manager.collect_diagnosis_data(DiagnosisData::TrainingLog {
                node_rank: i,
                timestamp: 0,
                logs: vec![],
            });
        }
        assert_eq!(manager.recent_data(usize::MAX).len(), 1024);
    }
}
