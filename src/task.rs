//! Task requests and result replies exchanged at the orchestrator boundary.

use crate::{Result, ShiftError, hypervisor::domain_name_from_xml, pci::PciId};
use serde::{Deserialize, Serialize};
use serde_yaml::Value;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Operation {
    #[serde(rename = "start", alias = "start vm")]
    Start,
    #[serde(rename = "stop", alias = "stop vm")]
    Stop,
    #[serde(rename = "migrate", alias = "migrate vm")]
    Migrate,
    #[serde(rename = "quit")]
    Quit,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Start => "start",
            Operation::Stop => "stop",
            Operation::Migrate => "migrate",
            Operation::Quit => "quit",
        }
    }

    /// Title of the reply container for this operation.
    pub fn result_label(&self) -> &'static str {
        match self {
            Operation::Start => "vm started",
            Operation::Stop => "vm stopped",
            Operation::Migrate => "vm migrated",
            Operation::Quit => "quit",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartParams {
    #[serde(default, alias = "vm-name")]
    pub vm_name: Option<String>,
    /// Full domain definition, used when the domain is not yet known to the host.
    #[serde(default)]
    pub xml: Option<String>,
    #[serde(default)]
    pub vcpus: Option<u32>,
    /// KiB
    #[serde(default)]
    pub memory: Option<u64>,
    #[serde(default, alias = "pci-ids")]
    pub pci_ids: Vec<PciId>,
    #[serde(default = "default_true", alias = "concurrent-execution")]
    pub concurrent: bool,
}

impl StartParams {
    pub fn named(vm_name: &str) -> Self {
        Self {
            vm_name: Some(vm_name.to_string()),
            xml: None,
            vcpus: None,
            memory: None,
            pci_ids: Vec::new(),
            concurrent: true,
        }
    }

    /// Name reported in results: the explicit name, else the `<name>` of the XML.
    pub fn display_name(&self) -> String {
        if let Some(name) = &self.vm_name {
            return name.clone();
        }
        self.xml
            .as_deref()
            .and_then(domain_name_from_xml)
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StopParams {
    #[serde(alias = "vm-name")]
    pub vm_name: String,
    /// Destroy instead of a graceful guest shutdown.
    #[serde(default = "default_true")]
    pub force: bool,
    #[serde(default = "default_true", alias = "concurrent-execution")]
    pub concurrent: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrateParams {
    #[serde(alias = "vm-name")]
    pub vm_name: String,
    pub destination: String,
    #[serde(default, alias = "live-migration")]
    pub live: bool,
    #[serde(default, alias = "rdma-migration")]
    pub rdma: bool,
    #[serde(default)]
    pub driver: Option<String>,
    #[serde(default)]
    pub transport: Option<String>,
    /// Communication processes inside the guest that must acknowledge suspend.
    #[serde(default, alias = "pscom-hook-procs")]
    pub pscom_hook_procs: u32,
    #[serde(default, alias = "memory-ballooning")]
    pub memory_ballooning: bool,
    #[serde(default = "default_true", alias = "concurrent-execution")]
    pub concurrent: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubTask {
    Start(StartParams),
    Stop(StopParams),
    Migrate(MigrateParams),
    Quit,
}

impl SubTask {
    pub fn operation(&self) -> Operation {
        match self {
            SubTask::Start(_) => Operation::Start,
            SubTask::Stop(_) => Operation::Stop,
            SubTask::Migrate(_) => Operation::Migrate,
            SubTask::Quit => Operation::Quit,
        }
    }

    /// Whether this sub-task runs on its own task instead of when awaited.
    pub fn concurrent(&self) -> bool {
        match self {
            SubTask::Start(p) => p.concurrent,
            SubTask::Stop(p) => p.concurrent,
            SubTask::Migrate(p) => p.concurrent,
            SubTask::Quit => false,
        }
    }

    pub fn vm_name(&self) -> String {
        match self {
            SubTask::Start(p) => p.display_name(),
            SubTask::Stop(p) => p.vm_name.clone(),
            SubTask::Migrate(p) => p.vm_name.clone(),
            SubTask::Quit => String::new(),
        }
    }

    fn decode(operation: Operation, item: Value) -> Result<Self> {
        match operation {
            Operation::Start => {
                let params: StartParams = serde_yaml::from_value(item)?;
                if params.vm_name.is_none() && params.xml.is_none() {
                    return Err(ShiftError::MalformedRequest(
                        "start item needs \"vm_name\" or \"xml\"".to_string(),
                    ));
                }
                Ok(SubTask::Start(params))
            }
            Operation::Stop => Ok(SubTask::Stop(serde_yaml::from_value(item)?)),
            Operation::Migrate => Ok(SubTask::Migrate(serde_yaml::from_value(
                hoist_parameters(item),
            )?)),
            Operation::Quit => Ok(SubTask::Quit),
        }
    }
}

/// Older migrate requests nest their flags under `parameter:`; lift them to the item level.
fn hoist_parameters(item: Value) -> Value {
    let Value::Mapping(mut map) = item else {
        return item;
    };
    if let Some(Value::Mapping(nested)) = map.remove("parameter") {
        for (key, value) in nested {
            if !map.contains_key(&key) {
                map.insert(key, value);
            }
        }
    }
    Value::Mapping(map)
}

/// One request: homogeneous sub-tasks plus the task-level concurrency flag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Task {
    operation: Operation,
    concurrent: bool,
    sub_tasks: Vec<SubTask>,
}

impl Task {
    pub fn new(operation: Operation, sub_tasks: Vec<SubTask>, concurrent: bool) -> Result<Self> {
        if let Some(other) = sub_tasks.iter().find(|s| s.operation() != operation) {
            return Err(ShiftError::MalformedRequest(format!(
                "{} sub-task in a {} task",
                other.operation(),
                operation
            )));
        }
        Ok(Self {
            operation,
            concurrent,
            sub_tasks,
        })
    }

    pub fn quit() -> Self {
        Self {
            operation: Operation::Quit,
            concurrent: false,
            sub_tasks: vec![SubTask::Quit],
        }
    }

    pub fn operation(&self) -> Operation {
        self.operation
    }

    pub fn concurrent(&self) -> bool {
        self.concurrent
    }

    pub fn sub_tasks(&self) -> &[SubTask] {
        &self.sub_tasks
    }

    pub fn into_sub_tasks(self) -> Vec<SubTask> {
        self.sub_tasks
    }

    pub fn is_quit(&self) -> bool {
        self.operation == Operation::Quit
    }

    pub fn is_empty(&self) -> bool {
        self.sub_tasks.is_empty()
    }

    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let doc: Value = serde_yaml::from_str(yaml)?;
        Self::from_value(doc)
    }

    pub fn from_value(doc: Value) -> Result<Self> {
        if !doc.is_mapping() {
            return Err(ShiftError::MalformedRequest(
                "task must be a mapping".to_string(),
            ));
        }

        let operation: Operation = lookup(&doc, &["operation", "task"])
            .ok_or_else(|| {
                ShiftError::MalformedRequest("Cannot find key \"operation\" in task.".to_string())
            })
            .and_then(|v| Ok(serde_yaml::from_value(v.clone())?))?;

        if operation == Operation::Quit {
            return Ok(Self::quit());
        }

        let concurrent = match lookup(&doc, &["concurrent", "concurrent-execution"]) {
            Some(v) => serde_yaml::from_value(v.clone())?,
            None => true,
        };

        let sub_tasks = match lookup(&doc, &["items", "vm-configurations"]) {
            Some(Value::Sequence(items)) => items
                .iter()
                .map(|item| SubTask::decode(operation, item.clone()))
                .collect::<Result<Vec<_>>>()?,
            Some(Value::Null) => Vec::new(),
            Some(_) => {
                return Err(ShiftError::MalformedRequest(
                    "\"items\" must be a list".to_string(),
                ));
            }
            // Single inline migrate request.
            None if operation == Operation::Migrate => {
                vec![SubTask::decode(operation, doc.clone())?]
            }
            None => Vec::new(),
        };

        Self::new(operation, sub_tasks, concurrent)
    }
}

fn lookup<'a>(doc: &'a Value, keys: &[&str]) -> Option<&'a Value> {
    keys.iter().find_map(|key| doc.get(*key))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Success,
    Error,
}

/// Outcome of one sub-task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskResult {
    #[serde(alias = "vm-name")]
    pub vm_name: String,
    pub status: Status,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl TaskResult {
    pub fn success(vm_name: impl Into<String>) -> Self {
        Self {
            vm_name: vm_name.into(),
            status: Status::Success,
            details: None,
        }
    }

    pub fn error(vm_name: impl Into<String>, details: impl Into<String>) -> Self {
        let details = details.into();
        Self {
            vm_name: vm_name.into(),
            status: Status::Error,
            details: (!details.is_empty()).then_some(details),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == Status::Success
    }
}

/// Reply for one task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultContainer {
    #[serde(rename = "result")]
    pub title: String,
    #[serde(rename = "list")]
    pub results: Vec<TaskResult>,
}

impl ResultContainer {
    pub fn new(title: impl Into<String>, results: Vec<TaskResult>) -> Self {
        Self {
            title: title.into(),
            results,
        }
    }

    pub fn to_yaml(&self) -> Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    pub fn from_yaml(yaml: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(yaml)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_start_task() {
        let task = Task::from_yaml(
            r#"
operation: start
concurrent: false
items:
  - vm_name: vm1
    vcpus: 4
    memory: 2097152
    pci_ids: ["0000:82:00.0"]
  - vm-name: vm2
    concurrent-execution: false
"#,
        )
        .unwrap();

        assert_eq!(task.operation(), Operation::Start);
        assert!(!task.concurrent());
        assert_eq!(task.sub_tasks().len(), 2);
        match &task.sub_tasks()[0] {
            SubTask::Start(p) => {
                assert_eq!(p.vcpus, Some(4));
                assert_eq!(p.memory, Some(2097152));
                assert_eq!(p.pci_ids, vec![PciId::new(0, 0x82, 0, 0)]);
                assert!(p.concurrent);
            }
            other => panic!("unexpected sub-task {:?}", other),
        }
        assert!(!task.sub_tasks()[1].concurrent());
    }

    #[test]
    fn test_decode_legacy_migrate() {
        let task = Task::from_yaml(
            r#"
task: migrate vm
vm-name: vm1
destination: node02
parameter:
  live-migration: true
  rdma-migration: false
  pscom-hook-procs: 2
  memory-ballooning: true
"#,
        )
        .unwrap();

        assert_eq!(task.operation(), Operation::Migrate);
        assert!(task.concurrent());
        match &task.sub_tasks()[0] {
            SubTask::Migrate(p) => {
                assert_eq!(p.destination, "node02");
                assert!(p.live);
                assert!(!p.rdma);
                assert_eq!(p.pscom_hook_procs, 2);
                assert!(p.memory_ballooning);
            }
            other => panic!("unexpected sub-task {:?}", other),
        }
    }

    #[test]
    fn test_missing_required_field_is_malformed() {
        let err = Task::from_yaml("operation: stop\nitems:\n  - force: true\n").unwrap_err();
        assert!(matches!(err, ShiftError::MalformedRequest(_)));

        let err = Task::from_yaml("items: []\n").unwrap_err();
        assert!(err.to_string().contains("operation"));

        let err = Task::from_yaml("operation: start\nitems:\n  - vcpus: 2\n").unwrap_err();
        assert!(matches!(err, ShiftError::MalformedRequest(_)));
    }

    #[test]
    fn test_quit_and_empty_tasks() {
        assert!(Task::from_yaml("operation: quit\n").unwrap().is_quit());
        let task = Task::from_yaml("operation: stop\nitems: []\n").unwrap();
        assert!(task.is_empty());
    }

    #[test]
    fn test_mixed_sub_tasks_rejected() {
        let err = Task::new(
            Operation::Stop,
            vec![SubTask::Start(StartParams::named("vm1"))],
            true,
        )
        .unwrap_err();
        assert!(matches!(err, ShiftError::MalformedRequest(_)));
    }

    #[test]
    fn test_start_name_from_xml() {
        let params = StartParams {
            vm_name: None,
            xml: Some("<domain><name> vm9 </name></domain>".to_string()),
            ..StartParams::named("")
        };
        assert_eq!(params.display_name(), "vm9");
    }

    #[test]
    fn test_result_container_format() {
        let container = ResultContainer::new(
            "vm stopped",
            vec![
                TaskResult::success("vm1"),
                TaskResult::error("vm2", "Domain not running."),
            ],
        );
        let yaml = container.to_yaml().unwrap();
        assert!(yaml.contains("result: vm stopped"));
        assert!(yaml.contains("status: success"));
        assert!(yaml.contains("details: Domain not running."));
        assert_eq!(yaml.matches("details").count(), 1);

        assert_eq!(ResultContainer::from_yaml(&yaml).unwrap(), container);
    }
}
