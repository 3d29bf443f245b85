use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use time::OffsetDateTime;

use crate::model::{ServiceInfo, ServiceStatus};

// Push topic and event name for status notifications
pub const STATUS_TOPIC: &str = "ServiceMonitors";
pub const STATUS_UPDATED: &str = "ServiceStatusUpdated";

pub const RESULT_SUCCESS: &str = "Success";
pub const RESULT_FAILURE: &str = "Failure";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LogType {
    Access,
    Operation,
    StatusChange,
}

impl LogType {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogType::Access => "Access",
            LogType::Operation => "Operation",
            LogType::StatusChange => "StatusChange",
        }
    }
}

impl fmt::Display for LogType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LogType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace(['_', '-'], "").as_str() {
            "access" => Ok(LogType::Access),
            "operation" => Ok(LogType::Operation),
            "statuschange" | "status" => Ok(LogType::StatusChange),
            _ => Err(format!(
                "unknown log type '{s}' (expected access, operation or status-change)"
            )),
        }
    }
}

// One audit record. Optional fields are only present for the entry types
// that carry them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogEntry {
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    #[serde(rename = "type")]
    pub log_type: LogType,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip_address: Option<String>,

    // Access entries
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http_method: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,

    // Operation entries
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,

    // StatusChange entries
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub old_status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_status: Option<String>,
}

impl LogEntry {
    pub fn new(log_type: LogType, message: impl Into<String>) -> Self {
        Self {
            timestamp: OffsetDateTime::now_utc(),
            log_type,
            message: message.into(),
            service_name: None,
            user_name: None,
            ip_address: None,
            http_method: None,
            request_path: None,
            status_code: None,
            result: None,
            old_status: None,
            new_status: None,
        }
    }

    pub fn operation(service: &str, message: impl Into<String>, success: bool) -> Self {
        let mut entry = Self::new(LogType::Operation, message);
        entry.service_name = Some(service.to_string());
        entry.result = Some(if success { RESULT_SUCCESS } else { RESULT_FAILURE }.to_string());
        entry
    }

    pub fn status_change(service: &str, old: ServiceStatus, new: ServiceStatus) -> Self {
        let mut entry = Self::new(
            LogType::StatusChange,
            format!("Service '{service}' changed from {old} to {new}"),
        );
        entry.service_name = Some(service.to_string());
        entry.old_status = Some(old.to_string());
        entry.new_status = Some(new.to_string());
        entry
    }

    pub fn access(method: &str, path: &str, status: u16) -> Self {
        let mut entry = Self::new(LogType::Access, format!("{method} {path} -> {status}"));
        entry.http_method = Some(method.to_string());
        entry.request_path = Some(path.to_string());
        entry.status_code = Some(status);
        entry
    }

    pub fn by(mut self, user: Option<&str>, ip: Option<&str>) -> Self {
        self.user_name = user.map(str::to_string);
        self.ip_address = ip.map(str::to_string);
        self
    }

    pub fn at(mut self, timestamp: OffsetDateTime) -> Self {
        self.timestamp = timestamp;
        self
    }
}

// Message fanned out to push subscribers
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceEvent {
    pub topic: String,
    pub event: String,
    pub payload: ServiceInfo,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_type_from_str() {
        assert_eq!("access".parse::<LogType>(), Ok(LogType::Access));
        assert_eq!("Operation".parse::<LogType>(), Ok(LogType::Operation));
        assert_eq!("status-change".parse::<LogType>(), Ok(LogType::StatusChange));
        assert_eq!("StatusChange".parse::<LogType>(), Ok(LogType::StatusChange));
        assert!("bogus".parse::<LogType>().is_err());
    }

    #[test]
    fn test_log_entry_serialization() {
        let entry = LogEntry::status_change("nginx", ServiceStatus::Running, ServiceStatus::Stopped);
        let json = serde_json::to_value(&entry).unwrap();

        assert_eq!(json["type"], "StatusChange");
        assert_eq!(json["serviceName"], "nginx");
        assert_eq!(json["oldStatus"], "Running");
        assert_eq!(json["newStatus"], "Stopped");
        assert!(json.get("httpMethod").is_none());

        let back: LogEntry = serde_json::from_value(json).unwrap();
        assert_eq!(back.message, entry.message);
    }

    #[test]
    fn test_operation_entry_result() {
        let ok = LogEntry::operation("api", "Started 'api'", true).by(Some("alice"), None);
        assert_eq!(ok.result.as_deref(), Some(RESULT_SUCCESS));
        assert_eq!(ok.user_name.as_deref(), Some("alice"));

        let failed = LogEntry::operation("api", "Failed to start 'api'", false);
        assert_eq!(failed.result.as_deref(), Some(RESULT_FAILURE));
    }
}
