//! The controller's wire message set.
//!
//! Messages are declared with `prost` derives rather than generated
//! from a schema file; the field tags are the schema. Anything that
//! talks to the daemon (the CLI client, the test launcher, tests)
//! shares these types.

/// Shell command plus environment overrides.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Command {
    #[prost(string, tag = "1")]
    pub cmd: ::prost::alloc::string::String,
    #[prost(message, repeated, tag = "2")]
    pub env_vars: ::prost::alloc::vec::Vec<EnvVar>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct EnvVar {
    #[prost(string, tag = "1")]
    pub key: ::prost::alloc::string::String,
    #[prost(string, tag = "2")]
    pub value: ::prost::alloc::string::String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ::prost::Enumeration)]
#[repr(i32)]
pub enum ServiceType {
    Daemon = 0,
    Task = 1,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ::prost::Enumeration)]
#[repr(i32)]
pub enum HealthCheckType {
    Command = 0,
    Http = 1,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct HttpHealthCheck {
    #[prost(string, tag = "1")]
    pub url: ::prost::alloc::string::String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct HealthCheck {
    #[prost(enumeration = "HealthCheckType", tag = "1")]
    pub check_type: i32,
    #[prost(message, optional, tag = "2")]
    pub cmd: ::core::option::Option<Command>,
    #[prost(message, optional, tag = "3")]
    pub http_health_check: ::core::option::Option<HttpHealthCheck>,
}

/// A service definition as registered with the controller.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Service {
    #[prost(string, tag = "1")]
    pub service_name: ::prost::alloc::string::String,
    #[prost(enumeration = "ServiceType", tag = "2")]
    pub service_type: i32,
    #[prost(message, optional, tag = "3")]
    pub launch_cmd: ::core::option::Option<Command>,
    #[prost(message, optional, tag = "4")]
    pub stop_cmd: ::core::option::Option<Command>,
    #[prost(string, repeated, tag = "5")]
    pub dependencies: ::prost::alloc::vec::Vec<::prost::alloc::string::String>,
    #[prost(message, repeated, tag = "6")]
    pub health_checks: ::prost::alloc::vec::Vec<HealthCheck>,
    #[prost(string, repeated, tag = "7")]
    pub version_files: ::prost::alloc::vec::Vec<::prost::alloc::string::String>,
    #[prost(string, tag = "8")]
    pub owner: ::prost::alloc::string::String,
    #[prost(bool, tag = "9")]
    pub verbose: bool,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Empty {}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ErrorResp {
    #[prost(string, tag = "1")]
    pub message: ::prost::alloc::string::String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct CreateBatchReq {
    #[prost(message, repeated, tag = "1")]
    pub services: ::prost::alloc::vec::Vec<Service>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RemoveBatchReq {
    #[prost(string, repeated, tag = "1")]
    pub service_names: ::prost::alloc::vec::Vec<::prost::alloc::string::String>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct StartReq {
    #[prost(string, tag = "1")]
    pub service_name: ::prost::alloc::string::String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct StopReq {
    #[prost(string, tag = "1")]
    pub service_name: ::prost::alloc::string::String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct StopAllReq {
    /// Graceful stops signal the process group first; non-graceful
    /// force-kills the whole tree immediately.
    #[prost(bool, tag = "1")]
    pub graceful: bool,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct StatusReq {
    /// Empty means "all services".
    #[prost(string, repeated, tag = "1")]
    pub service_names: ::prost::alloc::vec::Vec<::prost::alloc::string::String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ::prost::Enumeration)]
#[repr(i32)]
pub enum StatusCode {
    Stopped = 0,
    Starting = 1,
    Started = 2,
    Stopping = 3,
    Error = 4,
}

impl StatusCode {
    pub fn as_lower_str(self) -> &'static str {
        match self {
            StatusCode::Stopped => "stopped",
            StatusCode::Starting => "starting",
            StatusCode::Started => "started",
            StatusCode::Stopping => "stopping",
            StatusCode::Error => "error",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ::prost::Enumeration)]
#[repr(i32)]
pub enum FailureType {
    Unknown = 0,
    HasRaces = 1,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct FailureMessage {
    #[prost(enumeration = "FailureType", tag = "1")]
    pub failure_type: i32,
    #[prost(string, tag = "2")]
    pub log: ::prost::alloc::string::String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SvcStatus {
    #[prost(string, tag = "1")]
    pub service_name: ::prost::alloc::string::String,
    #[prost(string, tag = "2")]
    pub owner: ::prost::alloc::string::String,
    #[prost(enumeration = "StatusCode", tag = "3")]
    pub status_code: i32,
    #[prost(bool, tag = "4")]
    pub needs_restart: bool,
    #[prost(string, tag = "5")]
    pub log_file: ::prost::alloc::string::String,
    #[prost(enumeration = "ServiceType", tag = "6")]
    pub service_type: i32,
    #[prost(int64, tag = "7")]
    pub start_duration_ms: i64,
    #[prost(message, optional, tag = "8")]
    pub failure_message: ::core::option::Option<FailureMessage>,
    /// Advisory; the process may have exited since the snapshot.
    #[prost(int64, tag = "9")]
    pub pid: i64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct StatusResp {
    #[prost(message, repeated, tag = "1")]
    pub svc_status: ::prost::alloc::vec::Vec<SvcStatus>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct DiagnosticsReq {
    /// Empty means "all services".
    #[prost(string, repeated, tag = "1")]
    pub service_names: ::prost::alloc::vec::Vec<::prost::alloc::string::String>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Metrics {
    #[prost(string, tag = "1")]
    pub service_name: ::prost::alloc::string::String,
    #[prost(int64, tag = "2")]
    pub cpu_time_ms: i64,
    #[prost(int64, tag = "3")]
    pub rss_mb: i64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct DiagnosticsResp {
    #[prost(message, repeated, tag = "1")]
    pub svc_metrics: ::prost::alloc::vec::Vec<Metrics>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use prost::Message;

    #[test]
    fn service_roundtrip() {
        let svc = Service {
            service_name: "echo".to_string(),
            service_type: ServiceType::Daemon as i32,
            launch_cmd: Some(Command {
                cmd: "echo_server --port 1234".to_string(),
                env_vars: vec![EnvVar {
                    key: "PORT".to_string(),
                    value: "1234".to_string(),
                }],
            }),
            stop_cmd: None,
            dependencies: vec!["base".to_string()],
            health_checks: vec![HealthCheck {
                check_type: HealthCheckType::Http as i32,
                cmd: None,
                http_health_check: Some(HttpHealthCheck {
                    url: "http://localhost:1234/healthz".to_string(),
                }),
            }],
            version_files: vec![],
            owner: "infra".to_string(),
            verbose: false,
        };
        let bytes = svc.encode_to_vec();
        let decoded = Service::decode(bytes.as_slice()).unwrap();
        assert_eq!(svc, decoded);
    }

    #[test]
    fn status_code_survives_roundtrip() {
        let status = SvcStatus {
            status_code: StatusCode::Error as i32,
            ..Default::default()
        };
        let decoded = SvcStatus::decode(status.encode_to_vec().as_slice()).unwrap();
        assert_eq!(decoded.status_code, StatusCode::Error as i32);
    }
}
