use miette::Diagnostic;
use std::io;
use thiserror::Error;

#[derive(Error, Diagnostic, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Service not found: {0}")]
    #[diagnostic(
        code(svcctl::service::not_found),
        help("Check registered services with `svcctl status --all`")
    )]
    ServiceNotFound(String),

    #[error("Duplicate service name: {0}")]
    #[diagnostic(code(svcctl::service::duplicate))]
    DuplicateService(String),

    #[error("Undeclared dependency {dependency} for {service}")]
    #[diagnostic(
        code(svcctl::service::undeclared_dependency),
        help("Dependencies must name services created in the same batch or earlier")
    )]
    UndeclaredDependency { service: String, dependency: String },

    #[error("Some services could not be added:{0}")]
    #[diagnostic(
        code(svcctl::service::batch_rejected),
        help("A batch is rejected as a whole; look for missing or cyclic dependencies")
    )]
    BatchRejected(String),

    #[error("Service '{0}' failed to start: {1}")]
    #[diagnostic(
        code(svcctl::service::start_failed),
        help("Check the service log under logs/service_logs/<name>/service.log")
    )]
    StartFailed(String, String),

    #[error("Service {service} in unexpected state {state}")]
    #[diagnostic(
        code(svcctl::service::unhealthy),
        help("Check the service log under logs/service_logs/<name>/service.log")
    )]
    Unhealthy { service: String, state: String },

    #[error("Failed to signal service '{service}': {source}")]
    Signal {
        service: String,
        source: nix::Error,
    },

    #[error("Controller unreachable: {0}")]
    #[diagnostic(
        code(svcctl::client::unreachable),
        help("The controller writes its port to $TEST_TMPDIR/svcd-port once it is up")
    )]
    Unreachable(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Remote error: {0}")]
    Remote(String),

    #[error("Service definitions are stale or the service controller has changed. Please recreate the container.")]
    #[diagnostic(code(svcctl::client::stale_defs))]
    StaleDefinitions,

    #[error("XML error: {0}")]
    Xml(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl From<quick_xml::Error> for Error {
    fn from(e: quick_xml::Error) -> Self {
        Error::Xml(e.to_string())
    }
}

impl From<prost::DecodeError> for Error {
    fn from(e: prost::DecodeError) -> Self {
        Error::Protocol(format!("decode: {}", e))
    }
}
