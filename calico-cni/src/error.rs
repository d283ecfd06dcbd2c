use std::io::Write;

use thiserror::Error;
use tracing::error;

use crate::config::ConfigError;
use crate::datastore::DatastoreError;
use crate::engine::EngineError;
use crate::ipam::IpamError;
use crate::network::cni::args::ArgsError;
use crate::network::cni::schema::CniError;
use crate::network::namespace::NetnsError;
use crate::policy::PolicyError;

const PANIC_MESSAGE: &str = "Unhandled Exception killed plugin";

#[derive(Debug, Error)]
pub enum Error {
    #[error("Invalid network configuration")]
    Config(#[from] ConfigError),

    #[error("Invalid CNI environment")]
    Args(#[from] ArgsError),

    #[error("{context}")]
    Datastore {
        context: String,
        #[source]
        error: DatastoreError,
    },

    #[error(transparent)]
    Policy(#[from] PolicyError),

    #[error(transparent)]
    Ipam(#[from] IpamError),

    #[error("Could not inspect container")]
    Engine(#[from] EngineError),

    #[error("{context}")]
    Netns {
        context: String,
        #[source]
        error: NetnsError,
    },

    /// A panic caught at the top level, with its payload.
    #[error("{}", PANIC_MESSAGE)]
    Panic(String),
}

impl Error {
    pub fn datastore<S: Into<String>>(context: S, error: DatastoreError) -> Error {
        Error::Datastore {
            context: context.into(),
            error,
        }
    }
}

/// Messages of every error below `err`, outermost first.
fn source_chain(err: &dyn std::error::Error) -> Option<String> {
    let mut causes = Vec::new();
    let mut source = err.source();
    while let Some(cause) = source {
        causes.push(cause.to_string());
        source = cause.source();
    }
    if causes.is_empty() {
        None
    } else {
        Some(causes.join(": "))
    }
}

impl From<Error> for CniError {
    fn from(err: Error) -> CniError {
        match err {
            Error::Ipam(IpamError::Plugin(err)) => err,
            Error::Policy(PolicyError::ApplyProfile { message, details }) => CniError {
                details,
                ..CniError::generic(message)
            },
            Error::Panic(payload) => CniError::generic(PANIC_MESSAGE).with_details(payload),
            other => CniError {
                details: source_chain(&other),
                ..CniError::generic(other.to_string())
            },
        }
    }
}

/// Logs `err` and writes it to `out` as a CNI error. Returns the exit code to report it with.
pub fn report<W: Write>(err: Error, mut out: W) -> i32 {
    match source_chain(&err) {
        Some(cause) => error!("{}: {}", err, cause),
        None => error!("{}", err),
    }
    let err = CniError::from(err);
    if let Err(write_err) = err.write_to(&mut out).and_then(|_| out.flush()) {
        error!("Could not write error: {}", write_err);
    }
    err.exit_code()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::cni::schema::ErrorCode;

    #[test]
    fn test_generic_with_cause() {
        let err = Error::datastore("Failed to create Calico endpoint", DatastoreError::AlreadyExists("endpoint".into()));
        let err = CniError::from(err);
        assert_eq!(err.exit_code(), 100);
        assert_eq!(err.message, "Failed to create Calico endpoint");
        assert_eq!(err.details.as_deref(), Some("endpoint already exists"));
    }

    #[test]
    fn test_plugin_error_passthrough() {
        let plugin = CniError {
            code: ErrorCode::from(7),
            message: "bad config".into(),
            details: None,
        };
        assert_eq!(CniError::from(Error::Ipam(IpamError::Plugin(plugin.clone()))), plugin);
    }

    #[test]
    fn test_policy_errors() {
        let err = CniError::from(Error::Policy(PolicyError::apply_with_details("Failed to parse policy annotation", "oops")));
        assert_eq!(err.message, "Failed to parse policy annotation");
        assert_eq!(err.details.as_deref(), Some("oops"));

        let err = CniError::from(Error::Policy(PolicyError::UnknownPolicyType("calico".into())));
        assert_eq!(err.message, "Invalid policy type: calico");
        assert_eq!(err.details, None);
    }

    #[test]
    fn test_report() {
        let mut out = Vec::new();
        let code = report(Error::Panic("boom".into()), &mut out);
        assert_eq!(code, 100);
        assert_eq!(
            serde_json::from_slice::<serde_json::Value>(&out).unwrap(),
            serde_json::json!({"code": 100, "msg": "Unhandled Exception killed plugin", "details": "boom"})
        );
    }
}
