use std::fmt;
use std::net::IpAddr;

use serde::{
    Deserialize,
    Serialize,
};

/// `(name, namespace)`. Forms the stable registry key `namespace/name`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ServiceId {
    pub name: String,
    pub namespace: String,
}

impl ServiceId {
    pub fn new(name: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: namespace.into(),
        }
    }

    /// The registry key: `namespace/name`.
    pub fn key(&self) -> String {
        format!("{}/{}", self.namespace, self.name)
    }
}

impl fmt::Display for ServiceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.key())
    }
}

/// `(name, namespace)` of a backend pod. The source's empty-field sentinel
/// is modeled as `Option<PodIdentity>` per the Design Notes' preference for
/// the optional form over a `""/""` sentinel.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PodIdentity {
    pub name: String,
    pub namespace: String,
}

impl PodIdentity {
    pub fn new(name: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: namespace.into(),
        }
    }

    /// `namespace/name`, used in reconciler reason strings.
    pub fn key(&self) -> String {
        format!("{}/{}", self.namespace, self.name)
    }
}

impl fmt::Display for PodIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.key())
    }
}

/// Carried inside a `Create` request.
#[derive(Clone, Debug)]
pub struct TunnelSpec {
    pub service: ServiceId,
    pub hostnames: Vec<String>,
    pub ports: Vec<u16>,
    /// An explicit backend, bypassing endpoints lookup.
    pub endpoint: Option<PodIdentity>,
}

impl TunnelSpec {
    pub fn new(service: ServiceId, hostnames: Vec<String>, ports: Vec<u16>) -> Self {
        Self {
            service,
            hostnames,
            ports,
            endpoint: None,
        }
    }

    pub fn with_endpoint(mut self, endpoint: PodIdentity) -> Self {
        self.endpoint = Some(endpoint);
        self
    }
}

/// One of `Running`, `Recreating`, `Waiting`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TunnelStatus {
    Running,
    Recreating,
    Waiting,
}

impl fmt::Display for TunnelStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TunnelStatus::Running => "Running",
            TunnelStatus::Recreating => "Recreating",
            TunnelStatus::Waiting => "Waiting",
        };
        write!(f, "{s}")
    }
}

/// The tagged request variant consumed by the processor.
#[derive(Clone, Debug)]
pub enum Request {
    Create {
        spec: TunnelSpec,
        recreate: bool,
        recreate_reason: String,
    },
    Delete {
        service: ServiceId,
    },
}

impl Request {
    pub fn create(spec: TunnelSpec) -> Self {
        Request::Create {
            spec,
            recreate: false,
            recreate_reason: String::new(),
        }
    }

    pub fn recreate(spec: TunnelSpec, reason: impl Into<String>) -> Self {
        Request::Create {
            spec,
            recreate: true,
            recreate_reason: reason.into(),
        }
    }

    pub fn delete(service: ServiceId) -> Self {
        Request::Delete { service }
    }
}

/// A read-only view of a `Connection`, with no forwarder handle — what
/// status inspectors and tests see.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionSnapshot {
    pub service: ServiceId,
    pub pod: Option<PodIdentity>,
    pub ip: IpAddr,
    pub hostnames: Vec<String>,
    pub ports: Vec<u16>,
    pub status: TunnelStatus,
    pub status_reason: Option<String>,
}
