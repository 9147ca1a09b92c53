//! Runtime environment detection
//!
//! Decides whether the process runs inside a Kubernetes pod, which selects
//! the default configuration file.

use std::path::Path;

const SERVICE_ACCOUNT_TOKEN: &str = "/var/run/secrets/kubernetes.io/serviceaccount/token";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeEnvironment {
    Kubernetes,
    Local,
}

impl RuntimeEnvironment {
    pub fn detect() -> Self {
        let in_cluster = Path::new(SERVICE_ACCOUNT_TOKEN).exists()
            || std::env::var_os("KUBERNETES_SERVICE_HOST").is_some();
        if in_cluster {
            RuntimeEnvironment::Kubernetes
        } else {
            RuntimeEnvironment::Local
        }
    }

    pub fn is_kubernetes(self) -> bool {
        self == RuntimeEnvironment::Kubernetes
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RuntimeEnvironment::Kubernetes => "kubernetes",
            RuntimeEnvironment::Local => "local",
        }
    }
}
