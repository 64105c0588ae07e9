//! Builds clients for data-plane clusters from their Cluster connection data.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Config};
use serde_json::json;

use crate::crd::ControlPlane;
use crate::error::{OperatorError, Result};

/// Decode one base64 PEM field, rejecting anything that is not PEM.
fn decode_pem(field: &str, data: &str) -> Result<String> {
    let bytes = STANDARD
        .decode(data.trim())
        .map_err(|e| OperatorError::Configuration(format!("{field} is not valid base64: {e}")))?;
    let pem = String::from_utf8(bytes)
        .map_err(|_| OperatorError::Configuration(format!("{field} is not UTF-8 PEM data")))?;
    if !pem.contains("-----BEGIN") {
        return Err(OperatorError::Configuration(format!(
            "{field} does not contain a PEM block"
        )));
    }
    Ok(pem)
}

/// A single-context kubeconfig for `cluster`.
pub fn build_kubeconfig(cluster: &str, control_plane: &ControlPlane) -> Result<Kubeconfig> {
    let server = control_plane
        .endpoints
        .first()
        .ok_or_else(|| OperatorError::Configuration(format!("cluster {cluster} has no endpoint")))?;
    // Kubeconfig wants the base64 form; decoding only validates the input
    decode_pem("certData", &control_plane.cert_data)?;
    decode_pem("keyData", &control_plane.key_data)?;
    decode_pem("caData", &control_plane.ca_data)?;

    let kubeconfig = json!({
        "apiVersion": "v1",
        "kind": "Config",
        "clusters": [{
            "name": cluster,
            "cluster": {
                "server": server,
                "certificate-authority-data": control_plane.ca_data.trim(),
            },
        }],
        "users": [{
            "name": cluster,
            "user": {
                "client-certificate-data": control_plane.cert_data.trim(),
                "client-key-data": control_plane.key_data.trim(),
            },
        }],
        "contexts": [{
            "name": cluster,
            "context": {"cluster": cluster, "user": cluster},
        }],
        "current-context": cluster,
    });
    Ok(serde_json::from_value(kubeconfig)?)
}

/// Connect to a data-plane cluster.
pub async fn build_client(cluster: &str, control_plane: &ControlPlane) -> Result<Client> {
    let kubeconfig = build_kubeconfig(cluster, control_plane)?;
    let config = Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
        .await
        .map_err(|e| OperatorError::Configuration(format!("cluster {cluster}: {e}")))?;
    Ok(Client::try_from(config)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pem(label: &str) -> String {
        STANDARD.encode(format!("-----BEGIN {label}-----\nAAAA\n-----END {label}-----\n"))
    }

    fn control_plane() -> ControlPlane {
        ControlPlane {
            endpoints: vec!["https://10.0.0.1:6443".to_string()],
            cert_data: pem("CERTIFICATE"),
            key_data: pem("PRIVATE KEY"),
            ca_data: pem("CERTIFICATE"),
        }
    }

    #[test]
    fn test_build_kubeconfig() {
        let kubeconfig = build_kubeconfig("gpu-a", &control_plane()).unwrap();
        assert_eq!(kubeconfig.current_context.as_deref(), Some("gpu-a"));
        let cluster = kubeconfig.clusters[0].cluster.as_ref().unwrap();
        assert_eq!(cluster.server.as_deref(), Some("https://10.0.0.1:6443"));
        assert_eq!(kubeconfig.auth_infos.len(), 1);
    }

    #[test]
    fn test_rejects_missing_endpoint_and_bad_data() {
        let mut cp = control_plane();
        cp.endpoints.clear();
        assert!(matches!(
            build_kubeconfig("gpu-a", &cp),
            Err(OperatorError::Configuration(_))
        ));

        let mut cp = control_plane();
        cp.key_data = "%%%".to_string();
        assert!(build_kubeconfig("gpu-a", &cp).is_err());

        let mut cp = control_plane();
        cp.ca_data = STANDARD.encode("plain text");
        assert!(build_kubeconfig("gpu-a", &cp).is_err());
    }
}
