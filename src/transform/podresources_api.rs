//! Kubelet pod-resources API: `v1.PodResources/List` over a unix socket.
//!
//! The message surface is small enough that the prost types are written out
//! by hand instead of generated from the upstream proto, keeping the build
//! free of a protoc step. Field tags match `k8s.io/kubelet/pkg/apis/podresources/v1`.

use crate::error::{ExporterError, Result};
use hyper_util::rt::TokioIo;
use std::path::{Path, PathBuf};
use tonic::codec::ProstCodec;
use tonic::transport::{Channel, Endpoint, Uri};
use tower::service_fn;

#[derive(Clone, PartialEq, prost::Message)]
pub struct ListPodResourcesRequest {}

#[derive(Clone, PartialEq, prost::Message)]
pub struct ListPodResourcesResponse {
    #[prost(message, repeated, tag = "1")]
    pub pod_resources: Vec<PodResources>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct PodResources {
    #[prost(string, tag = "1")]
    pub name: String,
    #[prost(string, tag = "2")]
    pub namespace: String,
    #[prost(message, repeated, tag = "3")]
    pub containers: Vec<ContainerResources>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct ContainerResources {
    #[prost(string, tag = "1")]
    pub name: String,
    #[prost(message, repeated, tag = "2")]
    pub devices: Vec<ContainerDevices>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct ContainerDevices {
    #[prost(string, tag = "1")]
    pub resource_name: String,
    #[prost(string, repeated, tag = "2")]
    pub device_ids: Vec<String>,
}

/// Unary client for the pod-resources service, shaped like tonic codegen.
pub struct PodResourcesClient {
    inner: tonic::client::Grpc<Channel>,
}

impl PodResourcesClient {
    /// Connects over the kubelet's unix socket. The authority is a dummy;
    /// every connection goes through the socket connector.
    pub async fn connect_uds(socket: &Path) -> Result<Self> {
        let socket: PathBuf = socket.to_path_buf();
        let channel = Endpoint::try_from("http://[::1]:50051")
            .map_err(|e| ExporterError::Enrichment(e.to_string()))?
            .connect_with_connector(service_fn(move |_: Uri| {
                let socket = socket.clone();
                async move {
                    let stream = tokio::net::UnixStream::connect(socket).await?;
                    Ok::<_, std::io::Error>(TokioIo::new(stream))
                }
            }))
            .await
            .map_err(|e| {
                ExporterError::Enrichment(format!("pod-resources endpoint unreachable: {e}"))
            })?;
        Ok(Self {
            inner: tonic::client::Grpc::new(channel),
        })
    }

    pub async fn list(&mut self) -> Result<ListPodResourcesResponse> {
        self.inner.ready().await.map_err(|e| {
            ExporterError::Enrichment(format!("pod-resources service not ready: {e}"))
        })?;
        let codec: ProstCodec<ListPodResourcesRequest, ListPodResourcesResponse> =
            ProstCodec::default();
        let path = tonic::codegen::http::uri::PathAndQuery::from_static("/v1.PodResources/List");
        let response = self
            .inner
            .unary(
                tonic::Request::new(ListPodResourcesRequest {}),
                path,
                codec,
            )
            .await
            .map_err(|e| ExporterError::Enrichment(format!("pod-resources List failed: {e}")))?;
        Ok(response.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use prost::Message;

    #[test]
    fn response_encoding_round_trips() {
        let response = ListPodResourcesResponse {
            pod_resources: vec![PodResources {
                name: "trainer-0".to_string(),
                namespace: "ml".to_string(),
                containers: vec![ContainerResources {
                    name: "main".to_string(),
                    devices: vec![ContainerDevices {
                        resource_name: "nvidia.com/gpu".to_string(),
                        device_ids: vec!["GPU-abcd".to_string()],
                    }],
                }],
            }],
        };
        let bytes = response.encode_to_vec();
        let decoded = ListPodResourcesResponse::decode(bytes.as_slice()).unwrap();
        assert_eq!(decoded, response);
    }
}
