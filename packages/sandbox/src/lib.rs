// ABOUTME: Container runtime abstraction for sandbox sessions
// ABOUTME: Provider trait, Docker implementation, and session resource naming

pub mod naming;
pub mod providers;

pub use providers::{
    ensure_image, ContainerEvent, ContainerInspect, ContainerSpec, ContainerState, DockerProvider,
    EventStream, HealthStatus, LogChunk, LogStream, LogStreamOptions, NetworkAttachment,
    NetworkInfo, PortMapping, Provider as SandboxProvider, ProviderError, StreamType, VolumeMount,
};
