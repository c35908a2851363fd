use std::fmt;

use clap::ValueEnum;
use ort::execution_providers::{
    CPUExecutionProvider, CUDAExecutionProvider, ExecutionProvider, ExecutionProviderDispatch,
    TensorRTExecutionProvider,
};
use tracing::{info, warn};

/// Requested compute device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum DevicePreference {
    /// Best available accelerator, else CPU.
    #[default]
    Auto,
    Cpu,
    Cuda,
    #[value(name = "tensorrt")]
    TensorRt,
}

/// Compute device bound once at startup and shared by every session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Device {
    TensorRt { device_id: i32 },
    Cuda { device_id: i32 },
    Cpu,
}

impl Device {
    /// Resolves a preference against the execution providers ONNX Runtime
    /// reports as available. An explicitly requested accelerator that is not
    /// available falls back to CPU with a warning.
    pub fn resolve(preference: DevicePreference, device_id: i32) -> Self {
        let tensorrt = || provider_available(&TensorRTExecutionProvider::default(), "TensorRT");
        let cuda = || provider_available(&CUDAExecutionProvider::default(), "CUDA");

        let device = match preference {
            DevicePreference::Cpu => Self::Cpu,
            DevicePreference::Auto if tensorrt() => Self::TensorRt { device_id },
            DevicePreference::Auto if cuda() => Self::Cuda { device_id },
            DevicePreference::Auto => Self::Cpu,
            DevicePreference::TensorRt if tensorrt() => Self::TensorRt { device_id },
            DevicePreference::Cuda if cuda() => Self::Cuda { device_id },
            DevicePreference::TensorRt | DevicePreference::Cuda => {
                warn!(?preference, "requested accelerator is unavailable, using CPU");
                Self::Cpu
            }
        };

        info!(%device, "compute device selected");
        device
    }

    /// Execution providers for a session on this device, most preferred
    /// first. CPU always closes the list.
    pub fn execution_providers(&self) -> Vec<ExecutionProviderDispatch> {
        let mut providers = match *self {
            Self::TensorRt { device_id } => vec![
                TensorRTExecutionProvider::default()
                    .with_device_id(device_id)
                    .build(),
                CUDAExecutionProvider::default()
                    .with_device_id(device_id)
                    .build(),
            ],
            Self::Cuda { device_id } => vec![CUDAExecutionProvider::default()
                .with_device_id(device_id)
                .build()],
            Self::Cpu => Vec::new(),
        };
        providers.push(CPUExecutionProvider::default().build());
        providers
    }
}

fn provider_available(provider: &impl ExecutionProvider, name: &str) -> bool {
    match provider.is_available() {
        Ok(available) => available,
        Err(e) => {
            warn!(provider = name, error = %e, "execution provider probe failed");
            false
        }
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TensorRt { device_id } => write!(f, "tensorrt:{device_id}"),
            Self::Cuda { device_id } => write!(f, "cuda:{device_id}"),
            Self::Cpu => write!(f, "cpu"),
        }
    }
}
