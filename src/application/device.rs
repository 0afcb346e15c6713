// ============================================================
// Layer 2 — Compute Device Selection
// ============================================================
// Use cases are generic over the Burn backend; this is the one
// place that maps the user's choice onto a concrete backend.
//
//   gpu → Wgpu    (training wraps it in Autodiff)
//   cpu → NdArray (slow, but runs anywhere)

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};

pub type GpuBackend = burn::backend::Wgpu;
pub type CpuBackend = burn::backend::NdArray;

pub type GpuTrainBackend = burn::backend::Autodiff<GpuBackend>;
pub type CpuTrainBackend = burn::backend::Autodiff<CpuBackend>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceKind {
    #[default]
    Gpu,
    Cpu,
}

impl FromStr for DeviceKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "gpu" | "wgpu" => Ok(Self::Gpu),
            "cpu" | "ndarray" => Ok(Self::Cpu),
            other => bail!("unknown device '{other}' (expected gpu or cpu)"),
        }
    }
}

impl fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Gpu => f.write_str("gpu"),
            Self::Cpu => f.write_str("cpu"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse() {
        assert_eq!("GPU".parse::<DeviceKind>().unwrap(), DeviceKind::Gpu);
        assert_eq!("ndarray".parse::<DeviceKind>().unwrap(), DeviceKind::Cpu);
        assert!("tpu".parse::<DeviceKind>().is_err());
    }
}
