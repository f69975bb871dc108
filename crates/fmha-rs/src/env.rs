use std::env;
use std::sync::OnceLock;

use serde::{Deserialize, Serialize};

use crate::lowering::Platform;

pub const PLATFORM_ENV: &str = "FMHA_RS_PLATFORM";

static DEFAULT_PLATFORM: OnceLock<Platform> = OnceLock::new();

/// Lowering platform used when none is configured explicitly.
///
/// Reads `FMHA_RS_PLATFORM` once per process; unset, empty or unparsable values mean CUDA.
pub fn default_platform() -> Platform {
    *DEFAULT_PLATFORM.get_or_init(|| parse_platform(env::var(PLATFORM_ENV).ok().as_deref()))
}

pub(crate) fn parse_platform(value: Option<&str>) -> Platform {
    match value {
        Some(raw) if !raw.trim().is_empty() => raw.parse().unwrap_or_else(|err| {
            tracing::warn!(env = PLATFORM_ENV, %err, "falling back to cuda");
            Platform::Cuda
        }),
        _ => Platform::Cuda,
    }
}

/// User-facing knobs for [`crate::FusedAttention`].
///
/// Dropout, causal masking and flash mode are intentionally absent: the operators always
/// encode them switched off.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FusedAttentionOptions {
    #[serde(default = "default_platform")]
    pub platform: Platform,
}

impl Default for FusedAttentionOptions {
    fn default() -> Self {
        Self {
            platform: default_platform(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn platform_parsing_falls_back_to_cuda() {
        assert_eq!(parse_platform(None), Platform::Cuda);
        assert_eq!(parse_platform(Some("  ")), Platform::Cuda);
        assert_eq!(parse_platform(Some("gpu")), Platform::Cuda);
        assert_eq!(parse_platform(Some("ROCm")), Platform::Rocm);
        assert_eq!(parse_platform(Some("cpu")), Platform::Cpu);
        assert_eq!(parse_platform(Some("tpu")), Platform::Cuda);
    }
}
