//! Backend configuration payload attached to every fused attention kernel call.
//!
//! The record mirrors the JSON schema the external kernel parses. Field names and their order
//! are part of that contract. Integer fields use the proto-JSON convention of decimal strings,
//! which the `proto_json` helpers below take care of, so the Rust side stays strongly typed.
//!
//! Tensor layouts referenced by the six GEMM stages:
//!
//! ```text
//! Q  [b, q_seq,  heads, head_dim]
//! K  [b, kv_seq, heads, head_dim]
//! V  [b, kv_seq, heads, head_dim]
//! P  [b, heads,  q_seq, kv_seq]      (softmax activation)
//! O  [b, q_seq,  heads, head_dim]
//!
//! bmm1:            Q  @ K  -> P
//! bmm2:            P  @ V  -> O
//! bmm2_grad_gemm1: P  @ dO -> dV
//! bmm2_grad_gemm2: dO @ V  -> dP
//! bmm1_grad_gemm1: dP @ Q  -> dK
//! bmm1_grad_gemm2: dP @ K  -> dQ
//! ```

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::descriptor::{DType, ATTENTION_RANK};
use crate::error::ValidationError;
use crate::inference::AttentionDims;

const ENCODER: &str = "backend_config";

const MATH_TYPE_TENSOR_OP: &str = "TENSOR_OP_MATH";
const PRIMITIVE_TYPE_INVALID: &str = "PRIMITIVE_TYPE_INVALID";
const FIXED_SEED: i64 = 42;
const TUNING_KNOBS: [(i64, i64); 2] = [(17, 1), (24, 0)];

/// Scalar knobs of one kernel call.
///
/// Only `scale` varies in practice. Dropout, causal masking and flash mode exist in the payload
/// schema but the operators always encode them switched off.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FmhaParams {
    pub scale: f64,
    pub dropout_rate: f64,
    pub is_flash_attention: bool,
    pub is_causal_mask: bool,
}

impl FmhaParams {
    pub fn new(scale: f64) -> Self {
        Self {
            scale,
            dropout_rate: 0.0,
            is_flash_attention: false,
            is_causal_mask: false,
        }
    }
}

/// The six matrix multiplies of the fused forward and backward kernels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum GemmStage {
    /// `Q @ K -> P`
    Bmm1,
    /// `P @ V -> O`
    Bmm2,
    /// `dP @ Q -> dK`
    Bmm1GradGemm1,
    /// `dP @ K -> dQ`
    Bmm1GradGemm2,
    /// `P @ dO -> dV`
    Bmm2GradGemm1,
    /// `dO @ V -> dP`
    Bmm2GradGemm2,
}

impl GemmStage {
    pub const ALL: [GemmStage; 6] = [
        GemmStage::Bmm1,
        GemmStage::Bmm2,
        GemmStage::Bmm1GradGemm1,
        GemmStage::Bmm1GradGemm2,
        GemmStage::Bmm2GradGemm1,
        GemmStage::Bmm2GradGemm2,
    ];

    /// Name of the payload field holding this stage's dimension numbers.
    pub fn field_name(self) -> &'static str {
        match self {
            GemmStage::Bmm1 => "bmm1_dot_dimension_numbers",
            GemmStage::Bmm2 => "bmm2_dot_dimension_numbers",
            GemmStage::Bmm1GradGemm1 => "bmm1_grad_gemm1_dot_dimension_numbers",
            GemmStage::Bmm1GradGemm2 => "bmm1_grad_gemm2_dot_dimension_numbers",
            GemmStage::Bmm2GradGemm1 => "bmm2_grad_gemm1_dot_dimension_numbers",
            GemmStage::Bmm2GradGemm2 => "bmm2_grad_gemm2_dot_dimension_numbers",
        }
    }

    /// Fixed `(lhs_contract, rhs_contract, lhs_batch, rhs_batch)` axes for this stage.
    ///
    /// These follow from the operand layouts alone and never depend on extents.
    fn axes(self) -> (&'static [usize], &'static [usize], &'static [usize], &'static [usize]) {
        match self {
            // Q.K over head_dim, batched over (b, heads) in the [b, seq, heads, d] layout.
            GemmStage::Bmm1 => (&[3], &[3], &[0, 2], &[0, 2]),
            // P.V over kv_seq.
            GemmStage::Bmm2 => (&[3], &[1], &[0, 1], &[0, 2]),
            GemmStage::Bmm1GradGemm1 => (&[2], &[1], &[0, 1], &[0, 2]),
            GemmStage::Bmm1GradGemm2 => (&[3], &[1], &[0, 1], &[0, 2]),
            GemmStage::Bmm2GradGemm1 => (&[2], &[1], &[0, 1], &[0, 2]),
            GemmStage::Bmm2GradGemm2 => (&[3], &[3], &[0, 2], &[0, 2]),
        }
    }

    pub fn dimension_numbers(self) -> DotDimensionNumbers {
        let (lhs_contract, rhs_contract, lhs_batch, rhs_batch) = self.axes();
        DotDimensionNumbers {
            lhs_contracting_dimensions: lhs_contract.to_vec(),
            rhs_contracting_dimensions: rhs_contract.to_vec(),
            lhs_batch_dimensions: lhs_batch.to_vec(),
            rhs_batch_dimensions: rhs_batch.to_vec(),
        }
    }
}

/// Contracting and batch axes of one matrix multiply.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DotDimensionNumbers {
    #[serde(with = "proto_json::int64_seq")]
    pub lhs_contracting_dimensions: Vec<usize>,
    #[serde(with = "proto_json::int64_seq")]
    pub rhs_contracting_dimensions: Vec<usize>,
    #[serde(with = "proto_json::int64_seq")]
    pub lhs_batch_dimensions: Vec<usize>,
    #[serde(with = "proto_json::int64_seq")]
    pub rhs_batch_dimensions: Vec<usize>,
}

/// Algorithm and tuning selectors.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlgorithmConfig {
    #[serde(with = "proto_json::int64")]
    pub algo_id: i64,
    pub math_type: String,
    #[serde(with = "proto_json::int64_map")]
    pub tuning_knobs: BTreeMap<i64, i64>,
    pub is_cudnn_frontend: bool,
    #[serde(with = "proto_json::int64")]
    pub workspace_size: i64,
}

impl Default for AlgorithmConfig {
    fn default() -> Self {
        Self {
            algo_id: 0,
            math_type: MATH_TYPE_TENSOR_OP.to_string(),
            tuning_knobs: TUNING_KNOBS.into_iter().collect(),
            is_cudnn_frontend: true,
            workspace_size: 0,
        }
    }
}

/// One layout tile; present for schema completeness, always empty here.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayoutTile {
    #[serde(with = "proto_json::int64_seq")]
    pub dimensions: Vec<usize>,
}

/// Physical layout of the intermediate tensor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntermediateLayout {
    pub dim_level_types: Vec<String>,
    pub dim_unique: Vec<bool>,
    pub dim_ordered: Vec<bool>,
    #[serde(with = "proto_json::int64_seq")]
    pub minor_to_major: Vec<usize>,
    pub tiles: Vec<LayoutTile>,
    #[serde(with = "proto_json::int64")]
    pub element_size_in_bits: i64,
    #[serde(with = "proto_json::int64")]
    pub memory_space: i64,
    pub index_primitive_type: String,
    pub pointer_primitive_type: String,
    #[serde(with = "proto_json::int64")]
    pub dynamic_shape_metadata_prefix_bytes: i64,
}

impl IntermediateLayout {
    /// Dense layout with the last axis fastest-varying.
    pub fn dense(rank: usize) -> Self {
        Self {
            dim_level_types: Vec::new(),
            dim_unique: Vec::new(),
            dim_ordered: Vec::new(),
            minor_to_major: crate::lowering::default_layout(rank),
            tiles: Vec::new(),
            element_size_in_bits: 0,
            memory_space: 0,
            index_primitive_type: PRIMITIVE_TYPE_INVALID.to_string(),
            pointer_primitive_type: PRIMITIVE_TYPE_INVALID.to_string(),
            dynamic_shape_metadata_prefix_bytes: 0,
        }
    }
}

/// Shape record of the softmax activation the kernels exchange.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntermediateTensorShape {
    pub element_type: String,
    #[serde(with = "proto_json::int64_seq")]
    pub dimensions: Vec<usize>,
    pub tuple_shapes: Vec<IntermediateTensorShape>,
    pub layout: IntermediateLayout,
    pub is_dynamic_dimension: Vec<bool>,
}

/// Complete kernel configuration; a plain value with no identity beyond its contents.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackendConfig {
    pub algorithm: AlgorithmConfig,
    pub fmha_scale: f64,
    pub dropout_rate: f64,
    pub bmm1_dot_dimension_numbers: DotDimensionNumbers,
    pub bmm2_dot_dimension_numbers: DotDimensionNumbers,
    pub bmm1_grad_gemm1_dot_dimension_numbers: DotDimensionNumbers,
    pub bmm1_grad_gemm2_dot_dimension_numbers: DotDimensionNumbers,
    pub bmm2_grad_gemm1_dot_dimension_numbers: DotDimensionNumbers,
    pub bmm2_grad_gemm2_dot_dimension_numbers: DotDimensionNumbers,
    pub intermediate_tensor_shape: IntermediateTensorShape,
    #[serde(with = "proto_json::int64")]
    pub seed: i64,
    pub is_flash_attention: bool,
    pub is_causal_mask: bool,
}

impl BackendConfig {
    /// Builds the configuration for a problem of the given extents.
    ///
    /// Identical inputs always produce identical records (and identical JSON), so repeated
    /// graph construction yields comparable kernel descriptors. Fails when `dims.dtype` has no
    /// backend element tag or a float parameter is NaN or infinite, since JSON cannot carry
    /// either.
    pub fn encode(dims: &AttentionDims, params: &FmhaParams) -> Result<Self, ValidationError> {
        ensure_finite("fmha_scale", params.scale)?;
        ensure_finite("dropout_rate", params.dropout_rate)?;
        let element_type = element_type_tag(dims.dtype)?;
        let intermediate_dims = dims.activation_dims().to_vec();
        Ok(Self {
            algorithm: AlgorithmConfig::default(),
            fmha_scale: params.scale,
            dropout_rate: params.dropout_rate,
            bmm1_dot_dimension_numbers: GemmStage::Bmm1.dimension_numbers(),
            bmm2_dot_dimension_numbers: GemmStage::Bmm2.dimension_numbers(),
            bmm1_grad_gemm1_dot_dimension_numbers: GemmStage::Bmm1GradGemm1.dimension_numbers(),
            bmm1_grad_gemm2_dot_dimension_numbers: GemmStage::Bmm1GradGemm2.dimension_numbers(),
            bmm2_grad_gemm1_dot_dimension_numbers: GemmStage::Bmm2GradGemm1.dimension_numbers(),
            bmm2_grad_gemm2_dot_dimension_numbers: GemmStage::Bmm2GradGemm2.dimension_numbers(),
            intermediate_tensor_shape: IntermediateTensorShape {
                element_type: element_type.to_string(),
                is_dynamic_dimension: vec![false; intermediate_dims.len()],
                dimensions: intermediate_dims,
                tuple_shapes: Vec::new(),
                layout: IntermediateLayout::dense(ATTENTION_RANK),
            },
            seed: FIXED_SEED,
            is_flash_attention: params.is_flash_attention,
            is_causal_mask: params.is_causal_mask,
        })
    }

    /// Dimension numbers recorded for `stage`.
    pub fn stage(&self, stage: GemmStage) -> &DotDimensionNumbers {
        match stage {
            GemmStage::Bmm1 => &self.bmm1_dot_dimension_numbers,
            GemmStage::Bmm2 => &self.bmm2_dot_dimension_numbers,
            GemmStage::Bmm1GradGemm1 => &self.bmm1_grad_gemm1_dot_dimension_numbers,
            GemmStage::Bmm1GradGemm2 => &self.bmm1_grad_gemm2_dot_dimension_numbers,
            GemmStage::Bmm2GradGemm1 => &self.bmm2_grad_gemm1_dot_dimension_numbers,
            GemmStage::Bmm2GradGemm2 => &self.bmm2_grad_gemm2_dot_dimension_numbers,
        }
    }

    /// Serializes to the compact JSON form the external kernel expects.
    pub fn to_json_string(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json_str(src: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(src)
    }
}

fn ensure_finite(parameter: &'static str, value: f64) -> Result<(), ValidationError> {
    if !value.is_finite() {
        return Err(ValidationError::NonFinite {
            operator: ENCODER,
            parameter,
            value: value.to_string(),
        });
    }
    Ok(())
}

fn element_type_tag(dtype: DType) -> Result<&'static str, ValidationError> {
    dtype.backend_type_tag().ok_or_else(|| {
        ValidationError::unsupported_dtype(
            ENCODER,
            "intermediate_tensor_shape",
            dtype,
            "no backend element type tag",
        )
    })
}

/// Serde adapters for proto-JSON integers, which travel as decimal strings.
mod proto_json {
    use std::collections::BTreeMap;
    use std::fmt::Display;
    use std::str::FromStr;

    use serde::{de, Deserialize, Deserializer, Serializer};

    fn parse<T, E>(raw: &str) -> Result<T, E>
    where
        T: FromStr,
        T::Err: Display,
        E: de::Error,
    {
        raw.parse()
            .map_err(|err| E::custom(format!("invalid integer '{raw}': {err}")))
    }

    pub mod int64 {
        use super::*;

        pub fn serialize<T: Display, S: Serializer>(value: &T, s: S) -> Result<S::Ok, S::Error> {
            s.collect_str(value)
        }

        pub fn deserialize<'de, T, D>(d: D) -> Result<T, D::Error>
        where
            T: FromStr,
            T::Err: Display,
            D: Deserializer<'de>,
        {
            let raw = String::deserialize(d)?;
            parse(&raw)
        }
    }

    pub mod int64_seq {
        use super::*;

        #[allow(clippy::ptr_arg)]
        pub fn serialize<T: Display, S: Serializer>(
            values: &Vec<T>,
            s: S,
        ) -> Result<S::Ok, S::Error> {
            s.collect_seq(values.iter().map(ToString::to_string))
        }

        pub fn deserialize<'de, T, D>(d: D) -> Result<Vec<T>, D::Error>
        where
            T: FromStr,
            T::Err: Display,
            D: Deserializer<'de>,
        {
            let raw = Vec::<String>::deserialize(d)?;
            raw.iter().map(|item| parse(item)).collect()
        }
    }

    pub mod int64_map {
        use super::*;

        pub fn serialize<K, V, S>(map: &BTreeMap<K, V>, s: S) -> Result<S::Ok, S::Error>
        where
            K: Display,
            V: Display,
            S: Serializer,
        {
            s.collect_map(
                map.iter()
                    .map(|(key, value)| (key.to_string(), value.to_string())),
            )
        }

        pub fn deserialize<'de, K, V, D>(d: D) -> Result<BTreeMap<K, V>, D::Error>
        where
            K: FromStr + Ord,
            K::Err: Display,
            V: FromStr,
            V::Err: Display,
            D: Deserializer<'de>,
        {
            let raw = BTreeMap::<String, String>::deserialize(d)?;
            raw.iter()
                .map(|(key, value)| Ok((parse::<K, D::Error>(key)?, parse::<V, D::Error>(value)?)))
                .collect()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dims(dtype: DType) -> AttentionDims {
        AttentionDims {
            batch: 2,
            q_seq_len: 128,
            kv_seq_len: 96,
            num_heads: 4,
            head_dim: 64,
            dtype,
        }
    }

    #[test]
    fn integers_travel_as_strings() {
        let config = BackendConfig::encode(&dims(DType::Bf16), &FmhaParams::new(0.125)).unwrap();
        let json: serde_json::Value = serde_json::to_value(&config).unwrap();
        assert_eq!(json["seed"], "42");
        assert_eq!(json["algorithm"]["algo_id"], "0");
        assert_eq!(json["algorithm"]["workspace_size"], "0");
        assert_eq!(json["algorithm"]["tuning_knobs"]["17"], "1");
        assert_eq!(json["algorithm"]["tuning_knobs"]["24"], "0");
        assert_eq!(
            json["intermediate_tensor_shape"]["dimensions"],
            serde_json::json!(["2", "4", "128", "96"])
        );
        assert_eq!(
            json["bmm1_dot_dimension_numbers"]["lhs_batch_dimensions"],
            serde_json::json!(["0", "2"])
        );
        assert_eq!(json["fmha_scale"], 0.125);
        assert_eq!(json["is_flash_attention"], false);
    }

    #[test]
    fn malformed_integer_string_is_rejected() {
        let config = BackendConfig::encode(&dims(DType::F16), &FmhaParams::new(1.0)).unwrap();
        let json = config.to_json_string().unwrap();
        let broken = json.replace("\"seed\":\"42\"", "\"seed\":\"forty-two\"");
        let err = BackendConfig::from_json_str(&broken).unwrap_err();
        assert!(err.to_string().contains("invalid integer 'forty-two'"));
    }

    #[test]
    fn stage_accessor_matches_fixed_table() {
        let config = BackendConfig::encode(&dims(DType::F16), &FmhaParams::new(1.0)).unwrap();
        for stage in GemmStage::ALL {
            assert_eq!(config.stage(stage), &stage.dimension_numbers());
        }
    }
}
