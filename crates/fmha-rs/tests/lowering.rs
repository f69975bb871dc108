use std::sync::Arc;

use anyhow::Result;
use fmha_rs::attention::{BACKWARD_OPERATOR, FORWARD_OPERATOR};
use fmha_rs::lowering::{
    default_layout, CustomCallRule, CUDNN_FMHA_SOFTMAX_BACKWARD_TARGET,
    CUDNN_FMHA_SOFTMAX_TARGET,
};
use fmha_rs::{
    infer_backward, infer_forward, AttentionDims, BackendConfig, DType, FmhaParams,
    KernelInvocation, LoweringDispatcher, LoweringError, Platform, TensorDescriptor,
    ValidationError,
};

struct Problem {
    q: TensorDescriptor,
    k: TensorDescriptor,
    v: TensorDescriptor,
    config: BackendConfig,
}

fn problem(dtype: DType) -> Result<Problem> {
    let dims = AttentionDims {
        batch: 2,
        q_seq_len: 128,
        kv_seq_len: 64,
        num_heads: 4,
        head_dim: 64,
        dtype,
    };
    let q = dims.output_descriptor();
    let k = TensorDescriptor::new(dtype, [2, 64, 4, 64]);
    Ok(Problem {
        v: k.clone(),
        k,
        q,
        config: BackendConfig::encode(&dims, &FmhaParams::new(0.125))?,
    })
}

fn lower_forward(dispatcher: &LoweringDispatcher, platform: Platform) -> Result<KernelInvocation> {
    let p = problem(DType::Bf16)?;
    let (output, activation) = infer_forward(&p.q, &p.k, &p.v)?;
    Ok(dispatcher.lower(
        platform,
        FORWARD_OPERATOR,
        &[p.q, p.k, p.v],
        &[output, activation],
        &p.config,
    )?)
}

#[test]
fn default_rules_cover_cuda_only() -> Result<()> {
    let dispatcher = LoweringDispatcher::with_default_rules()?;
    assert_eq!(
        dispatcher.rules(),
        vec![
            (BACKWARD_OPERATOR.to_string(), Platform::Cuda),
            (FORWARD_OPERATOR.to_string(), Platform::Cuda),
        ]
    );
    assert!(dispatcher.supports(FORWARD_OPERATOR, Platform::Cuda));
    assert!(!dispatcher.supports(FORWARD_OPERATOR, Platform::Rocm));
    Ok(())
}

#[test]
fn forward_lowers_to_cudnn_softmax_call() -> Result<()> {
    let dispatcher = LoweringDispatcher::with_default_rules()?;
    let invocation = lower_forward(&dispatcher, Platform::Cuda)?;

    assert_eq!(invocation.call_target, CUDNN_FMHA_SOFTMAX_TARGET);
    assert_eq!(invocation.operator, FORWARD_OPERATOR);
    assert_eq!(invocation.operands.len(), 3);
    assert_eq!(invocation.results.len(), 2);
    assert_eq!(invocation.operand_sources, vec![0, 1, 2]);
    for tensor in invocation.operands.iter().chain(&invocation.results) {
        assert_eq!(tensor.minor_to_major, vec![3, 2, 1, 0]);
    }
    let results: Vec<_> = invocation.result_descriptors().cloned().collect();
    assert_eq!(results[1].dims(), &[2, 4, 128, 64]);

    let decoded = invocation.decode_backend_config()?;
    assert_eq!(decoded, problem(DType::Bf16)?.config);
    Ok(())
}

#[test]
fn backward_kernel_takes_inputs_after_gradient() -> Result<()> {
    let dispatcher = LoweringDispatcher::with_default_rules()?;
    let p = problem(DType::F16)?;
    let (output, activation) = infer_forward(&p.q, &p.k, &p.v)?;
    let (dq, dk, dv) = infer_backward(&output, &p.q, &p.k, &p.v, &activation)?;

    let inputs = [output, p.q, p.k, p.v, activation];
    let invocation = dispatcher.lower(
        Platform::Cuda,
        BACKWARD_OPERATOR,
        &inputs,
        &[dq, dk, dv],
        &p.config,
    )?;
    assert_eq!(invocation.call_target, CUDNN_FMHA_SOFTMAX_BACKWARD_TARGET);
    assert_eq!(invocation.operand_sources, vec![1, 2, 3, 4]);
    let operands: Vec<_> = invocation
        .operands
        .iter()
        .map(|tensor| tensor.descriptor.clone())
        .collect();
    assert_eq!(operands, inputs[1..].to_vec());
    for tensor in &invocation.operands {
        assert_eq!(tensor.minor_to_major, vec![3, 2, 1, 0]);
    }
    assert_eq!(
        invocation.select_operands(&["dO", "q", "k", "v", "p"]),
        vec!["q", "k", "v", "p"]
    );
    assert_eq!(invocation.results.len(), 3);
    Ok(())
}

#[test]
fn unsupported_platform_fails_without_fallback() -> Result<()> {
    let dispatcher = LoweringDispatcher::with_default_rules()?;
    for platform in [Platform::Rocm, Platform::Cpu] {
        let err = lower_forward(&dispatcher, platform).unwrap_err();
        match err.downcast_ref::<LoweringError>() {
            Some(LoweringError::UnsupportedPlatform { operator, platform: p }) => {
                assert_eq!(operator, FORWARD_OPERATOR);
                assert_eq!(*p, platform);
            }
            other => panic!("unexpected {other:?}"),
        }
    }
    Ok(())
}

#[test]
fn duplicate_rule_is_rejected() -> Result<()> {
    let mut dispatcher = LoweringDispatcher::with_default_rules()?;
    let err = dispatcher
        .register(
            FORWARD_OPERATOR,
            Platform::Cuda,
            Arc::new(CustomCallRule::new("__other", 3, 2)),
        )
        .unwrap_err();
    assert!(matches!(err, LoweringError::DuplicateRule { .. }));
    Ok(())
}

#[test]
fn rule_checks_operand_count() -> Result<()> {
    let dispatcher = LoweringDispatcher::with_default_rules()?;
    let p = problem(DType::Bf16)?;
    let err = dispatcher
        .lower(
            Platform::Cuda,
            FORWARD_OPERATOR,
            &[p.q.clone(), p.k],
            &[p.q],
            &p.config,
        )
        .unwrap_err();
    assert!(matches!(
        err,
        LoweringError::Validation(ValidationError::Arity {
            expected: 3,
            found: 2,
            ..
        })
    ));
    Ok(())
}

#[test]
fn invocation_renders_and_fingerprints_stably() -> Result<()> {
    let dispatcher = LoweringDispatcher::with_default_rules()?;
    let first = lower_forward(&dispatcher, Platform::Cuda)?;
    let second = lower_forward(&dispatcher, Platform::Cuda)?;
    assert_eq!(first, second);
    assert_eq!(first.fingerprint(), second.fingerprint());

    let text = first.to_string();
    assert!(text.starts_with(
        "custom_call @__cudnn$fhmaSoftmax(bf16[2,128,4,64]{3,2,1,0}, bf16[2,64,4,64]{3,2,1,0}, bf16[2,64,4,64]{3,2,1,0}) -> (bf16[2,128,4,64]{3,2,1,0}, bf16[2,4,128,64]{3,2,1,0})"
    ), "{text}");
    assert!(text.contains("platform = cuda"));

    let mut other = first.clone();
    other.backend_config = BackendConfig::encode(
        &AttentionDims {
            batch: 2,
            q_seq_len: 128,
            kv_seq_len: 64,
            num_heads: 4,
            head_dim: 64,
            dtype: DType::Bf16,
        },
        &FmhaParams::new(0.5),
    )?
    .to_json_string()?;
    assert_ne!(first.fingerprint(), other.fingerprint());
    Ok(())
}

#[test]
fn layouts_depend_on_rank_only() {
    assert_eq!(default_layout(4), vec![3, 2, 1, 0]);
    assert_eq!(default_layout(2), vec![1, 0]);
    assert!(default_layout(0).is_empty());
}

#[test]
fn platform_names_parse() {
    assert_eq!("cuda".parse::<Platform>(), Ok(Platform::Cuda));
    assert_eq!("GPU".parse::<Platform>(), Ok(Platform::Cuda));
    assert_eq!("rocm".parse::<Platform>(), Ok(Platform::Rocm));
    assert!("tpu".parse::<Platform>().is_err());
    assert_eq!(Platform::Cpu.to_string(), "cpu");
}
